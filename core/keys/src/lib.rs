//! Key lifecycle management for KeyLedger.
//!
//! [`KeyLifecycleManager`] drives every key status change: generation,
//! rotation, revocation and expiry. It keeps exactly one active key and
//! serves it from a short-lived [`KeyCache`].

pub mod cache;
pub mod config;
pub mod manager;

pub use cache::KeyCache;
pub use config::KeyConfig;
pub use manager::KeyLifecycleManager;
