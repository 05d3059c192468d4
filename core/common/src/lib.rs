//! Common utilities and types shared across KeyLedger crates.
//!
//! This crate provides the error taxonomy, identifiers, and the audit event
//! model that key and transaction components publish to their observers.

pub mod error;
pub mod events;
pub mod types;

pub use error::{Error, Result};
pub use events::{AuditEvent, AuditEventKind, EventObserver, ObserverSet};
pub use types::{KeyId, Operation, RequestContext, SensitiveBytes, TransactionId, UserId};
