//! Durable state for KeyLedger.
//!
//! This crate defines the persisted key and transaction records, the
//! repository traits the lifecycle manager and ledger are written against,
//! and two backends (in-memory and SQLite).
//!
//! # Design Principles
//! - Records never hold plaintext key material; only the sealed form is stored
//! - Key activation is a single atomic repository step
//! - Transaction transitions lock one record, never the whole table

pub mod key_store;
pub mod memory;
pub mod records;
pub mod repository;
pub mod sqlite;

pub use key_store::{KeyStore, META_FINGERPRINT};
pub use memory::MemoryRepository;
pub use records::{
    FailureKind, KeyInfo, KeyRecord, KeyStatus, TransactionCounts, TransactionMetadata,
    TransactionRecord, TransactionStatus, Transition, TransitionOutcome, TIMEOUT_REASON,
};
pub use repository::{KeyRepository, PredecessorUpdate, TransactionRepository};
pub use sqlite::SqliteRepository;
