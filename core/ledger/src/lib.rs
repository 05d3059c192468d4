//! Transaction ledger for KeyLedger.
//!
//! Every encrypt or decrypt runs inside a transaction that binds to one key
//! at start and moves monotonically from `pending` to `completed` or `failed`.
//! A background [`Reaper`] fails transactions left pending past the timeout.

pub mod config;
pub mod ledger;
pub mod reaper;

pub use config::LedgerConfig;
pub use ledger::{LedgerStats, TransactionLedger};
pub use reaper::{spawn_reaper, Reaper, ReaperHandle, ReaperRequest};
