//! Error taxonomy for KeyLedger.

use thiserror::Error;

/// Top-level error type for KeyLedger operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No key is in the `active` state.
    ///
    /// The engine keeps exactly one active key once bootstrapped, so this
    /// signals a broken invariant. It must be alerted on, not retried.
    #[error("No active key: {0}")]
    NoActiveKey(String),

    /// The requested key is revoked or expired.
    #[error("Key {key_id} is unavailable (status: {status})")]
    KeyUnavailable { key_id: String, status: String },

    /// Authenticated decryption failed.
    ///
    /// Deliberately carries no detail: a wrong key and tampered ciphertext
    /// are indistinguishable to the caller.
    #[error("Decryption failed")]
    DecryptionFailed,

    /// A concurrent rotation won the race on the predecessor key.
    #[error("Rotation conflict: {0}")]
    RotationConflict(String),

    /// The transaction was reaped after exceeding its timeout.
    #[error("Transaction timed out: {0}")]
    TransactionTimeout(String),

    /// Attempted to move a transaction or key into a state it cannot reach.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Writing an audit record failed.
    #[error("Audit write failed: {0}")]
    AuditWriteFailure(String),

    /// Cryptographic operation failed (other than authentication).
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency check failed.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl Error {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NoActiveKey(_) => "no_active_key",
            Error::KeyUnavailable { .. } => "key_unavailable",
            Error::DecryptionFailed => "decryption_failed",
            Error::RotationConflict(_) => "rotation_conflict",
            Error::TransactionTimeout(_) => "transaction_timeout",
            Error::InvalidTransition(_) => "invalid_transition",
            Error::AuditWriteFailure(_) => "audit_write_failure",
            Error::Crypto(_) => "crypto_error",
            Error::Storage(_) => "storage_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Config(_) => "config_error",
            Error::InvalidInput(_) => "invalid_input",
            Error::NotPermitted(_) => "not_permitted",
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::Conflict(_) => "conflict",
        }
    }

    /// Whether the caller may retry the same call.
    ///
    /// Crypto failures are never retryable here: a retry has to re-fetch the
    /// active key rather than reuse material captured before a rotation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RotationConflict(_) | Error::Io(_))
    }

    /// Whether this error indicates a broken engine invariant.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::NoActiveKey(_))
    }

    /// Helper for mapping a poisoned lock into a storage error.
    pub fn lock_poisoned(what: &str) -> Self {
        Error::Storage(format!("{} lock poisoned", what))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decryption_failed_message_is_uniform() {
        assert_eq!(Error::DecryptionFailed.to_string(), "Decryption failed");
    }

    #[test]
    fn test_codes() {
        assert_eq!(Error::NoActiveKey("x".into()).code(), "no_active_key");
        assert_eq!(
            Error::KeyUnavailable {
                key_id: "k".into(),
                status: "revoked".into()
            }
            .code(),
            "key_unavailable"
        );
        assert_eq!(Error::InvalidTransition("x".into()).code(), "invalid_transition");
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::RotationConflict("lost".into()).is_retryable());
        assert!(!Error::DecryptionFailed.is_retryable());
        assert!(!Error::InvalidTransition("x".into()).is_retryable());
        assert!(Error::NoActiveKey("x".into()).is_fatal());
    }
}
