//! Common types used throughout KeyLedger.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use zeroize::Zeroize;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from a string.
            ///
            /// # Errors
            /// - Returns error if id is empty or contains whitespace
            pub fn new(id: impl Into<String>) -> crate::Result<Self> {
                let id = id.into();
                if id.is_empty() {
                    return Err(crate::Error::InvalidInput(format!(
                        "{} cannot be empty",
                        $label
                    )));
                }
                if id.chars().any(char::is_whitespace) {
                    return Err(crate::Error::InvalidInput(format!(
                        "{} cannot contain whitespace",
                        $label
                    )));
                }
                Ok(Self(id))
            }

            /// Get the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> crate::Result<Self> {
                Self::new(s)
            }
        }
    };
}

string_id!(
    /// Identifier of an encryption key.
    KeyId,
    "KeyId"
);

string_id!(
    /// Globally unique identifier of an encryption transaction.
    TransactionId,
    "TransactionId"
);

string_id!(
    /// Identifier of the user a transaction is performed for.
    UserId,
    "UserId"
);

impl KeyId {
    /// Generate a fresh random key id.
    pub fn generate() -> Self {
        Self(format!("key_{}", Uuid::new_v4().simple()))
    }
}

impl TransactionId {
    /// Generate a fresh random transaction id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Cryptographic operation a transaction performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Encrypt,
    Decrypt,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Encrypt => "encrypt",
            Operation::Decrypt => "decrypt",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "encrypt" => Ok(Operation::Encrypt),
            "decrypt" => Ok(Operation::Decrypt),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown operation: {}",
                other
            ))),
        }
    }
}

/// Request context captured with every transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub endpoint: Option<String>,
}

impl RequestContext {
    /// Context for operations issued outside of a request (CLI, jobs).
    pub fn system(endpoint: impl Into<String>) -> Self {
        Self {
            ip_address: None,
            user_agent: None,
            endpoint: Some(endpoint.into()),
        }
    }
}

/// Sensitive data wrapper that zeroizes on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_id_creation() {
        let id = KeyId::new("key-1").unwrap();
        assert_eq!(id.as_str(), "key-1");
    }

    #[test]
    fn test_ids_reject_empty_and_whitespace() {
        assert!(KeyId::new("").is_err());
        assert!(TransactionId::new("a b").is_err());
        assert!(UserId::new("").is_err());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(KeyId::generate(), KeyId::generate());
        assert_ne!(TransactionId::generate(), TransactionId::generate());
        assert!(KeyId::generate().as_str().starts_with("key_"));
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!("encrypt".parse::<Operation>().unwrap(), Operation::Encrypt);
        assert_eq!(Operation::Decrypt.to_string(), "decrypt");
        assert!("sign".parse::<Operation>().is_err());
    }

    #[test]
    fn test_id_serializes_transparently() {
        let id = UserId::new("user-42").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"user-42\"");
    }

    #[test]
    fn test_sensitive_bytes_debug_redacts() {
        let bytes = SensitiveBytes::new(vec![1, 2, 3]);
        assert_eq!(format!("{:?}", bytes), "SensitiveBytes([REDACTED; 3 bytes])");
    }
}
