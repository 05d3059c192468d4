//! Cryptographic primitives for KeyLedger.
//!
//! This crate provides:
//! - The stateless AEAD [`EncryptionEngine`] (AES-256-GCM, XChaCha20-Poly1305)
//! - Key material types with automatic zeroization
//! - Sealing of key material under a master key for storage at rest
//! - Argon2id derivation of the master key from an operator passphrase
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Decryption failures are indistinguishable to the caller

pub mod aead;
pub mod kdf;
pub mod keys;
pub mod seal;

pub use aead::{Algorithm, EncryptionEngine, Envelope, ENVELOPE_VERSION, TAG_SIZE};
pub use kdf::{derive_master_key, KdfParams};
pub use keys::{DataKey, KeyMaterial, MasterKey, Salt, KEY_LENGTH};
pub use seal::{seal_material, unseal_material, verification_blob, verify_master_key};
