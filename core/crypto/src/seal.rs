//! Envelope encryption of key material at rest.
//!
//! Data-key material is sealed with the master key using XChaCha20-Poly1305.
//! The sealed form is `nonce || ciphertext || tag`, with the key id bound as
//! associated data so sealed material cannot be moved between records.

use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305,
};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::keys::{KeyMaterial, MasterKey};
use keyledger_common::{Error, KeyId, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

const VERIFICATION_PLAINTEXT: &[u8] = b"KEYLEDGER_MASTER_KEY_VERIFICATION_V1";
const VERIFICATION_AAD: &[u8] = b"keyledger-verification";

fn seal(master: &MasterKey, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(master.as_bytes()));
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| Error::Crypto(format!("Sealing failed: {}", e)))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

fn open(master: &MasterKey, aad: &[u8], sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Crypto("Sealed data too short".to_string()));
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(master.as_bytes()));

    cipher
        .decrypt(
            GenericArray::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| Error::Crypto("Unsealing failed".to_string()))
}

/// Seal data-key material for storage.
pub fn seal_material(master: &MasterKey, key_id: &KeyId, material: &KeyMaterial) -> Result<Vec<u8>> {
    seal(master, key_id.as_str().as_bytes(), material.as_bytes())
}

/// Recover data-key material from its sealed form.
///
/// # Errors
/// - Returns `Crypto` if the master key is wrong or the record was tampered
///   with or moved to another key id
pub fn unseal_material(master: &MasterKey, key_id: &KeyId, sealed: &[u8]) -> Result<KeyMaterial> {
    let plaintext = open(master, key_id.as_str().as_bytes(), sealed)?;
    KeyMaterial::from_slice(&plaintext)
}

/// Produce a blob that lets a store check the master key on open.
pub fn verification_blob(master: &MasterKey) -> Result<Vec<u8>> {
    seal(master, VERIFICATION_AAD, VERIFICATION_PLAINTEXT)
}

/// Check a master key against a stored verification blob.
pub fn verify_master_key(master: &MasterKey, blob: &[u8]) -> bool {
    match open(master, VERIFICATION_AAD, blob) {
        Ok(plaintext) => plaintext.as_slice().ct_eq(VERIFICATION_PLAINTEXT).into(),
        Err(_) => false,
    }
}
