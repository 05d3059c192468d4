//! Wire contract for encrypted bodies.
//!
//! An encrypted body is a JSON [`Envelope`] and is marked with
//! `x-e2ee-encrypted: 1`, `x-e2ee-key-id` and `x-e2ee-algorithm` so the
//! receiver can select the right key, including a rotating one.

use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};

use keyledger_common::{Error, KeyId, Result};
use keyledger_crypto::Envelope;

pub const HEADER_ENCRYPTED: &str = "x-e2ee-encrypted";
pub const HEADER_KEY_ID: &str = "x-e2ee-key-id";
pub const HEADER_ALGORITHM: &str = "x-e2ee-algorithm";

const ENCRYPTED_FLAG: &str = "1";

/// Whether the headers mark the body as an encrypted envelope.
pub fn is_encrypted(headers: &HeaderMap) -> bool {
    headers
        .get(HEADER_ENCRYPTED)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == ENCRYPTED_FLAG)
        .unwrap_or(false)
}

/// Key id announced by the sender, if any.
///
/// # Errors
/// - `InvalidInput` if the header is not a valid key id
pub fn key_id(headers: &HeaderMap) -> Result<Option<KeyId>> {
    match headers.get(HEADER_KEY_ID) {
        None => Ok(None),
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| Error::InvalidInput(format!("{} is not ASCII", HEADER_KEY_ID)))?;
            KeyId::new(value).map(Some)
        }
    }
}

/// Parse an encrypted body, checking it against the announced key id.
///
/// # Errors
/// - `InvalidInput` if the body is not marked encrypted, is not an envelope,
///   or names a different key than the header
pub fn open_body(headers: &HeaderMap, body: &[u8]) -> Result<Envelope> {
    if !is_encrypted(headers) {
        return Err(Error::InvalidInput(
            "encrypted payload required".to_string(),
        ));
    }

    let envelope = Envelope::from_bytes(body)
        .map_err(|_| Error::InvalidInput("malformed encrypted payload".to_string()))?;

    if let Some(announced) = key_id(headers)? {
        if announced != envelope.key_id {
            return Err(Error::InvalidInput(format!(
                "{} does not match the payload",
                HEADER_KEY_ID
            )));
        }
    }
    Ok(envelope)
}

/// Serialize an envelope as the body and mark the headers.
pub fn seal_body(headers: &mut HeaderMap, envelope: &Envelope) -> Result<Vec<u8>> {
    let body = envelope.to_bytes()?;
    let key_id = HeaderValue::from_str(envelope.key_id.as_str())
        .map_err(|_| Error::InvalidInput("key id is not a valid header value".to_string()))?;

    headers.insert(HEADER_ENCRYPTED, HeaderValue::from_static(ENCRYPTED_FLAG));
    headers.insert(HEADER_KEY_ID, key_id);
    headers.insert(
        HEADER_ALGORITHM,
        HeaderValue::from_static(envelope.algorithm.as_str()),
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    Ok(body)
}

/// Remove encryption markers after the body has been decrypted.
pub fn clear(headers: &mut HeaderMap, plaintext_len: usize) {
    headers.remove(HEADER_ENCRYPTED);
    headers.remove(HEADER_KEY_ID);
    headers.remove(HEADER_ALGORITHM);
    if headers.contains_key(CONTENT_LENGTH) {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(plaintext_len));
    }
}
