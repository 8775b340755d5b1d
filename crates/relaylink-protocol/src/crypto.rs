//! Per-message payload encryption for chat messages.
//!
//! Every outgoing chat payload is encrypted under a freshly generated
//! AES-128 key in ECB mode with PKCS#7 padding, and both the ciphertext and
//! the raw key are base64 encoded.
//!
//! # Known weakness
//!
//! The key travels in the same message as the ciphertext it decrypts, so this
//! provides no confidentiality against anyone who can read the wire. ECB also
//! leaks repeated 16-byte blocks. Both are properties of the wire protocol
//! shared with existing peers; changing them requires a protocol revision
//! with real key exchange.

use aes::Aes128;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ecb::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, block_padding::Pkcs7};
use rand::{RngCore, rngs::OsRng};
use thiserror::Error;

type Aes128EcbEnc = ecb::Encryptor<Aes128>;
type Aes128EcbDec = ecb::Decryptor<Aes128>;

/// Key size in bytes (128-bit AES).
pub const KEY_LEN: usize = 16;

/// Errors that can occur while decrypting a payload.
///
/// These are recoverable: display code renders a placeholder instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("Invalid base64 in {field}")]
    InvalidBase64 { field: &'static str },

    #[error("Invalid key length: expected 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Ciphertext was not produced under this key")]
    BadCiphertext,

    #[error("Decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Base64 ciphertext together with the base64 key that decrypts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    pub ciphertext: String,
    pub key_material: String,
}

/// Encrypts `plaintext` under a new random key.
#[must_use]
pub fn encrypt_payload(plaintext: &str) -> SealedPayload {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);

    let ciphertext =
        Aes128EcbEnc::new(&key.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    SealedPayload {
        ciphertext: BASE64.encode(ciphertext),
        key_material: BASE64.encode(key),
    }
}

/// Decrypts a payload produced by [`encrypt_payload`].
///
/// # Errors
/// Returns [`DecryptionError`] on malformed base64, a key that is not
/// 16 bytes, ciphertext not produced under the key, or non UTF-8 output.
pub fn decrypt_payload(ciphertext: &str, key_material: &str) -> Result<String, DecryptionError> {
    let key = BASE64
        .decode(key_material)
        .map_err(|_| DecryptionError::InvalidBase64 { field: "key_material" })?;
    let data = BASE64
        .decode(ciphertext)
        .map_err(|_| DecryptionError::InvalidBase64 { field: "ciphertext" })?;

    let cipher = Aes128EcbDec::new_from_slice(&key)
        .map_err(|_| DecryptionError::InvalidKeyLength(key.len()))?;

    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&data)
        .map_err(|_| DecryptionError::BadCiphertext)?;

    String::from_utf8(plaintext).map_err(|_| DecryptionError::InvalidUtf8)
}
