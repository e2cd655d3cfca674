//! Symmetric encryption of record fields.
//!
//! Keys are derived from a password as `hex(md5(password))`, giving 32 ASCII
//! bytes which are used directly as the AES-256-GCM key. The derivation is
//! kept for compatibility with records encrypted by existing deployments; it
//! is unsalted and operators should treat the password as the full secret.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use md5::{Digest, Md5};
use rand::RngCore;

use crate::error::{Error, Result};

/// Number of bytes required of a cipher key.
pub const CIPHER_KEY_LENGTH: usize = 32;

const NONCE_LENGTH: usize = 12;

/// Checks a cipher key meets the length requirement.
pub fn check_cipher_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::CipherKeyMissing);
    }
    if key.len() != CIPHER_KEY_LENGTH {
        return Err(Error::CipherKeyLength);
    }
    Ok(())
}

/// Derives a cipher key from a password.
pub fn password_to_cipher_key(password: &str) -> Result<Vec<u8>> {
    if password.is_empty() {
        return Err(Error::CipherPassword);
    }
    let digest = Md5::digest(password.as_bytes());
    let key = hex::encode(digest).into_bytes();
    check_cipher_key(&key)?;
    Ok(key)
}

/// Encrypts a string field, returning base64(nonce || ciphertext).
pub fn encrypt(plaintext: &str, key: &[u8]) -> Result<String> {
    check_cipher_key(key)?;
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| Error::CipherKeyLength)?;

    let mut nonce = [0u8; NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|_| Error::CipherPasswordMismatch)?;

    let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(base64::encode(sealed))
}

/// Decrypts a base64(nonce || ciphertext) field produced by [`encrypt`].
pub fn decrypt(data: &str, key: &[u8]) -> Result<String> {
    check_cipher_key(key)?;
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| Error::CipherKeyLength)?;

    let sealed = base64::decode(data).map_err(|_| Error::CipherPasswordMismatch)?;
    if sealed.len() < NONCE_LENGTH {
        return Err(Error::CipherPasswordMismatch);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LENGTH);

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::CipherPasswordMismatch)?;

    String::from_utf8(plaintext).map_err(|_| Error::CipherPasswordMismatch)
}
