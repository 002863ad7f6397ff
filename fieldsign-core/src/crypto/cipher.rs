//! AES-256-GCM encryption and decryption of signature blobs.
//!
//! Uses AES-256-GCM with:
//! - 256-bit per-device key provisioned at enrollment
//! - 96-bit (12 byte) random nonce per blob
//! - 128-bit authentication tag
//!
//! The stored and uploaded envelope is `nonce(12) || ciphertext || auth_tag(16)`.

use crate::crypto::{CryptoError, Result, SecureBuffer};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroize;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Smallest valid envelope: nonce, one byte of ciphertext, tag.
pub const MIN_ENVELOPE_LEN: usize = NONCE_LEN + 1 + TAG_LEN;

/// The per-device symmetric key.
///
/// Provisioned once by enrollment and read-only afterwards; it never leaves
/// the device.
pub struct DeviceKey {
    key: [u8; 32],
}

impl DeviceKey {
    /// Generate a new random device key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self { key: key.into() }
    }

    /// Create a key from raw bytes
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Create a key from a slice, checking its length
    pub fn from_slice(key: &[u8]) -> Result<Self> {
        let key: [u8; 32] = key.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            got: key.len(),
        })?;
        Ok(Self { key })
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl Drop for DeviceKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeviceKey(..)")
    }
}

/// An encrypted signature envelope.
///
/// Only [`encrypt`] and the queue's row decoder construct this type, so a
/// plaintext blob cannot be handed to the queue by mistake.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedBlob(Vec<u8>);

impl EncryptedBlob {
    pub(crate) fn from_stored(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Cheap structural check; does not authenticate.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() >= MIN_ENVELOPE_LEN
    }
}

impl std::fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptedBlob({} bytes)", self.0.len())
    }
}

/// Encrypt a signature blob with the device key.
///
/// Each call draws a fresh random nonce, so encrypting the same strokes twice
/// yields different envelopes.
pub fn encrypt(key: &DeviceKey, plaintext: &[u8]) -> Result<EncryptedBlob> {
    if plaintext.is_empty() {
        return Err(CryptoError::EncryptionFailed(
            "Cannot encrypt empty signature".to_string(),
        ));
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    // aes-gcm appends the tag, so this is ciphertext || tag
    let ciphertext_with_tag = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(format!("{}", e)))?;

    let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext_with_tag.len());
    envelope.extend_from_slice(nonce.as_slice());
    envelope.extend_from_slice(&ciphertext_with_tag);

    Ok(EncryptedBlob(envelope))
}

/// Decrypt a signature envelope.
///
/// Any structural problem or tag mismatch is reported as
/// [`CryptoError::DecryptionFailed`]; callers must treat it as tampering or
/// corruption.
pub fn decrypt(key: &DeviceKey, blob: &EncryptedBlob) -> Result<SecureBuffer> {
    let bytes = blob.as_bytes();
    if bytes.len() < MIN_ENVELOPE_LEN {
        return Err(CryptoError::DecryptionFailed(format!(
            "Envelope too short: {} bytes",
            bytes.len()
        )));
    }

    let nonce_bytes: [u8; NONCE_LEN] = bytes[..NONCE_LEN]
        .try_into()
        .map_err(|_| CryptoError::DecryptionFailed("Invalid nonce length".to_string()))?;

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Nonce::from(nonce_bytes);

    cipher
        .decrypt(&nonce, &bytes[NONCE_LEN..])
        .map(SecureBuffer::new)
        .map_err(|_| {
            CryptoError::DecryptionFailed("Authentication tag mismatch".to_string())
        })
}
