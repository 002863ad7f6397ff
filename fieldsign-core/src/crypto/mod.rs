//! Cryptographic primitives for signature capture.
//!
//! This module provides:
//! - AES-256-GCM encryption of signature blobs at rest
//! - Argon2id derivation of PIN keys for offline attestation
//! - Zeroizing buffers for transiently decrypted material

pub mod cipher;
pub mod kdf;
pub mod zero;

pub use cipher::{decrypt, encrypt, DeviceKey, EncryptedBlob};
pub use kdf::{derive_pin_key, PinKdfParams, PinKey};
pub use zero::SecureBuffer;

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Authentication tag mismatch or malformed envelope; the blob was
    /// tampered with or corrupted.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
