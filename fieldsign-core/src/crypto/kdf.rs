//! Argon2id key derivation for signer PINs.
//!
//! A PIN has very little entropy, so the derivation is deliberately
//! memory-hard. The 64-byte output is split in two halves:
//! - the first half is the verifier cached at enrollment
//! - the second half keys the attestation HMAC and is never stored

use crate::crypto::{CryptoError, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

const OUTPUT_LEN: usize = 64;

/// Argon2id parameters stored alongside the PIN verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinKdfParams {
    /// Memory cost in KiB
    pub mem_cost: u32,
    /// Number of iterations
    pub time_cost: u32,
    /// Number of lanes
    pub parallelism: u32,
}

impl Default for PinKdfParams {
    fn default() -> Self {
        // Sized for handheld devices: 19 MiB, two passes, single lane.
        Self {
            mem_cost: 19_456,
            time_cost: 2,
            parallelism: 1,
        }
    }
}

impl PinKdfParams {
    /// Verify that parameters are within acceptable ranges
    pub fn validate(&self) -> Result<()> {
        if self.mem_cost < 8_192 {
            return Err(CryptoError::KdfFailed(
                "Memory cost too low (minimum: 8 MiB)".to_string(),
            ));
        }
        if self.time_cost < 1 {
            return Err(CryptoError::KdfFailed(
                "Time cost too low (minimum: 1)".to_string(),
            ));
        }
        if self.parallelism < 1 {
            return Err(CryptoError::KdfFailed(
                "Parallelism too low (minimum: 1)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Key material derived from a PIN.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PinKey {
    verifier: [u8; 32],
    attest_key: [u8; 32],
}

impl PinKey {
    /// The half that is cached as the enrollment PIN hash.
    pub fn verifier(&self) -> &[u8; 32] {
        &self.verifier
    }

    /// The half used to key attestation hashes.
    pub fn attest_key(&self) -> &[u8; 32] {
        &self.attest_key
    }
}

/// Derive PIN key material with Argon2id.
pub fn derive_pin_key(pin: &[u8], salt: &[u8; 16], params: &PinKdfParams) -> Result<PinKey> {
    params.validate()?;

    let params_obj = Params::new(
        params.mem_cost,
        params.time_cost,
        params.parallelism,
        Some(OUTPUT_LEN),
    )
    .map_err(|e| CryptoError::KdfFailed(format!("Invalid parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params_obj);

    let mut output = [0u8; OUTPUT_LEN];
    argon2
        .hash_password_into(pin, salt, &mut output)
        .map_err(|e| CryptoError::KdfFailed(format!("Hashing failed: {}", e)))?;

    let mut key = PinKey {
        verifier: [0u8; 32],
        attest_key: [0u8; 32],
    };
    key.verifier.copy_from_slice(&output[..32]);
    key.attest_key.copy_from_slice(&output[32..]);
    output.zeroize();

    Ok(key)
}
