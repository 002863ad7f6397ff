//! Offline identity attestation with RUT + PIN.
//!
//! Enrollment caches a [`PinVerifier`] for the device's signer. At capture
//! time [`Attestor::attest`] re-derives the PIN key locally, compares it in
//! constant time, and produces an [`AttestationHash`] that only the correct
//! PIN can reproduce. No network access is involved.

use crate::crypto::{derive_pin_key, PinKdfParams};
use crate::{FieldSignError, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

const ATTEST_DOMAIN: &[u8] = b"fieldsign-attest-v1|";

/// A validated Chilean RUT, stored in `12345678-5` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rut(String);

impl Rut {
    /// Parse a RUT in any common notation (`12.345.678-5`, `12345678-5`,
    /// `123456785`) and verify its modulo-11 check digit.
    pub fn parse(input: &str) -> Result<Self> {
        let cleaned: String = input
            .chars()
            .filter(|c| !matches!(c, '.' | '-' | ' '))
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if cleaned.len() < 2 {
            return Err(FieldSignError::InvalidRut(input.to_string()));
        }

        let (body, dv) = cleaned.split_at(cleaned.len() - 1);
        if body.len() > 9 || !body.chars().all(|c| c.is_ascii_digit()) {
            return Err(FieldSignError::InvalidRut(input.to_string()));
        }

        let dv = dv
            .chars()
            .next()
            .ok_or_else(|| FieldSignError::InvalidRut(input.to_string()))?;
        if Self::check_digit(body) != dv {
            return Err(FieldSignError::InvalidRut(input.to_string()));
        }

        let body = body.trim_start_matches('0');
        if body.is_empty() {
            return Err(FieldSignError::InvalidRut(input.to_string()));
        }

        Ok(Self(format!("{}-{}", body, dv)))
    }

    fn check_digit(body: &str) -> char {
        let sum: u32 = body
            .chars()
            .rev()
            .filter_map(|c| c.to_digit(10))
            .zip([2u32, 3, 4, 5, 6, 7].iter().cycle())
            .map(|(d, w)| d * w)
            .sum();

        match 11 - (sum % 11) {
            11 => '0',
            10 => 'K',
            n => char::from_digit(n, 10).unwrap_or('0'),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Rut {
    type Error = FieldSignError;

    fn try_from(value: String) -> Result<Self> {
        Rut::parse(&value)
    }
}

impl From<Rut> for String {
    fn from(rut: Rut) -> Self {
        rut.0
    }
}

impl std::fmt::Display for Rut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The PIN hash cached on the device at enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinVerifier {
    #[serde(with = "crate::sync::models::base64_array")]
    pub salt: [u8; 16],
    pub params: PinKdfParams,
    #[serde(with = "crate::sync::models::base64_array")]
    pub hash: [u8; 32],
}

impl PinVerifier {
    /// Derive a fresh verifier for `pin` with a random salt.
    pub fn create(pin: &str, params: PinKdfParams) -> Result<Self> {
        let salt: [u8; 16] = rand::random();
        let key = derive_pin_key(pin.as_bytes(), &salt, &params)?;
        Ok(Self {
            salt,
            params,
            hash: *key.verifier(),
        })
    }
}

/// Stable proof that the signer entered the correct PIN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttestationHash(String);

impl AttestationHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn from_stored(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for AttestationHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Performs attestation against the enrolled signer's cached PIN hash.
///
/// Read-only after enrollment.
#[derive(Debug, Clone)]
pub struct Attestor {
    rut: Rut,
    verifier: PinVerifier,
}

impl Attestor {
    pub fn new(rut: Rut, verifier: PinVerifier) -> Self {
        Self { rut, verifier }
    }

    pub fn rut(&self) -> &Rut {
        &self.rut
    }

    pub fn verifier(&self) -> &PinVerifier {
        &self.verifier
    }

    /// Attest that `pin` is the enrolled PIN for `rut`.
    ///
    /// A RUT that is well-formed but not the enrolled one fails with
    /// [`FieldSignError::InvalidPin`] so the error does not reveal which
    /// half of the pair was wrong.
    pub fn attest(&self, rut: &str, pin: &str) -> Result<AttestationHash> {
        let rut = Rut::parse(rut)?;

        let key = derive_pin_key(pin.as_bytes(), &self.verifier.salt, &self.verifier.params)?;
        let pin_ok: bool = key.verifier()[..].ct_eq(&self.verifier.hash[..]).into();
        let rut_ok: bool = rut.as_str().as_bytes().ct_eq(self.rut.as_str().as_bytes()).into();

        if !(pin_ok && rut_ok) {
            warn!("Attestation rejected");
            return Err(FieldSignError::InvalidPin);
        }

        let mut mac = HmacSha256::new_from_slice(key.attest_key())
            .map_err(|e| FieldSignError::Crypto(crate::CryptoError::KdfFailed(e.to_string())))?;
        mac.update(ATTEST_DOMAIN);
        mac.update(rut.as_str().as_bytes());

        Ok(AttestationHash(hex::encode(mac.finalize().into_bytes())))
    }
}
