//! Enrollment material provisioned onto the device.
//!
//! The enrollment service writes `enrollment.json` once; afterwards the
//! device key and PIN verifier are read-only.

use crate::attestation::{Attestor, PinVerifier, Rut};
use crate::crypto::DeviceKey;
use crate::sync::models::base64_bytes;
use crate::{FieldSignError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use zeroize::Zeroize;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnrollmentFile {
    device_id: Uuid,
    rut: Rut,
    #[serde(with = "base64_bytes")]
    device_key: Vec<u8>,
    pin_verifier: PinVerifier,
}

impl Drop for EnrollmentFile {
    fn drop(&mut self) {
        self.device_key.zeroize();
    }
}

/// The device identity, its symmetric key and the enrolled signer.
pub struct Enrollment {
    device_id: Uuid,
    key: Arc<DeviceKey>,
    attestor: Attestor,
}

impl Enrollment {
    pub fn new(device_id: Uuid, key: DeviceKey, attestor: Attestor) -> Self {
        Self {
            device_id,
            key: Arc::new(key),
            attestor,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let enrollment = Self::from_json(&content)?;
        info!(device_id = %enrollment.device_id, "Loaded enrollment");
        Ok(enrollment)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: EnrollmentFile = serde_json::from_str(json)
            .map_err(|e| FieldSignError::Config(format!("Invalid enrollment: {}", e)))?;
        let key = DeviceKey::from_slice(&file.device_key)?;

        Ok(Self::new(
            file.device_id,
            key,
            Attestor::new(file.rut.clone(), file.pin_verifier.clone()),
        ))
    }

    /// Serialize in the provisioning format, key included.
    pub fn to_json(&self) -> Result<String> {
        let file = EnrollmentFile {
            device_id: self.device_id,
            rut: self.attestor.rut().clone(),
            device_key: self.key.as_bytes().to_vec(),
            pin_verifier: self.attestor.verifier().clone(),
        };
        serde_json::to_string_pretty(&file)
            .map_err(|e| FieldSignError::Config(format!("Invalid enrollment: {}", e)))
    }

    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    pub fn key(&self) -> Arc<DeviceKey> {
        self.key.clone()
    }

    pub fn attestor(&self) -> &Attestor {
        &self.attestor
    }
}

impl std::fmt::Debug for Enrollment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enrollment")
            .field("device_id", &self.device_id)
            .field("rut", self.attestor.rut())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{decrypt, encrypt, PinKdfParams};

    fn fast_params() -> PinKdfParams {
        PinKdfParams {
            mem_cost: 8_192,
            time_cost: 1,
            parallelism: 1,
        }
    }

    fn enrollment() -> Enrollment {
        let verifier = PinVerifier::create("2468", fast_params()).unwrap();
        Enrollment::new(
            Uuid::new_v4(),
            DeviceKey::generate(),
            Attestor::new(Rut::parse("11.111.111-1").unwrap(), verifier),
        )
    }

    #[test]
    fn json_roundtrip_preserves_key_and_verifier() {
        let original = enrollment();
        let json = original.to_json().unwrap();
        assert!(json.contains("deviceKey"));
        assert!(json.contains("pinVerifier"));

        let loaded = Enrollment::from_json(&json).unwrap();
        assert_eq!(loaded.device_id(), original.device_id());

        let blob = encrypt(&original.key(), b"strokes").unwrap();
        assert_eq!(decrypt(&loaded.key(), &blob).unwrap().as_bytes(), b"strokes");

        let a = original.attestor().attest("11111111-1", "2468").unwrap();
        let b = loaded.attestor().attest("11111111-1", "2468").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enrollment.json");
        std::fs::write(&path, enrollment().to_json().unwrap()).unwrap();

        assert!(Enrollment::load(&path).is_ok());
    }

    #[test]
    fn bad_material_rejected() {
        assert!(matches!(
            Enrollment::from_json("{}"),
            Err(FieldSignError::Config(_))
        ));

        let json = enrollment().to_json().unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["deviceKey"] = serde_json::Value::String("AQID".to_string());
        assert!(Enrollment::from_json(&value.to_string()).is_err());

        value = serde_json::from_str(&json).unwrap();
        value["rut"] = serde_json::Value::String("12.345.678-9".to_string());
        assert!(Enrollment::from_json(&value.to_string()).is_err());
    }

    #[test]
    fn debug_hides_key() {
        let rendered = format!("{:?}", enrollment());
        assert!(!rendered.contains("key"));
    }
}
