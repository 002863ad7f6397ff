//! Sync data models: upload wire format and per-record outcomes.

use crate::queue::PendingSignatureRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// A single signature in an upload batch.
///
/// `encrypted_blob` is `nonce(12) || ciphertext || auth_tag(16)` exactly as
/// stored on the device; the server holds the decryption material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadItem {
    /// Idempotency key
    pub local_id: Uuid,
    pub request_id: i64,
    pub worker_id: i64,
    #[serde(with = "base64_bytes")]
    pub encrypted_blob: Vec<u8>,
    pub captured_at_local: DateTime<Utc>,
    pub attestation_hash: String,
}

impl From<&PendingSignatureRecord> for UploadItem {
    fn from(record: &PendingSignatureRecord) -> Self {
        Self {
            local_id: record.local_id,
            request_id: record.request_id,
            worker_id: record.worker_id,
            encrypted_blob: record.signature_blob.as_bytes().to_vec(),
            captured_at_local: record.captured_at_local,
            attestation_hash: record.attestation_hash.as_str().to_string(),
        }
    }
}

/// Server-side status of one uploaded signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Acked,
    Conflicted,
    Rejected,
}

/// Per-record result returned by the batch endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResultItem {
    pub local_id: Uuid,
    pub status: UploadStatus,
    pub server_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Reference to the signature that completed the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ref: Option<String>,
}

impl UploadResultItem {
    /// Interpret the wire status as an outcome.
    pub fn outcome(&self) -> UploadOutcome {
        match self.status {
            UploadStatus::Acked => UploadOutcome::Acked,
            UploadStatus::Conflicted => match self.reason.as_deref() {
                Some("expired") => UploadOutcome::ConflictedExpired,
                _ => {
                    if self.server_ref.is_none() {
                        warn!(local_id = %self.local_id, "Conflict reported without a server reference");
                    }
                    UploadOutcome::ConflictedAlreadyCompleted(
                        self.server_ref.clone().unwrap_or_default(),
                    )
                }
            },
            UploadStatus::Rejected => UploadOutcome::RejectedValidation(
                self.reason
                    .clone()
                    .unwrap_or_else(|| "rejected by server".to_string()),
            ),
        }
    }
}

/// Response body of the batch endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadResponse {
    pub results: Vec<UploadResultItem>,
}

/// What the server did with one signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Applied, now or on an earlier delivery of the same `local_id`.
    Acked,
    /// Another signature already completed the request; carries its reference.
    ConflictedAlreadyCompleted(String),
    /// The request expired without completion.
    ConflictedExpired,
    /// The payload is malformed; retrying cannot help.
    RejectedValidation(String),
}

/// Custom base64 serialization for `Vec<u8>`.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Custom base64 serialization for fixed-size byte arrays.
pub(crate) mod base64_array {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(bytes: &[u8; N], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(d: D) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = STANDARD.decode(&s).map_err(serde::de::Error::custom)?;
        let len = bytes.len();
        bytes.try_into().map_err(|_| {
            serde::de::Error::custom(format!("expected {} bytes, got {}", N, len))
        })
    }
}
