//! Queue data model: pending signature records and their sync bookkeeping.

use crate::attestation::AttestationHash;
use crate::crypto::EncryptedBlob;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Sync state of a queued signature.
///
/// Transitions: `Pending -> Syncing -> {Synced | Conflicted | Failed}`, and a
/// retry-eligible `Failed -> Syncing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Syncing,
    Synced,
    Conflicted,
    Failed,
}

impl SyncState {
    pub const ALL: [SyncState; 5] = [
        Self::Pending,
        Self::Syncing,
        Self::Synced,
        Self::Conflicted,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Conflicted => "conflicted",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "syncing" => Self::Syncing,
            "synced" => Self::Synced,
            "conflicted" => Self::Conflicted,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a failed record may be retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Retryable,
    Fatal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Fatal => "fatal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retryable" => Some(Self::Retryable),
            "fatal" => Some(Self::Fatal),
            _ => None,
        }
    }
}

/// Why an upload attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncErrorKind {
    DecryptionFailed,
    NetworkError,
    ServerRejectedValidation,
    MaxAttemptsExceeded,
    /// The server response did not mention the record.
    MissingOutcome,
}

impl SyncErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DecryptionFailed => "DecryptionFailed",
            Self::NetworkError => "NetworkError",
            Self::ServerRejectedValidation => "ServerRejectedValidation",
            Self::MaxAttemptsExceeded => "MaxAttemptsExceeded",
            Self::MissingOutcome => "MissingOutcome",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "DecryptionFailed" => Self::DecryptionFailed,
            "NetworkError" => Self::NetworkError,
            "ServerRejectedValidation" => Self::ServerRejectedValidation,
            "MaxAttemptsExceeded" => Self::MaxAttemptsExceeded,
            "MissingOutcome" => Self::MissingOutcome,
            _ => return None,
        })
    }
}

/// Failure bookkeeping for a `Failed` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub error: SyncErrorKind,
    pub detail: String,
}

impl FailureInfo {
    pub fn retryable(error: SyncErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            error,
            detail: detail.into(),
        }
    }

    pub fn fatal(error: SyncErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            error,
            detail: detail.into(),
        }
    }
}

/// Why the server no longer accepts a signature for the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ConflictReason {
    /// Another signature already completed the request.
    AlreadyCompleted {
        #[serde(rename = "serverRef")]
        server_ref: String,
    },
    /// The request expired without completion.
    Expired,
}

/// Resolution detail stored on a `Conflicted` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetail {
    pub reason: ConflictReason,
    pub detail: String,
    pub server_timestamp: DateTime<Utc>,
}

/// A captured signature waiting to reach the server.
#[derive(Debug, Clone)]
pub struct PendingSignatureRecord {
    /// Client-generated id; also the server idempotency key
    pub local_id: Uuid,
    pub request_id: i64,
    pub worker_id: i64,
    pub signature_blob: EncryptedBlob,
    pub captured_at_local: DateTime<Utc>,
    pub attestation_hash: AttestationHash,
    pub sync_state: SyncState,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest retry time for a retryable failure
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureInfo>,
    /// Fatal failure or attempt ceiling reached; never retried automatically
    pub needs_attention: bool,
    pub conflict: Option<ConflictDetail>,
    pub server_timestamp: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl PendingSignatureRecord {
    /// A freshly captured record with a new `local_id`.
    pub fn new(
        request_id: i64,
        worker_id: i64,
        signature_blob: EncryptedBlob,
        captured_at_local: DateTime<Utc>,
        attestation_hash: AttestationHash,
    ) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            request_id,
            worker_id,
            signature_blob,
            captured_at_local,
            attestation_hash,
            sync_state: SyncState::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            failure: None,
            needs_attention: false,
            conflict: None,
            server_timestamp: None,
            acknowledged_at: None,
        }
    }

    /// Whether the sync engine may pick this record up at `now`.
    pub fn is_retry_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.sync_state {
            SyncState::Pending => true,
            SyncState::Failed => {
                !self.needs_attention
                    && matches!(
                        self.failure.as_ref().map(|f| f.kind),
                        Some(FailureKind::Retryable)
                    )
                    && self.next_attempt_at.map_or(true, |at| at <= now)
            }
            _ => false,
        }
    }
}

/// Queue depth and state distribution for indicators and the admin panel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Records currently stored
    pub depth: u64,
    pub by_state: BTreeMap<SyncState, u64>,
    /// Pending, syncing, or retry-eligible failed records
    pub pending_count: u64,
    /// Conflicted or attention-needed records not yet acknowledged
    pub unacknowledged_count: u64,
    pub needs_attention: u64,
    /// Not-yet-synced records per worker
    pub by_worker: BTreeMap<i64, u64>,
    pub stored_bytes: u64,
}
