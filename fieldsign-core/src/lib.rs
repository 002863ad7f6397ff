//! FieldSign Core Library
//!
//! Offline signature capture and synchronization for field devices:
//! identity attestation, encryption of signature material at rest,
//! a crash-safe local queue, an append-only audit ledger, and the
//! sync engine that reconciles captured signatures with the server.

pub mod attestation;
pub mod audit;
pub mod capture;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod enrollment;
pub mod platform;
pub mod queue;
pub mod sync;

pub use attestation::{AttestationHash, Attestor, PinVerifier, Rut};
pub use audit::{AuditEntry, AuditEvent, AuditLog};
pub use capture::{CaptureRequest, SignatureCapture};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FieldSignConfig;
pub use crypto::{decrypt, encrypt, CryptoError, DeviceKey, EncryptedBlob};
pub use enrollment::Enrollment;
pub use queue::{
    ConflictDetail, ConflictReason, FailureInfo, FailureKind, PendingSignatureRecord,
    QueueCommand, QueueHandle, QueueStats, SignatureQueue, SyncErrorKind, SyncState,
};
pub use sync::{
    BackoffPolicy, ConflictResolver, EnginePhase, Resolution, SyncEngine, SyncSettings,
    UploadApi, UploadOutcome,
};

use thiserror::Error;
use uuid::Uuid;

/// Result type for FieldSign operations
pub type Result<T> = std::result::Result<T, FieldSignError>;

/// Errors raised by the local store
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: i32, found: i32 },
}

/// General error type for FieldSign operations
#[derive(Error, Debug)]
pub enum FieldSignError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Device storage is full: {0}")]
    StorageFull(String),

    #[error("Invalid state transition for {local_id}: {from} -> {to}")]
    InvalidStateTransition {
        local_id: Uuid,
        from: SyncState,
        to: SyncState,
    },

    #[error("Invalid PIN")]
    InvalidPin,

    #[error("Invalid RUT: {0}")]
    InvalidRut(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Server rejected the payload: {0}")]
    ServerRejectedValidation(String),

    #[error("Record {local_id} exceeded {attempts} upload attempts")]
    MaxAttemptsExceeded { local_id: Uuid, attempts: u32 },

    #[error("Record {local_id} in state {state} cannot be acknowledged")]
    NotAcknowledgeable { local_id: Uuid, state: SyncState },

    #[error("Local id already used: {0}")]
    DuplicateLocalId(Uuid),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Queue writer is no longer running")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for FieldSignError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref code, _) = e {
            if code.code == rusqlite::ErrorCode::DiskFull {
                return FieldSignError::StorageFull(e.to_string());
            }
        }
        FieldSignError::Database(DatabaseError::Sqlite(e))
    }
}

impl FieldSignError {
    /// Whether a sync attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FieldSignError::ServerRejectedValidation(_)
                | FieldSignError::Crypto(CryptoError::DecryptionFailed(_))
        )
    }
}
