//! Local durable queue of captured signatures.

pub mod handle;
pub mod models;
pub mod store;

pub use handle::{serve, QueueCommand, QueueHandle};
pub use models::{
    ConflictDetail, ConflictReason, FailureInfo, FailureKind, PendingSignatureRecord, QueueStats,
    SyncErrorKind, SyncState,
};
pub use store::SignatureQueue;
