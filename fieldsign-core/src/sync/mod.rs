//! Signature synchronization
//!
//! Drains the local queue to the signature server:
//! - Oldest-first batches bounded by count and size
//! - Idempotent upload keyed by each record's `local_id`
//! - Exponential backoff with per-record jitter
//! - Server-authoritative conflict resolution (never merges signatures)

pub mod backoff;
pub mod client;
pub mod conflict;
pub mod engine;
pub mod models;

pub use backoff::BackoffPolicy;
#[cfg(feature = "http")]
pub use client::HttpUploadClient;
pub use client::UploadApi;
pub use conflict::{ConflictResolver, Resolution};
pub use engine::{DrainReport, EnginePhase, SyncEngine, SyncSettings};
pub use models::{UploadItem, UploadOutcome, UploadResponse, UploadResultItem, UploadStatus};
