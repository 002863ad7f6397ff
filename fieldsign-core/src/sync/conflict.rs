//! Server-authoritative resolution of per-record upload outcomes.

use crate::queue::{ConflictDetail, ConflictReason};
use crate::sync::models::UploadOutcome;
use chrono::{DateTime, Utc};

pub const ALREADY_COMPLETED_DETAIL: &str = "already completed by other source";
pub const EXPIRED_DETAIL: &str = "expired";

/// What to do with a record after the server answered for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    MarkSynced { server_timestamp: DateTime<Utc> },
    MarkConflicted(ConflictDetail),
    MarkFailedFatal { reason: String },
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Map a server outcome to a local transition.
    ///
    /// The server's view always wins; signatures are never merged.
    pub fn resolve(outcome: &UploadOutcome, server_timestamp: DateTime<Utc>) -> Resolution {
        match outcome {
            UploadOutcome::Acked => Resolution::MarkSynced { server_timestamp },
            UploadOutcome::ConflictedAlreadyCompleted(server_ref) => {
                Resolution::MarkConflicted(ConflictDetail {
                    reason: ConflictReason::AlreadyCompleted {
                        server_ref: server_ref.clone(),
                    },
                    detail: ALREADY_COMPLETED_DETAIL.to_string(),
                    server_timestamp,
                })
            }
            UploadOutcome::ConflictedExpired => Resolution::MarkConflicted(ConflictDetail {
                reason: ConflictReason::Expired,
                detail: EXPIRED_DETAIL.to_string(),
                server_timestamp,
            }),
            UploadOutcome::RejectedValidation(reason) => Resolution::MarkFailedFatal {
                reason: reason.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_714_564_800, 0).unwrap()
    }

    #[test]
    fn acked_becomes_synced() {
        assert_eq!(
            ConflictResolver::resolve(&UploadOutcome::Acked, ts()),
            Resolution::MarkSynced {
                server_timestamp: ts()
            }
        );
    }

    #[test]
    fn completed_elsewhere_keeps_server_reference() {
        let resolution = ConflictResolver::resolve(
            &UploadOutcome::ConflictedAlreadyCompleted("sig-881".to_string()),
            ts(),
        );
        match resolution {
            Resolution::MarkConflicted(detail) => {
                assert_eq!(detail.detail, "already completed by other source");
                assert_eq!(
                    detail.reason,
                    ConflictReason::AlreadyCompleted {
                        server_ref: "sig-881".to_string()
                    }
                );
                assert_eq!(detail.server_timestamp, ts());
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
    }

    #[test]
    fn expired_request_is_conflicted_not_failed() {
        match ConflictResolver::resolve(&UploadOutcome::ConflictedExpired, ts()) {
            Resolution::MarkConflicted(detail) => {
                assert_eq!(detail.reason, ConflictReason::Expired);
                assert_eq!(detail.detail, "expired");
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
    }

    #[test]
    fn validation_rejection_is_fatal() {
        assert_eq!(
            ConflictResolver::resolve(
                &UploadOutcome::RejectedValidation("attestation mismatch".to_string()),
                ts()
            ),
            Resolution::MarkFailedFatal {
                reason: "attestation mismatch".to_string()
            }
        );
    }
}
