//! Shared fixtures: an in-process signature server and enrolled devices.

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use fieldsign_core::attestation::{Attestor, PinVerifier, Rut};
use fieldsign_core::crypto::{DeviceKey, PinKdfParams};
use fieldsign_core::sync::{
    BackoffPolicy, SyncSettings, UploadApi, UploadItem, UploadResponse, UploadResultItem,
    UploadStatus,
};
use fieldsign_core::{
    CaptureRequest, Enrollment, FieldSignError, PendingSignatureRecord, QueueHandle, Result,
    SignatureCapture,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

pub const RUT: &str = "12.345.678-5";
pub const PIN: &str = "4821";

pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_714_564_800, 0).unwrap()
}

#[derive(Default)]
struct ServerState {
    /// Outcome per idempotency key; replayed on re-delivery
    outcomes: HashMap<Uuid, UploadResultItem>,
    /// request_id -> (winning local_id, server ref)
    completions: HashMap<i64, (Uuid, String)>,
    expired: HashSet<i64>,
    rejected: HashMap<i64, String>,
    /// Every item received, duplicates included, in arrival order
    received: Vec<Uuid>,
    /// Signatures actually applied, in application order
    applied: Vec<(i64, Uuid)>,
    ticks: i64,
}

/// Authoritative server model: idempotent per `local_id`, first arriving
/// signature completes a request, later ones conflict.
pub struct ReferenceServer {
    state: Mutex<ServerState>,
    online: AtomicBool,
    fail_next: AtomicUsize,
    drop_next_acks: AtomicUsize,
    hold: AtomicBool,
    in_flight: AtomicUsize,
    release: Notify,
}

impl Default for ReferenceServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceServer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            online: AtomicBool::new(true),
            fail_next: AtomicUsize::new(0),
            drop_next_acks: AtomicUsize::new(0),
            hold: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            release: Notify::new(),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// The next `n` uploads fail before reaching the server.
    pub fn fail_next_uploads(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// The next `n` uploads are applied but their response is lost.
    pub fn drop_next_acks(&self, n: usize) {
        self.drop_next_acks.store(n, Ordering::SeqCst);
    }

    /// Park uploads until [`ReferenceServer::release_uploads`].
    pub fn hold_uploads(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn release_uploads(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn complete_elsewhere(&self, request_id: i64, server_ref: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .completions
            .insert(request_id, (Uuid::new_v4(), server_ref.to_string()));
    }

    pub fn expire_request(&self, request_id: i64) {
        self.state.lock().unwrap().expired.insert(request_id);
    }

    pub fn reject_request(&self, request_id: i64, reason: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected
            .insert(request_id, reason.to_string());
    }

    pub fn received(&self) -> Vec<Uuid> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn applied_ids(&self) -> Vec<Uuid> {
        self.state
            .lock()
            .unwrap()
            .applied
            .iter()
            .map(|(_, id)| *id)
            .collect()
    }

    /// How many signatures were applied to `request_id`.
    pub fn applied_count(&self, request_id: i64) -> usize {
        self.state
            .lock()
            .unwrap()
            .applied
            .iter()
            .filter(|(r, _)| *r == request_id)
            .count()
    }

    /// Apply a batch and return the per-record results.
    pub fn deliver(&self, items: &[UploadItem]) -> UploadResponse {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let mut results = Vec::with_capacity(items.len());

        for item in items {
            state.received.push(item.local_id);
            if let Some(previous) = state.outcomes.get(&item.local_id) {
                results.push(previous.clone());
                continue;
            }

            state.ticks += 1;
            let server_timestamp = t0() + Duration::seconds(state.ticks);
            let mut result = UploadResultItem {
                local_id: item.local_id,
                status: UploadStatus::Acked,
                server_timestamp,
                reason: None,
                server_ref: None,
            };

            if let Some(reason) = state.rejected.get(&item.request_id) {
                result.status = UploadStatus::Rejected;
                result.reason = Some(reason.clone());
            } else if let Some((_, server_ref)) = state.completions.get(&item.request_id) {
                result.status = UploadStatus::Conflicted;
                result.reason = Some("already_completed".to_string());
                result.server_ref = Some(server_ref.clone());
            } else if state.expired.contains(&item.request_id) {
                result.status = UploadStatus::Conflicted;
                result.reason = Some("expired".to_string());
            } else {
                let server_ref = format!("sig-{}", item.local_id);
                state
                    .completions
                    .insert(item.request_id, (item.local_id, server_ref));
                state.applied.push((item.request_id, item.local_id));
            }

            state.outcomes.insert(item.local_id, result.clone());
            results.push(result);
        }

        UploadResponse { results }
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl UploadApi for ReferenceServer {
    async fn upload_batch(&self, items: &[UploadItem]) -> Result<UploadResponse> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(FieldSignError::NetworkError("server unreachable".to_string()));
        }
        if take_one(&self.fail_next) {
            return Err(FieldSignError::NetworkError("connection reset".to_string()));
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.hold.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let response = self.deliver(items);
        if take_one(&self.drop_next_acks) {
            return Err(FieldSignError::NetworkError("response lost".to_string()));
        }
        Ok(response)
    }

    async fn probe(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// PIN parameters cheap enough for tests.
pub fn fast_params() -> PinKdfParams {
    PinKdfParams {
        mem_cost: 8_192,
        time_cost: 1,
        parallelism: 1,
    }
}

pub fn enroll() -> Enrollment {
    Enrollment::new(
        Uuid::new_v4(),
        DeviceKey::generate(),
        Attestor::new(
            Rut::parse(RUT).unwrap(),
            PinVerifier::create(PIN, fast_params()).unwrap(),
        ),
    )
}

pub fn capture_request(request_id: i64, worker_id: i64) -> CaptureRequest {
    CaptureRequest {
        request_id,
        worker_id,
        rut: RUT.to_string(),
        pin: PIN.to_string(),
        signature: format!("strokes for request {}", request_id).into_bytes(),
    }
}

/// An attested, encrypted record captured at `captured_at`.
pub fn signed_record(
    enrollment: &Enrollment,
    request_id: i64,
    captured_at: DateTime<Utc>,
) -> PendingSignatureRecord {
    let (handle, _rx) = QueueHandle::channel(1);
    let capture = SignatureCapture::new(enrollment, handle);
    let mut record = capture
        .prepare_record(&capture_request(request_id, 1))
        .unwrap();
    record.captured_at_local = captured_at;
    record
}

pub fn test_settings() -> SyncSettings {
    SyncSettings {
        batch_max_count: 25,
        batch_max_bytes: 1024 * 1024,
        backoff: BackoffPolicy {
            base: std::time::Duration::from_secs(1),
            cap: std::time::Duration::from_secs(60),
            max_jitter: std::time::Duration::from_millis(200),
        },
        max_attempts: 5,
        poll_interval: std::time::Duration::from_millis(100),
    }
}
