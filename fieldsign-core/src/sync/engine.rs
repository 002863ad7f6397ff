//! Sync engine: drains the queue to the server with batching, idempotent
//! upload, backoff and server-authoritative conflict handling.

use crate::clock::Clock;
use crate::crypto::{decrypt, DeviceKey};
use crate::queue::{
    FailureInfo, PendingSignatureRecord, QueueCommand, SignatureQueue, SyncErrorKind,
};
use crate::sync::backoff::BackoffPolicy;
use crate::sync::client::UploadApi;
use crate::sync::conflict::{ConflictResolver, Resolution};
use crate::sync::models::{UploadItem, UploadResponse, UploadResultItem};
use crate::{FieldSignError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shortest sleep between run-loop cycles.
const MIN_WAKE: Duration = Duration::from_millis(100);

/// Tunables for the sync loop.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub batch_max_count: usize,
    pub batch_max_bytes: usize,
    pub backoff: BackoffPolicy,
    /// Attempts after which a record is escalated instead of retried
    pub max_attempts: u32,
    /// Connectivity re-check interval; also the longest idle sleep
    pub poll_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_max_count: 25,
            batch_max_bytes: 512 * 1024,
            backoff: BackoffPolicy::default(),
            max_attempts: 20,
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// What the engine is doing, for status indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Draining,
    Uploading,
    /// Waiting out retry delays
    Backoff,
}

/// Counts from one or more drained batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub batches: usize,
    pub synced: usize,
    pub conflicted: usize,
    /// Fatal failures and escalations
    pub failed: usize,
    pub retry_scheduled: usize,
}

impl DrainReport {
    fn absorb(&mut self, other: &DrainReport) {
        self.batches += other.batches;
        self.synced += other.synced;
        self.conflicted += other.conflicted;
        self.failed += other.failed;
        self.retry_scheduled += other.retry_scheduled;
    }
}

/// A record claimed for upload in the current batch.
struct Claimed {
    local_id: Uuid,
    attempt: u32,
    attempted_at: DateTime<Utc>,
    item: UploadItem,
}

enum Flow {
    Continue,
    Shutdown,
}

enum Upload {
    Done(Result<UploadResponse>),
    Cancelled(Flow),
}

/// Platform connectivity signal.
struct Connectivity {
    rx: watch::Receiver<bool>,
    closed: bool,
}

impl Connectivity {
    fn is_up(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves on the next transition. Once the signal source is gone the
    /// last value sticks and this never resolves.
    async fn changed(&mut self) {
        if !self.closed && self.rx.changed().await.is_err() {
            debug!("Connectivity signal closed");
            self.closed = true;
        }
        if self.closed {
            std::future::pending::<()>().await;
        }
    }
}

/// The per-device sync loop. Sole owner and writer of the queue while it
/// runs.
pub struct SyncEngine<U, C> {
    queue: SignatureQueue,
    api: U,
    key: Arc<DeviceKey>,
    clock: C,
    settings: SyncSettings,
    phase: watch::Sender<EnginePhase>,
}

impl<U: UploadApi, C: Clock> SyncEngine<U, C> {
    pub fn new(
        queue: SignatureQueue,
        api: U,
        key: Arc<DeviceKey>,
        clock: C,
        settings: SyncSettings,
    ) -> Self {
        let (phase, _) = watch::channel(EnginePhase::Idle);
        Self {
            queue,
            api,
            key,
            clock,
            settings,
            phase,
        }
    }

    /// Follow phase changes.
    pub fn subscribe(&self) -> watch::Receiver<EnginePhase> {
        self.phase.subscribe()
    }

    pub fn queue(&self) -> &SignatureQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut SignatureQueue {
        &mut self.queue
    }

    pub fn into_queue(self) -> SignatureQueue {
        self.queue
    }

    /// Upload a single batch. A report with `batches == 0` means nothing was
    /// eligible.
    pub async fn drain_once(&mut self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        self.set_phase(EnginePhase::Draining);

        let claimed = match self.claim_batch(&mut report)? {
            Some(claimed) => claimed,
            None => return Ok(report),
        };
        if !claimed.is_empty() {
            let items: Vec<UploadItem> = claimed.iter().map(|c| c.item.clone()).collect();
            self.set_phase(EnginePhase::Uploading);
            let response = self.api.upload_batch(&items).await;
            self.finish_batch(claimed, response, &mut report)?;
        }

        self.set_phase(EnginePhase::Draining);
        Ok(report)
    }

    /// Upload batches until nothing is eligible or a retry gets scheduled.
    pub async fn drain(&mut self) -> Result<DrainReport> {
        let mut total = DrainReport::default();
        loop {
            let report = self.drain_once().await?;
            total.absorb(&report);
            if report.batches == 0 || report.retry_scheduled > 0 {
                break;
            }
        }
        self.settle_phase();
        Ok(total)
    }

    /// Run until shutdown is requested or every queue handle is dropped.
    ///
    /// The engine is online when the platform signal says so and the
    /// server answers a probe. Captures sent through `commands` are written
    /// even while an upload is in flight. Losing connectivity or shutting
    /// down mid-upload cancels it and returns the batch to `Pending`.
    ///
    /// Returns the queue so the caller can inspect or close it.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<QueueCommand>,
        connectivity: watch::Receiver<bool>,
    ) -> SignatureQueue {
        info!("Sync engine started");
        let mut connectivity = Connectivity {
            rx: connectivity,
            closed: false,
        };

        loop {
            let online = connectivity.is_up() && self.api.probe().await;

            if online {
                match self.drain_serving(&mut commands, &mut connectivity).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Shutdown) => break,
                    Err(e) => {
                        error!("Sync cycle failed: {}", e);
                        // nothing may stay claimed while the engine waits
                        if let Err(e) = self.queue.recover_interrupted() {
                            error!("Failed to release claimed records: {}", e);
                        }
                    }
                }
            }
            self.settle_phase();

            let wait = self.next_wake(online);
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !command.apply(&mut self.queue) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = connectivity.changed() => {
                    debug!(online = connectivity.is_up(), "Connectivity changed");
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.set_phase(EnginePhase::Idle);
        info!("Sync engine stopped");
        self.queue
    }

    /// Drain while servicing commands and watching connectivity.
    async fn drain_serving(
        &mut self,
        commands: &mut mpsc::Receiver<QueueCommand>,
        connectivity: &mut Connectivity,
    ) -> Result<Flow> {
        let mut total = DrainReport::default();

        while connectivity.is_up() {
            let mut report = DrainReport::default();
            self.set_phase(EnginePhase::Draining);

            let claimed = match self.claim_batch(&mut report)? {
                Some(claimed) => claimed,
                None => break,
            };
            if claimed.is_empty() {
                total.absorb(&report);
                continue;
            }

            let items: Vec<UploadItem> = claimed.iter().map(|c| c.item.clone()).collect();
            self.set_phase(EnginePhase::Uploading);

            let upload = {
                let Self { queue, api, .. } = &mut *self;
                let request = api.upload_batch(&items);
                tokio::pin!(request);
                loop {
                    tokio::select! {
                        response = &mut request => break Upload::Done(response),
                        command = commands.recv() => match command {
                            Some(command) => {
                                if !command.apply(queue) {
                                    break Upload::Cancelled(Flow::Shutdown);
                                }
                            }
                            None => break Upload::Cancelled(Flow::Shutdown),
                        },
                        _ = connectivity.changed() => {
                            if !connectivity.is_up() {
                                break Upload::Cancelled(Flow::Continue);
                            }
                        }
                    }
                }
            };

            match upload {
                Upload::Done(response) => {
                    self.finish_batch(claimed, response, &mut report)?;
                    total.absorb(&report);
                    if report.retry_scheduled > 0 {
                        break;
                    }
                }
                Upload::Cancelled(flow) => {
                    let ids: Vec<Uuid> = claimed.iter().map(|c| c.local_id).collect();
                    self.queue.revert_to_pending(&ids)?;
                    warn!(records = ids.len(), "Upload cancelled; batch returned to pending");
                    total.absorb(&report);
                    log_report(&total);
                    return Ok(flow);
                }
            }
        }

        log_report(&total);
        Ok(Flow::Continue)
    }

    /// Pick the next batch, mark it syncing, and verify every blob still
    /// decrypts. Records that fail verification are failed fatally and left
    /// out of the upload.
    fn claim_batch(&mut self, report: &mut DrainReport) -> Result<Option<Vec<Claimed>>> {
        let batch = self
            .queue
            .peek_batch(self.settings.batch_max_count, self.settings.batch_max_bytes)?;
        if batch.is_empty() {
            return Ok(None);
        }
        report.batches += 1;

        let mut claimed = Vec::with_capacity(batch.len());
        for record in batch {
            let attempt = self.queue.mark_syncing(&record.local_id)?;
            let attempted_at = self.clock.now();

            if let Err(e) = self.verify(&record) {
                error!(local_id = %record.local_id, "Signature blob failed integrity check");
                self.queue.mark_failed(
                    &record.local_id,
                    &FailureInfo::fatal(SyncErrorKind::DecryptionFailed, e.to_string()),
                    None,
                )?;
                report.failed += 1;
                continue;
            }

            claimed.push(Claimed {
                local_id: record.local_id,
                attempt,
                attempted_at,
                item: UploadItem::from(&record),
            });
        }
        Ok(Some(claimed))
    }

    fn verify(&self, record: &PendingSignatureRecord) -> Result<()> {
        // plaintext is zeroized when the buffer drops
        let _plaintext = decrypt(&self.key, &record.signature_blob)?;
        Ok(())
    }

    fn finish_batch(
        &mut self,
        claimed: Vec<Claimed>,
        response: Result<UploadResponse>,
        report: &mut DrainReport,
    ) -> Result<()> {
        match response {
            Ok(response) => {
                let mut results: HashMap<Uuid, UploadResultItem> = response
                    .results
                    .into_iter()
                    .map(|r| (r.local_id, r))
                    .collect();

                for c in &claimed {
                    match results.remove(&c.local_id) {
                        Some(result) => {
                            let resolution =
                                ConflictResolver::resolve(&result.outcome(), result.server_timestamp);
                            self.apply_resolution(c, resolution, report)?;
                        }
                        None => self.fail_retryable(
                            c,
                            SyncErrorKind::MissingOutcome,
                            "server response did not include this record",
                            report,
                        )?,
                    }
                }

                if !results.is_empty() {
                    warn!(unknown = results.len(), "Server returned results for records not in the batch");
                }
            }
            Err(e) if !e.is_retryable() => {
                warn!("Batch failed permanently: {}", e);
                let (kind, detail) = match e {
                    FieldSignError::ServerRejectedValidation(reason) => {
                        (SyncErrorKind::ServerRejectedValidation, reason)
                    }
                    FieldSignError::Crypto(err) => (SyncErrorKind::DecryptionFailed, err.to_string()),
                    other => (SyncErrorKind::ServerRejectedValidation, other.to_string()),
                };
                for c in &claimed {
                    self.queue
                        .mark_failed(&c.local_id, &FailureInfo::fatal(kind, detail.clone()), None)?;
                    report.failed += 1;
                }
            }
            Err(e) => {
                warn!("Batch upload failed: {}", e);
                let detail = e.to_string();
                for c in &claimed {
                    self.fail_retryable(c, SyncErrorKind::NetworkError, &detail, report)?;
                }
            }
        }
        Ok(())
    }

    fn apply_resolution(
        &mut self,
        claimed: &Claimed,
        resolution: Resolution,
        report: &mut DrainReport,
    ) -> Result<()> {
        let local_id = &claimed.local_id;
        match resolution {
            Resolution::MarkSynced { server_timestamp } => {
                self.queue.mark_synced(local_id, server_timestamp)?;
                self.queue.remove(&[*local_id])?;
                report.synced += 1;
                debug!(%local_id, "Signature synced");
            }
            Resolution::MarkConflicted(detail) => {
                self.queue.mark_conflicted(local_id, &detail)?;
                report.conflicted += 1;
                warn!(%local_id, "Signature conflicted: {}", detail.detail);
            }
            Resolution::MarkFailedFatal { reason } => {
                self.queue.mark_failed(
                    local_id,
                    &FailureInfo::fatal(SyncErrorKind::ServerRejectedValidation, reason),
                    None,
                )?;
                report.failed += 1;
            }
        }
        Ok(())
    }

    /// Schedule a retry, or escalate once the attempt ceiling is reached.
    fn fail_retryable(
        &mut self,
        claimed: &Claimed,
        error: SyncErrorKind,
        detail: &str,
        report: &mut DrainReport,
    ) -> Result<()> {
        if claimed.attempt >= self.settings.max_attempts {
            let escalation = FieldSignError::MaxAttemptsExceeded {
                local_id: claimed.local_id,
                attempts: claimed.attempt,
            };
            warn!("{}", escalation);
            self.queue.mark_failed(
                &claimed.local_id,
                &FailureInfo::fatal(
                    SyncErrorKind::MaxAttemptsExceeded,
                    format!("{}; last error {}: {}", escalation, error.as_str(), detail),
                ),
                None,
            )?;
            report.failed += 1;
            return Ok(());
        }

        let delay = self
            .settings
            .backoff
            .delay_for(&claimed.local_id, claimed.attempt);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let next_attempt_at = claimed
            .attempted_at
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.queue.mark_failed(
            &claimed.local_id,
            &FailureInfo::retryable(error, detail),
            Some(next_attempt_at),
        )?;
        report.retry_scheduled += 1;
        Ok(())
    }

    fn next_wake(&self, online: bool) -> Duration {
        let poll = self.settings.poll_interval;
        if !online {
            return poll.max(MIN_WAKE);
        }
        let wait = match self.queue.next_retry_at() {
            Ok(Some(at)) => (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO).min(poll),
            Ok(None) => poll,
            Err(e) => {
                warn!("Could not read retry schedule: {}", e);
                poll
            }
        };
        wait.max(MIN_WAKE)
    }

    fn settle_phase(&self) {
        let phase = match self.queue.next_retry_at() {
            Ok(Some(_)) => EnginePhase::Backoff,
            _ => EnginePhase::Idle,
        };
        self.set_phase(phase);
    }

    fn set_phase(&self, phase: EnginePhase) {
        self.phase.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
    }
}

fn log_report(report: &DrainReport) {
    if report.batches > 0 {
        info!(
            batches = report.batches,
            synced = report.synced,
            conflicted = report.conflicted,
            failed = report.failed,
            retry_scheduled = report.retry_scheduled,
            "Drain finished"
        );
    }
}
