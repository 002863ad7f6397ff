//! SQLite-backed durable queue of pending signatures.

use super::models::{
    ConflictDetail, ConflictReason, FailureInfo, FailureKind, PendingSignatureRecord, QueueStats,
    SyncErrorKind, SyncState,
};
use crate::attestation::AttestationHash;
use crate::audit::{self, AuditEvent, AuditLog};
use crate::clock::{Clock, SystemClock};
use crate::crypto::{CryptoError, EncryptedBlob};
use crate::{DatabaseError, FieldSignError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, Row, ToSql};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Current schema version, stored in `PRAGMA user_version`.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

const CREATE_QUEUE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS pending_signatures (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        local_id TEXT NOT NULL UNIQUE,
        request_id INTEGER NOT NULL,
        worker_id INTEGER NOT NULL,
        signature_blob BLOB NOT NULL,
        captured_at_local INTEGER NOT NULL,
        attestation_hash TEXT NOT NULL,
        sync_state TEXT NOT NULL DEFAULT 'pending'
            CHECK (sync_state IN ('pending', 'syncing', 'synced', 'conflicted', 'failed')),
        attempt_count INTEGER NOT NULL DEFAULT 0,
        last_attempt_at INTEGER,
        next_attempt_at INTEGER,
        failure_kind TEXT,
        failure_error TEXT,
        failure_detail TEXT,
        needs_attention INTEGER NOT NULL DEFAULT 0,
        conflict_reason TEXT,
        conflict_server_ref TEXT,
        conflict_detail TEXT,
        server_timestamp INTEGER,
        acknowledged_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_pending_state
        ON pending_signatures(sync_state, captured_at_local, seq);
    CREATE INDEX IF NOT EXISTS idx_pending_worker ON pending_signatures(worker_id);
";

const SELECT_RECORD: &str = "SELECT local_id, request_id, worker_id, signature_blob,
    captured_at_local, attestation_hash, sync_state, attempt_count, last_attempt_at,
    next_attempt_at, failure_kind, failure_error, failure_detail, needs_attention,
    conflict_reason, conflict_server_ref, conflict_detail, server_timestamp, acknowledged_at
    FROM pending_signatures";

/// Records the engine still has to deliver.
const UNSYNCED: &str = "(sync_state IN ('pending', 'syncing')
    OR (sync_state = 'failed' AND failure_kind = 'retryable' AND needs_attention = 0))";

/// The device's durable signature queue.
///
/// Every mutation runs in its own transaction together with the audit entry
/// describing it. The database is opened with `journal_mode=WAL` and
/// `synchronous=FULL`, so a mutation that returned `Ok` survives a crash or
/// power loss.
///
/// Mutating methods take `&mut self`: one owner (the sync engine's run loop)
/// is the only writer for a given database.
pub struct SignatureQueue {
    conn: Connection,
    clock: Arc<dyn Clock>,
    max_queue_bytes: Option<u64>,
}

impl SignatureQueue {
    /// Open (or create) the queue at `path` and recover interrupted uploads.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock<P: AsRef<Path>>(path: P, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut queue = Self::connect(path.as_ref(), clock)?;

        let recovered = queue.recover_interrupted()?;
        if recovered > 0 {
            warn!(recovered, "Recovered uploads interrupted by restart");
        }
        Ok(queue)
    }

    /// Open a queue that a running sync engine may own, for out-of-band
    /// appends and acknowledgements. Crash recovery is left to the owner.
    pub fn open_secondary<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::connect(path.as_ref(), Arc::new(SystemClock))
    }

    fn connect(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let queue = Self {
            conn,
            clock,
            max_queue_bytes: None,
        };
        queue.initialize_schema()?;
        Ok(queue)
    }

    /// Open an existing queue for inspection only. No recovery is run.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let queue = Self {
            conn,
            clock: Arc::new(SystemClock),
            max_queue_bytes: None,
        };
        queue.validate_schema_version()?;
        Ok(queue)
    }

    /// Create a new in-memory queue for testing
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with_clock(Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let queue = Self {
            conn,
            clock,
            max_queue_bytes: None,
        };
        queue.initialize_schema()?;
        Ok(queue)
    }

    /// Cap the total ciphertext stored in the queue.
    pub fn with_max_queue_bytes(mut self, max: Option<u64>) -> Self {
        self.max_queue_bytes = max;
        self
    }

    fn initialize_schema(&self) -> Result<()> {
        self.validate_schema_version()?;
        self.conn.execute_batch(CREATE_QUEUE_TABLE)?;
        self.conn.execute_batch(audit::CREATE_AUDIT_TABLE)?;
        self.conn
            .pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
        Ok(())
    }

    /// Refuse databases written by a newer schema. Version 0 is a fresh file.
    pub fn validate_schema_version(&self) -> Result<()> {
        let found: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;
        if found > CURRENT_SCHEMA_VERSION {
            return Err(DatabaseError::SchemaMismatch {
                expected: CURRENT_SCHEMA_VERSION,
                found,
            }
            .into());
        }
        Ok(())
    }

    /// Persist a freshly captured record.
    ///
    /// Returns only after the insert and its `captured`/`queued` audit
    /// entries have committed.
    pub fn append(&mut self, record: &PendingSignatureRecord) -> Result<()> {
        if record.sync_state != SyncState::Pending {
            return Err(FieldSignError::InvalidStateTransition {
                local_id: record.local_id,
                from: record.sync_state,
                to: SyncState::Pending,
            });
        }
        if !record.signature_blob.is_well_formed() {
            return Err(CryptoError::EncryptionFailed(
                "Signature blob is not a sealed envelope".to_string(),
            )
            .into());
        }

        let now = self.clock.now();
        let size = record.signature_blob.len() as u64;
        let tx = self.conn.transaction()?;

        if audit::has_history(&tx, &record.local_id)? || find_record(&tx, &record.local_id)?.is_some()
        {
            return Err(FieldSignError::DuplicateLocalId(record.local_id));
        }

        if let Some(max) = self.max_queue_bytes {
            let stored = quota_bytes(&tx)?;
            if stored + size > max {
                return Err(FieldSignError::StorageFull(format!(
                    "queue holds {} of {} bytes, record needs {}",
                    stored, max, size
                )));
            }
        }

        tx.execute(
            "INSERT INTO pending_signatures (
                local_id, request_id, worker_id, signature_blob,
                captured_at_local, attestation_hash, sync_state, attempt_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0)",
            params![
                record.local_id.to_string(),
                record.request_id,
                record.worker_id,
                record.signature_blob.as_bytes(),
                to_millis(record.captured_at_local),
                record.attestation_hash.as_str(),
            ],
        )?;
        audit::record(
            &tx,
            &record.local_id,
            AuditEvent::Captured,
            record.captured_at_local,
            &format!("request {} worker {}", record.request_id, record.worker_id),
            false,
        )?;
        audit::record(
            &tx,
            &record.local_id,
            AuditEvent::Queued,
            now,
            &format!("{} bytes", size),
            false,
        )?;
        tx.commit()?;

        debug!(local_id = %record.local_id, request_id = record.request_id, "Signature queued");
        Ok(())
    }

    /// Oldest-first records eligible for upload now: pending ones and
    /// retryable failures whose backoff delay has elapsed.
    ///
    /// The batch holds at most `max_count` records and `max_bytes` of
    /// ciphertext, except that a single oversized record is still returned
    /// on its own.
    pub fn peek_batch(&self, max_count: usize, max_bytes: usize) -> Result<Vec<PendingSignatureRecord>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let now = to_millis(self.clock.now());
        let candidates = query_records(
            &self.conn,
            &format!(
                "{} WHERE sync_state = 'pending'
                    OR (sync_state = 'failed' AND failure_kind = 'retryable'
                        AND needs_attention = 0
                        AND (next_attempt_at IS NULL OR next_attempt_at <= ?1))
                 ORDER BY captured_at_local ASC, seq ASC LIMIT ?2",
                SELECT_RECORD
            ),
            params![now, max_count as i64],
        )?;

        let mut batch = Vec::with_capacity(candidates.len());
        let mut total = 0usize;
        for record in candidates {
            let size = record.signature_blob.len();
            if !batch.is_empty() && total + size > max_bytes {
                break;
            }
            total += size;
            batch.push(record);
        }
        Ok(batch)
    }

    /// Begin an upload attempt. Returns the new attempt count.
    pub fn mark_syncing(&mut self, local_id: &Uuid) -> Result<u32> {
        let now = self.clock.now();
        let tx = self.conn.transaction()?;
        let record = load_record(&tx, local_id)?;
        if !record.is_retry_eligible(now) {
            return Err(FieldSignError::InvalidStateTransition {
                local_id: *local_id,
                from: record.sync_state,
                to: SyncState::Syncing,
            });
        }

        let attempt = record.attempt_count + 1;
        tx.execute(
            "UPDATE pending_signatures
             SET sync_state = 'syncing', attempt_count = ?2,
                 last_attempt_at = ?3, next_attempt_at = NULL
             WHERE local_id = ?1",
            params![local_id.to_string(), attempt, to_millis(now)],
        )?;
        audit::record(
            &tx,
            local_id,
            AuditEvent::SyncAttempt,
            now,
            &format!("attempt {}", attempt),
            false,
        )?;
        tx.commit()?;
        Ok(attempt)
    }

    /// The server applied the signature.
    pub fn mark_synced(&mut self, local_id: &Uuid, server_timestamp: DateTime<Utc>) -> Result<()> {
        let now = self.clock.now();
        let tx = self.conn.transaction()?;
        require_state(&load_record(&tx, local_id)?, SyncState::Syncing, SyncState::Synced)?;

        tx.execute(
            "UPDATE pending_signatures
             SET sync_state = 'synced', server_timestamp = ?2,
                 failure_kind = NULL, failure_error = NULL, failure_detail = NULL
             WHERE local_id = ?1",
            params![local_id.to_string(), to_millis(server_timestamp)],
        )?;
        audit::record(
            &tx,
            local_id,
            AuditEvent::SyncSuccess,
            now,
            &format!("applied at {}", server_timestamp.to_rfc3339()),
            false,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The attempt failed. Fatal failures are flagged for attention and
    /// never retried; retryable ones wait until `next_attempt_at`.
    pub fn mark_failed(
        &mut self,
        local_id: &Uuid,
        failure: &FailureInfo,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = self.clock.now();
        let tx = self.conn.transaction()?;
        require_state(&load_record(&tx, local_id)?, SyncState::Syncing, SyncState::Failed)?;

        let needs_attention = failure.kind == FailureKind::Fatal;
        let next_attempt_at = if needs_attention {
            None
        } else {
            next_attempt_at.map(to_millis)
        };

        tx.execute(
            "UPDATE pending_signatures
             SET sync_state = 'failed', failure_kind = ?2, failure_error = ?3,
                 failure_detail = ?4, needs_attention = ?5, next_attempt_at = ?6
             WHERE local_id = ?1",
            params![
                local_id.to_string(),
                failure.kind.as_str(),
                failure.error.as_str(),
                failure.detail,
                needs_attention,
                next_attempt_at,
            ],
        )?;
        audit::record(
            &tx,
            local_id,
            AuditEvent::SyncFailure,
            now,
            &format!("{} ({}): {}", failure.error.as_str(), failure.kind.as_str(), failure.detail),
            needs_attention,
        )?;
        tx.commit()?;

        if needs_attention {
            warn!(%local_id, error = failure.error.as_str(), "Signature needs attention");
        }
        Ok(())
    }

    /// The server no longer accepts this signature.
    pub fn mark_conflicted(&mut self, local_id: &Uuid, conflict: &ConflictDetail) -> Result<()> {
        let now = self.clock.now();
        let tx = self.conn.transaction()?;
        require_state(&load_record(&tx, local_id)?, SyncState::Syncing, SyncState::Conflicted)?;

        let (reason, server_ref, audit_detail) = match &conflict.reason {
            ConflictReason::AlreadyCompleted { server_ref } if server_ref.is_empty() => (
                "already_completed",
                None,
                format!("{} (server sent no reference)", conflict.detail),
            ),
            ConflictReason::AlreadyCompleted { server_ref } => (
                "already_completed",
                Some(server_ref.as_str()),
                format!("{} (server ref {})", conflict.detail, server_ref),
            ),
            ConflictReason::Expired => ("expired", None, conflict.detail.clone()),
        };

        tx.execute(
            "UPDATE pending_signatures
             SET sync_state = 'conflicted', conflict_reason = ?2, conflict_server_ref = ?3,
                 conflict_detail = ?4, server_timestamp = ?5
             WHERE local_id = ?1",
            params![
                local_id.to_string(),
                reason,
                server_ref,
                conflict.detail,
                to_millis(conflict.server_timestamp),
            ],
        )?;
        audit::record(&tx, local_id, AuditEvent::SyncConflict, now, &audit_detail, false)?;
        tx.commit()?;
        Ok(())
    }

    /// Delete synced records. All-or-nothing: if any id is not `Synced`,
    /// nothing is removed.
    pub fn remove(&mut self, local_ids: &[Uuid]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for local_id in local_ids {
            require_state(&load_record(&tx, local_id)?, SyncState::Synced, SyncState::Synced)?;
            tx.execute(
                "DELETE FROM pending_signatures WHERE local_id = ?1",
                [local_id.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Return records whose upload was cancelled to `Pending`. Their state
    /// is as if the upload was never sent.
    pub fn revert_to_pending(&mut self, local_ids: &[Uuid]) -> Result<()> {
        let now = self.clock.now();
        let tx = self.conn.transaction()?;
        for local_id in local_ids {
            require_state(&load_record(&tx, local_id)?, SyncState::Syncing, SyncState::Pending)?;
            revert(&tx, local_id, now, "upload cancelled before acknowledgement")?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Revert every record left in `Syncing` by a crash and drop `Synced`
    /// rows whose removal never ran. Runs on open. Returns the number of
    /// reverted records.
    pub fn recover_interrupted(&mut self) -> Result<usize> {
        let now = self.clock.now();
        let tx = self.conn.transaction()?;

        let ids: Vec<String> = {
            let mut stmt =
                tx.prepare("SELECT local_id FROM pending_signatures WHERE sync_state = 'syncing'")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let ids = rows.collect::<std::result::Result<Vec<_>, _>>()?;
            ids
        };

        for id in &ids {
            let local_id = parse_uuid(id)?;
            revert(&tx, &local_id, now, "interrupted upload reverted at startup")?;
        }
        // the sync_success entry is already in the audit log
        let swept = tx.execute("DELETE FROM pending_signatures WHERE sync_state = 'synced'", [])?;
        tx.commit()?;

        if swept > 0 {
            info!(swept, "Removed synced records left behind by an interrupted cycle");
        }
        Ok(ids.len())
    }

    /// Operator acknowledgement of a conflicted or attention-needed record.
    /// The record stays in the store but leaves the conflict and attention
    /// lists. Acknowledging twice is a no-op.
    pub fn acknowledge(&mut self, local_id: &Uuid) -> Result<()> {
        let now = self.clock.now();
        let tx = self.conn.transaction()?;
        let record = load_record(&tx, local_id)?;

        let eligible = record.sync_state == SyncState::Conflicted
            || (record.sync_state == SyncState::Failed && record.needs_attention);
        if !eligible {
            return Err(FieldSignError::NotAcknowledgeable {
                local_id: *local_id,
                state: record.sync_state,
            });
        }
        if record.acknowledged_at.is_some() {
            return Ok(());
        }

        tx.execute(
            "UPDATE pending_signatures SET acknowledged_at = ?2 WHERE local_id = ?1",
            params![local_id.to_string(), to_millis(now)],
        )?;
        audit::record(
            &tx,
            local_id,
            AuditEvent::Acknowledged,
            now,
            &format!("acknowledged in state {}", record.sync_state),
            false,
        )?;
        tx.commit()?;

        info!(%local_id, "Record acknowledged");
        Ok(())
    }

    pub fn get(&self, local_id: &Uuid) -> Result<Option<PendingSignatureRecord>> {
        find_record(&self.conn, local_id)
    }

    /// All records in `state`, oldest first.
    pub fn records_in(&self, state: SyncState) -> Result<Vec<PendingSignatureRecord>> {
        query_records(
            &self.conn,
            &format!(
                "{} WHERE sync_state = ?1 ORDER BY captured_at_local ASC, seq ASC",
                SELECT_RECORD
            ),
            params![state.as_str()],
        )
    }

    /// Unacknowledged conflicts, oldest first
    pub fn conflicts(&self) -> Result<Vec<PendingSignatureRecord>> {
        query_records(
            &self.conn,
            &format!(
                "{} WHERE sync_state = 'conflicted' AND acknowledged_at IS NULL
                 ORDER BY captured_at_local ASC, seq ASC",
                SELECT_RECORD
            ),
            params![],
        )
    }

    /// Unacknowledged failures that will not be retried automatically
    pub fn needing_attention(&self) -> Result<Vec<PendingSignatureRecord>> {
        query_records(
            &self.conn,
            &format!(
                "{} WHERE needs_attention = 1 AND acknowledged_at IS NULL
                 ORDER BY captured_at_local ASC, seq ASC",
                SELECT_RECORD
            ),
            params![],
        )
    }

    /// Earliest time a backed-off record becomes eligible again.
    pub fn next_retry_at(&self) -> Result<Option<DateTime<Utc>>> {
        let next: Option<i64> = self.conn.query_row(
            "SELECT MIN(next_attempt_at) FROM pending_signatures
             WHERE sync_state = 'failed' AND failure_kind = 'retryable' AND needs_attention = 0",
            [],
            |row| row.get(0),
        )?;
        next.map(from_millis).transpose()
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();

        {
            let mut stmt = self.conn.prepare(
                "SELECT sync_state, COUNT(*), COALESCE(SUM(LENGTH(signature_blob)), 0)
                 FROM pending_signatures GROUP BY sync_state",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let state: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                let bytes: i64 = row.get(2)?;
                let state = SyncState::parse(&state)
                    .ok_or_else(|| DatabaseError::CorruptRow(format!("sync_state: {}", state)))?;
                stats.by_state.insert(state, count as u64);
                stats.depth += count as u64;
                stats.stored_bytes += bytes as u64;
            }
        }

        stats.pending_count = self.count_where(UNSYNCED)?;
        stats.needs_attention = self.count_where("needs_attention = 1 AND acknowledged_at IS NULL")?;
        stats.unacknowledged_count = self.count_where(
            "(sync_state = 'conflicted' OR needs_attention = 1) AND acknowledged_at IS NULL",
        )?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT worker_id, COUNT(*) FROM pending_signatures WHERE {} GROUP BY worker_id",
            UNSYNCED
        ))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let worker_id: i64 = row.get(0)?;
            let count: i64 = row.get(1)?;
            stats.by_worker.insert(worker_id, count as u64);
        }

        Ok(stats)
    }

    /// Read-only view of the audit ledger.
    pub fn audit(&self) -> AuditLog<'_> {
        AuditLog::new(&self.conn)
    }

    fn count_where(&self, predicate: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM pending_signatures WHERE {}", predicate),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn revert(conn: &Connection, local_id: &Uuid, now: DateTime<Utc>, reason: &str) -> Result<()> {
    conn.execute(
        "UPDATE pending_signatures SET sync_state = 'pending', next_attempt_at = NULL
         WHERE local_id = ?1",
        [local_id.to_string()],
    )?;
    audit::record(conn, local_id, AuditEvent::SyncFailure, now, reason, false)
}

fn require_state(record: &PendingSignatureRecord, expected: SyncState, to: SyncState) -> Result<()> {
    if record.sync_state != expected {
        return Err(FieldSignError::InvalidStateTransition {
            local_id: record.local_id,
            from: record.sync_state,
            to,
        });
    }
    Ok(())
}

/// Ciphertext counted against the quota. Acknowledged terminal records are
/// kept for the record but no longer count.
fn quota_bytes(conn: &Connection) -> Result<u64> {
    let bytes: i64 = conn.query_row(
        "SELECT COALESCE(SUM(LENGTH(signature_blob)), 0) FROM pending_signatures
         WHERE acknowledged_at IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(bytes as u64)
}

fn load_record(conn: &Connection, local_id: &Uuid) -> Result<PendingSignatureRecord> {
    find_record(conn, local_id)?
        .ok_or_else(|| FieldSignError::NotFound(format!("signature {}", local_id)))
}

fn find_record(conn: &Connection, local_id: &Uuid) -> Result<Option<PendingSignatureRecord>> {
    let mut stmt = conn.prepare(&format!("{} WHERE local_id = ?1", SELECT_RECORD))?;
    let mut rows = stmt.query([local_id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(record_from_row(row)?)),
        None => Ok(None),
    }
}

fn query_records(
    conn: &Connection,
    sql: &str,
    args: &[&dyn ToSql],
) -> Result<Vec<PendingSignatureRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(args)?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(record_from_row(row)?);
    }
    Ok(records)
}

fn record_from_row(row: &Row<'_>) -> Result<PendingSignatureRecord> {
    let local_id: String = row.get(0)?;
    let sync_state: String = row.get(6)?;
    let failure_kind: Option<String> = row.get(10)?;
    let conflict_reason: Option<String> = row.get(14)?;
    let server_timestamp: Option<i64> = row.get(17)?;

    let failure = match failure_kind {
        Some(kind) => {
            let error: Option<String> = row.get(11)?;
            let error = error.unwrap_or_default();
            Some(FailureInfo {
                kind: FailureKind::parse(&kind)
                    .ok_or_else(|| DatabaseError::CorruptRow(format!("failure_kind: {}", kind)))?,
                error: SyncErrorKind::parse(&error)
                    .ok_or_else(|| DatabaseError::CorruptRow(format!("failure_error: {}", error)))?,
                detail: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
            })
        }
        None => None,
    };

    let server_timestamp = server_timestamp.map(from_millis).transpose()?;
    let conflict = match conflict_reason.as_deref() {
        Some(reason) => {
            let reason = match reason {
                "already_completed" => ConflictReason::AlreadyCompleted {
                    server_ref: row.get::<_, Option<String>>(15)?.unwrap_or_default(),
                },
                "expired" => ConflictReason::Expired,
                other => {
                    return Err(
                        DatabaseError::CorruptRow(format!("conflict_reason: {}", other)).into(),
                    )
                }
            };
            Some(ConflictDetail {
                reason,
                detail: row.get::<_, Option<String>>(16)?.unwrap_or_default(),
                server_timestamp: server_timestamp.ok_or_else(|| {
                    DatabaseError::CorruptRow("conflict without server timestamp".to_string())
                })?,
            })
        }
        None => None,
    };

    Ok(PendingSignatureRecord {
        local_id: parse_uuid(&local_id)?,
        request_id: row.get(1)?,
        worker_id: row.get(2)?,
        signature_blob: EncryptedBlob::from_stored(row.get(3)?),
        captured_at_local: from_millis(row.get(4)?)?,
        attestation_hash: AttestationHash::from_stored(row.get(5)?),
        sync_state: SyncState::parse(&sync_state)
            .ok_or_else(|| DatabaseError::CorruptRow(format!("sync_state: {}", sync_state)))?,
        attempt_count: row.get(7)?,
        last_attempt_at: row.get::<_, Option<i64>>(8)?.map(from_millis).transpose()?,
        next_attempt_at: row.get::<_, Option<i64>>(9)?.map(from_millis).transpose()?,
        failure,
        needs_attention: row.get(13)?,
        conflict,
        server_timestamp,
        acknowledged_at: row.get::<_, Option<i64>>(18)?.map(from_millis).transpose()?,
    })
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::CorruptRow(format!("local_id: {}", e)).into())
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DatabaseError::CorruptRow(format!("timestamp out of range: {}", ms)).into())
}
