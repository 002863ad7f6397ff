//! Audit ledger of signature lifecycle events.
//!
//! Entries live in the `audit_log` table of the queue database and are
//! written in the same transaction as the transition they describe. The
//! table is append-only (update and delete are refused by triggers) and is
//! independent of the queue rows, so the trail outlives removed records.

use crate::{DatabaseError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle events recorded for each signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Captured,
    Queued,
    SyncAttempt,
    SyncSuccess,
    SyncConflict,
    SyncFailure,
    Acknowledged,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Captured => "captured",
            Self::Queued => "queued",
            Self::SyncAttempt => "sync_attempt",
            Self::SyncSuccess => "sync_success",
            Self::SyncConflict => "sync_conflict",
            Self::SyncFailure => "sync_failure",
            Self::Acknowledged => "acknowledged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "captured" => Self::Captured,
            "queued" => Self::Queued,
            "sync_attempt" => Self::SyncAttempt,
            "sync_success" => Self::SyncSuccess,
            "sync_conflict" => Self::SyncConflict,
            "sync_failure" => Self::SyncFailure,
            "acknowledged" => Self::Acknowledged,
            _ => return None,
        })
    }

    /// Severity level (0-5) shown on the admin panel.
    fn severity(&self, flagged: bool) -> u8 {
        match (self, flagged) {
            (Self::SyncFailure, true) => 5,
            (Self::SyncConflict, _) => 4,
            (_, true) => 4,
            (Self::SyncFailure, false) => 2,
            (Self::Acknowledged, _) => 1,
            (Self::SyncSuccess, _) => 1,
            (Self::Captured | Self::Queued | Self::SyncAttempt, false) => 0,
        }
    }
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub entry_id: i64,
    pub local_id: Uuid,
    pub event: AuditEvent,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
    /// Integrity problems and records escalated for manual attention
    pub flagged: bool,
    pub severity: u8,
}

pub(crate) const CREATE_AUDIT_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS audit_log (
        entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
        local_id TEXT NOT NULL,
        event TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        detail TEXT NOT NULL,
        flagged INTEGER NOT NULL DEFAULT 0,
        severity INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_audit_local_id ON audit_log(local_id);
    CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
    CREATE TRIGGER IF NOT EXISTS audit_log_no_update
        BEFORE UPDATE ON audit_log
        BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END;
    CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
        BEFORE DELETE ON audit_log
        BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END;
";

/// Append an entry. Callers pass their open transaction so the entry
/// commits or rolls back together with the state change.
pub(crate) fn record(
    conn: &Connection,
    local_id: &Uuid,
    event: AuditEvent,
    timestamp: DateTime<Utc>,
    detail: &str,
    flagged: bool,
) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_log (local_id, event, timestamp, detail, flagged, severity)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            local_id.to_string(),
            event.as_str(),
            timestamp.timestamp_millis(),
            detail,
            flagged,
            event.severity(flagged),
        ],
    )?;
    Ok(())
}

/// Whether `local_id` has ever been captured on this device.
pub(crate) fn has_history(conn: &Connection, local_id: &Uuid) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM audit_log WHERE local_id = ?1)",
        [local_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Read-only view of the audit ledger for the admin panel.
pub struct AuditLog<'a> {
    conn: &'a Connection,
}

const SELECT_ENTRY: &str =
    "SELECT entry_id, local_id, event, timestamp, detail, flagged, severity FROM audit_log";

impl<'a> AuditLog<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Most recent entries first
    pub fn entries(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.query(
            &format!("{} ORDER BY entry_id DESC LIMIT ?1", SELECT_ENTRY),
            params![limit as i64],
        )
    }

    /// Entries strictly after `since`, oldest first
    pub fn entries_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditEntry>> {
        self.query(
            &format!("{} WHERE timestamp > ?1 ORDER BY entry_id ASC", SELECT_ENTRY),
            params![since.timestamp_millis()],
        )
    }

    /// Full trail of one record, oldest first
    pub fn entries_for(&self, local_id: &Uuid) -> Result<Vec<AuditEntry>> {
        self.query(
            &format!("{} WHERE local_id = ?1 ORDER BY entry_id ASC", SELECT_ENTRY),
            params![local_id.to_string()],
        )
    }

    pub fn flagged_entries(&self) -> Result<Vec<AuditEntry>> {
        self.query(
            &format!("{} WHERE flagged = 1 ORDER BY entry_id ASC", SELECT_ENTRY),
            params![],
        )
    }

    fn query(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| Ok(RawEntry::from_row(row)))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row??);
        }
        Ok(entries)
    }
}

struct RawEntry;

impl RawEntry {
    fn from_row(row: &Row<'_>) -> Result<AuditEntry> {
        let local_id: String = row.get(1)?;
        let event: String = row.get(2)?;
        let timestamp: i64 = row.get(3)?;

        Ok(AuditEntry {
            entry_id: row.get(0)?,
            local_id: Uuid::parse_str(&local_id)
                .map_err(|e| DatabaseError::CorruptRow(format!("audit local_id: {}", e)))?,
            event: AuditEvent::parse(&event)
                .ok_or_else(|| DatabaseError::CorruptRow(format!("audit event: {}", event)))?,
            timestamp: DateTime::from_timestamp_millis(timestamp).unwrap_or_default(),
            detail: row.get(4)?,
            flagged: row.get(5)?,
            severity: row.get(6)?,
        })
    }
}
