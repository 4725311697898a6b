//! Durable relational store backed by SQLite.
//!
//! Persists events, thread and turn aggregates, the archive catalog, and
//! the migration ledger. Uniqueness constraints are the pipeline's safety
//! net: every write is idempotent on its key, so at-least-once delivery
//! from the persister can never double-insert.
//!
//! # Schema
//!
//! - `agent_events`: one row per event, `event_id` primary key, unique
//!   `(thread_id, seq)`.
//! - `threads`: derived aggregate per thread; `last_seq` only ratchets up.
//! - `turns`: derived aggregate per `(thread_id, turn_id)`; `completed_at`
//!   is set once by the first terminal event and never changes after.
//! - `event_archives`: catalog of cold ranges, keyed by `archive_id`.
//! - `schema_migrations`: write-once version ledger.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::value::RawValue;
use tracing::debug;

use turnbus_core::error::{Classify, ErrorKind};
use turnbus_core::event::{types, Event, InvalidEvent, Level};
use turnbus_core::SPEC_VERSION;

pub mod migrations;

#[cfg(test)]
mod tests;

/// Fallback idle timeout recorded when the caller passes a non-positive
/// value.
const FALLBACK_IDLE_TIMEOUT_SECONDS: i64 = 900;

/// Errors from durable store operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The connection mutex was poisoned by a panicking holder.
    #[error("store lock poisoned")]
    LockPoisoned,

    /// A caller-supplied parameter failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The event failed protocol validation before any write.
    #[error("event invalid: {0}")]
    InvalidEvent(#[from] InvalidEvent),

    /// A stored row no longer decodes to a valid event.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Anything SQLite reported.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::LockPoisoned => ErrorKind::Transient,
            Self::InvalidArgument(_) | Self::InvalidEvent(_) => ErrorKind::InvalidInput,
            Self::Corrupt(_) => ErrorKind::Poison,
            Self::Sqlite(err) => classify_sqlite(err),
        }
    }
}

fn classify_sqlite(err: &rusqlite::Error) -> ErrorKind {
    use rusqlite::ErrorCode;
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => ErrorKind::Transient,
        Some(ErrorCode::ConstraintViolation) => ErrorKind::Conflict,
        _ => ErrorKind::Fatal,
    }
}

/// Thread aggregate row.
#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    pub thread_id: String,
    pub tenant_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub idle_timeout_seconds: i64,
    pub last_seq: i64,
}

/// Turn aggregate row.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub thread_id: String,
    pub turn_id: String,
    pub status: String,
    /// Raw JSON captured from the first `turn.input` event, `{}` before.
    pub input: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Archive catalog row. `from_seq`/`to_seq` are the actual extremes of the
/// archived batch, both inclusive.
#[derive(Debug, Clone, Serialize)]
pub struct EventArchive {
    pub archive_id: String,
    pub thread_id: String,
    pub from_seq: i64,
    pub to_seq: i64,
    pub object_key: String,
    pub content_encoding: String,
    pub content_type: String,
    pub event_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Events plus the actual seq extremes returned by an archive query. The
/// extremes may be tighter than the requested bounds when the range is
/// sparse at either end.
#[derive(Debug)]
pub struct ArchiveQuery {
    pub events: Vec<Event>,
    pub min_seq: i64,
    pub max_seq: i64,
}

/// Sink the persister writes through. Split from [`DurableStore`] so the
/// consumer loop can be exercised against failure-injecting doubles.
pub trait EventSink: Send + Sync {
    fn persist_event(
        &self,
        tenant_id: &str,
        idle_timeout_seconds: i64,
        event: &Event,
    ) -> Result<(), StoreError>;
}

/// SQLite-backed durable store. Cheap to clone; all clones share one
/// connection behind a mutex.
#[derive(Clone)]
pub struct DurableStore {
    conn: Arc<Mutex<Connection>>,
}

impl DurableStore {
    /// Opens (creating if needed) the database at `path` in WAL mode.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, used by tests and throwaway tooling.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Writes one event and its derived aggregates in a single
    /// transaction. Safe to call any number of times with the same event.
    pub fn persist_event_tx(
        &self,
        tenant_id: &str,
        idle_timeout_seconds: i64,
        event: &Event,
    ) -> Result<(), StoreError> {
        if tenant_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument("tenant_id is required"));
        }
        let idle_timeout_seconds = if idle_timeout_seconds > 0 {
            idle_timeout_seconds
        } else {
            FALLBACK_IDLE_TIMEOUT_SECONDS
        };
        event.validate()?;

        let source = encode_bag(&event.source)?;
        let trace = encode_bag(&event.trace)?;
        let tags = event
            .tags
            .as_ref()
            .map(|t| serde_json::to_string(t).map_err(|e| StoreError::Corrupt(e.to_string())))
            .transpose()?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO agent_events
               (event_id, thread_id, seq, turn_id, ts, type, level, payload, source, trace, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT (event_id) DO NOTHING",
            params![
                event.event_id,
                event.thread_id,
                event.seq,
                event.turn_id,
                event.ts,
                event.kind,
                event.level.to_string(),
                event.payload_str(),
                source,
                trace,
                tags,
            ],
        )?;

        let status = if event.is_terminal() { "idle" } else { "active" };
        let now = Utc::now();
        tx.execute(
            "INSERT INTO threads
               (thread_id, tenant_id, status, created_at, last_active_at, idle_timeout_seconds, last_seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (thread_id) DO UPDATE SET
               tenant_id = excluded.tenant_id,
               status = excluded.status,
               last_active_at = excluded.last_active_at,
               idle_timeout_seconds = excluded.idle_timeout_seconds,
               last_seq = MAX(threads.last_seq, excluded.last_seq)",
            params![
                event.thread_id,
                tenant_id,
                status,
                now,
                now,
                idle_timeout_seconds,
                event.seq,
            ],
        )?;

        let turn_status = types::turn_status(&event.kind);
        let completed_at = event.is_terminal().then_some(event.ts);
        if event.kind == types::TURN_INPUT {
            // First turn.input wins the input capture; later ones are
            // no-ops unless nothing was captured yet.
            tx.execute(
                "INSERT INTO turns (thread_id, turn_id, status, input, created_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (thread_id, turn_id) DO UPDATE SET
                   status = excluded.status,
                   input = CASE WHEN turns.input = '{}' THEN excluded.input ELSE turns.input END,
                   completed_at = COALESCE(turns.completed_at, excluded.completed_at)",
                params![
                    event.thread_id,
                    event.turn_id,
                    turn_status,
                    event.payload_str(),
                    event.ts,
                    completed_at,
                ],
            )?;
        } else {
            tx.execute(
                "INSERT INTO turns (thread_id, turn_id, status, input, created_at, completed_at)
                 VALUES (?1, ?2, ?3, '{}', ?4, ?5)
                 ON CONFLICT (thread_id, turn_id) DO UPDATE SET
                   status = excluded.status,
                   completed_at = COALESCE(turns.completed_at, excluded.completed_at)",
                params![
                    event.thread_id,
                    event.turn_id,
                    turn_status,
                    event.ts,
                    completed_at,
                ],
            )?;
        }

        tx.commit()?;
        debug!(
            thread_id = %event.thread_id,
            seq = event.seq,
            event_id = %event.event_id,
            "persisted event"
        );
        Ok(())
    }

    pub fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, StoreError> {
        if thread_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument("thread_id is required"));
        }
        let conn = self.lock()?;
        conn.query_row(
            "SELECT thread_id, tenant_id, status, created_at, last_active_at,
                    idle_timeout_seconds, last_seq
             FROM threads WHERE thread_id = ?1",
            params![thread_id],
            |row| {
                Ok(Thread {
                    thread_id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    status: row.get(2)?,
                    created_at: row.get(3)?,
                    last_active_at: row.get(4)?,
                    idle_timeout_seconds: row.get(5)?,
                    last_seq: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn get_turn(&self, thread_id: &str, turn_id: &str) -> Result<Option<Turn>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT thread_id, turn_id, status, input, created_at, completed_at
             FROM turns WHERE thread_id = ?1 AND turn_id = ?2",
            params![thread_id, turn_id],
            |row| {
                Ok(Turn {
                    thread_id: row.get(0)?,
                    turn_id: row.get(1)?,
                    status: row.get(2)?,
                    input: row.get(3)?,
                    created_at: row.get(4)?,
                    completed_at: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Events with `seq > from_seq`, ascending, capped at `limit`
    /// (default 500, max 5000).
    pub fn list_events(
        &self,
        thread_id: &str,
        from_seq: i64,
        limit: i64,
    ) -> Result<Vec<Event>, StoreError> {
        if thread_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument("thread_id is required"));
        }
        let from_seq = from_seq.max(0);
        let limit = match limit {
            l if l <= 0 => 500,
            l => l.min(5000),
        };
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, thread_id, seq, turn_id, ts, type, level, payload, source, trace, tags
             FROM agent_events
             WHERE thread_id = ?1 AND seq > ?2
             ORDER BY seq ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![thread_id, from_seq, limit], event_row)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(event_from_row(row?)?);
        }
        Ok(events)
    }

    /// Events with `from_seq <= seq <= to_seq` plus the actual extremes of
    /// the rows returned.
    pub fn list_events_for_archive(
        &self,
        thread_id: &str,
        from_seq: i64,
        to_seq: i64,
        limit: i64,
    ) -> Result<ArchiveQuery, StoreError> {
        if thread_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument("thread_id is required"));
        }
        let from_seq = from_seq.max(0);
        if to_seq < from_seq {
            return Err(StoreError::InvalidArgument("invalid seq range"));
        }
        let limit = if limit <= 0 { 5000 } else { limit };
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, thread_id, seq, turn_id, ts, type, level, payload, source, trace, tags
             FROM agent_events
             WHERE thread_id = ?1 AND seq >= ?2 AND seq <= ?3
             ORDER BY seq ASC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(params![thread_id, from_seq, to_seq, limit], event_row)?;
        let mut result = ArchiveQuery {
            events: Vec::new(),
            min_seq: 0,
            max_seq: 0,
        };
        for row in rows {
            let event = event_from_row(row?)?;
            if result.events.is_empty() {
                result.min_seq = event.seq;
            }
            // Rows come back ascending, so the last one carries the max.
            result.max_seq = event.seq;
            result.events.push(event);
        }
        Ok(result)
    }

    /// Records an archive catalog row. Idempotent on `archive_id`.
    pub fn insert_archive(&self, archive: &EventArchive) -> Result<(), StoreError> {
        if archive.archive_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument("archive_id is required"));
        }
        if archive.thread_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument("thread_id is required"));
        }
        if archive.object_key.trim().is_empty() {
            return Err(StoreError::InvalidArgument("object_key is required"));
        }
        if archive.to_seq < archive.from_seq {
            return Err(StoreError::InvalidArgument("invalid seq range"));
        }
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO event_archives
               (archive_id, thread_id, from_seq, to_seq, object_key,
                content_encoding, content_type, event_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (archive_id) DO NOTHING",
            params![
                archive.archive_id,
                archive.thread_id,
                archive.from_seq,
                archive.to_seq,
                archive.object_key,
                archive.content_encoding,
                archive.content_type,
                archive.event_count,
                archive.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_archive(&self, archive_id: &str) -> Result<Option<EventArchive>, StoreError> {
        if archive_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument("archive_id is required"));
        }
        let conn = self.lock()?;
        conn.query_row(
            "SELECT archive_id, thread_id, from_seq, to_seq, object_key,
                    content_encoding, content_type, event_count, created_at
             FROM event_archives WHERE archive_id = ?1",
            params![archive_id],
            archive_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Archive catalog of one thread, ordered by `from_seq` ascending,
    /// capped at `limit` (default 100, max 1000).
    pub fn list_archives(
        &self,
        thread_id: &str,
        limit: i64,
    ) -> Result<Vec<EventArchive>, StoreError> {
        if thread_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument("thread_id is required"));
        }
        let limit = match limit {
            l if l <= 0 => 100,
            l => l.min(1000),
        };
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT archive_id, thread_id, from_seq, to_seq, object_key,
                    content_encoding, content_type, event_count, created_at
             FROM event_archives
             WHERE thread_id = ?1
             ORDER BY from_seq ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![thread_id, limit], archive_row)?;
        let mut archives = Vec::new();
        for row in rows {
            archives.push(row?);
        }
        Ok(archives)
    }

    pub fn ensure_migrations_table(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
               version TEXT PRIMARY KEY,
               applied_at TEXT NOT NULL
             )",
            [],
        )?;
        Ok(())
    }

    pub fn is_migration_applied(&self, version: &str) -> Result<bool, StoreError> {
        let version = version.trim();
        if version.is_empty() {
            return Err(StoreError::InvalidArgument("version is required"));
        }
        let conn = self.lock()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1)",
            params![version],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Runs a migration body and its ledger insert in one transaction.
    /// Concurrent migrators are safe: the ledger insert is
    /// `ON CONFLICT DO NOTHING` and the body must be idempotent DDL.
    pub fn apply_migration(&self, version: &str, sql: &str) -> Result<(), StoreError> {
        let version = version.trim();
        if version.is_empty() {
            return Err(StoreError::InvalidArgument("version is required"));
        }
        if sql.trim().is_empty() {
            return Err(StoreError::InvalidArgument("sql is required"));
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)
             ON CONFLICT (version) DO NOTHING",
            params![version, Utc::now()],
        )?;
        tx.commit()?;
        debug!(version, "applied migration");
        Ok(())
    }
}

impl EventSink for DurableStore {
    fn persist_event(
        &self,
        tenant_id: &str,
        idle_timeout_seconds: i64,
        event: &Event,
    ) -> Result<(), StoreError> {
        self.persist_event_tx(tenant_id, idle_timeout_seconds, event)
    }
}

fn encode_bag(
    bag: &Option<serde_json::Map<String, serde_json::Value>>,
) -> Result<Option<String>, StoreError> {
    bag.as_ref()
        .map(|m| serde_json::to_string(m).map_err(|e| StoreError::Corrupt(e.to_string())))
        .transpose()
}

/// Column tuple pulled straight out of an `agent_events` row, before any
/// JSON handling.
struct EventRow {
    event_id: String,
    thread_id: String,
    seq: i64,
    turn_id: String,
    ts: DateTime<Utc>,
    kind: String,
    level: String,
    payload: String,
    source: Option<String>,
    trace: Option<String>,
    tags: Option<String>,
}

fn event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok(EventRow {
        event_id: row.get(0)?,
        thread_id: row.get(1)?,
        seq: row.get(2)?,
        turn_id: row.get(3)?,
        ts: row.get(4)?,
        kind: row.get(5)?,
        level: row.get(6)?,
        payload: row.get(7)?,
        source: row.get(8)?,
        trace: row.get(9)?,
        tags: row.get(10)?,
    })
}

fn event_from_row(row: EventRow) -> Result<Event, StoreError> {
    let level: Level = row
        .level
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("bad level {:?}", row.level)))?;
    let payload = RawValue::from_string(row.payload)
        .map_err(|e| StoreError::Corrupt(format!("bad payload: {e}")))?;
    Ok(Event {
        spec_version: SPEC_VERSION.to_string(),
        event_id: row.event_id,
        thread_id: row.thread_id,
        turn_id: row.turn_id,
        seq: row.seq,
        ts: row.ts,
        kind: row.kind,
        level,
        payload: Some(payload),
        source: decode_bag(row.source.as_deref())?,
        trace: decode_bag(row.trace.as_deref())?,
        tags: row
            .tags
            .as_deref()
            .map(|t| serde_json::from_str(t).map_err(|e| StoreError::Corrupt(e.to_string())))
            .transpose()?,
    })
}

fn decode_bag(
    text: Option<&str>,
) -> Result<Option<serde_json::Map<String, serde_json::Value>>, StoreError> {
    text.map(|t| serde_json::from_str(t).map_err(|e| StoreError::Corrupt(e.to_string())))
        .transpose()
}

fn archive_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventArchive> {
    Ok(EventArchive {
        archive_id: row.get(0)?,
        thread_id: row.get(1)?,
        from_seq: row.get(2)?,
        to_seq: row.get(3)?,
        object_key: row.get(4)?,
        content_encoding: row.get(5)?,
        content_type: row.get(6)?,
        event_count: row.get(7)?,
        created_at: row.get(8)?,
    })
}
