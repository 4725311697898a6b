//! In-process append-only publish/subscribe log with consumer groups.
//!
//! The log owns three families of keys per thread: the per-thread stream
//! `stream:thread:{id}`, the global stream `stream:global:events`, and the
//! thread-scoped sequence counter `seq:thread:{id}`. A bounded-TTL dedupe
//! entry `dedupe:event:{event_id}` backs the idempotent publish.
//!
//! # Atomicity
//!
//! [`idempotent_publish`](StreamLog::idempotent_publish) runs the dedupe
//! check, both stream appends, the approximate trim, and the dedupe record
//! in one critical section under the log's mutex. A concurrent second
//! publish of the same `event_id` either observes the dedupe entry or is
//! serialized after it was written; there is no interleaving in between.
//! The per-thread sequence counter lives here too, so many ingest workers
//! share one allocator and never cache it locally.
//!
//! # Consumer groups
//!
//! Groups follow the usual stream-consumer contract: a group tracks the
//! last delivered id and a pending-entries list per entry, with delivery
//! counts. [`read_group`](StreamLog::read_group) delivers new entries
//! exclusively to one consumer, [`ack`](StreamLog::ack) settles them,
//! [`pending_ext`](StreamLog::pending_ext) enumerates what is unsettled,
//! and [`auto_claim`](StreamLog::auto_claim) transfers entries that sat
//! idle too long. Entries trimmed out from under a pending list are
//! dropped from it during the next claim scan.
//!
//! # Blocking reads
//!
//! [`read`](StreamLog::read) and [`read_group`](StreamLog::read_group)
//! wait up to their block timeout for new entries using an async
//! notifier. Both observe caller cancellation at every await point, so
//! dropping the future abandons the wait cleanly.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::Notify;

use crate::error::{Classify, ErrorKind};

mod entry;


pub use entry::{AutoClaimOutcome, Fields, GroupMessage, PendingInfo, StreamEntry, StreamId};

/// Name of the global stream every ingested event is mirrored to.
pub const GLOBAL_STREAM: &str = "stream:global:events";

/// Default dead-letter stream for entries abandoned by their group.
pub const DEFAULT_DLQ_STREAM: &str = "stream:global:dlq";

/// Default time a dedupe record is held before a retried `event_id` would
/// publish again.
pub const DEFAULT_DEDUPE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub const FIELD_SEQ: &str = "seq";
pub const FIELD_EVENT_ID: &str = "event_id";
pub const FIELD_THREAD_ID: &str = "thread_id";
pub const FIELD_TURN_ID: &str = "turn_id";
pub const FIELD_TS: &str = "ts";
pub const FIELD_TYPE: &str = "type";
pub const FIELD_LEVEL: &str = "level";
pub const FIELD_PAYLOAD: &str = "payload";
pub const FIELD_EVENT: &str = "event";

/// The per-thread stream key.
pub fn thread_stream(thread_id: &str) -> String {
    format!("stream:thread:{thread_id}")
}

fn seq_counter(thread_id: &str) -> String {
    format!("seq:thread:{thread_id}")
}

fn dedupe_key(event_id: &str) -> String {
    format!("dedupe:event:{event_id}")
}

/// Errors from stream log operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StreamLogError {
    /// The log mutex was poisoned by a panicking holder.
    #[error("stream log lock poisoned")]
    LockPoisoned,

    /// A group operation named a group that was never created.
    #[error("no such consumer group {group} on stream {stream}")]
    NoSuchGroup { stream: String, group: String },

    /// `reserve_seq_range` needs a positive count.
    #[error("seq reservation count must be > 0, got {0}")]
    InvalidReservation(i64),

    /// A cursor string did not parse as a stream id.
    #[error("malformed stream id: {0}")]
    MalformedStreamId(String),
}

impl Classify for StreamLogError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::LockPoisoned => ErrorKind::Transient,
            Self::NoSuchGroup { .. }
            | Self::InvalidReservation(_)
            | Self::MalformedStreamId(_) => ErrorKind::InvalidInput,
        }
    }
}

/// Borrowed view of one event as published to the log. The caller has
/// already encoded `event_json`; the log never re-serializes it.
#[derive(Debug, Clone, Copy)]
pub struct PublishRecord<'a> {
    pub thread_id: &'a str,
    pub event_id: &'a str,
    pub seq: i64,
    pub turn_id: &'a str,
    pub ts: &'a str,
    pub kind: &'a str,
    pub level: &'a str,
    pub payload: &'a str,
    pub event_json: &'a str,
}

struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Default)]
struct GroupState {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, PendingState>,
}

#[derive(Default)]
struct StreamState {
    entries: VecDeque<StreamEntry>,
    /// Highest id ever assigned, surviving trims and deletes so new ids
    /// keep increasing.
    last_id: StreamId,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn append(&mut self, fields: Fields) -> StreamId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let id = if now_ms <= self.last_id.ms {
            self.last_id.next()
        } else {
            StreamId { ms: now_ms, seq: 0 }
        };
        self.last_id = id;
        self.entries.push_back(StreamEntry { id, fields });
        id
    }

    fn entry(&self, id: StreamId) -> Option<&StreamEntry> {
        // Entries are id-ordered; binary search keeps range scans cheap.
        self.entries
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|i| &self.entries[i])
    }
}

struct DedupeState {
    stream_id: StreamId,
    seq: i64,
    expires_at: Instant,
}

/// Placement reported by [`StreamLog::idempotent_publish`]. On a
/// duplicate, `stream_id` and `seq` describe the original placement, not
/// the rejected resubmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub stream_id: StreamId,
    pub seq: i64,
    pub duplicated: bool,
}

#[derive(Default)]
struct LogState {
    streams: HashMap<String, StreamState>,
    counters: HashMap<String, i64>,
    dedupe: HashMap<String, DedupeState>,
}

/// The in-process stream log. Cheap to share behind an `Arc`; all methods
/// take `&self`.
#[derive(Default)]
pub struct StreamLog {
    state: Mutex<LogState>,
    appended: Notify,
}

impl StreamLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, LogState>, StreamLogError> {
        self.state.lock().map_err(|_| StreamLogError::LockPoisoned)
    }

    /// Atomically increments the per-thread sequence counter and returns
    /// the new value. First call for a thread returns 1.
    pub fn next_seq(&self, thread_id: &str) -> Result<i64, StreamLogError> {
        let mut state = self.lock()?;
        let counter = state.counters.entry(seq_counter(thread_id)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    /// Reserves `n` consecutive sequence numbers for a thread and returns
    /// the first of the block.
    pub fn reserve_seq_range(&self, thread_id: &str, n: i64) -> Result<i64, StreamLogError> {
        if n <= 0 {
            return Err(StreamLogError::InvalidReservation(n));
        }
        let mut state = self.lock()?;
        let counter = state.counters.entry(seq_counter(thread_id)).or_insert(0);
        *counter += n;
        Ok(*counter - n + 1)
    }

    /// Publishes one event to its per-thread stream and the global stream,
    /// deduplicating by `event_id`.
    ///
    /// On a duplicate the original placement is returned and nothing is
    /// appended. When `trim_max_len > 0` the per-thread stream is
    /// truncated to roughly that length afterwards; a zero `dedupe_ttl`
    /// disables the dedupe record.
    pub fn idempotent_publish(
        &self,
        record: &PublishRecord<'_>,
        trim_max_len: i64,
        dedupe_ttl: Duration,
    ) -> Result<PublishOutcome, StreamLogError> {
        let key = dedupe_key(record.event_id);
        let now = Instant::now();
        {
            let mut state = self.lock()?;
            match state.dedupe.get(&key) {
                Some(existing) if existing.expires_at > now => {
                    return Ok(PublishOutcome {
                        stream_id: existing.stream_id,
                        seq: existing.seq,
                        duplicated: true,
                    });
                }
                Some(_) => {
                    state.dedupe.remove(&key);
                }
                None => {}
            }

            let mut thread_fields = Fields::new();
            thread_fields.insert(FIELD_SEQ.into(), record.seq.to_string());
            thread_fields.insert(FIELD_EVENT_ID.into(), record.event_id.into());
            thread_fields.insert(FIELD_TURN_ID.into(), record.turn_id.into());
            thread_fields.insert(FIELD_TS.into(), record.ts.into());
            thread_fields.insert(FIELD_TYPE.into(), record.kind.into());
            thread_fields.insert(FIELD_LEVEL.into(), record.level.into());
            thread_fields.insert(FIELD_PAYLOAD.into(), record.payload.into());
            thread_fields.insert(FIELD_EVENT.into(), record.event_json.into());

            let stream_key = thread_stream(record.thread_id);
            let stream = state.streams.entry(stream_key.clone()).or_default();
            let stream_id = stream.append(thread_fields);

            let mut global_fields = Fields::new();
            global_fields.insert(FIELD_THREAD_ID.into(), record.thread_id.into());
            global_fields.insert(FIELD_SEQ.into(), record.seq.to_string());
            global_fields.insert(FIELD_EVENT_ID.into(), record.event_id.into());
            global_fields.insert(FIELD_EVENT.into(), record.event_json.into());
            state
                .streams
                .entry(GLOBAL_STREAM.to_string())
                .or_default()
                .append(global_fields);

            if trim_max_len > 0 {
                if let Some(stream) = state.streams.get_mut(&stream_key) {
                    let max = trim_max_len as usize;
                    while stream.entries.len() > max {
                        stream.entries.pop_front();
                    }
                }
            }

            if !dedupe_ttl.is_zero() {
                state.dedupe.insert(
                    key,
                    DedupeState {
                        stream_id,
                        seq: record.seq,
                        expires_at: now + dedupe_ttl,
                    },
                );
            }

            drop(state);
            self.appended.notify_waiters();
            Ok(PublishOutcome {
                stream_id,
                seq: record.seq,
                duplicated: false,
            })
        }
    }

    /// Appends an entry with arbitrary fields to any stream. Used for the
    /// dead-letter stream; event ingest goes through
    /// [`idempotent_publish`](Self::idempotent_publish).
    pub fn add(&self, stream: &str, fields: Fields) -> Result<StreamId, StreamLogError> {
        let id = {
            let mut state = self.lock()?;
            state.streams.entry(stream.to_string()).or_default().append(fields)
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    /// Entries with `start <= id <= end`, oldest first, capped at `count`.
    pub fn range(
        &self,
        stream: &str,
        start: StreamId,
        end: StreamId,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamLogError> {
        let state = self.lock()?;
        let Some(stream) = state.streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(stream
            .entries
            .iter()
            .filter(|e| e.id >= start && e.id <= end)
            .take(count)
            .cloned()
            .collect())
    }

    /// Removes specific entries. Pending references simply dangle and are
    /// dropped on the next claim scan.
    pub fn del(&self, stream: &str, ids: &[StreamId]) -> Result<usize, StreamLogError> {
        let mut state = self.lock()?;
        let Some(stream) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        let before = stream.entries.len();
        stream.entries.retain(|e| !ids.contains(&e.id));
        Ok(before - stream.entries.len())
    }

    /// Best-effort truncation of a stream to `max_len` entries, dropping
    /// the oldest. Returns how many entries were dropped.
    pub fn trim_max_len_approx(
        &self,
        stream: &str,
        max_len: i64,
    ) -> Result<usize, StreamLogError> {
        if max_len < 0 {
            return Ok(0);
        }
        let mut state = self.lock()?;
        let Some(stream) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        let max = max_len as usize;
        let mut dropped = 0;
        while stream.entries.len() > max {
            stream.entries.pop_front();
            dropped += 1;
        }
        Ok(dropped)
    }

    /// Current entry count of a stream.
    pub fn len(&self, stream: &str) -> Result<usize, StreamLogError> {
        let state = self.lock()?;
        Ok(state.streams.get(stream).map_or(0, |s| s.entries.len()))
    }

    /// True when the stream is missing or empty.
    pub fn is_empty(&self, stream: &str) -> Result<bool, StreamLogError> {
        Ok(self.len(stream)? == 0)
    }

    /// Tail a stream without a group: entries with `id > after`, oldest
    /// first, waiting up to `block` when none are available yet. A cursor
    /// of [`StreamId::ZERO`] reads from the beginning.
    pub async fn read(
        &self,
        stream: &str,
        after: StreamId,
        block: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamLogError> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.lock()?;
                if let Some(s) = state.streams.get(stream) {
                    let out: Vec<StreamEntry> = s
                        .entries
                        .iter()
                        .filter(|e| e.id > after)
                        .take(count)
                        .cloned()
                        .collect();
                    if !out.is_empty() {
                        return Ok(out);
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    /// Idempotently creates `group` on `stream`, anchored at the stream's
    /// current tail so only new entries are delivered. Creates the stream
    /// when missing. A second call is a no-op.
    pub fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StreamLogError> {
        let mut state = self.lock()?;
        let stream = state.streams.entry(stream.to_string()).or_default();
        let anchor = stream.last_id;
        stream
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                last_delivered: anchor,
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    /// Delivers up to `count` new entries to `consumer`, recording each as
    /// pending, waiting up to `block` when the group has nothing new.
    pub async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        stream: &str,
        block: Duration,
        count: usize,
    ) -> Result<Vec<GroupMessage>, StreamLogError> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock()?;
                let stream_state = state.streams.entry(stream.to_string()).or_default();
                let cursor = stream_state
                    .groups
                    .get(group)
                    .map(|g| g.last_delivered)
                    .ok_or_else(|| StreamLogError::NoSuchGroup {
                        stream: stream.to_string(),
                        group: group.to_string(),
                    })?;

                let now = Instant::now();
                let out: Vec<GroupMessage> = stream_state
                    .entries
                    .iter()
                    .filter(|e| e.id > cursor)
                    .take(count)
                    .map(|entry| GroupMessage {
                        stream: stream.to_string(),
                        id: entry.id,
                        fields: entry.fields.clone(),
                    })
                    .collect();
                if !out.is_empty() {
                    let group_state = stream_state.groups.get_mut(group).ok_or_else(|| {
                        StreamLogError::NoSuchGroup {
                            stream: stream.to_string(),
                            group: group.to_string(),
                        }
                    })?;
                    for msg in &out {
                        group_state.last_delivered = msg.id;
                        group_state.pending.insert(
                            msg.id,
                            PendingState {
                                consumer: consumer.to_string(),
                                delivered_at: now,
                                delivery_count: 1,
                            },
                        );
                    }
                    return Ok(out);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    /// Settles pending entries. Unknown ids are ignored; returns how many
    /// were actually removed.
    pub fn ack(
        &self,
        stream: &str,
        group: &str,
        ids: &[StreamId],
    ) -> Result<usize, StreamLogError> {
        let mut state = self.lock()?;
        let group_state = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| StreamLogError::NoSuchGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        let mut removed = 0;
        for id in ids {
            if group_state.pending.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Enumerates pending entries with `start <= id <= end`, oldest first,
    /// with idle times and delivery counters.
    pub fn pending_ext(
        &self,
        stream: &str,
        group: &str,
        start: StreamId,
        end: StreamId,
        count: usize,
    ) -> Result<Vec<PendingInfo>, StreamLogError> {
        let state = self.lock()?;
        let group_state = state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| StreamLogError::NoSuchGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        let now = Instant::now();
        Ok(group_state
            .pending
            .range(start..=end)
            .take(count)
            .map(|(id, p)| PendingInfo {
                id: *id,
                consumer: p.consumer.clone(),
                idle: now.saturating_duration_since(p.delivered_at),
                retry_count: p.delivery_count,
            })
            .collect())
    }

    /// Transfers ownership of pending entries idle for at least `min_idle`
    /// to `consumer`, starting the scan at `start`. Each claim bumps the
    /// entry's delivery counter and resets its idle clock. Entries whose
    /// backing data was trimmed or deleted are dropped from the pending
    /// list instead of claimed.
    ///
    /// The returned cursor resumes the scan; it is [`StreamId::ZERO`] once
    /// the whole pending list has been covered.
    pub fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        start: StreamId,
        min_idle: Duration,
        count: usize,
    ) -> Result<AutoClaimOutcome, StreamLogError> {
        let mut state = self.lock()?;
        let stream_state =
            state
                .streams
                .get_mut(stream)
                .ok_or_else(|| StreamLogError::NoSuchGroup {
                    stream: stream.to_string(),
                    group: group.to_string(),
                })?;

        // Claims need entry lookups and pending mutation together, so pull
        // the candidate ids out first.
        let candidate_ids: Vec<StreamId> = {
            let group_state =
                stream_state
                    .groups
                    .get(group)
                    .ok_or_else(|| StreamLogError::NoSuchGroup {
                        stream: stream.to_string(),
                        group: group.to_string(),
                    })?;
            group_state.pending.range(start..).map(|(id, _)| *id).collect()
        };

        let now = Instant::now();
        let mut messages = Vec::new();
        let mut dropped = Vec::new();
        let mut next = StreamId::ZERO;
        for id in &candidate_ids {
            if messages.len() >= count {
                next = *id;
                break;
            }
            let Some(entry) = stream_state.entry(*id) else {
                dropped.push(*id);
                continue;
            };
            let fields = entry.fields.clone();
            let Some(pending) = stream_state
                .groups
                .get_mut(group)
                .and_then(|g| g.pending.get_mut(id))
            else {
                continue;
            };
            if now.saturating_duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            messages.push(GroupMessage {
                stream: stream.to_string(),
                id: *id,
                fields,
            });
        }

        if let Some(group_state) = stream_state.groups.get_mut(group) {
            for id in dropped {
                group_state.pending.remove(&id);
            }
        }

        Ok(AutoClaimOutcome { next, messages })
    }
}
