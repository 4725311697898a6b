//! Batch offload of a seq range into the object store.
//!
//! An archive run is all-or-nothing: the catalog row is written last, so
//! any earlier failure leaves no trace and the same range can be retried
//! verbatim. The recorded bounds are the actual extremes of the rows
//! archived, letting the next run resume from `to_seq + 1` without
//! fabricating coverage over sparse tails. Catalog intervals of one
//! thread therefore never overlap.

use std::io::Write;

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::info;

use turnbus_core::error::{Classify, ErrorKind};
use turnbus_core::event::{Event, InvalidEvent};
use turnbus_core::id;

use crate::objectstore::{FsObjectStore, ObjectStoreError};
use crate::store::{DurableStore, EventArchive, StoreError};

/// Content type recorded on archive objects.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/x-ndjson";

/// Content encoding recorded on archive objects.
pub const ARCHIVE_CONTENT_ENCODING: &str = "gzip";

/// Upper bound on events pulled into one archive object.
pub const ARCHIVE_BATCH_LIMIT: i64 = 20_000;

/// Errors from an archive run.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ArchiveError {
    #[error("invalid archive range: from_seq {from_seq} > to_seq {to_seq}")]
    InvalidRange { from_seq: i64, to_seq: i64 },

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("object store: {0}")]
    Objects(#[from] ObjectStoreError),

    #[error("encode: {0}")]
    Encode(#[from] InvalidEvent),

    #[error("gzip: {0}")]
    Gzip(#[from] std::io::Error),
}

impl Classify for ArchiveError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRange { .. } => ErrorKind::InvalidInput,
            Self::Store(err) => err.kind(),
            Self::Objects(err) => err.kind(),
            Self::Encode(_) => ErrorKind::Poison,
            Self::Gzip(_) => ErrorKind::Transient,
        }
    }
}

/// Parameters of one run. A missing `to_seq` resolves to the thread's
/// current `last_seq`.
#[derive(Debug, Clone)]
pub struct ArchiveRequest {
    pub thread_id: String,
    pub from_seq: i64,
    pub to_seq: Option<i64>,
}

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    pub archive_id: String,
    pub object_key: String,
    pub from_seq: i64,
    pub to_seq: i64,
    pub event_count: i64,
}

/// Archives one seq range of one thread. Returns `Ok(None)` when there is
/// nothing to do: unknown thread, empty range, or no rows in range.
pub fn run_archive(
    store: &DurableStore,
    objects: &FsObjectStore,
    request: &ArchiveRequest,
) -> Result<Option<ArchiveOutcome>, ArchiveError> {
    let from_seq = request.from_seq.max(1);
    let to_seq = match request.to_seq {
        Some(to_seq) => {
            if to_seq < from_seq {
                return Err(ArchiveError::InvalidRange { from_seq, to_seq });
            }
            to_seq
        }
        None => {
            let Some(thread) = store.get_thread(&request.thread_id)? else {
                info!(thread_id = %request.thread_id, "thread unknown, nothing to archive");
                return Ok(None);
            };
            if thread.last_seq < from_seq {
                info!(
                    thread_id = %request.thread_id,
                    from_seq,
                    last_seq = thread.last_seq,
                    "range empty, nothing to archive"
                );
                return Ok(None);
            }
            thread.last_seq
        }
    };

    let query =
        store.list_events_for_archive(&request.thread_id, from_seq, to_seq, ARCHIVE_BATCH_LIMIT)?;
    if query.events.is_empty() {
        info!(thread_id = %request.thread_id, from_seq, to_seq, "no events in range");
        return Ok(None);
    }

    let body = encode_ndjson_gzip(&query.events)?;
    let archive_id = id::new_id();
    let object_key = objects.key(&format!(
        "threads/{}/archives/{archive_id}.jsonl.gz",
        request.thread_id
    ));
    objects.put_object(
        &object_key,
        &body,
        ARCHIVE_CONTENT_TYPE,
        ARCHIVE_CONTENT_ENCODING,
    )?;

    let event_count = query.events.len() as i64;
    store.insert_archive(&EventArchive {
        archive_id: archive_id.clone(),
        thread_id: request.thread_id.clone(),
        from_seq: query.min_seq,
        to_seq: query.max_seq,
        object_key: object_key.clone(),
        content_encoding: ARCHIVE_CONTENT_ENCODING.to_string(),
        content_type: ARCHIVE_CONTENT_TYPE.to_string(),
        event_count,
        created_at: Utc::now(),
    })?;

    info!(
        thread_id = %request.thread_id,
        archive_id = %archive_id,
        from_seq = query.min_seq,
        to_seq = query.max_seq,
        event_count,
        "archived range"
    );
    Ok(Some(ArchiveOutcome {
        archive_id,
        object_key,
        from_seq: query.min_seq,
        to_seq: query.max_seq,
        event_count,
    }))
}

/// One event JSON per line, gzip-compressed.
fn encode_ndjson_gzip(events: &[Event]) -> Result<Vec<u8>, ArchiveError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for event in events {
        encoder.write_all(event.encode()?.as_slice())?;
        encoder.write_all(b"\n")?;
    }
    Ok(encoder.finish()?)
}
