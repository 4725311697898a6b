//! Live tailing of one thread's sub-stream.
//!
//! Each subscriber owns an independent reader; cursors are never shared
//! between connections. Readers start at the beginning of the stream so a
//! subscriber that connects before the producer publishes still sees
//! everything. The `after_seq` filter suppresses already-seen entries for
//! replay-by-seq resume without moving the cursor semantics.

use std::sync::Arc;
use std::time::Duration;

use turnbus_core::streamlog::{
    thread_stream, StreamId, StreamLog, StreamLogError, FIELD_EVENT, FIELD_SEQ,
};

/// Default block timeout of one poll window.
pub const DEFAULT_BLOCK: Duration = Duration::from_secs(30);

/// Default entry cap per poll.
pub const DEFAULT_BATCH: usize = 200;

/// Reader tuning.
#[derive(Debug, Clone)]
pub struct LiveStreamConfig {
    /// Entries with `seq <= after_seq` are suppressed from the output.
    pub after_seq: i64,
    pub block: Duration,
    pub batch: usize,
}

impl Default for LiveStreamConfig {
    fn default() -> Self {
        Self {
            after_seq: 0,
            block: DEFAULT_BLOCK,
            batch: DEFAULT_BATCH,
        }
    }
}

/// One frame handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveFrame {
    /// An event to deliver: its seq (the frame id) and its verbatim JSON.
    Event { seq: i64, json: String },
    /// The poll window elapsed without entries; the transport should emit
    /// a keepalive to defeat intermediary idle timeouts.
    Keepalive,
}

/// Tails one per-thread stream from the beginning.
pub struct LiveStreamReader {
    log: Arc<StreamLog>,
    stream: String,
    cursor: StreamId,
    cfg: LiveStreamConfig,
}

impl LiveStreamReader {
    pub fn new(log: Arc<StreamLog>, thread_id: &str, cfg: LiveStreamConfig) -> Self {
        Self {
            log,
            stream: thread_stream(thread_id),
            cursor: StreamId::ZERO,
            cfg,
        }
    }

    /// One poll window: frames for new entries, or a single keepalive when
    /// the window elapsed empty. Entries missing their seq or event fields
    /// are skipped; the cursor still advances past them.
    pub async fn next_frames(&mut self) -> Result<Vec<LiveFrame>, StreamLogError> {
        let entries = self
            .log
            .read(&self.stream, self.cursor, self.cfg.block, self.cfg.batch)
            .await?;
        if entries.is_empty() {
            return Ok(vec![LiveFrame::Keepalive]);
        }
        let mut frames = Vec::new();
        for entry in entries {
            self.cursor = entry.id;
            let Some(seq) = entry
                .fields
                .get(FIELD_SEQ)
                .and_then(|s| s.parse::<i64>().ok())
            else {
                continue;
            };
            if seq <= self.cfg.after_seq {
                continue;
            }
            let Some(json) = entry.fields.get(FIELD_EVENT) else {
                continue;
            };
            frames.push(LiveFrame::Event {
                seq,
                json: json.clone(),
            });
        }
        Ok(frames)
    }
}
