//! Durable consumer draining the global stream into the store.
//!
//! One persister instance binds to the global stream under a named group
//! with a per-instance consumer identity. Delivery is at least once; the
//! store's uniqueness guards absorb redelivery. Each scheduling pass runs
//! three phases:
//!
//! 1. **Poison sweep**: pending entries whose delivery counter reached
//!    `max_retries` move to the dead-letter stream with provenance fields,
//!    then are acked and deleted from the source.
//! 2. **Reclaim**: entries other consumers left idle past `min_idle` are
//!    claimed and handled; the claim cursor persists across passes.
//! 3. **Fresh read**: a blocking group read picks up new entries.
//!
//! A handling failure stops the current batch; unacked entries stay
//! pending and age back into reclaim, eventually hitting the sweep.
//! Envelopes that cannot be decoded are acked and dropped with a warning:
//! they would fail identically on every redelivery, and the dead-letter
//! stream is reserved for entries that failed real persist attempts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use turnbus_core::event::Event;
use turnbus_core::streamlog::{
    GroupMessage, StreamId, StreamLog, StreamLogError, DEFAULT_DLQ_STREAM, FIELD_EVENT,
    GLOBAL_STREAM,
};

use crate::store::EventSink;

/// Errors that abort a persister pass.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PersisterError {
    #[error("stream log: {0}")]
    Log(#[from] StreamLogError),
}

/// Persister tuning. Defaults match the deployment contract; tests shrink
/// the windows.
#[derive(Debug, Clone)]
pub struct PersisterConfig {
    pub group: String,
    pub consumer: String,
    /// Delivery count at which a pending entry is declared poison.
    pub max_retries: u64,
    pub dlq_stream: String,
    /// Idle age before another consumer's pending entry may be claimed.
    pub min_idle: Duration,
    /// Block timeout of the fresh-read phase.
    pub read_block: Duration,
    /// Entry cap per phase per pass.
    pub batch: usize,
    pub tenant_id: String,
    pub idle_timeout_seconds: i64,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            group: "persist".to_string(),
            consumer: crate::config::default_consumer(),
            max_retries: 5,
            dlq_stream: DEFAULT_DLQ_STREAM.to_string(),
            min_idle: Duration::from_secs(30),
            read_block: Duration::from_secs(5),
            batch: 200,
            tenant_id: "default".to_string(),
            idle_timeout_seconds: 900,
        }
    }
}

enum Handled {
    /// Persisted and acked.
    Persisted,
    /// Undecodable envelope, acked and dropped.
    Dropped,
    /// Persist failed; entry left pending for reclaim.
    Failed,
}

/// The long-running consumer. Owns its reclaim cursor.
pub struct Persister {
    log: Arc<StreamLog>,
    sink: Arc<dyn EventSink>,
    cfg: PersisterConfig,
    claim_cursor: StreamId,
}

impl Persister {
    pub fn new(log: Arc<StreamLog>, sink: Arc<dyn EventSink>, cfg: PersisterConfig) -> Self {
        Self {
            log,
            sink,
            cfg,
            claim_cursor: StreamId::ZERO,
        }
    }

    /// Creates the consumer group (idempotently) and loops passes until
    /// `shutdown` flips to true. Shutdown is observed between phases and
    /// during the blocking read.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = self.log.ensure_group(GLOBAL_STREAM, &self.cfg.group) {
            warn!(error = %err, "could not ensure consumer group, exiting");
            return;
        }
        info!(
            group = %self.cfg.group,
            consumer = %self.cfg.consumer,
            stream = GLOBAL_STREAM,
            "persister started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.run_pass() => {
                    if let Err(err) = result {
                        warn!(error = %err, "persister pass failed");
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                }
            }
        }
        info!("persister stopped");
    }

    /// One scheduling pass: poison sweep, reclaim, fresh read.
    pub async fn run_pass(&mut self) -> Result<(), PersisterError> {
        self.sweep_poison()?;
        self.reclaim()?;
        self.read_fresh().await?;
        Ok(())
    }

    fn sweep_poison(&self) -> Result<(), PersisterError> {
        let pending = self.log.pending_ext(
            GLOBAL_STREAM,
            &self.cfg.group,
            StreamId::ZERO,
            StreamId::MAX,
            self.cfg.batch,
        )?;
        for entry in pending {
            if entry.retry_count < self.cfg.max_retries {
                continue;
            }
            if let Err(err) = self.move_to_dlq(entry.id) {
                // Another pass will retry the sweep.
                warn!(id = %entry.id, error = %err, "dlq move failed, aborting sweep");
                break;
            }
        }
        Ok(())
    }

    fn move_to_dlq(&self, id: StreamId) -> Result<(), StreamLogError> {
        let found = self.log.range(GLOBAL_STREAM, id, id, 1)?;
        let Some(entry) = found.into_iter().next() else {
            // Data already trimmed away; settle the ghost.
            let _ = self.log.ack(GLOBAL_STREAM, &self.cfg.group, &[id]);
            let _ = self.log.del(GLOBAL_STREAM, &[id]);
            return Ok(());
        };
        let mut fields = entry.fields;
        fields.insert("dlq_from_stream".to_string(), GLOBAL_STREAM.to_string());
        fields.insert("dlq_from_id".to_string(), id.to_string());
        fields.insert(
            "dlq_ts".to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        self.log.add(&self.cfg.dlq_stream, fields)?;
        let _ = self.log.ack(GLOBAL_STREAM, &self.cfg.group, &[id]);
        let _ = self.log.del(GLOBAL_STREAM, &[id]);
        info!(id = %id, dlq = %self.cfg.dlq_stream, "moved poison entry to dead-letter stream");
        Ok(())
    }

    fn reclaim(&mut self) -> Result<(), PersisterError> {
        let outcome = self.log.auto_claim(
            GLOBAL_STREAM,
            &self.cfg.group,
            &self.cfg.consumer,
            self.claim_cursor,
            self.cfg.min_idle,
            self.cfg.batch,
        )?;
        self.claim_cursor = outcome.next;
        for message in outcome.messages {
            if matches!(self.handle(&message), Handled::Failed) {
                // Leave the rest pending; they age back into reclaim.
                break;
            }
        }
        Ok(())
    }

    async fn read_fresh(&self) -> Result<(), PersisterError> {
        let messages = self
            .log
            .read_group(
                &self.cfg.group,
                &self.cfg.consumer,
                GLOBAL_STREAM,
                self.cfg.read_block,
                self.cfg.batch,
            )
            .await?;
        for message in messages {
            if matches!(self.handle(&message), Handled::Failed) {
                break;
            }
        }
        Ok(())
    }

    fn handle(&self, message: &GroupMessage) -> Handled {
        let Some(event_json) = message.fields.get(FIELD_EVENT) else {
            warn!(id = %message.id, "dropping entry without event field");
            let _ = self.log.ack(GLOBAL_STREAM, &self.cfg.group, &[message.id]);
            return Handled::Dropped;
        };
        let event = match Event::decode(event_json.as_bytes()) {
            Ok(event) => event,
            Err(err) => {
                warn!(id = %message.id, error = %err, "dropping undecodable entry");
                let _ = self.log.ack(GLOBAL_STREAM, &self.cfg.group, &[message.id]);
                return Handled::Dropped;
            }
        };
        if let Err(err) = self.sink.persist_event(
            &self.cfg.tenant_id,
            self.cfg.idle_timeout_seconds,
            &event,
        ) {
            warn!(
                id = %message.id,
                thread_id = %event.thread_id,
                seq = event.seq,
                error = %err,
                "persist failed, leaving entry pending"
            );
            return Handled::Failed;
        }
        let _ = self.log.ack(GLOBAL_STREAM, &self.cfg.group, &[message.id]);
        debug!(id = %message.id, seq = event.seq, "persisted and acked");
        Handled::Persisted
    }
}
