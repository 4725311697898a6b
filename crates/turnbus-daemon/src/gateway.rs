//! Ingest gateway: defaults, sequence allocation, idempotent publish.
//!
//! The gateway is the sole seq allocator. The counter lives in the stream
//! log, shared by every ingest worker, so concurrent producers for one
//! thread always receive distinct, dense sequence numbers. Allocation and
//! publish are separate steps: if publish ultimately fails after retries,
//! the allocated seq is lost as a hole in the counter advance, never a
//! duplicate.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tracing::debug;

use turnbus_core::error::{Classify, ErrorKind};
use turnbus_core::event::{Event, InvalidEvent};
use turnbus_core::retry::retry_transient;
use turnbus_core::streamlog::{PublishRecord, StreamLog, StreamLogError, DEFAULT_DEDUPE_TTL};
use turnbus_core::{id, SPEC_VERSION};

use crate::config::DEFAULT_TRIM_MAX_LEN;

/// Errors surfaced by [`IngestGateway::append`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// The event failed validation. Not retriable.
    #[error(transparent)]
    Invalid(#[from] InvalidEvent),

    /// The stream log refused the operation, after retries where the
    /// failure was transient.
    #[error("publish: {0}")]
    Publish(#[from] StreamLogError),
}

impl Classify for GatewayError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid(err) => err.kind(),
            Self::Publish(err) => err.kind(),
        }
    }
}

/// Tuning for the publish step.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Per-thread stream cap; zero disables trimming.
    pub trim_max_len: i64,
    /// Lifetime of the dedupe record guarding each `event_id`.
    pub dedupe_ttl: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            trim_max_len: DEFAULT_TRIM_MAX_LEN,
            dedupe_ttl: DEFAULT_DEDUPE_TTL,
        }
    }
}

/// What the caller gets back from an append.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AppendReceipt {
    pub event_id: String,
    pub seq: i64,
    pub stream_id: String,
    pub duplicated: bool,
}

/// Accepts producer events and lands them on the stream log.
pub struct IngestGateway {
    log: Arc<StreamLog>,
    cfg: GatewayConfig,
}

impl IngestGateway {
    pub fn new(log: Arc<StreamLog>, cfg: GatewayConfig) -> Self {
        Self { log, cfg }
    }

    /// Fills defaults, allocates a seq when the producer did not supply
    /// one, validates, and publishes idempotently.
    ///
    /// Transient publish failures are retried on the fixed backoff
    /// schedule; the sleeps observe caller cancellation. A duplicate
    /// `event_id` returns the original placement with `duplicated` set.
    pub async fn append(&self, mut event: Event) -> Result<AppendReceipt, GatewayError> {
        if event.spec_version.is_empty() {
            event.spec_version = SPEC_VERSION.to_string();
        }
        if event.event_id.trim().is_empty() {
            event.event_id = id::new_id();
        }
        if event.ts_is_unset() {
            event.ts = Utc::now();
        }
        if event.seq == 0 {
            if event.thread_id.trim().is_empty() {
                return Err(InvalidEvent::MissingField("thread_id").into());
            }
            event.seq = self.log.next_seq(&event.thread_id)?;
        }
        event.validate()?;

        let event_json = event.encode_string()?;
        let ts = event.ts.to_rfc3339_opts(SecondsFormat::Nanos, true);
        let level = event.level.to_string();
        let record = PublishRecord {
            thread_id: &event.thread_id,
            event_id: &event.event_id,
            seq: event.seq,
            turn_id: &event.turn_id,
            ts: &ts,
            kind: &event.kind,
            level: &level,
            payload: event.payload_str(),
            event_json: &event_json,
        };

        let outcome = retry_transient(|| async {
            self.log
                .idempotent_publish(&record, self.cfg.trim_max_len, self.cfg.dedupe_ttl)
        })
        .await?;

        debug!(
            thread_id = %event.thread_id,
            seq = outcome.seq,
            event_id = %event.event_id,
            duplicated = outcome.duplicated,
            "appended event"
        );
        // On a duplicate the receipt reports the original placement, even
        // if this resubmission allocated (and thereby lost) a fresh seq.
        Ok(AppendReceipt {
            event_id: event.event_id,
            seq: outcome.seq,
            stream_id: outcome.stream_id.to_string(),
            duplicated: outcome.duplicated,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::value::RawValue;

    use turnbus_core::event::{types, Event, Level};
    use turnbus_core::streamlog::{thread_stream, StreamId, StreamLog, GLOBAL_STREAM};

    use super::{GatewayConfig, GatewayError, IngestGateway};

    fn bare_event(thread_id: &str, seq: i64) -> Event {
        Event {
            spec_version: String::new(),
            event_id: String::new(),
            thread_id: thread_id.to_string(),
            turn_id: "u1".to_string(),
            seq,
            ts: chrono::TimeZone::timestamp_opt(&chrono::Utc, 0, 0).unwrap(),
            kind: types::TURN_STARTED.to_string(),
            level: Level::Info,
            payload: Some(RawValue::from_string("{}".to_string()).unwrap()),
            source: None,
            trace: None,
            tags: None,
        }
    }

    fn gateway(log: &Arc<StreamLog>) -> IngestGateway {
        IngestGateway::new(Arc::clone(log), GatewayConfig::default())
    }

    #[tokio::test]
    async fn append_fills_defaults_and_allocates_seq() {
        let log = Arc::new(StreamLog::new());
        let gw = gateway(&log);
        let receipt = gw.append(bare_event("t1", 0)).await.unwrap();
        assert_eq!(receipt.seq, 1);
        assert!(!receipt.duplicated);
        assert!(!receipt.event_id.is_empty());

        let receipt2 = gw.append(bare_event("t1", 0)).await.unwrap();
        assert_eq!(receipt2.seq, 2);

        assert_eq!(log.len(&thread_stream("t1")).unwrap(), 2);
        assert_eq!(log.len(GLOBAL_STREAM).unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicate_event_id_returns_original_placement() {
        let log = Arc::new(StreamLog::new());
        let gw = gateway(&log);
        let mut event = bare_event("t1", 0);
        event.event_id = "fixed".to_string();
        let first = gw.append(event.clone()).await.unwrap();
        assert!(!first.duplicated);

        // The retry re-allocates a seq (lost as a counter hole), but the
        // receipt reports the original placement.
        let second = gw.append(event).await.unwrap();
        assert!(second.duplicated);
        assert_eq!(second.stream_id, first.stream_id);
        assert_eq!(second.seq, first.seq);
        assert_eq!(log.len(&thread_stream("t1")).unwrap(), 1);
    }

    #[tokio::test]
    async fn seq_allocation_requires_thread_id() {
        let log = Arc::new(StreamLog::new());
        let gw = gateway(&log);
        let mut event = bare_event("", 0);
        event.thread_id = String::new();
        let err = gw.append(event).await.unwrap_err();
        assert!(matches!(err, GatewayError::Invalid(_)));
    }

    #[tokio::test]
    async fn producer_supplied_seq_is_kept() {
        let log = Arc::new(StreamLog::new());
        let gw = gateway(&log);
        let receipt = gw.append(bare_event("t1", 7)).await.unwrap();
        assert_eq!(receipt.seq, 7);
        // The allocator was never consulted.
        assert_eq!(log.next_seq("t1").unwrap(), 1);
    }

    #[tokio::test]
    async fn invalid_event_is_rejected_before_publish() {
        let log = Arc::new(StreamLog::new());
        let gw = gateway(&log);
        let mut event = bare_event("t1", 0);
        event.payload = None;
        let err = gw.append(event).await.unwrap_err();
        assert!(matches!(err, GatewayError::Invalid(_)));
        assert_eq!(log.len(GLOBAL_STREAM).unwrap(), 0);
    }

    #[tokio::test]
    async fn stream_entries_carry_the_event_json() {
        let log = Arc::new(StreamLog::new());
        let gw = gateway(&log);
        let receipt = gw.append(bare_event("t1", 0)).await.unwrap();
        let entries = log
            .range(&thread_stream("t1"), StreamId::ZERO, StreamId::MAX, 10)
            .unwrap();
        let event_json = &entries[0].fields["event"];
        let decoded = Event::decode(event_json.as_bytes()).unwrap();
        assert_eq!(decoded.event_id, receipt.event_id);
        assert_eq!(decoded.seq, 1);
    }
}
