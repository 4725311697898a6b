//! The canonical event record and its wire encoding.
//!
//! An [`Event`] is one immutable record in a thread. Producers create
//! events; nothing downstream ever mutates one. The JSON encoding produced
//! by [`Event::encode`] is the wire format on every boundary: ingest,
//! stream entries, durable rows, and archive lines all carry the same
//! bytes.
//!
//! `payload` is opaque JSON and is carried as a raw value end to end.
//! Only the producer and the ultimate consumer interpret it; reparsing it
//! internally would break byte-for-byte archive equivalence. `source`,
//! `trace`, and `tags` are free-form bags with the same hands-off rule.
//!
//! Decoding re-runs validation, so a value of type [`Event`] obtained from
//! [`decode`](Event::decode) is always structurally valid.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

pub mod types;


/// Fixed protocol tag carried by every event.
pub const SPEC_VERSION: &str = "agent-events/1.0";

/// Severity of an event. Strictly enumerated; anything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for Level {
    type Err = InvalidEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(InvalidEvent::InvalidLevel(other.to_string())),
        }
    }
}

/// One immutable per-turn event record.
///
/// Fields default to their empty forms on deserialization so that partial
/// producer input can be accepted, defaulted by the ingest gateway, and
/// then validated. [`Event::validate`] is the single gate deciding what is
/// structurally acceptable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub spec_version: String,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub turn_id: String,
    /// 1-based per-thread ordering key. Zero on input means "allocate".
    #[serde(default)]
    pub seq: i64,
    /// Wall-clock time, RFC3339 with nanosecond precision on the wire.
    /// The Unix epoch doubles as "unset".
    #[serde(default = "epoch")]
    pub ts: DateTime<Utc>,
    /// Event type tag. Well-known values live in [`types`]; unknown tags
    /// are accepted as opaque strings for forward compatibility.
    #[serde(rename = "type", default)]
    pub kind: String,
    pub level: Level,
    /// Opaque JSON, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).unwrap()
}

/// Rejection produced by event validation or decoding.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvalidEvent {
    /// A required field is empty or missing.
    #[error("{0} is required")]
    MissingField(&'static str),

    /// The record carries a spec_version this build does not speak.
    #[error("unsupported spec_version: {0}")]
    UnsupportedSpecVersion(String),

    /// `level` is outside the enumerated set.
    #[error("invalid level: {0}")]
    InvalidLevel(String),

    /// `seq` must be zero (unallocated) or positive.
    #[error("seq must be >= 0, got {0}")]
    NegativeSeq(i64),

    /// The bytes are not a JSON document of the expected shape.
    #[error("malformed event json: {0}")]
    Json(#[from] serde_json::Error),
}

impl crate::error::Classify for InvalidEvent {
    fn kind(&self) -> crate::error::ErrorKind {
        crate::error::ErrorKind::InvalidInput
    }
}

impl Event {
    /// Checks every structural rule. Optionals (`source`, `trace`, `tags`)
    /// are exempt; everything else must be present and well-formed.
    pub fn validate(&self) -> Result<(), InvalidEvent> {
        if self.spec_version.is_empty() {
            return Err(InvalidEvent::MissingField("spec_version"));
        }
        if self.spec_version != SPEC_VERSION {
            return Err(InvalidEvent::UnsupportedSpecVersion(
                self.spec_version.clone(),
            ));
        }
        if self.event_id.trim().is_empty() {
            return Err(InvalidEvent::MissingField("event_id"));
        }
        if self.thread_id.trim().is_empty() {
            return Err(InvalidEvent::MissingField("thread_id"));
        }
        if self.turn_id.trim().is_empty() {
            return Err(InvalidEvent::MissingField("turn_id"));
        }
        if self.kind.trim().is_empty() {
            return Err(InvalidEvent::MissingField("type"));
        }
        if self.ts == epoch() {
            return Err(InvalidEvent::MissingField("ts"));
        }
        if self.payload.is_none() {
            return Err(InvalidEvent::MissingField("payload"));
        }
        if self.seq < 0 {
            return Err(InvalidEvent::NegativeSeq(self.seq));
        }
        Ok(())
    }

    /// Canonical JSON encoding. Validates first, so invalid records never
    /// reach the wire.
    pub fn encode(&self) -> Result<Vec<u8>, InvalidEvent> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    /// [`encode`](Self::encode) as an owned string, for callers that put
    /// the JSON into text fields.
    pub fn encode_string(&self) -> Result<String, InvalidEvent> {
        self.validate()?;
        Ok(serde_json::to_string(self)?)
    }

    /// Parses and validates an event from its JSON encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, InvalidEvent> {
        let event: Self = serde_json::from_slice(bytes)?;
        event.validate()?;
        Ok(event)
    }

    /// The raw payload text, or `""` for an unvalidated record without one.
    pub fn payload_str(&self) -> &str {
        self.payload.as_deref().map_or("", RawValue::get)
    }

    /// Whether this event terminates its turn.
    pub fn is_terminal(&self) -> bool {
        types::is_terminal(&self.kind)
    }

    /// True when `ts` still holds the "unset" sentinel.
    pub fn ts_is_unset(&self) -> bool {
        self.ts == epoch()
    }
}
