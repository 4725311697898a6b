//! turnbus-core - Append-only event bus primitives for conversational agents.
//!
//! This crate holds the pieces of the bus that carry no external I/O:
//!
//! - [`event`]: The canonical per-turn event record, its validation rules,
//!   and the JSON wire encoding shared by every boundary of the system.
//! - [`streamlog`]: An in-process append-only publish/subscribe log with
//!   per-thread sub-streams, a global stream, consumer groups, and an
//!   atomic idempotent-publish operation.
//! - [`error`]: The error taxonomy that drives retry and dead-letter
//!   policy across the pipeline.
//! - [`retry`]: The fixed backoff schedule used by ingest.
//!
//! The storage tiers (durable store, object store) and the long-running
//! workers live in `turnbus-daemon`.

pub mod error;
pub mod event;
pub mod id;
pub mod retry;
pub mod streamlog;

pub use error::{Classify, ErrorKind};
pub use event::{Event, InvalidEvent, Level, SPEC_VERSION};
pub use streamlog::{StreamLog, StreamLogError};
