//! Error classification shared across the pipeline.
//!
//! Every fallible subsystem exposes its own error enum; this module defines
//! the cross-cutting [`ErrorKind`] each of them classifies into. Policy is
//! driven by kind, never by matching on concrete variants:
//!
//! - `InvalidInput` is surfaced to the caller and never retried.
//! - `Transient` is retried per component policy, then surfaced.
//! - `Conflict` means a uniqueness guard fired; operations are idempotent
//!   on their keys, so conflicts are treated as success.
//! - `Poison` marks a message that repeatedly fails handling and is bound
//!   for the dead-letter stream.
//! - `Fatal` is a config or bootstrap failure; the process terminates.

/// Coarse error kind used for retry and surfacing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Validation, schema, or bad-parameter failure. Never retried.
    InvalidInput,
    /// Network or store hiccup expected to heal. Retried, then surfaced.
    Transient,
    /// A uniqueness guard fired on an idempotent write.
    Conflict,
    /// A message that keeps failing decode or persist.
    Poison,
    /// Config or bootstrap failure. Startup only.
    Fatal,
}

/// Implemented by component error types so callers can apply kind-driven
/// policy without knowing the concrete error.
pub trait Classify {
    /// The [`ErrorKind`] this error maps to.
    fn kind(&self) -> ErrorKind;

    /// Whether a retry may succeed.
    fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
