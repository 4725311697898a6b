//! Well-known event type tags and the turn-state rules keyed off them.
//!
//! The type set is open: unknown tags flow through the pipeline untouched.
//! Only the tags below carry semantics for thread and turn aggregates.

pub const THREAD_READY: &str = "thread.ready";
pub const THREAD_HEARTBEAT: &str = "thread.heartbeat";
pub const THREAD_SUSPENDED: &str = "thread.suspended";
pub const THREAD_RESUMED: &str = "thread.resumed";

pub const TURN_STARTED: &str = "turn.started";
pub const TURN_INPUT: &str = "turn.input";
pub const TURN_COMPLETED: &str = "turn.completed";
pub const TURN_FAILED: &str = "turn.failed";
pub const TURN_CANCELLED: &str = "turn.cancelled";

pub const ASSISTANT_MESSAGE_DELTA: &str = "assistant.message.delta";
pub const ASSISTANT_MESSAGE_COMPLETED: &str = "assistant.message.completed";
/// Short alias for [`ASSISTANT_MESSAGE_DELTA`] kept for older producers.
pub const MESSAGE_DELTA: &str = "message.delta";
/// Short alias for [`ASSISTANT_MESSAGE_COMPLETED`] kept for older producers.
pub const MESSAGE_COMPLETED: &str = "message.completed";

pub const TOOL_CALL_STARTED: &str = "tool.call.started";
pub const TOOL_CALL_ARGS_DELTA: &str = "tool.call.args.delta";
pub const TOOL_CALL_COMPLETED: &str = "tool.call.completed";
pub const TOOL_CALL_ERROR: &str = "tool.call.error";

pub const STATE_CHECKPOINT: &str = "state.checkpoint";
pub const STATE_SNAPSHOT: &str = "state.snapshot";
pub const STATE_DELTA: &str = "state.delta";

pub const CUSTOM: &str = "custom";

/// Whether a type tag ends its turn. Terminal events flip the thread to
/// idle and pin the turn's completion time.
pub fn is_terminal(kind: &str) -> bool {
    matches!(kind, TURN_COMPLETED | TURN_FAILED | TURN_CANCELLED)
}

/// The turn status implied by an event of this type.
pub fn turn_status(kind: &str) -> &'static str {
    match kind {
        TURN_STARTED => "started",
        TURN_COMPLETED => "completed",
        TURN_FAILED => "failed",
        TURN_CANCELLED => "cancelled",
        _ => "running",
    }
}
