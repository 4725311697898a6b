//! Time-ordered identifiers for events and archives.

use uuid::Uuid;

/// Returns a fresh time-ordered 128-bit identifier (UUIDv7), lowercase
/// hyphenated. Event ids and archive ids come from the same family so both
/// sort by creation time.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}
