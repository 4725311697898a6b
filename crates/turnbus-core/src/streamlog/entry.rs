//! Stream identifiers and entry shapes.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::StreamLogError;

/// Position of an entry within one stream: milliseconds since the Unix
/// epoch plus a tiebreaker for entries landing in the same millisecond.
/// Totally ordered, and orders by append time within a stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    /// The smallest id; used as a "from the beginning" cursor.
    pub const ZERO: Self = Self { ms: 0, seq: 0 };

    /// The largest id; used as an open upper bound.
    pub const MAX: Self = Self {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    /// The id immediately after this one.
    pub fn next(self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self { ms: self.ms, seq },
            None => Self {
                ms: self.ms.saturating_add(1),
                seq: 0,
            },
        }
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl std::str::FromStr for StreamId {
    type Err = StreamLogError;

    /// Parses `"ms-seq"`. A bare `"ms"` is shorthand for `"ms-0"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || StreamLogError::MalformedStreamId(s.to_string());
        match s.split_once('-') {
            Some((ms, seq)) => Ok(Self {
                ms: ms.parse().map_err(|_| malformed())?,
                seq: seq.parse().map_err(|_| malformed())?,
            }),
            None => Ok(Self {
                ms: s.parse().map_err(|_| malformed())?,
                seq: 0,
            }),
        }
    }
}

/// Field map carried by one stream entry. Ordered for deterministic
/// iteration and equality in tests.
pub type Fields = BTreeMap<String, String>;

/// One appended entry of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Fields,
}

/// An entry delivered through a consumer group, tagged with its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    pub stream: String,
    pub id: StreamId,
    pub fields: Fields,
}

/// Pending-entry summary returned by [`StreamLog::pending_ext`].
///
/// [`StreamLog::pending_ext`]: super::StreamLog::pending_ext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub id: StreamId,
    pub consumer: String,
    pub idle: Duration,
    /// Times this entry has been delivered (fresh read plus claims).
    pub retry_count: u64,
}

/// Result of one [`StreamLog::auto_claim`] scan.
///
/// [`StreamLog::auto_claim`]: super::StreamLog::auto_claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoClaimOutcome {
    /// Cursor to resume scanning from; [`StreamId::ZERO`] once the whole
    /// pending list has been covered.
    pub next: StreamId,
    pub messages: Vec<GroupMessage>,
}
