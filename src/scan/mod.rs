//! Message acquisition and state tracking.
//!
//! Turns repeated, overlapping snapshots of a chat panel into an exactly-once,
//! per-group, ordered stream of new messages:
//!
//! ```text
//! WebClient -> MessageExtractor -> Fingerprinter/Deduplicator -> GroupRouter
//!           -> Analyzer -> ResultAggregator -> sink
//! ```

pub mod aggregator;
pub mod dedup;
pub mod error;
pub mod extractor;
pub mod fingerprint;
pub mod orchestrator;
pub mod router;
pub mod state;

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use serde::Serialize;

pub use error::ScanError;

/// Ordering key of a message slot in the chat panel. Older messages have
/// smaller positions; a slot keeps its position across scroll steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UiPosition(pub i64);

impl std::fmt::Display for UiPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// When a message was sent, as precisely as the chat panel rendered it.
///
/// Chat panels usually show only `HH:MM` for recent messages. That is kept as
/// a time of day rather than pinned to whatever date the reader runs on, so the
/// same slot read before and after midnight has the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SentAt {
    Instant(DateTime<Utc>),
    TimeOfDay(NaiveTime),
}

impl SentAt {
    /// Seconds on the scale this value carries: since the epoch for an
    /// instant, since midnight for a time of day.
    pub fn seconds(&self) -> i64 {
        match self {
            SentAt::Instant(at) => at.timestamp(),
            SentAt::TimeOfDay(time) => i64::from(time.num_seconds_from_midnight()),
        }
    }
}

impl std::fmt::Display for SentAt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SentAt::Instant(at) => write!(f, "{}", at.format("%Y-%m-%d %H:%M")),
            SentAt::TimeOfDay(time) => write!(f, "{}", time.format("%H:%M")),
        }
    }
}

/// A message as read from the chat panel during one scan pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub group: String,
    pub sender: String,
    /// Sender's phone number, when the panel shows one next to the name.
    pub phone: Option<String>,
    pub text: String,
    /// Missing when the UI did not render a parseable time.
    pub sent_at: Option<SentAt>,
    pub position: UiPosition,
    /// Monotonically increasing within one scan pass.
    pub extraction_order: u64,
}
