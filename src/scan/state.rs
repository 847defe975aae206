use std::collections::HashMap;

use super::dedup::Deduplicator;
use super::fingerprint::MessageFingerprint;
use super::UiPosition;

/// Lower bound on the positions an incremental read should return.
/// Orders with `start()` lowest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor(Option<UiPosition>);

impl Cursor {
    /// Admits every position.
    pub fn start() -> Self {
        Self(None)
    }

    pub fn at(position: UiPosition) -> Self {
        Self(Some(position))
    }

    pub fn after(position: UiPosition) -> Self {
        Self(Some(UiPosition(position.0.saturating_add(1))))
    }

    pub fn position(&self) -> Option<UiPosition> {
        self.0
    }

    pub fn admits(&self, position: UiPosition) -> bool {
        self.0.map_or(true, |cursor| position >= cursor)
    }
}

/// Per-group counters reported through logs at the end of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupStats {
    pub passes: u64,
    pub extracted: u64,
    pub duplicates: u64,
    /// Committed messages read again because the cursor was held behind them.
    pub rereads: u64,
    pub skipped_empty: u64,
    pub skipped_own: u64,
    pub invalid: u64,
    pub analyzed: u64,
    pub recoverable_errors: u64,
    pub fatal_errors: u64,
    pub permanently_failed: u64,
    pub deferred: u64,
    pub extraction_failures: u64,
}

/// Everything one group's scan loop owns. Never shared between loops.
#[derive(Debug)]
pub struct GroupState {
    pub dedup: Deduplicator,
    pub cursor: Cursor,
    /// Furthest `next_cursor` any extraction has reported. Positions below it
    /// have been read before.
    pub frontier: Cursor,
    /// Fatal analysis attempts per not-yet-committed message.
    pub fatal_attempts: HashMap<MessageFingerprint, u32>,
    pub stats: GroupStats,
}

impl GroupState {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            dedup: Deduplicator::new(group),
            cursor: Cursor::start(),
            frontier: Cursor::start(),
            fatal_attempts: HashMap::new(),
            stats: GroupStats::default(),
        }
    }

    pub fn group(&self) -> &str {
        self.dedup.group()
    }

    pub fn seen_len(&self) -> usize {
        self.dedup.len()
    }

    /// Commit a message as handled. Clears any retry bookkeeping for it.
    pub fn commit(&mut self, fingerprint: MessageFingerprint) {
        self.fatal_attempts.remove(&fingerprint);
        self.dedup.mark_seen(fingerprint);
    }

    pub fn advance_frontier(&mut self, reached: Cursor) {
        self.frontier = self.frontier.max(reached);
    }

    /// Count one more fatal attempt; returns the total so far.
    pub fn record_fatal_attempt(&mut self, fingerprint: MessageFingerprint) -> u32 {
        let attempts = self.fatal_attempts.entry(fingerprint).or_insert(0);
        *attempts += 1;
        *attempts
    }
}
