use std::collections::HashSet;

use tracing::warn;

use super::fingerprint::MessageFingerprint;

/// Seen-set for one group.
///
/// Grows with every distinct message committed during the process run; there
/// is no eviction, so very long live sessions are bounded only by memory.
#[derive(Debug, Default)]
pub struct Deduplicator {
    group: String,
    seen: HashSet<MessageFingerprint>,
}

impl Deduplicator {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            seen: HashSet::new(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn is_new(&self, fingerprint: &MessageFingerprint) -> bool {
        !self.seen.contains(fingerprint)
    }

    /// Records a fingerprint. Returns false (and logs) if it was already recorded,
    /// which means a commit ran twice for the same message.
    pub fn mark_seen(&mut self, fingerprint: MessageFingerprint) -> bool {
        let inserted = self.seen.insert(fingerprint);
        if !inserted {
            warn!(
                "Fingerprint {} committed twice in group '{}'",
                fingerprint, self.group
            );
        }
        inserted
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::fingerprint::Fingerprinter;
    use crate::scan::{RawMessage, UiPosition};
    use std::time::Duration;

    fn fingerprint_of(text: &str) -> MessageFingerprint {
        let message = RawMessage {
            group: "G1".to_string(),
            sender: "Dana".to_string(),
            phone: None,
            text: text.to_string(),
            sent_at: None,
            position: UiPosition(0),
            extraction_order: 0,
        };
        Fingerprinter::new(Duration::from_secs(60))
            .fingerprint(&message)
            .unwrap()
    }

    #[test]
    fn test_new_until_marked() {
        let mut dedup = Deduplicator::new("G1");
        let fp = fingerprint_of("hello");
        assert!(dedup.is_new(&fp));
        assert!(dedup.mark_seen(fp));
        assert!(!dedup.is_new(&fp));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_second_mark_reports_duplicate_commit() {
        let mut dedup = Deduplicator::new("G1");
        let fp = fingerprint_of("hello");
        assert!(dedup.mark_seen(fp));
        assert!(!dedup.mark_seen(fp));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_distinct_messages_tracked_independently() {
        let mut dedup = Deduplicator::new("G1");
        dedup.mark_seen(fingerprint_of("a"));
        assert!(dedup.is_new(&fingerprint_of("b")));
        assert!(!dedup.is_empty());
    }
}
