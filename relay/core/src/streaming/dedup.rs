//! Chunk deduplication
//!
//! Transports deliver at least once, so the same chunk can arrive twice. A
//! chunk is identified by a [`Fingerprint`] built from its request id,
//! sequence hint, the first and last few characters of its text, its length
//! and its done flag. Each stream remembers its most recent fingerprints.
//!
//! A repeat inside the dedup window is an expected network duplicate. A
//! repeat long after the first delivery points at a replay bug upstream; it
//! is still discarded, but reported as [`DedupVerdict::LateDuplicate`].

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::messages::RequestId;

/// Characters of text kept from each end of a chunk
const EDGE_CHARS: usize = 16;

/// Identity of a chunk for duplicate detection
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    request_id: RequestId,
    sequence: Option<u64>,
    prefix: String,
    suffix: String,
    len: usize,
    done: bool,
}

impl Fingerprint {
    /// Fingerprint a chunk
    #[must_use]
    pub fn new(request_id: &RequestId, sequence: Option<u64>, text: &str, done: bool) -> Self {
        let prefix: String = text.chars().take(EDGE_CHARS).collect();
        let char_count = text.chars().count();
        let suffix: String = text
            .chars()
            .skip(char_count.saturating_sub(EDGE_CHARS))
            .collect();

        Self {
            request_id: request_id.clone(),
            sequence,
            prefix,
            suffix,
            len: text.len(),
            done,
        }
    }
}

/// Result of checking a fingerprint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DedupVerdict {
    /// First sighting; the chunk should be applied
    Fresh,
    /// Seen within the window; discard silently
    Duplicate {
        /// Time since the first sighting
        age: Duration,
    },
    /// Seen well outside the window; discard and report
    LateDuplicate {
        /// Time since the first sighting
        age: Duration,
    },
}

impl DedupVerdict {
    /// Whether the chunk should be applied
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// Most-recent-N fingerprints of one stream
#[derive(Clone, Debug)]
pub struct FingerprintSet {
    seen: VecDeque<(Fingerprint, Instant)>,
    capacity: usize,
    window: Duration,
}

impl FingerprintSet {
    /// Remember up to `capacity` fingerprints
    #[must_use]
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            seen: VecDeque::new(),
            capacity: capacity.max(1),
            window,
        }
    }

    /// Check a fingerprint at `now`, remembering it if fresh
    pub fn check(&mut self, fingerprint: Fingerprint, now: Instant) -> DedupVerdict {
        if let Some((_, first_seen)) = self.seen.iter().find(|(seen, _)| *seen == fingerprint) {
            let age = now.saturating_duration_since(*first_seen);
            return if age <= self.window {
                DedupVerdict::Duplicate { age }
            } else {
                DedupVerdict::LateDuplicate { age }
            };
        }

        if self.seen.len() >= self.capacity {
            self.seen.pop_front();
        }
        self.seen.push_back((fingerprint, now));
        DedupVerdict::Fresh
    }

    /// Number of remembered fingerprints
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing is remembered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(50);

    fn fp(text: &str) -> Fingerprint {
        Fingerprint::new(&RequestId::new("r1"), None, text, false)
    }

    #[test]
    fn test_repeat_within_window_is_duplicate() {
        let mut set = FingerprintSet::new(8, WINDOW);
        let now = Instant::now();
        assert!(set.check(fp("Hello"), now).is_fresh());
        assert_eq!(
            set.check(fp("Hello"), now + Duration::from_millis(10)),
            DedupVerdict::Duplicate {
                age: Duration::from_millis(10)
            }
        );
    }

    #[test]
    fn test_repeat_outside_window_is_late_duplicate() {
        let mut set = FingerprintSet::new(8, WINDOW);
        let now = Instant::now();
        set.check(fp("Hello"), now);
        assert!(matches!(
            set.check(fp("Hello"), now + Duration::from_secs(5)),
            DedupVerdict::LateDuplicate { .. }
        ));
    }

    #[test]
    fn test_sequence_hint_separates_identical_text() {
        let mut set = FingerprintSet::new(8, WINDOW);
        let now = Instant::now();
        let id = RequestId::new("r1");
        assert!(set.check(Fingerprint::new(&id, Some(1), "the", false), now).is_fresh());
        assert!(set.check(Fingerprint::new(&id, Some(2), "the", false), now).is_fresh());
    }

    #[test]
    fn test_done_flag_is_part_of_identity() {
        let mut set = FingerprintSet::new(8, WINDOW);
        let now = Instant::now();
        let id = RequestId::new("r1");
        assert!(set.check(Fingerprint::new(&id, None, "end", false), now).is_fresh());
        assert!(set.check(Fingerprint::new(&id, None, "end", true), now).is_fresh());
    }

    #[test]
    fn test_long_texts_differing_in_middle_collide() {
        // Only the edges and the length are compared
        let a = format!("{}{}{}", "a".repeat(16), "X", "b".repeat(16));
        let b = format!("{}{}{}", "a".repeat(16), "Y", "b".repeat(16));
        assert_eq!(fp(&a), fp(&b));
        assert_ne!(fp("short one"), fp("short two"));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut set = FingerprintSet::new(2, WINDOW);
        let now = Instant::now();
        set.check(fp("a"), now);
        set.check(fp("b"), now);
        set.check(fp("c"), now);
        assert_eq!(set.len(), 2);
        // "a" was forgotten, so it reads as fresh again
        assert!(set.check(fp("a"), now).is_fresh());
    }
}
