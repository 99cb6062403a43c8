//! Heartbeat liveness tracking
//!
//! Every `ping_interval` the manager asks the tracker what to do. A link that
//! has been silent for more than twice the interval is stale: the peer is
//! presumed dead even though it never sent a close frame. Otherwise a ping is
//! due.
//!
//! Any inbound frame counts as activity, not only pongs, so a busy stream is
//! never declared stale between pongs.

use std::time::Duration;

use tokio::time::Instant;

/// What the heartbeat tick should do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Link looks alive; send a ping
    SendPing,
    /// Link has been silent too long; close and reconnect
    Stale {
        /// Time since the last activity
        silent_for: Duration,
    },
}

/// Last-seen bookkeeping for one connection
#[derive(Clone, Debug)]
pub struct LivenessTracker {
    ping_interval: Duration,
    last_activity: Instant,
}

impl LivenessTracker {
    /// Start tracking; the link counts as alive at `now`
    #[must_use]
    pub fn new(ping_interval: Duration, now: Instant) -> Self {
        Self {
            ping_interval,
            last_activity: now,
        }
    }

    /// Record that the peer was heard from
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Silence longer than this marks the link stale
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        self.ping_interval.saturating_mul(2)
    }

    /// When the peer was last heard from
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Decide what a heartbeat tick at `now` should do
    #[must_use]
    pub fn check(&self, now: Instant) -> HeartbeatVerdict {
        let silent_for = now.saturating_duration_since(self.last_activity);
        if silent_for > self.stale_after() {
            HeartbeatVerdict::Stale { silent_for }
        } else {
            HeartbeatVerdict::SendPing
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(30);

    #[test]
    fn test_fresh_link_pings() {
        let start = Instant::now();
        let tracker = LivenessTracker::new(INTERVAL, start);
        assert_eq!(tracker.check(start + INTERVAL), HeartbeatVerdict::SendPing);
    }

    #[test]
    fn test_exactly_twice_interval_is_not_stale() {
        let start = Instant::now();
        let tracker = LivenessTracker::new(INTERVAL, start);
        assert_eq!(tracker.check(start + INTERVAL * 2), HeartbeatVerdict::SendPing);
    }

    #[test]
    fn test_silence_beyond_twice_interval_is_stale() {
        let start = Instant::now();
        let tracker = LivenessTracker::new(INTERVAL, start);
        let now = start + INTERVAL * 2 + Duration::from_millis(1);
        assert_eq!(
            tracker.check(now),
            HeartbeatVerdict::Stale {
                silent_for: INTERVAL * 2 + Duration::from_millis(1)
            }
        );
    }

    #[test]
    fn test_activity_resets_silence() {
        let start = Instant::now();
        let mut tracker = LivenessTracker::new(INTERVAL, start);
        tracker.record_activity(start + INTERVAL * 2);
        assert_eq!(tracker.check(start + INTERVAL * 3), HeartbeatVerdict::SendPing);
        assert_eq!(tracker.last_activity(), start + INTERVAL * 2);
    }
}
