//! Outbound store-and-forward queue
//!
//! Holds payloads submitted while the link is down, in submission order.
//! The queue is bounded; when full, the [`OverflowPolicy`] decides which
//! payload is discarded and every discard is logged and counted.

use std::collections::VecDeque;

use crate::config::OverflowPolicy;
use crate::messages::OutboundMessage;

/// Bounded FIFO of pending outbound payloads
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<OutboundMessage>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: u64,
}

impl OutboundQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            policy,
            dropped: 0,
        }
    }

    /// Append a payload; returns the payload discarded to make room, if any
    pub fn push_back(&mut self, message: OutboundMessage) -> Option<OutboundMessage> {
        if self.items.len() < self.capacity {
            self.items.push_back(message);
            return None;
        }

        self.dropped += 1;
        let discarded = match self.policy {
            OverflowPolicy::DropOldest => {
                let oldest = self.items.pop_front();
                self.items.push_back(message);
                oldest
            }
            OverflowPolicy::DropNewest => Some(message),
        };

        if let Some(ref message) = discarded {
            tracing::warn!(
                kind = message.kind(),
                policy = ?self.policy,
                capacity = self.capacity,
                dropped_total = self.dropped,
                "Outbound queue full, discarding payload"
            );
        }
        discarded
    }

    /// Put a payload back at the head after a failed transmit
    ///
    /// If the queue is full the newest payload makes room, so the requeued
    /// one keeps its place in line.
    pub fn push_front(&mut self, message: OutboundMessage) {
        if self.items.len() >= self.capacity {
            if let Some(newest) = self.items.pop_back() {
                self.dropped += 1;
                tracing::warn!(
                    kind = newest.kind(),
                    dropped_total = self.dropped,
                    "Outbound queue full on requeue, discarding newest payload"
                );
            }
        }
        self.items.push_front(message);
    }

    /// Take the oldest payload
    pub fn pop_front(&mut self) -> Option<OutboundMessage> {
        self.items.pop_front()
    }

    /// Discard everything; returns how many payloads were dropped
    pub fn clear(&mut self) -> usize {
        let count = self.items.len();
        self.items.clear();
        count
    }

    /// Number of queued payloads
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Payloads discarded by overflow since creation
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(n: u32) -> OutboundMessage {
        OutboundMessage::Custom(json!({ "n": n }))
    }

    fn drain(queue: &mut OutboundQueue) -> Vec<OutboundMessage> {
        std::iter::from_fn(|| queue.pop_front()).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = OutboundQueue::new(10, OverflowPolicy::DropOldest);
        for n in 0..3 {
            assert!(queue.push_back(msg(n)).is_none());
        }
        assert_eq!(drain(&mut queue), vec![msg(0), msg(1), msg(2)]);
    }

    #[test]
    fn test_drop_oldest() {
        let mut queue = OutboundQueue::new(2, OverflowPolicy::DropOldest);
        queue.push_back(msg(1));
        queue.push_back(msg(2));
        assert_eq!(queue.push_back(msg(3)), Some(msg(1)));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(drain(&mut queue), vec![msg(2), msg(3)]);
    }

    #[test]
    fn test_drop_newest() {
        let mut queue = OutboundQueue::new(2, OverflowPolicy::DropNewest);
        queue.push_back(msg(1));
        queue.push_back(msg(2));
        assert_eq!(queue.push_back(msg(3)), Some(msg(3)));
        assert_eq!(drain(&mut queue), vec![msg(1), msg(2)]);
    }

    #[test]
    fn test_requeue_keeps_head_position() {
        let mut queue = OutboundQueue::new(3, OverflowPolicy::DropOldest);
        queue.push_back(msg(2));
        queue.push_back(msg(3));
        queue.push_front(msg(1));
        assert_eq!(drain(&mut queue), vec![msg(1), msg(2), msg(3)]);
    }

    #[test]
    fn test_requeue_when_full_evicts_newest() {
        let mut queue = OutboundQueue::new(2, OverflowPolicy::DropOldest);
        queue.push_back(msg(2));
        queue.push_back(msg(3));
        queue.push_front(msg(1));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(drain(&mut queue), vec![msg(1), msg(2)]);
    }

    #[test]
    fn test_clear() {
        let mut queue = OutboundQueue::new(4, OverflowPolicy::DropOldest);
        queue.push_back(msg(1));
        queue.push_back(msg(2));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
