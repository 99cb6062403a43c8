//! Link Events
//!
//! Typed events published by the connection manager and the stream assembler,
//! and the publish/subscribe bus that fans them out.
//!
//! # Design Philosophy
//!
//! Subscribers pick a [`Topic`] instead of listening on string-keyed event
//! names. Every subscriber owns an unbounded queue, so a slow consumer never
//! causes another consumer to miss chunks, and publishing never blocks the
//! connection loop.
//!
//! ```text
//!   ConnectionManager ──┐                ┌──▶ Subscription(Topic::MessageType("chunk"))
//!                       ├──▶ EventBus ───┼──▶ Subscription(Topic::Status)
//!   StreamAssembler ────┘                └──▶ Subscription(Topic::All)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::messages::{AssistantStatus, Inbound, MessageId, RequestId};

/// Summary emitted once a stream has been persisted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizedStream {
    /// Correlation key of the stream
    pub request_id: RequestId,
    /// Id the stream was rendered under while it was accumulating
    pub local_id: MessageId,
    /// Id assigned by the persistence store (equal to `local_id` if unchanged)
    pub message_id: MessageId,
    /// Length of the visible text in bytes
    pub content_len: usize,
    /// Length of the reasoning text in bytes
    pub reasoning_len: usize,
    /// Whether the stream was aborted before its final chunk
    pub cancelled: bool,
}

/// Events published on the [`EventBus`]
#[derive(Clone, Debug)]
pub enum LinkEvent {
    // ============================================
    // Connection lifecycle
    // ============================================
    /// A transport open was started
    Connecting {
        /// Epoch of this attempt
        epoch: u64,
        /// Reconnect attempts so far
        attempt: u32,
    },

    /// The transport is open
    Connected {
        /// Epoch of the open connection
        epoch: u64,
    },

    /// The transport closed, errored or went stale
    Disconnected {
        /// Epoch of the lost connection
        epoch: u64,
        /// Close code, when the peer sent one
        code: Option<u16>,
        /// Human-readable reason
        reason: String,
    },

    /// A reconnect timer was armed
    ReconnectScheduled {
        /// Attempt number the timer will run
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },

    /// Reconnection gave up; a caller must connect explicitly
    MaxAttemptsReached {
        /// Attempts made
        attempts: u32,
    },

    // ============================================
    // Inbound traffic
    // ============================================
    /// Assistant status changed
    Status(AssistantStatus),

    /// A normalized inbound message
    Message(Arc<Inbound>),

    // ============================================
    // Stream lifecycle
    // ============================================
    /// A stream was persisted and reconciled
    Finalized(FinalizedStream),

    /// Persisting a stream failed; it will not be retried automatically
    FinalizeFailed {
        /// Correlation key of the stream
        request_id: RequestId,
        /// Failure description
        error: String,
    },
}

/// Subscription filter
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Topic {
    /// Every event
    All,
    /// Connecting / connected / disconnected / reconnect / exhaustion
    Connection,
    /// Assistant status changes
    Status,
    /// Every inbound message, parsed or raw
    Messages,
    /// Parsed inbound messages with the given `type`
    MessageType(String),
    /// Finalized / failed streams
    Stream,
}

impl Topic {
    /// Subscribe to messages of one type
    pub fn message_type(kind: impl Into<String>) -> Self {
        Self::MessageType(kind.into())
    }

    /// Whether an event belongs to this topic
    #[must_use]
    pub fn matches(&self, event: &LinkEvent) -> bool {
        match self {
            Self::All => true,
            Self::Connection => matches!(
                event,
                LinkEvent::Connecting { .. }
                    | LinkEvent::Connected { .. }
                    | LinkEvent::Disconnected { .. }
                    | LinkEvent::ReconnectScheduled { .. }
                    | LinkEvent::MaxAttemptsReached { .. }
            ),
            Self::Status => matches!(event, LinkEvent::Status(_)),
            Self::Messages => matches!(event, LinkEvent::Message(_)),
            Self::MessageType(kind) => match event {
                LinkEvent::Message(inbound) => inbound.kind() == Some(kind.as_str()),
                _ => false,
            },
            Self::Stream => matches!(
                event,
                LinkEvent::Finalized(_) | LinkEvent::FinalizeFailed { .. }
            ),
        }
    }
}

struct Subscriber {
    id: u64,
    topic: Topic,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

#[derive(Default)]
struct BusInner {
    subscribers: Vec<Subscriber>,
    closed: bool,
}

/// Fan-out of [`LinkEvent`]s to topic subscribers
///
/// Cheap to clone; all clones share the same subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<RwLock<BusInner>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for a topic
    ///
    /// Subscribing to a closed bus yields a subscription that is already
    /// exhausted.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.write();
        if !inner.closed {
            inner.subscribers.push(Subscriber {
                id,
                topic: topic.clone(),
                tx,
            });
        }

        Subscription { id, topic, rx }
    }

    /// Deliver an event to every matching subscriber
    ///
    /// Returns the number of subscribers that received it. Subscribers whose
    /// receiving side has been dropped are pruned.
    pub fn publish(&self, event: LinkEvent) -> usize {
        let mut delivered = 0;
        let mut stale = false;

        {
            let inner = self.inner.read();
            for subscriber in inner.subscribers.iter().filter(|s| s.topic.matches(&event)) {
                if subscriber.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    stale = true;
                }
            }
        }

        if stale {
            self.inner.write().subscribers.retain(|s| !s.tx.is_closed());
        }

        delivered
    }

    /// Remove a single subscriber
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.inner
            .write()
            .subscribers
            .retain(|s| s.id != subscription.id);
    }

    /// Drop every subscriber and refuse new ones
    ///
    /// Pending events stay readable; afterwards each subscription yields `None`.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        inner.closed = true;
        inner.subscribers.clear();
    }

    /// Whether [`close`](Self::close) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.read().subscribers.len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving end of a topic subscription
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: Topic,
    rx: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Subscription {
    /// Wait for the next event; `None` once the bus is closed and drained
    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.rx.recv().await
    }

    /// Take the next event if one is queued
    pub fn try_recv(&mut self) -> Option<LinkEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently queued
    pub fn drain(&mut self) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// The topic this subscription filters on
    #[must_use]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}
