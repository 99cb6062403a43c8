//! Connection Manager
//!
//! Owns the single duplex link to the backend. A spawned actor task holds all
//! connection state; [`ConnectionManager`] is the handle that feeds it
//! commands over an unbounded channel, so `send()` never blocks and never
//! fails because the link is down.
//!
//! # Lifecycle
//!
//! ```text
//!            connect()                 open ok
//!   Idle ───────────────▶ Connecting ───────────▶ Open
//!                             ▲  │ open failed      │ close / error / stale
//!             backoff timer   │  ▼                  ▼
//!                           Waiting ◀────────────────┘
//!                             │ attempts >= max
//!                             ▼
//!                          Exhausted ── connect() ──▶ Connecting
//!
//!   any state ── dispose() ──▶ Disposed
//! ```
//!
//! Every open attempt gets a new epoch. Work captured under an older epoch
//! (a late open completion, an in-progress queue flush) is discarded once a
//! newer attempt has begun.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

use crate::config::ConnectionConfig;
use crate::events::{EventBus, LinkEvent, Subscription, Topic};
use crate::messages::{control, AssistantStatus, Inbound, MessageId, OutboundMessage, RequestId};
use crate::transport::{
    frame, FrameSink, Transport, TransportChannel, TransportError, TransportEvent, CLOSE_NORMAL,
    CLOSE_STALE,
};

use super::backoff::Backoff;
use super::heartbeat::{HeartbeatVerdict, LivenessTracker};
use super::queue::OutboundQueue;
use super::registry::{normalize, LocalIdRegistry};

// ============================================================================
// Public types
// ============================================================================

/// Where the link is in its lifecycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Never connected
    #[default]
    Idle,
    /// A transport open is in flight
    Connecting,
    /// The link is up
    Open,
    /// The link is down and a reconnect is scheduled
    Waiting,
    /// Reconnection gave up; waiting for an explicit `connect()`
    Exhausted,
    /// Shut down for good
    Disposed,
}

impl ConnectionPhase {
    /// Whether payloads are transmitted immediately
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Observable connection state, published on every change
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// Lifecycle phase
    pub phase: ConnectionPhase,
    /// Last status reported by the backend (or derived from the link)
    pub assistant_status: AssistantStatus,
    /// Epoch of the latest connect attempt
    pub epoch: u64,
    /// Consecutive failed attempts since the last successful open
    pub reconnect_attempts: u32,
    /// Payloads waiting in the outbound queue
    pub queued: usize,
    /// Payloads discarded by queue overflow
    pub dropped: u64,
}

/// Errors returned by the [`ConnectionManager`] handle
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The manager was disposed; nothing more will be sent
    #[error("Connection manager disposed")]
    Disposed,
}

enum Command {
    Connect,
    Send(OutboundMessage),
    Dispose,
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to the connection actor
///
/// Dropping the handle disposes the manager.
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionSnapshot>,
    bus: EventBus,
    registry: Arc<Mutex<LocalIdRegistry>>,
    disposed: AtomicBool,
}

impl ConnectionManager {
    /// Start a manager with its own event bus
    ///
    /// Must be called within a Tokio runtime. The manager stays idle until
    /// [`connect`](Self::connect) is called.
    pub fn spawn(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        Self::spawn_with_bus(transport, config, EventBus::new())
    }

    /// Start a manager publishing on an existing bus
    pub fn spawn_with_bus(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
        bus: EventBus,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionSnapshot::default());
        let registry = Arc::new(Mutex::new(LocalIdRegistry::default()));

        tracing::debug!(transport = %transport.describe(), "Starting connection manager");

        let actor = LinkActor::new(
            transport,
            config,
            bus.clone(),
            Arc::clone(&registry),
            status_tx,
        );
        tokio::spawn(actor.run(command_rx));

        Self {
            commands: command_tx,
            status: status_rx,
            bus,
            registry,
            disposed: AtomicBool::new(false),
        }
    }

    /// Open the link
    ///
    /// Ignored while connecting or open. After reconnection was exhausted,
    /// this starts over with a fresh attempt counter.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Disposed`] after [`dispose`](Self::dispose).
    pub fn connect(&self) -> Result<(), LinkError> {
        self.command(Command::Connect)
    }

    /// Send a payload, or queue it until the link is up
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Disposed`] after [`dispose`](Self::dispose).
    pub fn send(&self, message: impl Into<OutboundMessage>) -> Result<(), LinkError> {
        self.command(Command::Send(message.into()))
    }

    /// Send user input tagged with a fresh local id
    ///
    /// The id is remembered so the backend's `frontendGeneratedId` echo is
    /// promoted back to it.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Disposed`] after [`dispose`](Self::dispose).
    pub fn send_user_message(&self, text: impl Into<String>) -> Result<MessageId, LinkError> {
        let id = MessageId::new();
        self.registry.lock().register(&id);
        self.send(OutboundMessage::UserMessage {
            frontend_generated_id: id.clone(),
            text: text.into(),
        })?;
        Ok(id)
    }

    /// Ask the backend to stop producing a response
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Disposed`] after [`dispose`](Self::dispose).
    pub fn stop(&self, request_id: impl Into<RequestId>) -> Result<(), LinkError> {
        self.send(OutboundMessage::Stop {
            id: request_id.into(),
        })
    }

    /// Remember an id issued through some other path
    pub fn register_local_id(&self, id: &MessageId) {
        self.registry.lock().register(id);
    }

    /// Subscribe to events on a topic
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.bus.subscribe(topic)
    }

    /// The bus this manager publishes on
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Current connection state
    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.status.borrow().clone()
    }

    /// Current assistant status
    #[must_use]
    pub fn assistant_status(&self) -> AssistantStatus {
        self.status.borrow().assistant_status
    }

    /// Receiver that observes every state change
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.status.clone()
    }

    /// Wait until the connection state satisfies `predicate`
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Disposed`] if the actor stopped first.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<ConnectionSnapshot, LinkError>
    where
        F: FnMut(&ConnectionSnapshot) -> bool,
    {
        let mut status = self.status.clone();
        let result = status
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map(|snapshot| snapshot.clone());
        result.map_err(|_| LinkError::Disposed)
    }

    /// Shut down: stop timers, close the link, drop queued payloads and
    /// release every subscriber
    ///
    /// Idempotent and non-blocking, so it is safe from event handlers.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(Command::Dispose);
    }

    /// Whether [`dispose`](Self::dispose) was called
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn command(&self, command: Command) -> Result<(), LinkError> {
        if self.is_disposed() {
            return Err(LinkError::Disposed);
        }
        self.commands.send(command).map_err(|_| LinkError::Disposed)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("snapshot", &*self.status.borrow())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ============================================================================
// Actor
// ============================================================================

type OpenResult = Result<Result<TransportChannel, TransportError>, JoinError>;

struct Link {
    epoch: u64,
    sink: Box<dyn FrameSink>,
    events: mpsc::Receiver<TransportEvent>,
}

struct PendingOpen {
    epoch: u64,
    task: JoinHandle<Result<TransportChannel, TransportError>>,
}

struct LinkActor {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    backoff: Backoff,
    bus: EventBus,
    registry: Arc<Mutex<LocalIdRegistry>>,
    status: watch::Sender<ConnectionSnapshot>,

    phase: ConnectionPhase,
    assistant_status: AssistantStatus,
    epoch: u64,
    reconnect_attempts: u32,
    queue: OutboundQueue,

    link: Option<Link>,
    pending_open: Option<PendingOpen>,
    /// Epoch the running flush belongs to
    flush_epoch: Option<u64>,
    liveness: Option<LivenessTracker>,
    heartbeat: Option<Interval>,
    reconnect_at: Option<Instant>,
}

impl LinkActor {
    fn new(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
        bus: EventBus,
        registry: Arc<Mutex<LocalIdRegistry>>,
        status: watch::Sender<ConnectionSnapshot>,
    ) -> Self {
        let queue = OutboundQueue::new(config.outbound_queue_capacity, config.overflow_policy);
        Self {
            transport,
            backoff: Backoff::from_config(&config),
            config,
            bus,
            registry,
            status,
            phase: ConnectionPhase::Idle,
            assistant_status: AssistantStatus::Idle,
            epoch: 0,
            reconnect_attempts: 0,
            queue,
            link: None,
            pending_open: None,
            flush_epoch: None,
            liveness: None,
            heartbeat: None,
            reconnect_at: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Connect) => self.start_connect(true),
                    Some(Command::Send(message)) => self.handle_send(message).await,
                    Some(Command::Dispose) | None => {
                        self.shutdown().await;
                        break;
                    }
                },

                event = next_event(&mut self.link) => self.handle_transport_event(event).await,

                (epoch, opened) = open_completion(&mut self.pending_open) => {
                    self.pending_open = None;
                    self.handle_open_result(epoch, opened).await;
                }

                () = heartbeat_tick(&mut self.heartbeat) => self.on_heartbeat().await,

                () = reconnect_timer(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_connect(false);
                }

                () = std::future::ready(()), if self.flush_epoch.is_some() => self.flush_step().await,
            }

            self.publish_snapshot();
        }

        tracing::debug!("Connection actor stopped");
    }

    // ------------------------------------------------------------------
    // Connect / reconnect
    // ------------------------------------------------------------------

    fn start_connect(&mut self, explicit: bool) {
        match self.phase {
            ConnectionPhase::Disposed => return,
            ConnectionPhase::Connecting | ConnectionPhase::Open => {
                tracing::debug!(phase = ?self.phase, "Connect ignored, link already active");
                return;
            }
            ConnectionPhase::Exhausted if explicit => {
                tracing::info!("Explicit connect after exhaustion, resetting attempts");
                self.reconnect_attempts = 0;
            }
            _ => {}
        }

        if explicit {
            self.reconnect_at = None;
        }

        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            self.exhaust();
            return;
        }

        self.epoch += 1;
        self.phase = ConnectionPhase::Connecting;
        let epoch = self.epoch;

        tracing::info!(
            epoch,
            attempt = self.reconnect_attempts,
            transport = %self.transport.describe(),
            "Connecting"
        );
        self.bus.publish(LinkEvent::Connecting {
            epoch,
            attempt: self.reconnect_attempts,
        });

        let transport = Arc::clone(&self.transport);
        let task = tokio::spawn(async move { transport.open().await });
        self.pending_open = Some(PendingOpen { epoch, task });
    }

    async fn handle_open_result(&mut self, epoch: u64, opened: OpenResult) {
        if epoch != self.epoch || self.phase != ConnectionPhase::Connecting {
            tracing::debug!(epoch, current = self.epoch, "Discarding stale open");
            if let Ok(Ok(mut channel)) = opened {
                let _ = channel.sink.close(CLOSE_NORMAL, "superseded").await;
            }
            return;
        }

        let channel = match opened {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                tracing::warn!(epoch, error = %e, "Connect failed");
                self.on_link_lost(None, e.to_string());
                return;
            }
            Err(e) => {
                tracing::warn!(epoch, error = %e, "Connect task failed");
                self.on_link_lost(None, format!("open task failed: {e}"));
                return;
            }
        };

        let now = Instant::now();
        let period = self.config.ping_interval;
        let mut heartbeat = interval_at(now + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.link = Some(Link {
            epoch,
            sink: channel.sink,
            events: channel.events,
        });
        self.phase = ConnectionPhase::Open;
        self.reconnect_attempts = 0;
        self.liveness = Some(LivenessTracker::new(period, now));
        self.heartbeat = Some(heartbeat);
        self.set_assistant_status(AssistantStatus::Idle);

        tracing::info!(epoch, queued = self.queue.len(), "Connected");
        self.bus.publish(LinkEvent::Connected { epoch });

        if !self.queue.is_empty() {
            self.flush_epoch = Some(epoch);
        }
    }

    /// Common path for every way a link can go away
    fn on_link_lost(&mut self, code: Option<u16>, reason: String) {
        let epoch = self.link.take().map_or(self.epoch, |link| link.epoch);
        self.heartbeat = None;
        self.liveness = None;
        self.flush_epoch = None;

        if self.phase == ConnectionPhase::Disposed {
            return;
        }

        self.phase = ConnectionPhase::Waiting;
        self.set_assistant_status(AssistantStatus::Waiting);

        tracing::info!(epoch, ?code, %reason, "Disconnected");
        self.bus.publish(LinkEvent::Disconnected {
            epoch,
            code,
            reason,
        });

        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_at.is_some() {
            return;
        }

        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        let delay = self.backoff.delay_for_attempt(self.reconnect_attempts);
        self.reconnect_at = Some(Instant::now() + delay);

        tracing::info!(
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        self.bus.publish(LinkEvent::ReconnectScheduled {
            attempt: self.reconnect_attempts,
            delay,
        });
    }

    fn exhaust(&mut self) {
        self.phase = ConnectionPhase::Exhausted;
        self.reconnect_at = None;
        self.set_assistant_status(AssistantStatus::Error);

        tracing::warn!(
            attempts = self.reconnect_attempts,
            queued = self.queue.len(),
            "Max reconnect attempts reached"
        );
        self.bus.publish(LinkEvent::MaxAttemptsReached {
            attempts: self.reconnect_attempts,
        });
    }

    async fn close_link(&mut self, code: u16, reason: &str) {
        if let Some(link) = self.link.as_mut() {
            if let Err(e) = link.sink.close(code, reason).await {
                tracing::debug!(epoch = link.epoch, error = %e, "Close failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    async fn handle_send(&mut self, message: OutboundMessage) {
        if self.phase.is_open() && self.link.is_some() && self.queue.is_empty() {
            self.transmit(message).await;
            return;
        }

        // Queue behind anything still waiting so submission order holds
        tracing::debug!(
            kind = message.kind(),
            phase = ?self.phase,
            queued = self.queue.len() + 1,
            "Queueing outbound payload"
        );
        self.queue.push_back(message);

        if self.phase.is_open() && self.flush_epoch.is_none() {
            self.flush_epoch = Some(self.epoch);
        }
    }

    async fn transmit(&mut self, message: OutboundMessage) {
        let frame = match frame::encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(kind = message.kind(), error = %e, "Dropping unencodable payload");
                return;
            }
        };

        let Some(link) = self.link.as_mut() else {
            self.requeue(message);
            return;
        };

        match link.sink.send(frame).await {
            Ok(()) => tracing::trace!(epoch = link.epoch, kind = message.kind(), "Sent"),
            Err(e) => {
                tracing::warn!(epoch = link.epoch, error = %e, "Transmit failed");
                self.requeue(message);
                self.close_link(CLOSE_NORMAL, "send failed").await;
                self.on_link_lost(None, format!("send failed: {e}"));
            }
        }
    }

    fn requeue(&mut self, message: OutboundMessage) {
        // Liveness traffic is only meaningful on the link it was meant for
        if matches!(
            message,
            OutboundMessage::Ping { .. } | OutboundMessage::Pong { .. }
        ) {
            return;
        }
        self.queue.push_front(message);
    }

    /// Send one queued payload, unless a newer epoch has taken over
    async fn flush_step(&mut self) {
        let Some(flush_epoch) = self.flush_epoch else {
            return;
        };

        let link_epoch = self.link.as_ref().map(|link| link.epoch);
        if flush_epoch != self.epoch || link_epoch != Some(flush_epoch) {
            tracing::debug!(
                flush_epoch,
                current = self.epoch,
                remaining = self.queue.len(),
                "Discarding stale flush"
            );
            self.flush_epoch = None;
            return;
        }

        match self.queue.pop_front() {
            Some(message) => self.transmit(message).await,
            None => {
                tracing::debug!(epoch = flush_epoch, "Outbound queue flushed");
                self.flush_epoch = None;
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    async fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Message(frame)) => {
                if let Some(liveness) = self.liveness.as_mut() {
                    liveness.record_activity(Instant::now());
                }
                self.handle_inbound(frame::decode(frame)).await;
            }
            Some(TransportEvent::Error(e)) => {
                tracing::warn!(epoch = self.epoch, error = %e, "Transport error");
                self.close_link(CLOSE_NORMAL, "transport error").await;
                self.on_link_lost(None, e);
            }
            Some(TransportEvent::Closed { code, reason }) => {
                self.on_link_lost(code, reason);
            }
            None => self.on_link_lost(None, "transport ended".to_string()),
        }
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        let mut message = match inbound {
            Inbound::Parsed(message) => message,
            raw @ Inbound::Raw(_) => {
                self.bus.publish(LinkEvent::Message(Arc::new(raw)));
                return;
            }
        };

        match message.kind() {
            Some(control::HEARTBEAT | control::PING) => {
                let echo = message.timestamp().cloned();
                self.transmit(OutboundMessage::pong_for(echo)).await;
                return;
            }
            Some(control::PONG) => {
                tracing::trace!(epoch = self.epoch, "Pong received");
                return;
            }
            Some(control::STATUS) => {
                if let Some(status) = message.state.as_deref().and_then(AssistantStatus::parse) {
                    self.apply_reported_status(status);
                    return;
                }
                tracing::debug!(state = ?message.state, "Unrecognized status, forwarding as message");
            }
            _ => {}
        }

        normalize(&mut message, &self.registry.lock());
        self.bus
            .publish(LinkEvent::Message(Arc::new(Inbound::Parsed(message))));
    }

    async fn on_heartbeat(&mut self) {
        let Some(liveness) = self.liveness.as_ref() else {
            return;
        };

        match liveness.check(Instant::now()) {
            HeartbeatVerdict::SendPing => self.transmit(OutboundMessage::ping_now()).await,
            HeartbeatVerdict::Stale { silent_for } => {
                tracing::warn!(
                    epoch = self.epoch,
                    silent_ms = silent_for.as_millis() as u64,
                    "Heartbeat stale, reconnecting"
                );
                self.close_link(CLOSE_STALE, "heartbeat timeout").await;
                self.on_link_lost(Some(CLOSE_STALE), "heartbeat timeout".to_string());
            }
        }
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Status the backend reported; forwarded even when it repeats
    fn apply_reported_status(&mut self, status: AssistantStatus) {
        if self.assistant_status != status {
            tracing::debug!(from = ?self.assistant_status, to = ?status, "Assistant status reported");
            self.assistant_status = status;
        }
        self.bus.publish(LinkEvent::Status(status));
    }

    /// Status derived from the link itself; published only on change
    fn set_assistant_status(&mut self, status: AssistantStatus) {
        if self.assistant_status == status {
            return;
        }
        tracing::debug!(from = ?self.assistant_status, to = ?status, "Assistant status changed");
        self.assistant_status = status;
        self.bus.publish(LinkEvent::Status(status));
    }

    fn publish_snapshot(&self) {
        let snapshot = ConnectionSnapshot {
            phase: self.phase,
            assistant_status: self.assistant_status,
            epoch: self.epoch,
            reconnect_attempts: self.reconnect_attempts,
            queued: self.queue.len(),
            dropped: self.queue.dropped(),
        };
        self.status.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    async fn shutdown(&mut self) {
        if self.phase == ConnectionPhase::Disposed {
            return;
        }

        if let Some(pending) = self.pending_open.take() {
            pending.task.abort();
        }
        self.reconnect_at = None;
        self.heartbeat = None;
        self.liveness = None;
        self.flush_epoch = None;

        self.close_link(CLOSE_NORMAL, "disposed").await;
        self.link = None;
        self.phase = ConnectionPhase::Disposed;

        let discarded = self.queue.clear();
        tracing::info!(epoch = self.epoch, discarded, "Connection manager disposed");

        self.publish_snapshot();
        self.bus.close();
    }
}

// ============================================================================
// Select helpers: pending forever when there is nothing to wait on
// ============================================================================

async fn next_event(link: &mut Option<Link>) -> Option<TransportEvent> {
    match link {
        Some(link) => link.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn open_completion(pending: &mut Option<PendingOpen>) -> (u64, OpenResult) {
    match pending {
        Some(pending) => {
            let opened = (&mut pending.task).await;
            (pending.epoch, opened)
        }
        None => std::future::pending().await,
    }
}

async fn heartbeat_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn reconnect_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
