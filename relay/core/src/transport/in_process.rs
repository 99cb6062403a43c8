//! In-Process Transport
//!
//! Direct channel-based connections for embedded mode and tests. The backend
//! side of every opened connection is handed to an [`InProcessListener`] as a
//! [`RemoteConnection`], which can read what the client sent, push frames to
//! the client and close the connection.
//!
//! # Usage
//!
//! ```ignore
//! let (transport, mut listener) = InProcessTransport::new_pair();
//!
//! // Give the transport to the ConnectionManager
//! let manager = ConnectionManager::spawn(Arc::new(transport), config);
//! manager.connect();
//!
//! // Play the backend
//! let mut remote = listener.accept().await.unwrap();
//! remote.send_json(&json!({"type": "chunk", "id": "r1", "text": "hi"})).await?;
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::traits::{Frame, FrameSink, Transport, TransportChannel, TransportError, TransportEvent};

/// Default capacity of the backend-to-client event channel
const DEFAULT_CAPACITY: usize = 256;

struct Shared {
    /// Scripted failures, consumed one per open
    failures: Mutex<VecDeque<String>>,
    /// `true` lets opens complete, `false` holds them
    gate: watch::Sender<bool>,
    opens: AtomicU64,
}

/// Transport whose connections are served by an [`InProcessListener`]
pub struct InProcessTransport {
    accept_tx: mpsc::UnboundedSender<RemoteConnection>,
    shared: Arc<Shared>,
    capacity: usize,
}

impl InProcessTransport {
    /// Create a transport and the listener that serves it
    #[must_use]
    pub fn new_pair() -> (Self, InProcessListener) {
        Self::new_pair_with_capacity(DEFAULT_CAPACITY)
    }

    /// Create with custom event channel capacity
    #[must_use]
    pub fn new_pair_with_capacity(capacity: usize) -> (Self, InProcessListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (gate, _) = watch::channel(true);
        let shared = Arc::new(Shared {
            failures: Mutex::new(VecDeque::new()),
            gate,
            opens: AtomicU64::new(0),
        });

        let transport = Self {
            accept_tx,
            shared: Arc::clone(&shared),
            capacity: capacity.max(1),
        };
        let listener = InProcessListener { accept_rx, shared };

        (transport, listener)
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn open(&self) -> Result<TransportChannel, TransportError> {
        let attempt = self.shared.opens.fetch_add(1, Ordering::SeqCst) + 1;

        let mut gate = self.shared.gate.subscribe();
        let released = gate.wait_for(|open| *open).await.is_ok();
        if !released {
            return Err(TransportError::ConnectionFailed("listener gone".to_string()));
        }

        if let Some(reason) = self.shared.failures.lock().pop_front() {
            tracing::debug!(attempt, %reason, "In-process open failing as scripted");
            return Err(TransportError::ConnectionFailed(reason));
        }

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(self.capacity);
        let client_close = Arc::new(Mutex::new(None));

        let remote = RemoteConnection {
            id: attempt,
            frames: frame_rx,
            events: Some(event_tx),
            client_close: Arc::clone(&client_close),
        };

        self.accept_tx
            .send(remote)
            .map_err(|_| TransportError::ConnectionFailed("listener gone".to_string()))?;

        Ok(TransportChannel {
            sink: Box::new(InProcessSink {
                tx: Some(frame_tx),
                client_close,
            }),
            events: event_rx,
        })
    }

    fn describe(&self) -> String {
        "in-process".to_string()
    }
}

struct InProcessSink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    client_close: Arc<Mutex<Option<(u16, String)>>>,
}

#[async_trait]
impl FrameSink for InProcessSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame).map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.tx.take().is_some() {
            *self.client_close.lock() = Some((code, reason.to_string()));
        }
        Ok(())
    }
}

/// Backend side of an [`InProcessTransport`]
pub struct InProcessListener {
    accept_rx: mpsc::UnboundedReceiver<RemoteConnection>,
    shared: Arc<Shared>,
}

impl InProcessListener {
    /// Wait for the next opened connection
    pub async fn accept(&mut self) -> Option<RemoteConnection> {
        self.accept_rx.recv().await
    }

    /// Take an opened connection if one is waiting
    pub fn try_accept(&mut self) -> Option<RemoteConnection> {
        self.accept_rx.try_recv().ok()
    }

    /// Make the next open fail with `reason`
    ///
    /// Calls accumulate; each failure is consumed by one open.
    pub fn fail_next_open(&self, reason: impl Into<String>) {
        self.shared.failures.lock().push_back(reason.into());
    }

    /// Hold opens until [`release_opens`](Self::release_opens)
    pub fn hold_opens(&self) {
        self.shared.gate.send_replace(false);
    }

    /// Let held and future opens complete
    pub fn release_opens(&self) {
        self.shared.gate.send_replace(true);
    }

    /// Number of open attempts so far
    #[must_use]
    pub fn open_count(&self) -> u64 {
        self.shared.opens.load(Ordering::SeqCst)
    }
}

/// The backend's end of one in-process connection
pub struct RemoteConnection {
    id: u64,
    frames: mpsc::UnboundedReceiver<Frame>,
    events: Option<mpsc::Sender<TransportEvent>>,
    client_close: Arc<Mutex<Option<(u16, String)>>>,
}

impl RemoteConnection {
    /// Sequence number of the open that created this connection
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next frame the client sent
    ///
    /// Returns `None` once the client closed and every frame was read.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// Take a frame if one is waiting
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.frames.try_recv().ok()
    }

    /// Wait for the next frame and parse it as JSON
    ///
    /// Frames that are not valid JSON come back as a JSON string.
    pub async fn recv_json(&mut self) -> Option<Value> {
        self.recv().await.map(frame_to_json)
    }

    /// Every frame currently waiting, parsed as JSON
    pub fn drain_json(&mut self) -> Vec<Value> {
        let mut values = Vec::new();
        while let Some(frame) = self.try_recv() {
            values.push(frame_to_json(frame));
        }
        values
    }

    /// Push a text frame to the client
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionClosed` if either side closed.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.deliver(TransportEvent::Message(Frame::Text(text.into())))
            .await
    }

    /// Push a JSON text frame to the client
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionClosed` if either side closed.
    pub async fn send_json(&self, value: &Value) -> Result<(), TransportError> {
        self.send_text(value.to_string()).await
    }

    /// Push a binary frame to the client
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionClosed` if either side closed.
    pub async fn send_binary(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.deliver(TransportEvent::Message(Frame::Binary(bytes)))
            .await
    }

    /// Report a transport fault to the client
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionClosed` if either side closed.
    pub async fn send_error(&self, message: impl Into<String>) -> Result<(), TransportError> {
        self.deliver(TransportEvent::Error(message.into())).await
    }

    /// Close the connection from the backend side
    pub async fn close(&mut self, code: u16, reason: &str) {
        if let Some(events) = self.events.take() {
            let _ = events
                .send(TransportEvent::Closed {
                    code: Some(code),
                    reason: reason.to_string(),
                })
                .await;
        }
        self.frames.close();
    }

    /// Drop the connection without a close notification
    pub fn sever(&mut self) {
        self.events = None;
        self.frames.close();
    }

    /// Close code and reason, if the client closed the connection
    #[must_use]
    pub fn client_close(&self) -> Option<(u16, String)> {
        self.client_close.lock().clone()
    }

    async fn deliver(&self, event: TransportEvent) -> Result<(), TransportError> {
        let events = self.events.as_ref().ok_or(TransportError::ConnectionClosed)?;
        events
            .send(event)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

fn frame_to_json(frame: Frame) -> Value {
    match frame {
        Frame::Text(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        Frame::Binary(bytes) => serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())),
    }
}
