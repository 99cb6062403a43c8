//! Transport Traits
//!
//! The duplex channel the connection manager drives. A transport only knows
//! how to open one connection; retry, heartbeat and queuing live above it.
//!
//! Opening yields a [`TransportChannel`]: a [`FrameSink`] for outbound frames
//! and a receiver of [`TransportEvent`]s for inbound frames, errors and the
//! close notification. The "open" notification is the successful return of
//! [`Transport::open`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Close code sent on an orderly shutdown
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code sent when the heartbeat declared the peer dead
pub const CLOSE_STALE: u16 = 4000;

/// A discrete message on the wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame
    Text(String),
    /// Binary frame
    Binary(Vec<u8>),
}

impl Frame {
    /// Payload size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Notifications delivered by an open transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A frame arrived from the peer
    Message(Frame),
    /// The transport reported a fault; a close usually follows
    Error(String),
    /// The connection ended
    Closed {
        /// Close code, if the peer sent one
        code: Option<u16>,
        /// Close reason (may be empty)
        reason: String,
    },
}

/// Errors that can occur during transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection to peer failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Opening the connection took too long
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    /// Connection was closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send a frame
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Message serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Transport not in expected state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO error from underlying transport
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Outbound half of an open connection
#[async_trait]
pub trait FrameSink: Send {
    /// Transmit one frame
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the connection with a code and reason
    ///
    /// Closing an already closed sink is not an error.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// An open connection
pub struct TransportChannel {
    /// Outbound frames
    pub sink: Box<dyn FrameSink>,
    /// Inbound frames, errors and the final close
    ///
    /// The channel ending without a [`TransportEvent::Closed`] is treated as
    /// an abnormal close.
    pub events: mpsc::Receiver<TransportEvent>,
}

impl fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportChannel").finish_non_exhaustive()
    }
}

/// Something that can open duplex connections to the backend
///
/// Implementations have no built-in retry; every call makes exactly one
/// attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection
    async fn open(&self) -> Result<TransportChannel, TransportError>;

    /// Short description for logs (endpoint, mode)
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_len() {
        assert_eq!(Frame::Text("héllo".into()).len(), 6);
        assert!(Frame::Binary(Vec::new()).is_empty());
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("Connection failed"));

        let err = TransportError::Timeout(Duration::from_millis(500));
        assert_eq!(err.to_string(), "Connection timed out after 500ms");

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err = TransportError::from(io_err);
        assert!(err.to_string().contains("IO error"));
    }
}
