//! Transport Layer
//!
//! Provides abstraction over the duplex channel to the assistant backend:
//! - `InProcess`: Direct channel communication (embedded mode, tests)
//! - `WebSocket`: Remote backend over `ws://` / `wss://` (feature `websocket`)
//!
//! # Design Philosophy
//!
//! A transport opens exactly one connection per call and never retries.
//! Reconnection, heartbeat and store-and-forward queuing belong to the
//! [`ConnectionManager`](crate::connection::ConnectionManager), so every
//! transport gets them for free.

pub mod frame;
pub mod in_process;
pub mod traits;
#[cfg(feature = "websocket")]
pub mod websocket;

// Re-exports for convenience
pub use in_process::{InProcessListener, InProcessTransport, RemoteConnection};
pub use traits::{
    Frame, FrameSink, Transport, TransportChannel, TransportError, TransportEvent, CLOSE_NORMAL,
    CLOSE_STALE,
};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
