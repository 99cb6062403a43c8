//! Relay Core - Client-side duplex link to a streaming assistant backend
//!
//! This crate keeps one resilient connection to an assistant backend and turns
//! the chunked responses it streams into complete, persisted messages. It is
//! independent of any UI framework: rendering and storage are injected as
//! sinks, so the same core drives a terminal client, an embedded surface, or a
//! headless test harness.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Embedding Surface                         │
//! │      send_user_message / stop           RenderSink  PersistenceSink
//! └───────────────┬──────────────────────────────▲──────────▲───────┘
//!                 │                              │          │
//! ┌───────────────┼──────────────────────────────┼──────────┼───────┐
//! │               ▼           RELAY CORE         │          │       │
//! │  ┌──────────────────────┐   EventBus   ┌─────┴──────────┴─────┐ │
//! │  │  ConnectionManager   │ ───────────▶ │   StreamAssembler    │ │
//! │  │  backoff · heartbeat │  LinkEvent   │ dedup · <think> scan │ │
//! │  │  outbound queue      │              │ finalize exactly once│ │
//! │  └──────────┬───────────┘              └──────────────────────┘ │
//! └─────────────┼───────────────────────────────────────────────────┘
//!               ▼
//!        Transport (in-process channel, WebSocket)
//! ```
//!
//! # Key Types
//!
//! - [`ConnectionManager`]: Owns the link; reconnects, heartbeats and queues sends
//! - [`StreamAssembler`]: Accumulates chunks per request and finalizes them
//! - [`EventBus`]: Topic-filtered fan-out of [`LinkEvent`]s
//! - [`RenderSink`] / [`PersistenceSink`]: Where assembled messages go
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relay_core::{
//!     ConnectionConfig, ConnectionManager, InProcessTransport, MemoryPersistence,
//!     MemoryRenderSink, StreamAssembler, Topic, AssemblerConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let (transport, _listener) = InProcessTransport::new_pair();
//!     let link = ConnectionManager::spawn(Arc::new(transport), ConnectionConfig::default());
//!
//!     let assembler = StreamAssembler::new(
//!         AssemblerConfig::default(),
//!         Arc::new(MemoryRenderSink::new()),
//!         Arc::new(MemoryPersistence::new()),
//!         link.bus().clone(),
//!     );
//!     assembler.attach(link.subscribe(Topic::Messages));
//!
//!     link.connect().ok();
//!     link.send_user_message("hello").ok();
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`config`]: Layered configuration (defaults, TOML file, environment, CLI)
//! - [`connection`]: Connection manager, backoff, heartbeat, outbound queue
//! - [`events`]: Link events and the topic event bus
//! - [`messages`]: Wire message types and identifiers
//! - [`sinks`]: Render and persistence sink traits with bundled implementations
//! - [`streaming`]: Chunk deduplication, reasoning split and stream finalization
//! - [`transport`]: Duplex transports (in-process, WebSocket)

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod connection;
pub mod events;
pub mod messages;
pub mod sinks;
pub mod streaming;
pub mod transport;

// Re-exports for convenience
pub use connection::{
    Backoff, ConnectionManager, ConnectionPhase, ConnectionSnapshot, LinkError, OutboundQueue,
};
pub use events::{EventBus, FinalizedStream, LinkEvent, Subscription, Topic};
pub use messages::{
    AssistantStatus, Inbound, InboundMessage, MessageId, MessageRole, OutboundMessage, RawPayload,
    RequestId,
};

// Sink exports
pub use sinks::{
    DraftMessage, JsonlPersistence, MemoryPersistence, MemoryRenderSink, PersistenceError,
    PersistenceSink, RenderSink, SavedMessage,
};

// Streaming exports
pub use streaming::{AssemblerError, Chunk, ChunkOutcome, DropReason, StreamAssembler};

// Transport exports
pub use transport::{InProcessListener, InProcessTransport, RemoteConnection, Transport};
#[cfg(feature = "websocket")]
pub use transport::WebSocketTransport;

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, AssemblerConfig, ConfigError,
    ConfigOverrides, ConfigSource, ConnectionConfig, OverflowPolicy, RelayConfig,
};
