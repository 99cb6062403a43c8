//! Connection management
//!
//! Everything between the raw transport and the event bus:
//! - [`ConnectionManager`]: connect, reconnect with backoff, heartbeat,
//!   store-and-forward queuing, inbound normalization and fan-out
//! - [`Backoff`]: the reconnect delay schedule
//! - [`OutboundQueue`]: bounded FIFO of payloads held while disconnected
//! - [`LivenessTracker`]: stale-link detection
//! - [`LocalIdRegistry`]: ids this client issued, for echo promotion

pub mod backoff;
pub mod heartbeat;
pub mod manager;
pub mod queue;
pub mod registry;

pub use backoff::Backoff;
pub use heartbeat::{HeartbeatVerdict, LivenessTracker};
pub use manager::{ConnectionManager, ConnectionPhase, ConnectionSnapshot, LinkError};
pub use queue::OutboundQueue;
pub use registry::{normalize, LocalIdRegistry};
