//! Output sinks
//!
//! The stream assembler's two collaborators:
//! - [`RenderSink`]: paints accumulating text; synchronous, owns nothing the
//!   core depends on
//! - [`PersistenceSink`]: durably stores a finalized message and may assign a
//!   canonical id that differs from the local one
//!
//! Headless implementations live in [`memory`] (tests, embedders) and
//! [`jsonl`] (append-only file used by `relay-probe`).

pub mod jsonl;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::{MessageId, MessageRole, RequestId};

pub use jsonl::JsonlPersistence;
pub use memory::{MemoryPersistence, MemoryRenderSink, RenderCall};

/// Receives render instructions for messages being assembled
pub trait RenderSink: Send + Sync {
    /// A new message appeared
    fn create(&self, id: &MessageId, role: MessageRole, initial_text: &str);

    /// Replace the full text of a message
    fn update(&self, id: &MessageId, full_text: &str);

    /// The message now lives under a different id
    fn rekey(&self, old_id: &MessageId, new_id: &MessageId);
}

/// A finalized message ready to be stored
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftMessage {
    /// Id the message was rendered under
    pub local_id: MessageId,
    /// Author
    pub role: MessageRole,
    /// Visible text (may be empty)
    pub text: String,
    /// Reasoning text kept out of the visible body
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reasoning: String,
    /// Request the message answers
    pub correlation_id: RequestId,
    /// Conversation the message belongs to, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    /// The stream was aborted before its final chunk
    #[serde(default)]
    pub cancelled: bool,
    /// When the draft was produced
    pub created_at: DateTime<Utc>,
}

/// What the store returned for a saved message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedMessage {
    /// Canonical id; equal to the draft's local id if the store kept it
    pub id: MessageId,
}

/// Errors raised by a persistence store
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The store rejected the operation
    #[error("Store rejected operation: {0}")]
    Rejected(String),

    /// The store cannot be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// IO error from a file-backed store
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable storage for finalized messages
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Store a message; the returned id is canonical from then on
    async fn save(&self, draft: DraftMessage) -> Result<SavedMessage, PersistenceError>;

    /// Attach artifacts produced for `request_id` to the stored message
    ///
    /// Returns how many artifacts were updated.
    async fn link_artifacts(
        &self,
        request_id: &RequestId,
        canonical_id: &MessageId,
        chat_id: Option<&str>,
    ) -> Result<usize, PersistenceError>;
}
