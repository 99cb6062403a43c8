//! In-memory sinks
//!
//! Headless [`RenderSink`] and [`PersistenceSink`] implementations that record
//! every call. Used by tests and by embedders that render elsewhere.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::messages::{MessageId, MessageRole, RequestId};

use super::{DraftMessage, PersistenceError, PersistenceSink, RenderSink, SavedMessage};

// ============================================================================
// Render
// ============================================================================

/// One call received by a [`MemoryRenderSink`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenderCall {
    /// `create(id, role, text)`
    Create {
        /// Message id
        id: MessageId,
        /// Author
        role: MessageRole,
        /// Initial text
        text: String,
    },
    /// `update(id, text)`
    Update {
        /// Message id
        id: MessageId,
        /// Full replacement text
        text: String,
    },
    /// `rekey(old, new)`
    Rekey {
        /// Previous id
        old: MessageId,
        /// New id
        new: MessageId,
    },
}

#[derive(Default)]
struct RenderState {
    calls: Vec<RenderCall>,
    texts: HashMap<MessageId, String>,
}

/// Render sink that keeps the current text of every message
#[derive(Default)]
pub struct MemoryRenderSink {
    state: Mutex<RenderState>,
}

impl MemoryRenderSink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call received, in order
    #[must_use]
    pub fn calls(&self) -> Vec<RenderCall> {
        self.state.lock().calls.clone()
    }

    /// Texts passed to `update` for `id`, in order
    #[must_use]
    pub fn updates_for(&self, id: &MessageId) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                RenderCall::Update { id: target, text } if target == id => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// Current text of a message
    #[must_use]
    pub fn text(&self, id: &MessageId) -> Option<String> {
        self.state.lock().texts.get(id).cloned()
    }

    /// Number of messages currently rendered
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.state.lock().texts.len()
    }
}

impl RenderSink for MemoryRenderSink {
    fn create(&self, id: &MessageId, role: MessageRole, initial_text: &str) {
        let mut state = self.state.lock();
        state.texts.insert(id.clone(), initial_text.to_string());
        state.calls.push(RenderCall::Create {
            id: id.clone(),
            role,
            text: initial_text.to_string(),
        });
    }

    fn update(&self, id: &MessageId, full_text: &str) {
        let mut state = self.state.lock();
        state.texts.insert(id.clone(), full_text.to_string());
        state.calls.push(RenderCall::Update {
            id: id.clone(),
            text: full_text.to_string(),
        });
    }

    fn rekey(&self, old_id: &MessageId, new_id: &MessageId) {
        let mut state = self.state.lock();
        if let Some(text) = state.texts.remove(old_id) {
            state.texts.insert(new_id.clone(), text);
        }
        state.calls.push(RenderCall::Rekey {
            old: old_id.clone(),
            new: new_id.clone(),
        });
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// A recorded `link_artifacts` call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactLink {
    /// Request the artifacts were produced for
    pub request_id: RequestId,
    /// Stored message they now belong to
    pub canonical_id: MessageId,
    /// Conversation, if known
    pub chat_id: Option<String>,
}

#[derive(Default)]
struct StoreState {
    saved: Vec<DraftMessage>,
    links: Vec<ArtifactLink>,
    failures: VecDeque<String>,
    artifacts: HashMap<RequestId, usize>,
}

/// Persistence store held in memory
///
/// By default the local id is kept as the canonical id. With
/// [`with_canonical_ids`](Self::with_canonical_ids) every save is assigned a
/// fresh id, exercising the reconciliation path.
pub struct MemoryPersistence {
    state: Mutex<StoreState>,
    canonical_prefix: Option<String>,
    next_id: AtomicU64,
    started: AtomicU64,
    /// `true` lets saves complete, `false` holds them
    gate: watch::Sender<bool>,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistence {
    /// Create a store that keeps local ids
    #[must_use]
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(StoreState::default()),
            canonical_prefix: None,
            next_id: AtomicU64::new(1),
            started: AtomicU64::new(0),
            gate,
        }
    }

    /// Create a store that assigns `{prefix}{n}` ids
    #[must_use]
    pub fn with_canonical_ids(prefix: impl Into<String>) -> Self {
        Self {
            canonical_prefix: Some(prefix.into()),
            ..Self::new()
        }
    }

    /// Make the next save fail
    pub fn fail_next_save(&self, reason: impl Into<String>) {
        self.state.lock().failures.push_back(reason.into());
    }

    /// Report `count` artifacts when `request_id` is linked
    pub fn set_artifact_count(&self, request_id: impl Into<RequestId>, count: usize) {
        self.state.lock().artifacts.insert(request_id.into(), count);
    }

    /// Hold saves until [`release_saves`](Self::release_saves)
    pub fn hold_saves(&self) {
        self.gate.send_replace(false);
    }

    /// Let held and future saves complete
    pub fn release_saves(&self) {
        self.gate.send_replace(true);
    }

    /// Drafts stored so far
    #[must_use]
    pub fn saved(&self) -> Vec<DraftMessage> {
        self.state.lock().saved.clone()
    }

    /// Number of successful saves
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.state.lock().saved.len()
    }

    /// Number of save calls made, including held and failed ones
    #[must_use]
    pub fn save_attempts(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    /// Recorded `link_artifacts` calls
    #[must_use]
    pub fn links(&self) -> Vec<ArtifactLink> {
        self.state.lock().links.clone()
    }
}

#[async_trait]
impl PersistenceSink for MemoryPersistence {
    async fn save(&self, draft: DraftMessage) -> Result<SavedMessage, PersistenceError> {
        self.started.fetch_add(1, Ordering::SeqCst);

        let mut gate = self.gate.subscribe();
        let released = gate.wait_for(|open| *open).await.is_ok();
        if !released {
            return Err(PersistenceError::Unavailable("store shut down".to_string()));
        }

        let mut state = self.state.lock();
        if let Some(reason) = state.failures.pop_front() {
            return Err(PersistenceError::Unavailable(reason));
        }

        let id = match &self.canonical_prefix {
            Some(prefix) => MessageId(format!(
                "{prefix}{}",
                self.next_id.fetch_add(1, Ordering::SeqCst)
            )),
            None => draft.local_id.clone(),
        };
        state.saved.push(draft);

        Ok(SavedMessage { id })
    }

    async fn link_artifacts(
        &self,
        request_id: &RequestId,
        canonical_id: &MessageId,
        chat_id: Option<&str>,
    ) -> Result<usize, PersistenceError> {
        let mut state = self.state.lock();
        state.links.push(ArtifactLink {
            request_id: request_id.clone(),
            canonical_id: canonical_id.clone(),
            chat_id: chat_id.map(String::from),
        });
        Ok(state.artifacts.get(request_id).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn draft(local: &str) -> DraftMessage {
        DraftMessage {
            local_id: MessageId::from(local),
            role: MessageRole::Assistant,
            text: "text".into(),
            reasoning: String::new(),
            correlation_id: RequestId::new("r1"),
            chat_id: None,
            cancelled: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_render_sink_tracks_text_and_rekey() {
        let sink = MemoryRenderSink::new();
        let local = MessageId::from("local_1");
        let canonical = MessageId::from("msg_1");

        sink.create(&local, MessageRole::Assistant, "");
        sink.update(&local, "He");
        sink.update(&local, "Hello");
        sink.rekey(&local, &canonical);

        assert_eq!(sink.updates_for(&local), vec!["He", "Hello"]);
        assert_eq!(sink.text(&canonical).as_deref(), Some("Hello"));
        assert!(sink.text(&local).is_none());
        assert_eq!(sink.message_count(), 1);
    }

    #[tokio::test]
    async fn test_keeps_local_id_by_default() {
        let store = MemoryPersistence::new();
        let saved = store.save(draft("local_a")).await.unwrap();
        assert_eq!(saved.id, MessageId::from("local_a"));
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_assigns_canonical_ids() {
        let store = MemoryPersistence::with_canonical_ids("msg_");
        assert_eq!(store.save(draft("local_a")).await.unwrap().id.as_str(), "msg_1");
        assert_eq!(store.save(draft("local_b")).await.unwrap().id.as_str(), "msg_2");
    }

    #[tokio::test]
    async fn test_scripted_failure_is_consumed() {
        let store = MemoryPersistence::new();
        store.fail_next_save("disk full");

        assert!(matches!(
            store.save(draft("local_a")).await,
            Err(PersistenceError::Unavailable(ref r)) if r == "disk full"
        ));
        assert!(store.save(draft("local_a")).await.is_ok());
        assert_eq!(store.save_attempts(), 2);
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_link_artifacts_reports_count() {
        let store = MemoryPersistence::new();
        store.set_artifact_count("r1", 3);

        let updated = store
            .link_artifacts(&RequestId::new("r1"), &MessageId::from("msg_1"), Some("chat"))
            .await
            .unwrap();

        assert_eq!(updated, 3);
        assert_eq!(store.links()[0].chat_id.as_deref(), Some("chat"));
    }
}
