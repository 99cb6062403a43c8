//! Stream Assembler
//!
//! Turns chunk events into rendered, persisted assistant messages.
//!
//! # Architecture
//!
//! ```text
//!   Chunk ──▶ retired? ──▶ resolve context ──▶ dedup ──▶ scan ──▶ render.update
//!                             │                                      │
//!                   new request id:                              done? │
//!                   finalize current first                            ▼
//!                                                     finalize (shared, exactly once)
//!                                                       save ─▶ rekey ─▶ link artifacts
//! ```
//!
//! # Guarantees
//!
//! - At most one context accepts chunks at a time. A chunk for a new request
//!   waits until the current context is fully finalized.
//! - A context is persisted at most once. Every caller that asks for its
//!   finalization (a `done` chunk, a context switch, `finalize`, `abort`)
//!   awaits the same shared future.
//! - Chunks for one request are applied in the order they are processed.
//! - A persistence failure is reported, not retried automatically. The rendered
//!   text stays and the context waits for another finalize, abort or `done`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::AssemblerConfig;
use crate::events::{EventBus, FinalizedStream, LinkEvent, Subscription};
use crate::messages::{control, Inbound, InboundMessage, MessageRole, RequestId};
use crate::sinks::{DraftMessage, PersistenceSink, RenderSink};

use super::context::{ContextSnapshot, RetiredRequests, StreamContext, StreamPhase};
use super::dedup::{DedupVerdict, Fingerprint};

// ============================================================================
// Public types
// ============================================================================

/// One incremental delivery of response text
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Request the text belongs to
    pub request_id: RequestId,
    /// Text fragment (may be empty)
    pub text: String,
    /// Last chunk of the response
    pub done: bool,
    /// Sender-supplied ordering hint
    pub sequence: Option<u64>,
}

impl Chunk {
    /// An intermediate chunk
    pub fn new(request_id: impl Into<RequestId>, text: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            text: text.into(),
            done: false,
            sequence: None,
        }
    }

    /// The final chunk of a response
    pub fn last(request_id: impl Into<RequestId>, text: impl Into<String>) -> Self {
        Self {
            done: true,
            ..Self::new(request_id, text)
        }
    }

    /// Attach a sequence hint
    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Extract a chunk from an inbound message
    ///
    /// Only messages of type `chunk` that carry an `id` qualify. A message
    /// whose id was promoted from a client-issued id is an echo of something
    /// this client sent, never part of an assistant stream.
    #[must_use]
    pub fn from_message(message: &InboundMessage) -> Option<Self> {
        if message.kind() != Some(control::CHUNK) || message.backend_id.is_some() {
            return None;
        }

        let request_id = message.id.as_deref()?;
        Some(Self {
            request_id: RequestId::new(request_id),
            text: message.text.clone().unwrap_or_default(),
            done: message.is_done(),
            sequence: message.sequence(),
        })
    }

    /// Extract a chunk from a decoded payload
    #[must_use]
    pub fn from_inbound(inbound: &Inbound) -> Option<Self> {
        inbound.as_parsed().and_then(Self::from_message)
    }
}

/// Why a chunk was not applied
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The request was already finalized
    Retired,
    /// The request was being finalized when the chunk arrived
    Finalizing,
    /// The request's save failed and a newer request is current
    Superseded,
}

/// What happened to a processed chunk
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Text was accumulated
    Applied,
    /// Text was accumulated and the stream was finalized
    Finalized(FinalizedStream),
    /// Same chunk seen before; nothing changed
    Duplicate,
    /// Chunk was ignored
    Dropped(DropReason),
}

/// Errors surfaced by the assembler
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssemblerError {
    /// No context exists for the request
    #[error("No active stream for request {0}")]
    UnknownRequest(RequestId),

    /// The persistence store failed; the stream stays open until finalized again
    #[error("Persisting stream {request_id} failed: {message}")]
    Persistence {
        /// Request whose stream failed
        request_id: RequestId,
        /// Store error
        message: String,
    },
}

// ============================================================================
// Internal state
// ============================================================================

type Finalization = Shared<BoxFuture<'static, Result<FinalizedStream, AssemblerError>>>;

struct ContextSlot {
    context: Mutex<StreamContext>,
    finalization: Mutex<Option<Finalization>>,
}

struct Table {
    contexts: HashMap<RequestId, Arc<ContextSlot>>,
    current: Option<RequestId>,
    retired: RetiredRequests,
}

enum Lookup {
    Found(Arc<ContextSlot>),
    Retired,
    Missing,
}

enum Applied {
    Yes,
    Duplicate,
    Finalizing,
    Superseded,
}

struct Inner {
    config: AssemblerConfig,
    render: Arc<dyn RenderSink>,
    persistence: Arc<dyn PersistenceSink>,
    bus: EventBus,
    table: Mutex<Table>,
    /// Serializes context switches
    switching: tokio::sync::Mutex<()>,
    chat_id: RwLock<Option<String>>,
}

// ============================================================================
// Assembler
// ============================================================================

/// Per-request chunk assembly with exactly-once finalization
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct StreamAssembler {
    inner: Arc<Inner>,
}

impl StreamAssembler {
    /// Create an assembler
    ///
    /// Finalization outcomes are published on `bus`.
    pub fn new(
        config: AssemblerConfig,
        render: Arc<dyn RenderSink>,
        persistence: Arc<dyn PersistenceSink>,
        bus: EventBus,
    ) -> Self {
        let table = Table {
            contexts: HashMap::new(),
            current: None,
            retired: RetiredRequests::new(config.retired_capacity),
        };

        Self {
            inner: Arc::new(Inner {
                config,
                render,
                persistence,
                bus,
                table: Mutex::new(table),
                switching: tokio::sync::Mutex::new(()),
                chat_id: RwLock::new(None),
            }),
        }
    }

    /// Conversation id attached to drafts and artifact links
    pub fn set_chat_id(&self, chat_id: Option<String>) {
        *self.inner.chat_id.write() = chat_id;
    }

    /// Current conversation id
    #[must_use]
    pub fn chat_id(&self) -> Option<String> {
        self.inner.chat_id.read().clone()
    }

    /// Apply one chunk
    ///
    /// Returns once the chunk's effects are visible: for a `done` chunk that
    /// includes persistence and id reconciliation.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblerError::Persistence`] if this chunk finished the
    /// stream and saving it failed.
    pub async fn process_chunk(&self, chunk: Chunk) -> Result<ChunkOutcome, AssemblerError> {
        let Some(slot) = self.resolve(&chunk.request_id).await else {
            tracing::debug!(request_id = %chunk.request_id, "Dropping chunk for finished request");
            return Ok(ChunkOutcome::Dropped(DropReason::Retired));
        };

        match self.apply(&slot, &chunk) {
            Applied::Yes => {}
            Applied::Duplicate => return Ok(ChunkOutcome::Duplicate),
            Applied::Superseded => {
                tracing::debug!(
                    request_id = %chunk.request_id,
                    "Dropping chunk for unsaved superseded request"
                );
                return Ok(ChunkOutcome::Dropped(DropReason::Superseded));
            }
            Applied::Finalizing => {
                tracing::debug!(
                    request_id = %chunk.request_id,
                    "Chunk arrived during finalization, waiting"
                );
                let pending = slot.finalization.lock().clone();
                if let Some(finalization) = pending {
                    let _ = finalization.await;
                }
                return Ok(ChunkOutcome::Dropped(DropReason::Finalizing));
            }
        }

        if chunk.done {
            let stream = self.finalization_for(&slot, false).await?;
            return Ok(ChunkOutcome::Finalized(stream));
        }

        Ok(ChunkOutcome::Applied)
    }

    /// Finalize a stream now, without waiting for its `done` chunk
    ///
    /// Joins the in-flight finalization if one is running.
    ///
    /// # Errors
    ///
    /// [`AssemblerError::UnknownRequest`] if no context exists,
    /// [`AssemblerError::Persistence`] if saving failed.
    pub async fn finalize(&self, request_id: &RequestId) -> Result<FinalizedStream, AssemblerError> {
        self.finish(request_id, false).await
    }

    /// Finalize a stream marked as cancelled
    ///
    /// The partial text is persisted with `cancelled = true` instead of the
    /// context being left to leak.
    ///
    /// # Errors
    ///
    /// Same as [`finalize`](Self::finalize).
    pub async fn abort(&self, request_id: &RequestId) -> Result<FinalizedStream, AssemblerError> {
        tracing::info!(request_id = %request_id, "Aborting stream");
        self.finish(request_id, true).await
    }

    /// Consume chunk messages from a subscription on a spawned task
    ///
    /// This is the single consumer of inbound chunks: each one is fully
    /// processed before the next is read. The task ends when the bus closes.
    pub fn attach(&self, mut subscription: Subscription) -> JoinHandle<()> {
        let assembler = self.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let LinkEvent::Message(inbound) = event else {
                    continue;
                };
                let Some(chunk) = Chunk::from_inbound(&inbound) else {
                    continue;
                };
                if let Err(e) = assembler.process_chunk(chunk).await {
                    tracing::debug!(error = %e, "Chunk processing ended in error");
                }
            }
            tracing::debug!("Chunk consumer stopped");
        })
    }

    /// Request currently accepting chunks
    #[must_use]
    pub fn current_request(&self) -> Option<RequestId> {
        self.inner.table.lock().current.clone()
    }

    /// Inspect a live context
    #[must_use]
    pub fn context(&self, request_id: &RequestId) -> Option<ContextSnapshot> {
        let slot = self.inner.table.lock().contexts.get(request_id).cloned()?;
        let snapshot = slot.context.lock().snapshot();
        Some(snapshot)
    }

    /// Number of live contexts (accepting, finalizing or awaiting a retried save)
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.inner.table.lock().contexts.len()
    }

    /// Whether a request was finalized recently
    #[must_use]
    pub fn is_retired(&self, request_id: &RequestId) -> bool {
        self.inner.table.lock().retired.contains(request_id)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn lookup(&self, request_id: &RequestId) -> Lookup {
        let table = self.inner.table.lock();
        if let Some(slot) = table.contexts.get(request_id) {
            Lookup::Found(Arc::clone(slot))
        } else if table.retired.contains(request_id) {
            Lookup::Retired
        } else {
            Lookup::Missing
        }
    }

    /// Find the context for a request, switching to a new one if needed
    async fn resolve(&self, request_id: &RequestId) -> Option<Arc<ContextSlot>> {
        match self.lookup(request_id) {
            Lookup::Found(slot) => return Some(slot),
            Lookup::Retired => return None,
            Lookup::Missing => {}
        }

        let _switch = self.inner.switching.lock().await;

        // Another caller may have switched while we waited
        match self.lookup(request_id) {
            Lookup::Found(slot) => return Some(slot),
            Lookup::Retired => return None,
            Lookup::Missing => {}
        }

        let previous = self.inner.table.lock().current.clone();
        if let Some(previous) = previous {
            let slot = self.inner.table.lock().contexts.get(&previous).cloned();
            if let Some(slot) = slot {
                tracing::debug!(
                    previous = %previous,
                    next = %request_id,
                    "New request, finalizing current stream first"
                );
                // Failures are reported by the finalization itself. The
                // unsaved context stays for an explicit retry but stops
                // taking chunks.
                if self.finalization_for(&slot, false).await.is_err() {
                    let mut ctx = slot.context.lock();
                    if ctx.phase == StreamPhase::Accepting {
                        ctx.phase = StreamPhase::Failed;
                    }
                }
            }
        }

        let context = StreamContext::new(request_id.clone(), &self.inner.config);
        let local_id = context.local_id.clone();
        let slot = Arc::new(ContextSlot {
            context: Mutex::new(context),
            finalization: Mutex::new(None),
        });

        {
            let mut table = self.inner.table.lock();
            table.contexts.insert(request_id.clone(), Arc::clone(&slot));
            table.current = Some(request_id.clone());
        }

        self.inner
            .render
            .create(&local_id, MessageRole::Assistant, "");
        tracing::debug!(request_id = %request_id, local_id = %local_id, "Stream started");

        Some(slot)
    }

    /// Dedup, scan and render one chunk under the context lock
    fn apply(&self, slot: &ContextSlot, chunk: &Chunk) -> Applied {
        let mut ctx = slot.context.lock();
        match ctx.phase {
            StreamPhase::Accepting => {}
            StreamPhase::Failed => return Applied::Superseded,
            StreamPhase::Finalizing | StreamPhase::Done => return Applied::Finalizing,
        }

        let fingerprint = Fingerprint::new(&chunk.request_id, chunk.sequence, &chunk.text, chunk.done);
        match ctx.fingerprints.check(fingerprint, Instant::now()) {
            DedupVerdict::Fresh => {}
            DedupVerdict::Duplicate { age } => {
                tracing::trace!(
                    request_id = %chunk.request_id,
                    age_ms = age.as_millis() as u64,
                    "Duplicate chunk discarded"
                );
                return Applied::Duplicate;
            }
            DedupVerdict::LateDuplicate { age } => {
                tracing::warn!(
                    request_id = %chunk.request_id,
                    age_ms = age.as_millis() as u64,
                    len = chunk.text.len(),
                    "Chunk repeated long after first delivery, discarding"
                );
                return Applied::Duplicate;
            }
        }

        let output = ctx.scanner.feed(&chunk.text);
        ctx.chunks_applied += 1;
        if ctx.absorb(output) {
            self.inner.render.update(&ctx.local_id, &ctx.visible);
        }

        tracing::trace!(
            request_id = %chunk.request_id,
            len = chunk.text.len(),
            done = chunk.done,
            inside_reasoning = ctx.inside_reasoning(),
            "Chunk applied"
        );
        Applied::Yes
    }

    async fn finish(&self, request_id: &RequestId, cancel: bool) -> Result<FinalizedStream, AssemblerError> {
        let slot = self.inner.table.lock().contexts.get(request_id).cloned();
        match slot {
            Some(slot) => self.finalization_for(&slot, cancel).await,
            None => Err(AssemblerError::UnknownRequest(request_id.clone())),
        }
    }

    /// The context's finalization, started on first request
    fn finalization_for(&self, slot: &Arc<ContextSlot>, cancel: bool) -> Finalization {
        let mut pending = slot.finalization.lock();
        if let Some(existing) = pending.as_ref() {
            return existing.clone();
        }

        let draft = {
            let mut ctx = slot.context.lock();
            ctx.phase = StreamPhase::Finalizing;
            ctx.cancelled |= cancel;

            let tail = ctx.scanner.flush();
            if ctx.absorb(tail) {
                self.inner.render.update(&ctx.local_id, &ctx.visible);
            }

            DraftMessage {
                local_id: ctx.local_id.clone(),
                role: MessageRole::Assistant,
                text: ctx.visible.clone(),
                reasoning: ctx.reasoning.clone(),
                correlation_id: ctx.request_id.clone(),
                chat_id: self.inner.chat_id.read().clone(),
                cancelled: ctx.cancelled,
                created_at: Utc::now(),
            }
        };

        tracing::debug!(request_id = %draft.correlation_id, "Finalizing stream");

        let inner = Arc::clone(&self.inner);
        let owned_slot = Arc::clone(slot);
        let finalization = async move { inner.persist(owned_slot, draft).await }
            .boxed()
            .shared();
        *pending = Some(finalization.clone());
        drop(pending);

        // Runs to completion even if every waiter goes away
        tokio::spawn(finalization.clone());
        finalization
    }
}

impl Inner {
    async fn persist(
        self: Arc<Self>,
        slot: Arc<ContextSlot>,
        draft: DraftMessage,
    ) -> Result<FinalizedStream, AssemblerError> {
        let request_id = draft.correlation_id.clone();
        let local_id = draft.local_id.clone();
        let chat_id = draft.chat_id.clone();
        let content_len = draft.text.len();
        let reasoning_len = draft.reasoning.len();
        let cancelled = draft.cancelled;

        let saved = match self.persistence.save(draft).await {
            Ok(saved) => saved,
            Err(e) => {
                tracing::error!(
                    request_id = %request_id,
                    local_id = %local_id,
                    error = %e,
                    "Persisting stream failed, not retrying"
                );
                Self::reopen(&slot);
                self.bus.publish(LinkEvent::FinalizeFailed {
                    request_id: request_id.clone(),
                    error: e.to_string(),
                });
                return Err(AssemblerError::Persistence {
                    request_id,
                    message: e.to_string(),
                });
            }
        };

        let message_id = saved.id;
        if message_id != local_id {
            self.render.rekey(&local_id, &message_id);
            match self
                .persistence
                .link_artifacts(&request_id, &message_id, chat_id.as_deref())
                .await
            {
                Ok(updated) => tracing::debug!(
                    request_id = %request_id,
                    message_id = %message_id,
                    updated,
                    "Artifacts linked"
                ),
                Err(e) => tracing::warn!(
                    request_id = %request_id,
                    message_id = %message_id,
                    error = %e,
                    "Linking artifacts failed"
                ),
            }
        }

        slot.context.lock().canonical_id = Some(message_id.clone());
        self.retire(&request_id, &slot);

        let stream = FinalizedStream {
            request_id,
            local_id,
            message_id,
            content_len,
            reasoning_len,
            cancelled,
        };

        tracing::info!(
            request_id = %stream.request_id,
            message_id = %stream.message_id,
            content_len,
            reasoning_len,
            cancelled,
            "Stream finalized"
        );
        self.bus.publish(LinkEvent::Finalized(stream.clone()));

        Ok(stream)
    }

    /// Release the finalization guard after a failed save
    ///
    /// The context stays in the table so a later `finalize`, `abort` or
    /// `done` chunk can persist it again.
    fn reopen(slot: &ContextSlot) {
        slot.context.lock().phase = StreamPhase::Accepting;
        *slot.finalization.lock() = None;
    }

    /// Remove a finished context and remember its request id
    fn retire(&self, request_id: &RequestId, slot: &ContextSlot) {
        slot.context.lock().phase = StreamPhase::Done;

        let mut table = self.table.lock();
        table.contexts.remove(request_id);
        if table.current.as_ref() == Some(request_id) {
            table.current = None;
        }
        table.retired.retire(request_id.clone());
    }
}

impl std::fmt::Debug for StreamAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.inner.table.lock();
        f.debug_struct("StreamAssembler")
            .field("current", &table.current)
            .field("active", &table.contexts.len())
            .finish()
    }
}
