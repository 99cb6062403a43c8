//! Per-request assembly state

use std::collections::{HashSet, VecDeque};

use tokio::time::Instant;

use crate::config::AssemblerConfig;
use crate::messages::{MessageId, RequestId};

use super::dedup::FingerprintSet;
use super::scanner::{ReasoningScanner, ScanOutput};

/// Lifecycle of a stream context
///
/// `Accepting -> Finalizing -> Done`, with no way out of `Done`. A failed
/// save moves back to `Accepting`, or to `Failed` once a newer request has
/// taken over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    /// Taking new chunks
    Accepting,
    /// Being persisted; further chunks wait for the outcome
    Finalizing,
    /// Save failed after a newer request became current; only an explicit
    /// finalize or abort persists it
    Failed,
    /// Persisted and removed from the table
    Done,
}

/// Accumulated state of one in-flight request
#[derive(Debug)]
pub struct StreamContext {
    /// Correlation key supplied by the sender
    pub request_id: RequestId,
    /// Id used for rendering before persistence
    pub local_id: MessageId,
    /// Id assigned by persistence, once known
    pub canonical_id: Option<MessageId>,
    /// Text outside reasoning delimiters
    pub visible: String,
    /// Text inside reasoning delimiters
    pub reasoning: String,
    /// Lifecycle phase
    pub phase: StreamPhase,
    /// Finalized through `abort`
    pub cancelled: bool,
    /// Chunks applied so far
    pub chunks_applied: u32,
    /// When the first chunk arrived
    pub started_at: Instant,
    pub(crate) scanner: ReasoningScanner,
    pub(crate) fingerprints: FingerprintSet,
}

impl StreamContext {
    /// Create an empty context for a request
    #[must_use]
    pub fn new(request_id: RequestId, config: &AssemblerConfig) -> Self {
        Self {
            request_id,
            local_id: MessageId::new(),
            canonical_id: None,
            visible: String::new(),
            reasoning: String::new(),
            phase: StreamPhase::Accepting,
            cancelled: false,
            chunks_applied: 0,
            started_at: Instant::now(),
            scanner: ReasoningScanner::new(
                config.reasoning_open_tag.clone(),
                config.reasoning_close_tag.clone(),
            ),
            fingerprints: FingerprintSet::new(config.max_fingerprints, config.dedup_window),
        }
    }

    /// Whether the scanner is inside a reasoning block
    #[must_use]
    pub fn inside_reasoning(&self) -> bool {
        self.scanner.is_inside()
    }

    /// Append scanner output; returns `true` if visible text grew
    pub(crate) fn absorb(&mut self, output: ScanOutput) -> bool {
        self.reasoning.push_str(&output.reasoning);
        if output.visible.is_empty() {
            return false;
        }
        self.visible.push_str(&output.visible);
        true
    }

    /// Point-in-time copy for inspection
    #[must_use]
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            request_id: self.request_id.clone(),
            local_id: self.local_id.clone(),
            canonical_id: self.canonical_id.clone(),
            visible: self.visible.clone(),
            reasoning: self.reasoning.clone(),
            phase: self.phase,
            inside_reasoning: self.inside_reasoning(),
            cancelled: self.cancelled,
            chunks_applied: self.chunks_applied,
        }
    }
}

/// Read-only view of a [`StreamContext`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextSnapshot {
    /// Correlation key
    pub request_id: RequestId,
    /// Render id
    pub local_id: MessageId,
    /// Persisted id, once known
    pub canonical_id: Option<MessageId>,
    /// Visible text so far
    pub visible: String,
    /// Reasoning text so far
    pub reasoning: String,
    /// Lifecycle phase
    pub phase: StreamPhase,
    /// Scanner is inside a reasoning block
    pub inside_reasoning: bool,
    /// Finalized through `abort`
    pub cancelled: bool,
    /// Chunks applied so far
    pub chunks_applied: u32,
}

/// Bounded memory of finalized request ids
#[derive(Debug)]
pub struct RetiredRequests {
    order: VecDeque<RequestId>,
    known: HashSet<RequestId>,
    capacity: usize,
}

impl RetiredRequests {
    /// Remember up to `capacity` ids
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            known: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Mark a request as finished
    pub fn retire(&mut self, request_id: RequestId) {
        if !self.known.insert(request_id.clone()) {
            return;
        }
        self.order.push_back(request_id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.known.remove(&evicted);
            }
        }
    }

    /// Whether the request finished recently
    #[must_use]
    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.known.contains(request_id)
    }
}
