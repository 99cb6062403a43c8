//! Client-issued id tracking and inbound id normalization
//!
//! User messages leave this client tagged with a locally generated id. The
//! backend echoes it back as `frontendGeneratedId` next to its own `id`.
//! [`normalize`] promotes the echoed local id to the primary id so optimistic
//! UI records keep their key, and keeps the backend id in `backendId`.

use std::collections::{HashSet, VecDeque};

use crate::messages::{InboundMessage, MessageId};

/// Default number of issued ids remembered
pub const DEFAULT_REGISTRY_CAPACITY: usize = 1024;

/// Bounded memory of ids this client issued (oldest forgotten first)
#[derive(Debug)]
pub struct LocalIdRegistry {
    order: VecDeque<String>,
    known: HashSet<String>,
    capacity: usize,
}

impl Default for LocalIdRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_REGISTRY_CAPACITY)
    }
}

impl LocalIdRegistry {
    /// Create a registry remembering at most `capacity` ids
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            known: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Remember an id handed to the backend
    pub fn register(&mut self, id: &MessageId) {
        if !self.known.insert(id.as_str().to_string()) {
            return;
        }
        self.order.push_back(id.as_str().to_string());

        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.known.remove(&evicted);
            }
        }
    }

    /// Whether `id` was issued by this client and is still remembered
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.known.contains(id)
    }

    /// Number of remembered ids
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no ids are remembered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Promote a recognized `frontendGeneratedId` to the primary id
///
/// Returns `true` if the message was rewritten. Unrecognized echoes are left
/// untouched.
pub fn normalize(message: &mut InboundMessage, registry: &LocalIdRegistry) -> bool {
    let recognized = message
        .frontend_generated_id
        .as_deref()
        .is_some_and(|id| registry.contains(id));
    if !recognized {
        return false;
    }

    let Some(local_id) = message.frontend_generated_id.take() else {
        return false;
    };
    let backend_id = message.id.replace(local_id);
    if backend_id.is_some() {
        message.backend_id = backend_id;
    }

    tracing::trace!(
        id = message.id.as_deref().unwrap_or_default(),
        backend_id = message.backend_id.as_deref().unwrap_or_default(),
        "Promoted frontend id"
    );
    true
}
