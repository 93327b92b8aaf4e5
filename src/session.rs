use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::events::ConversationId;
use crate::storage::ConversationStore;

/// Owner of the durable conversation id.
///
/// Pure state plus a storage adapter: no network or UI side effects. Storage
/// failures are logged and the in-memory value stays authoritative.
pub struct ConversationSession {
    store: Arc<dyn ConversationStore>,
    current: Option<ConversationId>,
}

impl ConversationSession {
    /// Read the persisted id, if any.
    pub fn open(store: Arc<dyn ConversationStore>) -> Self {
        let current = match store.load() {
            Ok(Some(id)) if !id.trim().is_empty() => Some(ConversationId::from(id)),
            Ok(_) => None,
            Err(e) => {
                warn!("Could not read stored conversation id: {e:#}");
                None
            }
        };
        Self { store, current }
    }

    /// Current id, created and persisted on first use.
    pub fn get(&mut self) -> ConversationId {
        if let Some(id) = &self.current {
            return id.clone();
        }
        let id = ConversationId::generate();
        debug!(conversation_id = %id, "created conversation id");
        self.persist(&id);
        self.current = Some(id.clone());
        id
    }

    /// Current id without creating one.
    pub fn peek(&self) -> Option<&ConversationId> {
        self.current.as_ref()
    }

    /// Replace the current id with a server-assigned one.
    ///
    /// Returns `true` when the id changed. Empty ids are ignored.
    pub fn adopt(&mut self, id: ConversationId) -> bool {
        if id.is_empty() || self.current.as_ref() == Some(&id) {
            return false;
        }
        info!(conversation_id = %id, "adopting server conversation id");
        self.persist(&id);
        self.current = Some(id);
        true
    }

    /// Discard the current id and start a new conversation.
    pub fn rotate(&mut self) -> ConversationId {
        let id = ConversationId::generate();
        debug!(conversation_id = %id, "rotated conversation id");
        self.persist(&id);
        self.current = Some(id.clone());
        id
    }

    fn persist(&self, id: &ConversationId) {
        if let Err(e) = self.store.save(id.as_str()) {
            warn!("Could not persist conversation id: {e:#}");
        }
    }
}
