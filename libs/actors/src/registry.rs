//! Mailbox Registry
//!
//! Maps entity addresses to the mailboxes hosted on this fiber.

use crate::mailbox::Mailbox;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use strand_types::{ActorId, CoreError, Result};

#[derive(Debug, Default)]
pub struct MailboxRegistry {
    mailboxes: RwLock<HashMap<ActorId, Arc<Mailbox>>>,
}

impl MailboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mailbox; an entity can have only one
    pub fn register(&self, mailbox: Mailbox) -> Result<()> {
        let entity = mailbox.entity();
        let mut mailboxes = self.mailboxes.write();
        if mailboxes.contains_key(&entity) {
            return Err(CoreError::configuration(
                format!("entity {} already has a mailbox", entity),
                None,
            ));
        }
        tracing::debug!(%entity, mode = ?mailbox.mode(), "Registering mailbox");
        mailboxes.insert(entity, Arc::new(mailbox));
        Ok(())
    }

    pub fn unregister(&self, entity: ActorId) -> Option<Arc<Mailbox>> {
        self.mailboxes.write().remove(&entity)
    }

    pub fn get(&self, entity: ActorId) -> Option<Arc<Mailbox>> {
        self.mailboxes.read().get(&entity).cloned()
    }

    pub fn contains(&self, entity: ActorId) -> bool {
        self.mailboxes.read().contains_key(&entity)
    }

    pub fn len(&self) -> usize {
        self.mailboxes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mailboxes.read().is_empty()
    }

    pub fn entities(&self) -> Vec<ActorId> {
        self.mailboxes.read().keys().copied().collect()
    }

    /// Drop every mailbox, aborting ordered workers
    pub fn clear(&self) {
        let drained: Vec<Arc<Mailbox>> = self.mailboxes.write().drain().map(|(_, m)| m).collect();
        drop(drained);
    }
}
