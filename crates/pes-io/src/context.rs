use std::sync::{Mutex, MutexGuard};

use pes_chain::{Fields, MaterializedObject, RightsSet};
use pes_crypto::Keychain;
use pes_types::{EntityId, PartitionKey};

/// The desired next state of one entity, before it is signed.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityDraft {
    pub partition: PartitionKey,
    pub id: EntityId,
    pub entity_type: String,
    pub parent_id: Option<EntityId>,
    pub fields: Fields,
    pub rights: RightsSet,
}

impl EntityDraft {
    /// A draft for a brand new entity.
    pub fn new(partition: PartitionKey, entity_type: impl Into<String>) -> Self {
        Self {
            partition,
            id: EntityId::new(),
            entity_type: entity_type.into(),
            parent_id: None,
            fields: Fields::new(),
            rights: RightsSet::new(),
        }
    }

    /// A draft that edits the current state of `object`.
    pub fn from_object(partition: PartitionKey, object: &MaterializedObject) -> Self {
        Self {
            partition,
            id: object.id,
            entity_type: object.entity_type.clone(),
            parent_id: object.parent_id,
            fields: object.fields.clone(),
            rights: object.rights.clone(),
        }
    }

    pub fn with_id(mut self, id: EntityId) -> Self {
        self.id = id;
        self
    }

    pub fn parent(mut self, parent: EntityId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn rights(mut self, rights: RightsSet) -> Self {
        self.rights = rights;
        self
    }
}

/// A write queued on a [`RequestContext`] until the next flush.
#[derive(Clone, Debug, PartialEq)]
pub enum DeferredWrite {
    Merge(EntityDraft),
    Remove { partition: PartitionKey, id: EntityId },
}

impl DeferredWrite {
    pub fn partition(&self) -> &PartitionKey {
        match self {
            Self::Merge(draft) => &draft.partition,
            Self::Remove { partition, .. } => partition,
        }
    }

    pub fn entity(&self) -> EntityId {
        match self {
            Self::Merge(draft) => draft.id,
            Self::Remove { id, .. } => *id,
        }
    }
}

/// Who is calling, what keys they hold, and the writes they have deferred.
///
/// One context per request; the deferred queue never leaks between callers.
pub struct RequestContext {
    caller: String,
    keychain: Keychain,
    deferred: Mutex<Vec<DeferredWrite>>,
}

impl RequestContext {
    pub fn new(caller: impl Into<String>, keychain: Keychain) -> Self {
        Self {
            caller: caller.into(),
            keychain,
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// A caller holding no keys; it can read public entities only.
    pub fn anonymous() -> Self {
        Self::new("anonymous", Keychain::new())
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn keychain(&self) -> &Keychain {
        &self.keychain
    }

    pub fn defer(&self, write: DeferredWrite) {
        self.queue().push(write);
    }

    /// Empty the queue, returning its writes in submission order.
    pub fn take_deferred(&self) -> Vec<DeferredWrite> {
        std::mem::take(&mut *self.queue())
    }

    pub fn clear_deferred(&self) -> usize {
        self.take_deferred().len()
    }

    pub fn deferred_len(&self) -> usize {
        self.queue().len()
    }

    /// `(partition, entity)` pairs touched by queued writes.
    pub fn deferred_entities(&self) -> Vec<(PartitionKey, EntityId)> {
        self.queue()
            .iter()
            .map(|w| (w.partition().clone(), w.entity()))
            .collect()
    }

    fn queue(&self) -> MutexGuard<'_, Vec<DeferredWrite>> {
        self.deferred.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("caller", &self.caller)
            .field("keychain", &self.keychain)
            .field("deferred", &self.deferred_len())
            .finish()
    }
}
