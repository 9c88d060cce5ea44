use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use pes_chain::{History, LogEntry, MaterializedObject, MergeListener};
use pes_crypto::VerifyingKey;
use pes_types::{EntityId, KeyHash, PartitionKey};
use tracing::trace;

use crate::context::{EntityDraft, RequestContext};
use crate::error::IoResult;
use crate::layer::IoLayer;

type SlotKey = (PartitionKey, EntityId);

/// Smallest number of recent invalidations remembered for racing fills.
const MIN_INVALIDATION_WINDOW: usize = 64;

/// What an invalidation covered. `None` means the id in every partition.
#[derive(Clone, Debug)]
struct Invalidation {
    generation: u64,
    partition: Option<PartitionKey>,
    id: EntityId,
}

impl Invalidation {
    fn covers(&self, key: &SlotKey) -> bool {
        self.id == key.1 && self.partition.as_ref().map_or(true, |p| *p == key.0)
    }
}

#[derive(Default)]
struct Slots {
    objects: HashMap<SlotKey, Arc<MaterializedObject>>,
    /// Insertion order, oldest first. May hold keys already removed.
    order: VecDeque<SlotKey>,
    /// Bumped by every invalidation.
    generation: u64,
    /// Most recent invalidations, oldest first.
    recent: VecDeque<Invalidation>,
    /// Generation of the last `clear`.
    cleared_at: u64,
}

impl Slots {
    /// Whether anything covering `key` was invalidated after `ticket`.
    fn invalidated_since(&self, key: &SlotKey, ticket: u64) -> bool {
        if self.cleared_at > ticket {
            return true;
        }
        match self.recent.front() {
            // Invalidations after `ticket` fell out of the window.
            Some(oldest) if oldest.generation > ticket + 1 => true,
            None => self.generation > ticket,
            _ => self
                .recent
                .iter()
                .any(|inv| inv.generation > ticket && inv.covers(key)),
        }
    }
}

/// Bounded map from `(partition, entity)` to the last head seen for it.
///
/// Advisory only: a stale or missing slot falls through to the layer below.
/// Attach it to the chains as a [`MergeListener`] so every merge evicts the
/// entity it touched.
///
/// Fills read from below use [`ticket`](Self::ticket) and
/// [`insert_fresh`](Self::insert_fresh) so an invalidation that lands while
/// the read is in flight is not undone by the fill.
pub struct ObjectCache {
    capacity: usize,
    window: usize,
    slots: RwLock<Slots>,
}

impl ObjectCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            window: capacity.max(MIN_INVALIDATION_WINDOW),
            slots: RwLock::new(Slots::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, partition: &PartitionKey, id: &EntityId) -> Option<Arc<MaterializedObject>> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .objects
            .get(&(partition.clone(), *id))
            .cloned()
    }

    /// Current invalidation generation, taken before reading from below.
    pub fn ticket(&self) -> u64 {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).generation
    }

    /// Store `object`, evicting the oldest entries past capacity. Deleted
    /// heads are never cached.
    pub fn insert(&self, object: Arc<MaterializedObject>) {
        self.store(object, None);
    }

    /// Like [`insert`](Self::insert), but skipped when the object's slot
    /// was invalidated after `ticket`. Returns whether it was stored.
    pub fn insert_fresh(&self, object: Arc<MaterializedObject>, ticket: u64) -> bool {
        self.store(object, Some(ticket))
    }

    fn store(&self, object: Arc<MaterializedObject>, ticket: Option<u64>) -> bool {
        if self.capacity == 0 || object.deleted {
            return false;
        }
        let key = (object.partition.clone(), object.id);
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if let Some(ticket) = ticket {
            if slots.invalidated_since(&key, ticket) {
                trace!(partition = %key.0, entity = %key.1, "stale fill skipped");
                return false;
            }
        }
        if slots.objects.insert(key.clone(), object).is_none() {
            slots.order.push_back(key);
        }
        while slots.objects.len() > self.capacity {
            match slots.order.pop_front() {
                Some(oldest) => {
                    slots.objects.remove(&oldest);
                }
                None => break,
            }
        }
        if slots.order.len() > self.capacity * 2 {
            let Slots { objects, order, .. } = &mut *slots;
            order.retain(|key| objects.contains_key(key));
        }
        true
    }

    /// Evict `id` in `partition`.
    pub fn remove(&self, partition: &PartitionKey, id: &EntityId) -> bool {
        self.invalidate(Some(partition), id)
    }

    /// Evict `id` in every partition.
    pub fn remove_entity(&self, id: &EntityId) -> bool {
        self.invalidate(None, id)
    }

    fn invalidate(&self, partition: Option<&PartitionKey>, id: &EntityId) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.generation += 1;
        let generation = slots.generation;
        slots.recent.push_back(Invalidation {
            generation,
            partition: partition.cloned(),
            id: *id,
        });
        while slots.recent.len() > self.window {
            slots.recent.pop_front();
        }
        match partition {
            Some(p) => slots.objects.remove(&(p.clone(), *id)).is_some(),
            None => {
                let before = slots.objects.len();
                slots.objects.retain(|key, _| key.1 != *id);
                slots.objects.len() != before
            }
        }
    }

    pub fn clear(&self) {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.generation += 1;
        slots.cleared_at = slots.generation;
        slots.objects.clear();
        slots.order.clear();
        slots.recent.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MergeListener for ObjectCache {
    fn on_merged(&self, object: &Arc<MaterializedObject>) {
        if self.remove(&object.partition, &object.id) {
            trace!(partition = %object.partition, entity = %object.id, "cache entry invalidated by merge");
        }
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// Outermost layer: answers point reads from an [`ObjectCache`] when the
/// caller may read the cached object, and fills it from the layer below.
pub struct CacheLayer {
    cache: Arc<ObjectCache>,
    next: Arc<dyn IoLayer>,
}

impl CacheLayer {
    pub fn new(cache: Arc<ObjectCache>, next: Arc<dyn IoLayer>) -> Self {
        Self { cache, next }
    }

    pub fn object_cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }

    fn hit(&self, ctx: &RequestContext, partition: &PartitionKey, id: &EntityId) -> Option<Arc<MaterializedObject>> {
        self.cache
            .get(partition, id)
            .filter(|o| o.rights.permits_read(ctx.keychain()))
    }
}

#[async_trait]
impl IoLayer for CacheLayer {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn merge(&self, ctx: &RequestContext, draft: &EntityDraft) -> IoResult<bool> {
        self.cache.remove(&draft.partition, &draft.id);
        self.next.merge(ctx, draft).await
    }

    async fn merge_async(&self, ctx: &RequestContext, draft: &EntityDraft) -> IoResult<bool> {
        self.cache.remove(&draft.partition, &draft.id);
        self.next.merge_async(ctx, draft).await
    }

    fn merge_later(&self, ctx: &RequestContext, draft: EntityDraft) {
        self.next.merge_later(ctx, draft);
    }

    fn remove_later(&self, ctx: &RequestContext, partition: &PartitionKey, id: EntityId) {
        self.next.remove_later(ctx, partition, id);
    }

    async fn merge_deferred(&self, ctx: &RequestContext) -> IoResult<usize> {
        for (partition, id) in ctx.deferred_entities() {
            self.cache.remove(&partition, &id);
        }
        self.next.merge_deferred(ctx).await
    }

    fn clear_deferred(&self, ctx: &RequestContext) {
        self.next.clear_deferred(ctx);
    }

    async fn remove(&self, ctx: &RequestContext, partition: &PartitionKey, id: EntityId) -> IoResult<bool> {
        self.cache.remove(partition, &id);
        self.next.remove(ctx, partition, id).await
    }

    async fn merge_public_key(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        key: &VerifyingKey,
    ) -> IoResult<bool> {
        self.next.merge_public_key(ctx, partition, key).await
    }

    async fn get_or_none(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        id: EntityId,
    ) -> IoResult<Option<Arc<MaterializedObject>>> {
        if let Some(object) = self.hit(ctx, partition, &id) {
            return Ok(Some(object));
        }
        let ticket = self.cache.ticket();
        let found = self.next.get_or_none(ctx, partition, id).await?;
        if let Some(object) = &found {
            self.cache.insert_fresh(Arc::clone(object), ticket);
        }
        Ok(found)
    }

    async fn get_many(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        ids: &[EntityId],
    ) -> IoResult<Vec<Arc<MaterializedObject>>> {
        let cached: Vec<_> = ids.iter().map(|id| self.hit(ctx, partition, id)).collect();
        let missing: Vec<EntityId> = ids
            .iter()
            .zip(&cached)
            .filter(|(_, hit)| hit.is_none())
            .map(|(id, _)| *id)
            .collect();

        let mut fetched: HashMap<EntityId, Arc<MaterializedObject>> = HashMap::new();
        if !missing.is_empty() {
            let ticket = self.cache.ticket();
            for object in self.next.get_many(ctx, partition, &missing).await? {
                self.cache.insert_fresh(Arc::clone(&object), ticket);
                fetched.insert(object.id, object);
            }
        }

        Ok(ids
            .iter()
            .zip(cached)
            .filter_map(|(id, hit)| hit.or_else(|| fetched.get(id).cloned()))
            .collect())
    }

    async fn get_all(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        entity_type: &str,
    ) -> IoResult<Vec<Arc<MaterializedObject>>> {
        self.next.get_all(ctx, partition, entity_type).await
    }

    async fn get_history(&self, ctx: &RequestContext, partition: &PartitionKey, id: EntityId) -> IoResult<History> {
        self.next.get_history(ctx, partition, id).await
    }

    async fn get_version(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        id: EntityId,
        position: u64,
    ) -> IoResult<Option<Arc<MaterializedObject>>> {
        self.next.get_version(ctx, partition, id, position).await
    }

    async fn get_raw(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        id: EntityId,
    ) -> IoResult<Option<Arc<LogEntry>>> {
        self.next.get_raw(ctx, partition, id).await
    }

    async fn exists(&self, ctx: &RequestContext, partition: &PartitionKey, id: EntityId) -> IoResult<bool> {
        if self.cache.get(partition, &id).is_some() {
            return Ok(true);
        }
        self.next.exists(ctx, partition, id).await
    }

    async fn ever_existed(&self, ctx: &RequestContext, partition: &PartitionKey, id: EntityId) -> IoResult<bool> {
        if self.cache.get(partition, &id).is_some() {
            return Ok(true);
        }
        self.next.ever_existed(ctx, partition, id).await
    }

    async fn sync(&self, ctx: &RequestContext, partition: &PartitionKey) -> IoResult<bool> {
        self.next.sync(ctx, partition).await
    }

    async fn public_key(&self, partition: &PartitionKey, hash: &KeyHash) -> IoResult<Option<VerifyingKey>> {
        self.next.public_key(partition, hash).await
    }

    fn cache(&self, ctx: &RequestContext, object: &Arc<MaterializedObject>) {
        if object.rights.permits_read(ctx.keychain()) {
            self.cache.insert(Arc::clone(object));
        }
        self.next.cache(ctx, object);
    }

    fn decache(&self, id: &EntityId) {
        self.cache.remove_entity(id);
    }

    fn clear_cache(&self, id: &EntityId) {
        self.cache.remove_entity(id);
        self.next.clear_cache(id);
    }
}
