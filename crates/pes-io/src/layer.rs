use std::sync::Arc;

use async_trait::async_trait;
use pes_chain::{History, LogEntry, MaterializedObject};
use pes_crypto::VerifyingKey;
use pes_types::{EntityId, KeyHash, PartitionKey};

use crate::context::{EntityDraft, RequestContext};
use crate::error::IoResult;

/// The read/write contract shared by every layer of the pipeline.
///
/// Write operations return `Ok(false)` when the write was refused (no
/// usable key, quarantined, conflicting or not observed in time). `Err` is
/// reserved for capacity, corruption and backend failures.
#[async_trait]
pub trait IoLayer: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Sign, append and wait until the write is visible to readers.
    async fn merge(&self, ctx: &RequestContext, draft: &EntityDraft) -> IoResult<bool>;

    /// Sign and append without waiting for the write to come back.
    async fn merge_async(&self, ctx: &RequestContext, draft: &EntityDraft) -> IoResult<bool>;

    /// Queue a write on `ctx` for the next [`IoLayer::merge_deferred`].
    fn merge_later(&self, ctx: &RequestContext, draft: EntityDraft);

    /// Queue a removal on `ctx` for the next [`IoLayer::merge_deferred`].
    fn remove_later(&self, ctx: &RequestContext, partition: &PartitionKey, id: EntityId);

    /// Flush the writes queued on `ctx`; returns how many were applied.
    async fn merge_deferred(&self, ctx: &RequestContext) -> IoResult<usize>;

    /// Drop the writes queued on `ctx`.
    fn clear_deferred(&self, ctx: &RequestContext);

    async fn remove(&self, ctx: &RequestContext, partition: &PartitionKey, id: EntityId) -> IoResult<bool>;

    /// Announce `key` on `partition` so entries it signs can be verified.
    async fn merge_public_key(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        key: &VerifyingKey,
    ) -> IoResult<bool>;

    async fn get_or_none(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        id: EntityId,
    ) -> IoResult<Option<Arc<MaterializedObject>>>;

    /// Readable live heads among `ids`, in the order asked for.
    async fn get_many(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        ids: &[EntityId],
    ) -> IoResult<Vec<Arc<MaterializedObject>>>;

    /// Readable live heads of one type, in log order.
    async fn get_all(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        entity_type: &str,
    ) -> IoResult<Vec<Arc<MaterializedObject>>>;

    async fn get_history(&self, ctx: &RequestContext, partition: &PartitionKey, id: EntityId) -> IoResult<History>;

    /// State of `id` as of log position `position` (inclusive).
    async fn get_version(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        id: EntityId,
        position: u64,
    ) -> IoResult<Option<Arc<MaterializedObject>>>;

    /// The stored entry behind the current head.
    async fn get_raw(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        id: EntityId,
    ) -> IoResult<Option<Arc<LogEntry>>>;

    async fn exists(&self, ctx: &RequestContext, partition: &PartitionKey, id: EntityId) -> IoResult<bool>;

    /// `true` even after the entity was deleted.
    async fn ever_existed(&self, ctx: &RequestContext, partition: &PartitionKey, id: EntityId) -> IoResult<bool>;

    /// Wait until everything appended to `partition` so far is visible.
    async fn sync(&self, ctx: &RequestContext, partition: &PartitionKey) -> IoResult<bool>;

    async fn public_key(&self, partition: &PartitionKey, hash: &KeyHash) -> IoResult<Option<VerifyingKey>>;

    /// Offer an object to the cache layers.
    fn cache(&self, ctx: &RequestContext, object: &Arc<MaterializedObject>);

    /// Drop `id` from this layer's cache only.
    fn decache(&self, id: &EntityId);

    /// Drop `id` from every cache down the pipeline.
    fn clear_cache(&self, id: &EntityId);
}
