use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pes_bridge::{BridgeBuilder, PartitionBridge};
use pes_chain::{
    EntityView, History, LogEntry, LogRecord, MaterializedObject, NewEntry, PartitionChain,
    PublicKeyRecord, WriteIntent,
};
use pes_crypto::VerifyingKey;
use pes_sync::SyncManager;
use pes_types::{EntityId, EntryId, HybridLogicalClock, KeyHash, PartitionKey, SyncToken};
use tracing::{debug, warn};

use crate::context::{DeferredWrite, EntityDraft, RequestContext};
use crate::error::IoResult;
use crate::layer::IoLayer;

enum Change<'a> {
    Upsert(&'a EntityDraft),
    Delete(EntityId),
}

/// A signed entry plus the key announcement it depends on, if any.
struct Prepared {
    entry: LogEntry,
    announce: Option<VerifyingKey>,
}

/// A batch appended to one partition, waiting for its sync marker.
struct Submitted {
    bridge: Arc<PartitionBridge>,
    token: SyncToken,
    entries: Vec<EntryId>,
}

/// The innermost layer: signs writes, appends them through partition
/// bridges and reads materialized state from the chains.
///
/// Partitions are opened on first use.
pub struct BackendIo {
    bridges: Arc<BridgeBuilder>,
    clock: HybridLogicalClock,
}

impl BackendIo {
    pub fn new(bridges: Arc<BridgeBuilder>, node_id: u16) -> Self {
        Self {
            bridges,
            clock: HybridLogicalClock::new(node_id),
        }
    }

    pub fn bridges(&self) -> &Arc<BridgeBuilder> {
        &self.bridges
    }

    fn sync_manager(&self) -> &SyncManager {
        self.bridges.sync_manager()
    }

    fn sync_timeout(&self) -> Duration {
        self.sync_manager().config().default_timeout()
    }

    async fn bridge(&self, partition: &PartitionKey) -> IoResult<Arc<PartitionBridge>> {
        Ok(self.bridges.create_partition(partition).await?)
    }

    async fn chain(&self, partition: &PartitionKey) -> IoResult<Arc<PartitionChain>> {
        Ok(Arc::clone(self.bridge(partition).await?.chain()))
    }

    fn is_known(&self, chain: &PartitionChain, hash: &KeyHash) -> IoResult<bool> {
        Ok(self.bridges.verifier().public_key_for_hash(hash).is_some()
            || chain.announced_key(hash)?.is_some())
    }

    /// Pick a signing key and build the next entry for `change`.
    ///
    /// `pending` maps entities already written earlier in the same batch to
    /// the entry that will be their head once the batch is applied.
    fn prepare(
        &self,
        ctx: &RequestContext,
        chain: &PartitionChain,
        change: Change<'_>,
        pending: &HashMap<EntityId, EntryId>,
    ) -> IoResult<Option<Prepared>> {
        let engine = chain.engine();
        let planned = chain.read(|view| match change {
            Change::Upsert(draft) => {
                let head = view.head(&draft.id);
                let intent = WriteIntent {
                    entity_id: &draft.id,
                    entity_type: &draft.entity_type,
                    parent_id: draft.parent_id.as_ref(),
                    declared_write_keys: &draft.rights.write_keys,
                    fields: Some(&draft.fields),
                };
                let author = engine.write_key_for(&intent, ctx.keychain(), view)?;
                if let Some(head) = head {
                    self.clock.observe(&head.timestamp);
                }
                let previous = pending
                    .get(&draft.id)
                    .copied()
                    .or_else(|| head.map(|h| h.version));
                let mut entry = NewEntry::new(
                    chain.key().clone(),
                    draft.id,
                    draft.entity_type.clone(),
                    self.clock.now(),
                )
                .previous(previous)
                .fields(draft.fields.clone())
                .rights(draft.rights.clone());
                if let Some(parent) = draft.parent_id {
                    entry = entry.parent(parent);
                }
                Some((author, entry))
            }
            Change::Delete(id) => {
                let head = view.get(&id)?;
                let intent = WriteIntent {
                    entity_id: &id,
                    entity_type: &head.entity_type,
                    parent_id: head.parent_id.as_ref(),
                    declared_write_keys: &head.rights.write_keys,
                    fields: None,
                };
                let author = engine.write_key_for(&intent, ctx.keychain(), view)?;
                self.clock.observe(&head.timestamp);
                let previous = pending.get(&id).copied().unwrap_or(head.version);
                let mut entry = NewEntry::new(
                    chain.key().clone(),
                    id,
                    head.entity_type.clone(),
                    self.clock.now(),
                )
                .previous(Some(previous))
                .rights(head.rights.clone())
                .tombstone();
                if let Some(parent) = head.parent_id {
                    entry = entry.parent(parent);
                }
                Some((author, entry))
            }
        })?;

        let Some((author, entry)) = planned else {
            debug!(partition = %chain.key(), caller = ctx.caller(), "no usable write key");
            return Ok(None);
        };
        let Some(signer) = ctx.keychain().get(&author) else {
            return Ok(None);
        };
        let announce = if self.is_known(chain, &author)? {
            None
        } else {
            Some(signer.verifying_key())
        };
        Ok(Some(Prepared {
            entry: entry.sign(signer)?,
            announce,
        }))
    }

    fn records(prepared: Vec<Prepared>) -> (Vec<LogRecord>, Vec<EntryId>) {
        let mut records = Vec::with_capacity(prepared.len() + 1);
        let mut entries = Vec::with_capacity(prepared.len());
        let mut announced = HashSet::new();
        for p in prepared {
            if let Some(key) = p.announce {
                if announced.insert(key.key_hash()) {
                    records.push(LogRecord::PublicKey(PublicKeyRecord::new(&key)));
                }
            }
            entries.push(p.entry.entry_id);
            records.push(LogRecord::Data(p.entry));
        }
        (records, entries)
    }

    /// Append `prepared` and a trailing sync marker as one batch.
    async fn submit(&self, bridge: Arc<PartitionBridge>, prepared: Vec<Prepared>) -> IoResult<Submitted> {
        let (mut records, entries) = Self::records(prepared);
        let token = self.sync_manager().start_sync();
        records.push(LogRecord::Sync(token));
        if let Err(e) = bridge.append_batch(&records).await {
            self.sync_manager().cancel_sync(&token);
            return Err(e.into());
        }
        Ok(Submitted {
            bridge,
            token,
            entries,
        })
    }

    /// Wait for a submitted batch; returns how many of its entries were applied.
    async fn confirm(&self, submitted: Submitted) -> IoResult<usize> {
        if !self
            .sync_manager()
            .finish_sync(&submitted.token, self.sync_timeout())
            .await
        {
            warn!(
                partition = %submitted.bridge.key(),
                entries = submitted.entries.len(),
                "write not observed before timeout"
            );
            return Ok(0);
        }
        let chain = submitted.bridge.chain();
        let mut applied = 0;
        for entry in &submitted.entries {
            if chain.was_applied(entry)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    async fn write_one(&self, ctx: &RequestContext, partition: &PartitionKey, change: Change<'_>) -> IoResult<bool> {
        let bridge = self.bridge(partition).await?;
        let Some(prepared) = self.prepare(ctx, bridge.chain(), change, &HashMap::new())? else {
            return Ok(false);
        };
        let submitted = self.submit(bridge, vec![prepared]).await?;
        Ok(self.confirm(submitted).await? == 1)
    }

    fn readable(chain: &PartitionChain, ctx: &RequestContext, id: &EntityId) -> IoResult<bool> {
        Ok(chain.read(|view| {
            view.head(id)
                .map(|head| chain.engine().can_read(head, ctx.keychain()))
                .unwrap_or(false)
        })?)
    }
}

#[async_trait]
impl IoLayer for BackendIo {
    fn name(&self) -> &'static str {
        "backend"
    }

    async fn merge(&self, ctx: &RequestContext, draft: &EntityDraft) -> IoResult<bool> {
        self.write_one(ctx, &draft.partition, Change::Upsert(draft)).await
    }

    async fn merge_async(&self, ctx: &RequestContext, draft: &EntityDraft) -> IoResult<bool> {
        let bridge = self.bridge(&draft.partition).await?;
        let Some(prepared) = self.prepare(ctx, bridge.chain(), Change::Upsert(draft), &HashMap::new())? else {
            return Ok(false);
        };
        let (records, _) = Self::records(vec![prepared]);
        bridge.append_batch(&records).await?;
        Ok(true)
    }

    fn merge_later(&self, ctx: &RequestContext, draft: EntityDraft) {
        ctx.defer(DeferredWrite::Merge(draft));
    }

    fn remove_later(&self, ctx: &RequestContext, partition: &PartitionKey, id: EntityId) {
        ctx.defer(DeferredWrite::Remove {
            partition: partition.clone(),
            id,
        });
    }

    async fn merge_deferred(&self, ctx: &RequestContext) -> IoResult<usize> {
        let mut by_partition: BTreeMap<PartitionKey, Vec<DeferredWrite>> = BTreeMap::new();
        for write in ctx.take_deferred() {
            by_partition
                .entry(write.partition().clone())
                .or_default()
                .push(write);
        }

        let mut submitted = Vec::with_capacity(by_partition.len());
        for (partition, writes) in by_partition {
            let bridge = self.bridge(&partition).await?;
            let mut pending = HashMap::new();
            let mut prepared = Vec::with_capacity(writes.len());
            for write in &writes {
                let change = match write {
                    DeferredWrite::Merge(draft) => Change::Upsert(draft),
                    DeferredWrite::Remove { id, .. } => Change::Delete(*id),
                };
                match self.prepare(ctx, bridge.chain(), change, &pending)? {
                    Some(p) => {
                        pending.insert(p.entry.entity_id, p.entry.entry_id);
                        prepared.push(p);
                    }
                    None => debug!(partition = %partition, entity = %write.entity(), "deferred write refused"),
                }
            }
            if !prepared.is_empty() {
                submitted.push(self.submit(bridge, prepared).await?);
            }
        }

        let mut applied = 0;
        for batch in submitted {
            applied += self.confirm(batch).await?;
        }
        Ok(applied)
    }

    fn clear_deferred(&self, ctx: &RequestContext) {
        let dropped = ctx.clear_deferred();
        if dropped > 0 {
            debug!(caller = ctx.caller(), dropped, "deferred writes cleared");
        }
    }

    async fn remove(&self, ctx: &RequestContext, partition: &PartitionKey, id: EntityId) -> IoResult<bool> {
        self.write_one(ctx, partition, Change::Delete(id)).await
    }

    async fn merge_public_key(
        &self,
        _ctx: &RequestContext,
        partition: &PartitionKey,
        key: &VerifyingKey,
    ) -> IoResult<bool> {
        let bridge = self.bridge(partition).await?;
        let record = LogRecord::PublicKey(PublicKeyRecord::new(key));
        let seen = self
            .sync_manager()
            .sync(self.sync_timeout(), |token| {
                let bridge = Arc::clone(&bridge);
                async move {
                    bridge
                        .append_batch(&[record, LogRecord::Sync(token)])
                        .await
                        .map(drop)
                }
            })
            .await?;
        Ok(seen && bridge.chain().announced_key(&key.key_hash())?.is_some())
    }

    async fn get_or_none(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        id: EntityId,
    ) -> IoResult<Option<Arc<MaterializedObject>>> {
        let chain = self.chain(partition).await?;
        Ok(chain
            .get(&id)?
            .filter(|o| chain.engine().can_read(o, ctx.keychain())))
    }

    async fn get_many(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        ids: &[EntityId],
    ) -> IoResult<Vec<Arc<MaterializedObject>>> {
        let chain = self.chain(partition).await?;
        Ok(chain.read(|view| {
            ids.iter()
                .filter_map(|id| view.get(id))
                .filter(|o| chain.engine().can_read(o, ctx.keychain()))
                .cloned()
                .collect()
        })?)
    }

    async fn get_all(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        entity_type: &str,
    ) -> IoResult<Vec<Arc<MaterializedObject>>> {
        let chain = self.chain(partition).await?;
        let mut objects: Vec<_> = chain
            .objects_of_type(entity_type)?
            .into_iter()
            .filter(|o| chain.engine().can_read(o, ctx.keychain()))
            .collect();
        objects.sort_by_key(|o| o.offset);
        Ok(objects)
    }

    async fn get_history(&self, _ctx: &RequestContext, partition: &PartitionKey, id: EntityId) -> IoResult<History> {
        Ok(self.chain(partition).await?.get_history(&id)?)
    }

    async fn get_version(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        id: EntityId,
        position: u64,
    ) -> IoResult<Option<Arc<MaterializedObject>>> {
        let chain = self.chain(partition).await?;
        Ok(chain
            .get_version(&id, position)?
            .filter(|o| chain.engine().can_read(o, ctx.keychain())))
    }

    async fn get_raw(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        id: EntityId,
    ) -> IoResult<Option<Arc<LogEntry>>> {
        let chain = self.chain(partition).await?;
        if !Self::readable(&chain, ctx, &id)? {
            return Ok(None);
        }
        Ok(chain.get_raw(&id)?)
    }

    async fn exists(&self, _ctx: &RequestContext, partition: &PartitionKey, id: EntityId) -> IoResult<bool> {
        Ok(self.chain(partition).await?.get(&id)?.is_some())
    }

    async fn ever_existed(&self, _ctx: &RequestContext, partition: &PartitionKey, id: EntityId) -> IoResult<bool> {
        Ok(self.chain(partition).await?.ever_existed(&id)?)
    }

    async fn sync(&self, _ctx: &RequestContext, partition: &PartitionKey) -> IoResult<bool> {
        let bridge = self.bridge(partition).await?;
        Ok(self
            .sync_manager()
            .sync(self.sync_timeout(), |token| async move {
                bridge.publish_sync(token).await.map(drop)
            })
            .await?)
    }

    async fn public_key(&self, partition: &PartitionKey, hash: &KeyHash) -> IoResult<Option<VerifyingKey>> {
        if let Some(key) = self.bridges.verifier().public_key_for_hash(hash) {
            return Ok(Some(key));
        }
        Ok(self.chain(partition).await?.announced_key(hash)?)
    }

    fn cache(&self, _ctx: &RequestContext, _object: &Arc<MaterializedObject>) {}

    fn decache(&self, _id: &EntityId) {}

    fn clear_cache(&self, _id: &EntityId) {}
}
