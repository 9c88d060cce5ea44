use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use pes_chain::{History, LogEntry, MaterializedObject};
use pes_crypto::VerifyingKey;
use pes_types::{EntityId, KeyHash, PartitionKey};
use tracing::{info, warn};

use crate::context::{EntityDraft, RequestContext};
use crate::error::IoResult;
use crate::layer::IoLayer;

/// Outcome of one pipeline call as seen by the access log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessDecision {
    /// Write accepted, or read returned data.
    Allowed,
    /// Write refused by rights, conflict or timeout.
    Denied,
    /// Read found nothing the caller may see.
    Missing,
    /// The call failed with an error.
    Failed,
}

impl AccessDecision {
    fn of_write(result: &IoResult<bool>) -> Self {
        match result {
            Ok(true) => Self::Allowed,
            Ok(false) => Self::Denied,
            Err(_) => Self::Failed,
        }
    }

    fn of_read<T>(result: &IoResult<Option<T>>) -> Self {
        match result {
            Ok(Some(_)) => Self::Allowed,
            Ok(None) => Self::Missing,
            Err(_) => Self::Failed,
        }
    }

    fn of_list<T>(result: &IoResult<Vec<T>>) -> Self {
        match result {
            Ok(items) if items.is_empty() => Self::Missing,
            Ok(_) => Self::Allowed,
            Err(_) => Self::Failed,
        }
    }

    fn of_probe<T>(result: &IoResult<T>) -> Self {
        if result.is_ok() {
            Self::Allowed
        } else {
            Self::Failed
        }
    }
}

impl std::fmt::Display for AccessDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Missing => "missing",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AccessRecord {
    pub at: SystemTime,
    pub caller: String,
    pub operation: &'static str,
    pub partition: Option<PartitionKey>,
    pub entity: Option<EntityId>,
    pub decision: AccessDecision,
}

/// Bounded in-memory audit trail; the oldest records fall off first.
pub struct AccessLog {
    capacity: usize,
    records: Mutex<VecDeque<AccessRecord>>,
}

impl AccessLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, record: AccessRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Oldest first.
    pub fn records(&self) -> Vec<AccessRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for AccessLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessLog")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// Records every call with the caller and its decision, then returns the
/// inner layer's result untouched.
pub struct AccessLogLayer {
    log: Arc<AccessLog>,
    next: Arc<dyn IoLayer>,
}

impl AccessLogLayer {
    pub fn new(log: Arc<AccessLog>, next: Arc<dyn IoLayer>) -> Self {
        Self { log, next }
    }

    pub fn log(&self) -> &Arc<AccessLog> {
        &self.log
    }

    fn record(
        &self,
        ctx: &RequestContext,
        operation: &'static str,
        partition: Option<&PartitionKey>,
        entity: Option<EntityId>,
        decision: AccessDecision,
    ) {
        let partition_label = partition.map(ToString::to_string).unwrap_or_default();
        let entity_label = entity.map(|id| id.to_string()).unwrap_or_default();
        match decision {
            AccessDecision::Failed => warn!(
                target: "pes::access",
                caller = ctx.caller(),
                operation,
                partition = %partition_label,
                entity = %entity_label,
                decision = %decision,
                "access"
            ),
            _ => info!(
                target: "pes::access",
                caller = ctx.caller(),
                operation,
                partition = %partition_label,
                entity = %entity_label,
                decision = %decision,
                "access"
            ),
        }
        self.log.push(AccessRecord {
            at: SystemTime::now(),
            caller: ctx.caller().to_string(),
            operation,
            partition: partition.cloned(),
            entity,
            decision,
        });
    }
}

#[async_trait]
impl IoLayer for AccessLogLayer {
    fn name(&self) -> &'static str {
        "access-log"
    }

    async fn merge(&self, ctx: &RequestContext, draft: &EntityDraft) -> IoResult<bool> {
        let result = self.next.merge(ctx, draft).await;
        self.record(ctx, "merge", Some(&draft.partition), Some(draft.id), AccessDecision::of_write(&result));
        result
    }

    async fn merge_async(&self, ctx: &RequestContext, draft: &EntityDraft) -> IoResult<bool> {
        let result = self.next.merge_async(ctx, draft).await;
        self.record(
            ctx,
            "merge_async",
            Some(&draft.partition),
            Some(draft.id),
            AccessDecision::of_write(&result),
        );
        result
    }

    fn merge_later(&self, ctx: &RequestContext, draft: EntityDraft) {
        self.record(ctx, "merge_later", Some(&draft.partition), Some(draft.id), AccessDecision::Allowed);
        self.next.merge_later(ctx, draft);
    }

    fn remove_later(&self, ctx: &RequestContext, partition: &PartitionKey, id: EntityId) {
        self.record(ctx, "remove_later", Some(partition), Some(id), AccessDecision::Allowed);
        self.next.remove_later(ctx, partition, id);
    }

    async fn merge_deferred(&self, ctx: &RequestContext) -> IoResult<usize> {
        let queued = ctx.deferred_len();
        let result = self.next.merge_deferred(ctx).await;
        let decision = match &result {
            Ok(applied) if *applied == queued => AccessDecision::Allowed,
            Ok(_) => AccessDecision::Denied,
            Err(_) => AccessDecision::Failed,
        };
        self.record(ctx, "merge_deferred", None, None, decision);
        result
    }

    fn clear_deferred(&self, ctx: &RequestContext) {
        self.record(ctx, "clear_deferred", None, None, AccessDecision::Allowed);
        self.next.clear_deferred(ctx);
    }

    async fn remove(&self, ctx: &RequestContext, partition: &PartitionKey, id: EntityId) -> IoResult<bool> {
        let result = self.next.remove(ctx, partition, id).await;
        self.record(ctx, "remove", Some(partition), Some(id), AccessDecision::of_write(&result));
        result
    }

    async fn merge_public_key(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        key: &VerifyingKey,
    ) -> IoResult<bool> {
        let result = self.next.merge_public_key(ctx, partition, key).await;
        self.record(ctx, "merge_public_key", Some(partition), None, AccessDecision::of_write(&result));
        result
    }

    async fn get_or_none(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        id: EntityId,
    ) -> IoResult<Option<Arc<MaterializedObject>>> {
        let result = self.next.get_or_none(ctx, partition, id).await;
        self.record(ctx, "get_or_none", Some(partition), Some(id), AccessDecision::of_read(&result));
        result
    }

    async fn get_many(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        ids: &[EntityId],
    ) -> IoResult<Vec<Arc<MaterializedObject>>> {
        let result = self.next.get_many(ctx, partition, ids).await;
        self.record(ctx, "get_many", Some(partition), None, AccessDecision::of_list(&result));
        result
    }

    async fn get_all(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        entity_type: &str,
    ) -> IoResult<Vec<Arc<MaterializedObject>>> {
        let result = self.next.get_all(ctx, partition, entity_type).await;
        self.record(ctx, "get_all", Some(partition), None, AccessDecision::of_list(&result));
        result
    }

    async fn get_history(&self, ctx: &RequestContext, partition: &PartitionKey, id: EntityId) -> IoResult<History> {
        let result = self.next.get_history(ctx, partition, id).await;
        let decision = match &result {
            Ok(history) if history.is_empty() => AccessDecision::Missing,
            other => AccessDecision::of_probe(other),
        };
        self.record(ctx, "get_history", Some(partition), Some(id), decision);
        result
    }

    async fn get_version(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        id: EntityId,
        position: u64,
    ) -> IoResult<Option<Arc<MaterializedObject>>> {
        let result = self.next.get_version(ctx, partition, id, position).await;
        self.record(ctx, "get_version", Some(partition), Some(id), AccessDecision::of_read(&result));
        result
    }

    async fn get_raw(
        &self,
        ctx: &RequestContext,
        partition: &PartitionKey,
        id: EntityId,
    ) -> IoResult<Option<Arc<LogEntry>>> {
        let result = self.next.get_raw(ctx, partition, id).await;
        self.record(ctx, "get_raw", Some(partition), Some(id), AccessDecision::of_read(&result));
        result
    }

    async fn exists(&self, ctx: &RequestContext, partition: &PartitionKey, id: EntityId) -> IoResult<bool> {
        let result = self.next.exists(ctx, partition, id).await;
        self.record(ctx, "exists", Some(partition), Some(id), AccessDecision::of_probe(&result));
        result
    }

    async fn ever_existed(&self, ctx: &RequestContext, partition: &PartitionKey, id: EntityId) -> IoResult<bool> {
        let result = self.next.ever_existed(ctx, partition, id).await;
        self.record(ctx, "ever_existed", Some(partition), Some(id), AccessDecision::of_probe(&result));
        result
    }

    async fn sync(&self, ctx: &RequestContext, partition: &PartitionKey) -> IoResult<bool> {
        let result = self.next.sync(ctx, partition).await;
        self.record(ctx, "sync", Some(partition), None, AccessDecision::of_write(&result));
        result
    }

    async fn public_key(&self, partition: &PartitionKey, hash: &KeyHash) -> IoResult<Option<VerifyingKey>> {
        self.next.public_key(partition, hash).await
    }

    fn cache(&self, ctx: &RequestContext, object: &Arc<MaterializedObject>) {
        self.next.cache(ctx, object);
    }

    fn decache(&self, id: &EntityId) {
        self.next.decache(id);
    }

    fn clear_cache(&self, id: &EntityId) {
        self.next.clear_cache(id);
    }
}
