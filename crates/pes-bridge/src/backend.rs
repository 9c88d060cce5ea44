use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use pes_types::PartitionKey;
use tokio::sync::broadcast;
use tracing::warn;

use crate::config::BackendConfig;
use crate::error::BridgeResult;
use crate::file::FileLog;
use crate::memory::MemoryLog;

/// One stored record and the offset the backend assigned to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogItem {
    pub offset: u64,
    pub bytes: Bytes,
}

/// An ordered, partitioned, append-only byte log.
///
/// Offsets are assigned by the backend and strictly increase within a
/// partition. Partitions must be created before they are written or read.
#[async_trait]
pub trait LogBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Idempotent.
    async fn create_partition(&self, key: &PartitionKey) -> BridgeResult<()>;

    async fn append(&self, key: &PartitionKey, bytes: Bytes) -> BridgeResult<u64>;

    /// Append records in order; returns their offsets.
    async fn append_batch(&self, key: &PartitionKey, batch: Vec<Bytes>) -> BridgeResult<Vec<u64>> {
        let mut offsets = Vec::with_capacity(batch.len());
        for bytes in batch {
            offsets.push(self.append(key, bytes).await?);
        }
        Ok(offsets)
    }

    /// Stored records with `offset >= from`.
    async fn read(&self, key: &PartitionKey, from: u64) -> BridgeResult<Vec<LogItem>>;

    /// Stored records from `from` onwards, followed by every later append.
    async fn subscribe(&self, key: &PartitionKey, from: u64) -> BridgeResult<Subscription>;
}

pub(crate) type Reread = Box<dyn Fn(u64) -> BridgeResult<Vec<LogItem>> + Send + Sync>;

/// Backlog-then-live stream over one partition.
///
/// Yields each offset at most once, in increasing order. A subscriber that
/// falls behind the live channel re-reads the missed range from the backend.
pub struct Subscription {
    key: PartitionKey,
    backlog: VecDeque<LogItem>,
    live: broadcast::Receiver<LogItem>,
    next: u64,
    reread: Reread,
}

impl Subscription {
    pub(crate) fn new(
        key: PartitionKey,
        from: u64,
        backlog: Vec<LogItem>,
        live: broadcast::Receiver<LogItem>,
        reread: Reread,
    ) -> Self {
        Self {
            key,
            backlog: backlog.into(),
            live,
            next: from,
            reread,
        }
    }

    /// Next record, or `None` once the partition's live feed has closed.
    pub async fn next(&mut self) -> BridgeResult<Option<LogItem>> {
        loop {
            let item = match self.backlog.pop_front() {
                Some(item) => item,
                None => match self.live.recv().await {
                    Ok(item) => item,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(partition = %self.key, skipped, from = self.next, "subscriber lagged; re-reading");
                        self.backlog = (self.reread)(self.next)?.into();
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(None),
                },
            };
            if item.offset < self.next {
                continue;
            }
            self.next = item.offset + 1;
            return Ok(Some(item));
        }
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.key
    }

    /// Offset the next yielded record will have at least.
    pub fn position(&self) -> u64 {
        self.next
    }
}

impl BackendConfig {
    pub fn open(&self, channel_capacity: usize) -> BridgeResult<Arc<dyn LogBackend>> {
        Ok(match self {
            Self::Memory => Arc::new(MemoryLog::new(channel_capacity)),
            Self::File {
                root,
                sync_every_write,
            } => Arc::new(
                FileLog::open(root, channel_capacity)?.sync_every_write(*sync_every_write),
            ),
        })
    }
}
