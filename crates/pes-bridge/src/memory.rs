use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use pes_types::PartitionKey;
use tokio::sync::broadcast;

use crate::backend::{LogBackend, LogItem, Subscription};
use crate::error::{BridgeError, BridgeResult};

type Records = Arc<RwLock<Vec<Bytes>>>;

struct MemoryPartition {
    records: Records,
    live: broadcast::Sender<LogItem>,
}

/// In-memory ordered log. Offsets are record indices starting at zero.
pub struct MemoryLog {
    partitions: RwLock<HashMap<PartitionKey, MemoryPartition>>,
    channel_capacity: usize,
}

impl MemoryLog {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            channel_capacity: channel_capacity.max(1),
        }
    }

    fn with_partition<R>(
        &self,
        key: &PartitionKey,
        f: impl FnOnce(&MemoryPartition) -> R,
    ) -> BridgeResult<R> {
        let partitions = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        partitions
            .get(key)
            .map(f)
            .ok_or_else(|| BridgeError::UnknownPartition(key.clone()))
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(1024)
    }
}

fn items_from(records: &[Bytes], from: u64) -> Vec<LogItem> {
    records
        .iter()
        .enumerate()
        .skip(from as usize)
        .map(|(offset, bytes)| LogItem {
            offset: offset as u64,
            bytes: bytes.clone(),
        })
        .collect()
}

#[async_trait]
impl LogBackend for MemoryLog {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_partition(&self, key: &PartitionKey) -> BridgeResult<()> {
        let mut partitions = self.partitions.write().unwrap_or_else(|e| e.into_inner());
        partitions
            .entry(key.clone())
            .or_insert_with(|| MemoryPartition {
                records: Arc::default(),
                live: broadcast::channel(self.channel_capacity).0,
            });
        Ok(())
    }

    async fn append(&self, key: &PartitionKey, bytes: Bytes) -> BridgeResult<u64> {
        self.with_partition(key, |partition| {
            let mut records = partition.records.write().unwrap_or_else(|e| e.into_inner());
            let offset = records.len() as u64;
            records.push(bytes.clone());
            // No subscribers is fine.
            let _ = partition.live.send(LogItem { offset, bytes });
            offset
        })
    }

    async fn read(&self, key: &PartitionKey, from: u64) -> BridgeResult<Vec<LogItem>> {
        self.with_partition(key, |partition| {
            let records = partition.records.read().unwrap_or_else(|e| e.into_inner());
            items_from(&records, from)
        })
    }

    async fn subscribe(&self, key: &PartitionKey, from: u64) -> BridgeResult<Subscription> {
        self.with_partition(key, |partition| {
            // Subscribe while holding the records lock so no append falls
            // between the backlog and the live feed.
            let records = partition.records.read().unwrap_or_else(|e| e.into_inner());
            let live = partition.live.subscribe();
            let backlog = items_from(&records, from);
            drop(records);

            let source = Arc::clone(&partition.records);
            let reread = Box::new(move |from: u64| -> BridgeResult<Vec<LogItem>> {
                let records = source.read().unwrap_or_else(|e| e.into_inner());
                Ok(items_from(&records, from))
            });
            Subscription::new(key.clone(), from, backlog, live, reread)
        })
    }
}
