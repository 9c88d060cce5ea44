use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use pes_chain::{ChainConfig, MergeListener, PartitionChain, RightsEngine};
use pes_crypto::Verifier;
use pes_sync::SyncManager;
use pes_types::PartitionKey;
use tracing::info;

use crate::backend::LogBackend;
use crate::bridge::PartitionBridge;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};

/// Creates, tracks and removes the partitions of one store.
///
/// This is the only place the partition-count bound is enforced.
pub struct BridgeBuilder {
    config: BridgeConfig,
    chain_config: ChainConfig,
    backend: Arc<dyn LogBackend>,
    engine: Arc<RightsEngine>,
    verifier: Arc<dyn Verifier>,
    sync: Arc<SyncManager>,
    listeners: Vec<Arc<dyn MergeListener>>,
    bridges: RwLock<HashMap<PartitionKey, Arc<PartitionBridge>>>,
}

impl BridgeBuilder {
    pub fn new(
        config: BridgeConfig,
        chain_config: ChainConfig,
        backend: Arc<dyn LogBackend>,
        engine: Arc<RightsEngine>,
        verifier: Arc<dyn Verifier>,
        sync: Arc<SyncManager>,
    ) -> Self {
        Self {
            config,
            chain_config,
            backend,
            engine,
            verifier,
            sync,
            listeners: Vec::new(),
            bridges: RwLock::new(HashMap::new()),
        }
    }

    /// Attach `listener` to every chain this builder creates from now on.
    pub fn listener(mut self, listener: Arc<dyn MergeListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn sync_manager(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn backend(&self) -> &Arc<dyn LogBackend> {
        &self.backend
    }

    pub fn engine(&self) -> &Arc<RightsEngine> {
        &self.engine
    }

    pub fn verifier(&self) -> &Arc<dyn Verifier> {
        &self.verifier
    }

    /// Create (or return the existing) bridge for `key` and start feeding
    /// its chain from offset zero.
    pub async fn create_partition(&self, key: &PartitionKey) -> BridgeResult<Arc<PartitionBridge>> {
        let max = self.config.max_partitions_per_topic;
        if key.index >= max {
            return Err(BridgeError::Capacity {
                topic: key.topic.clone(),
                index: key.index,
                max,
            });
        }
        if let Some(existing) = self.get(key) {
            return Ok(existing);
        }

        self.backend.create_partition(key).await?;

        let mut bridges = self.bridges.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = bridges.get(key) {
            return Ok(Arc::clone(existing));
        }
        let chain = Arc::new(PartitionChain::new(
            key.clone(),
            Arc::clone(&self.engine),
            self.chain_config.merge_policy.strategy(),
            Arc::clone(&self.verifier),
        ));
        for listener in &self.listeners {
            chain.add_listener(Arc::clone(listener))?;
        }
        let bridge = Arc::new(PartitionBridge::start(
            chain,
            Arc::clone(&self.backend),
            Arc::clone(&self.sync),
            0,
        ));
        bridges.insert(key.clone(), Arc::clone(&bridge));
        info!(partition = %key, backend = self.backend.name(), "partition created");
        Ok(bridge)
    }

    pub fn get(&self, key: &PartitionKey) -> Option<Arc<PartitionBridge>> {
        self.bridges
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Stop feeding `key` and drop its chain. Stored records stay in the
    /// backend. Returns `false` if the partition was not open.
    pub async fn remove_partition(&self, key: &PartitionKey) -> bool {
        let removed = self
            .bridges
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        match removed {
            Some(bridge) => {
                bridge.stop().await;
                info!(partition = %key, "partition removed");
                true
            }
            None => false,
        }
    }

    pub fn partitions(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<_> = self
            .bridges
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

impl std::fmt::Debug for BridgeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeBuilder")
            .field("config", &self.config)
            .field("backend", &self.backend.name())
            .field("partitions", &self.partitions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LogItem;
    use crate::memory::MemoryLog;
    use bytes::Bytes;
    use pes_chain::{ChainError, LogRecord, NewEntry, RecordCodec, RightsSet};
    use pes_crypto::{KeyDirectory, Signer, SigningKey};
    use pes_sync::SyncConfig;
    use pes_types::{EntityId, TemporalAnchor};
    use serde_json::json;
    use std::time::Duration;

    fn builder(max: u32, keys: &[&SigningKey]) -> BridgeBuilder {
        let dir = KeyDirectory::new();
        for k in keys {
            dir.register(k.verifying_key());
        }
        BridgeBuilder::new(
            BridgeConfig {
                max_partitions_per_topic: max,
                ..BridgeConfig::default()
            },
            ChainConfig::default(),
            Arc::new(MemoryLog::default()),
            Arc::new(RightsEngine::permissive()),
            Arc::new(dir),
            Arc::new(SyncManager::new(SyncConfig::default())),
        )
    }

    #[tokio::test]
    async fn partition_index_bound_is_enforced_at_creation() {
        let b = builder(4, &[]);
        let err = b.create_partition(&PartitionKey::new("t", 4)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Capacity { index: 4, max: 4, .. }));
        assert!(b.create_partition(&PartitionKey::new("t", 3)).await.is_ok());
        assert_eq!(b.partitions(), vec![PartitionKey::new("t", 3)]);
    }

    #[tokio::test]
    async fn default_bound_is_128() {
        let b = BridgeBuilder::new(
            BridgeConfig::default(),
            ChainConfig::default(),
            Arc::new(MemoryLog::default()),
            Arc::new(RightsEngine::permissive()),
            Arc::new(KeyDirectory::new()),
            Arc::new(SyncManager::default()),
        );
        assert!(b.create_partition(&PartitionKey::new("t", 127)).await.is_ok());
        assert!(matches!(
            b.create_partition(&PartitionKey::new("t", 128)).await,
            Err(BridgeError::Capacity { .. })
        ));
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let b = builder(8, &[]);
        let key = PartitionKey::new("t", 1);
        let first = b.create_partition(&key).await.unwrap();
        let second = b.create_partition(&key).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn write_then_sync_makes_entry_visible() {
        let sk = SigningKey::generate();
        let b = builder(8, &[&sk]);
        let key = PartitionKey::new("t", 0);
        let bridge = b.create_partition(&key).await.unwrap();

        let entity = EntityId::new();
        let entry = NewEntry::new(key.clone(), entity, "doc", TemporalAnchor::new(1, 0, 0))
            .field("title", json!("hello"))
            .rights(RightsSet::new().with_write(sk.key_hash()))
            .sign(&sk)
            .unwrap();
        assert_eq!(bridge.append(&LogRecord::Data(entry)).await.unwrap(), 0);

        let sync = b.sync_manager();
        let token = sync.start_sync();
        bridge.publish_sync(token).await.unwrap();
        assert!(sync.finish_sync(&token, Duration::from_secs(2)).await);
        assert!(sync.has_finish_sync(Some(&token)));

        let object = bridge.chain().get(&entity).unwrap().unwrap();
        assert_eq!(object.field("title"), Some(&json!("hello")));
        assert!(bridge.is_feeding());
    }

    #[tokio::test]
    async fn manual_feed_rejects_out_of_order_offsets() {
        let b = builder(8, &[]);
        let bridge = b.create_partition(&PartitionKey::new("t", 2)).await.unwrap();
        let marker = |n: i64| LogItem {
            offset: 0,
            bytes: Bytes::from(RecordCodec::encode(&LogRecord::Sync(pes_types::SyncToken::new(0, n))).unwrap()),
        };

        let err = bridge.feed([LogItem { offset: 5, ..marker(1) }]).unwrap_err();
        assert!(matches!(err, BridgeError::FeederRunning(ref key) if *key == PartitionKey::new("t", 2)));
        assert!(!err.is_fatal());

        bridge.stop().await;
        assert!(!bridge.is_feeding());
        assert_eq!(bridge.feed([LogItem { offset: 5, ..marker(1) }]).unwrap(), 1);
        let err = bridge.feed([LogItem { offset: 5, ..marker(2) }]).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, BridgeError::Chain(ChainError::Corruption { offset: 5, .. })));
    }

    #[tokio::test]
    async fn removal_stops_feeder() {
        let b = builder(8, &[]);
        let key = PartitionKey::new("t", 5);
        let bridge = b.create_partition(&key).await.unwrap();
        assert!(b.remove_partition(&key).await);
        assert!(!b.remove_partition(&key).await);
        assert!(!bridge.is_feeding());
        assert!(b.get(&key).is_none());
    }

    #[tokio::test]
    async fn listeners_are_attached_to_new_chains() {
        use pes_chain::MaterializedObject;
        use std::sync::Mutex;

        #[derive(Default)]
        struct Seen(Mutex<Vec<EntityId>>);
        impl MergeListener for Seen {
            fn on_merged(&self, object: &Arc<MaterializedObject>) {
                self.0.lock().unwrap().push(object.id);
            }
        }

        let sk = SigningKey::generate();
        let seen = Arc::new(Seen::default());
        let b = builder(8, &[&sk]).listener(seen.clone());
        let key = PartitionKey::new("t", 6);
        let bridge = b.create_partition(&key).await.unwrap();

        let entity = EntityId::new();
        let entry = NewEntry::new(key, entity, "doc", TemporalAnchor::new(1, 0, 0))
            .rights(RightsSet::new().with_write(sk.key_hash()))
            .sign(&sk)
            .unwrap();
        bridge.append(&LogRecord::Data(entry)).await.unwrap();
        let token = b.sync_manager().start_sync();
        bridge.publish_sync(token).await.unwrap();
        assert!(b.sync_manager().finish_sync(&token, Duration::from_secs(2)).await);

        assert_eq!(*seen.0.lock().unwrap(), vec![entity]);
    }
}
