use std::sync::Arc;

use pes_bridge::{BridgeBuilder, LogBackend, PartitionBridge};
use pes_chain::RightsEngine;
use pes_crypto::Verifier;
use pes_sync::SyncManager;
use pes_task::TaskContext;
use pes_types::PartitionKey;
use tracing::info;

use crate::access::{AccessLog, AccessLogLayer};
use crate::backend::BackendIo;
use crate::cache::{CacheLayer, ObjectCache};
use crate::config::StoreConfig;
use crate::error::IoResult;
use crate::layer::IoLayer;

/// A running store: partition bridges plus the I/O pipeline over them.
///
/// The pipeline is assembled once, outermost first: cache, access log,
/// backend.
pub struct Store {
    config: StoreConfig,
    bridges: Arc<BridgeBuilder>,
    cache: Arc<ObjectCache>,
    access_log: Arc<AccessLog>,
    pipeline: Arc<dyn IoLayer>,
}

impl Store {
    /// Open the backend named in `config` and assemble the pipeline.
    pub fn open(config: StoreConfig, engine: RightsEngine, verifier: Arc<dyn Verifier>) -> IoResult<Self> {
        let backend = config.backend.open(config.bridge.channel_capacity)?;
        Ok(Self::with_backend(config, backend, engine, verifier))
    }

    pub fn with_backend(
        config: StoreConfig,
        backend: Arc<dyn LogBackend>,
        engine: RightsEngine,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        let cache = Arc::new(ObjectCache::new(config.io.cache_capacity));
        let sync = Arc::new(SyncManager::new(config.sync.clone()));
        let bridges = Arc::new(
            BridgeBuilder::new(
                config.bridge.clone(),
                config.chain.clone(),
                backend,
                Arc::new(engine),
                verifier,
                sync,
            )
            .listener(cache.clone()),
        );

        let access_log = Arc::new(AccessLog::new(config.io.access_log_capacity));
        let backend_io: Arc<dyn IoLayer> = Arc::new(BackendIo::new(Arc::clone(&bridges), config.node_id));
        let logged: Arc<dyn IoLayer> = Arc::new(AccessLogLayer::new(Arc::clone(&access_log), backend_io));
        let pipeline: Arc<dyn IoLayer> = Arc::new(CacheLayer::new(Arc::clone(&cache), logged));

        info!(
            backend = bridges.backend().name(),
            node = config.node_id,
            merge_policy = ?config.chain.merge_policy,
            "store opened"
        );
        Self {
            config,
            bridges,
            cache,
            access_log,
            pipeline,
        }
    }

    /// The outermost pipeline layer.
    pub fn io(&self) -> &Arc<dyn IoLayer> {
        &self.pipeline
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn bridges(&self) -> &Arc<BridgeBuilder> {
        &self.bridges
    }

    pub fn sync_manager(&self) -> &Arc<SyncManager> {
        self.bridges.sync_manager()
    }

    pub fn access_log(&self) -> &Arc<AccessLog> {
        &self.access_log
    }

    pub fn object_cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }

    pub async fn open_partition(&self, partition: &PartitionKey) -> IoResult<Arc<PartitionBridge>> {
        Ok(self.bridges.create_partition(partition).await?)
    }

    /// A task context subscribed to `partition`, opening it if needed.
    pub async fn task_context(&self, partition: &PartitionKey) -> IoResult<TaskContext> {
        let bridge = self.open_partition(partition).await?;
        Ok(TaskContext::new(Arc::clone(bridge.chain()))?)
    }

    /// Stop every feeder. Stored records stay in the backend.
    pub async fn shutdown(&self) {
        for partition in self.bridges.partitions() {
            self.bridges.remove_partition(&partition).await;
        }
        self.cache.clear();
        info!("store shut down");
    }
}
