use std::sync::{Arc, Mutex};

use bytes::Bytes;
use pes_chain::{ChainError, Disposition, LogRecord, PartitionChain, RecordCodec};
use pes_sync::SyncManager;
use pes_types::{PartitionKey, SyncToken};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::backend::{LogBackend, LogItem};
use crate::error::{BridgeError, BridgeResult};

/// Applies backend records to a chain, one caller at a time.
struct Feed {
    key: PartitionKey,
    chain: Arc<PartitionChain>,
    sync: Arc<SyncManager>,
    serial: Mutex<()>,
    failure: Mutex<Option<String>>,
}

impl Feed {
    fn apply(&self, items: impl IntoIterator<Item = LogItem>) -> BridgeResult<usize> {
        let _serial = self.serial.lock().unwrap_or_else(|e| e.into_inner());
        let mut applied = 0;
        for item in items {
            match self.chain.append_bytes(item.offset, &item.bytes) {
                Ok(outcome) => {
                    if let Disposition::SyncMarker(token) = outcome.disposition {
                        self.sync.process_sync(&token);
                    }
                }
                Err(ChainError::MergeConflict { entity, .. }) => {
                    debug!(partition = %self.key, offset = item.offset, entity = %entity, "conflicting entry kept in history");
                }
                Err(e) => return Err(e.into()),
            }
            applied += 1;
        }
        Ok(applied)
    }

    fn fail(&self, e: &BridgeError) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(e.to_string());
    }
}

/// One partition: its chain, the backend it lives on, and the feeder task
/// replaying the backend into the chain.
pub struct PartitionBridge {
    feed: Arc<Feed>,
    backend: Arc<dyn LogBackend>,
    shutdown: watch::Sender<bool>,
    feeder: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionBridge {
    /// Spawn a feeder replaying the backend from `from`. Must run inside a
    /// tokio runtime.
    pub(crate) fn start(
        chain: Arc<PartitionChain>,
        backend: Arc<dyn LogBackend>,
        sync: Arc<SyncManager>,
        from: u64,
    ) -> Self {
        let feed = Arc::new(Feed {
            key: chain.key().clone(),
            chain,
            sync,
            serial: Mutex::new(()),
            failure: Mutex::new(None),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let feeder = tokio::spawn(run_feeder(
            Arc::clone(&feed),
            Arc::clone(&backend),
            from,
            shutdown_rx,
        ));
        Self {
            feed,
            backend,
            shutdown,
            feeder: Mutex::new(Some(feeder)),
        }
    }

    pub fn key(&self) -> &PartitionKey {
        &self.feed.key
    }

    pub fn chain(&self) -> &Arc<PartitionChain> {
        &self.feed.chain
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Encode and append `record`; returns the offset the backend assigned.
    /// The record reaches the chain once the feeder replays it.
    pub async fn append(&self, record: &LogRecord) -> BridgeResult<u64> {
        let bytes = RecordCodec::encode(record)?;
        self.backend.append(self.key(), Bytes::from(bytes)).await
    }

    pub async fn append_batch(&self, records: &[LogRecord]) -> BridgeResult<Vec<u64>> {
        let batch = records
            .iter()
            .map(|r| RecordCodec::encode(r).map(Bytes::from))
            .collect::<Result<Vec<_>, _>>()?;
        self.backend.append_batch(self.key(), batch).await
    }

    /// Append a sync marker for `token`.
    pub async fn publish_sync(&self, token: SyncToken) -> BridgeResult<u64> {
        self.append(&LogRecord::Sync(token)).await
    }

    /// Apply records directly, bypassing the backend subscription.
    ///
    /// Only allowed once the feeder has stopped; a stopped feeder never
    /// restarts. Offsets must continue past what the chain has already
    /// seen; an ordering violation is returned as a corruption error.
    pub fn feed(&self, items: impl IntoIterator<Item = LogItem>) -> BridgeResult<usize> {
        if self.is_feeding() {
            return Err(BridgeError::FeederRunning(self.key().clone()));
        }
        self.feed.apply(items)
    }

    /// `true` while the feeder is alive.
    pub fn is_feeding(&self) -> bool {
        self.feeder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Why the feeder stopped, if it failed.
    pub fn failure(&self) -> Option<String> {
        self.feed
            .failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stop the feeder. The chain keeps its state.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = self
            .feeder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for PartitionBridge {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for PartitionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionBridge")
            .field("key", self.key())
            .field("backend", &self.backend.name())
            .field("feeding", &self.is_feeding())
            .finish()
    }
}

async fn run_feeder(
    feed: Arc<Feed>,
    backend: Arc<dyn LogBackend>,
    from: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut subscription = match backend.subscribe(&feed.key, from).await {
        Ok(subscription) => subscription,
        Err(e) => {
            error!(partition = %feed.key, error = %e, "feed could not subscribe");
            feed.fail(&e);
            return;
        }
    };
    info!(partition = %feed.key, backend = backend.name(), from, "feed started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = subscription.next() => match next {
                Ok(Some(item)) => {
                    if let Err(e) = feed.apply(std::iter::once(item)) {
                        error!(partition = %feed.key, error = %e, fatal = e.is_fatal(), "feed stopped");
                        feed.fail(&e);
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(partition = %feed.key, error = %e, "feed read failed");
                    feed.fail(&e);
                    return;
                }
            },
        }
    }
    info!(partition = %feed.key, "feed stopped");
}
