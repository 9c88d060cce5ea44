use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use pes_chain::MaterializedObject;
use pes_crypto::Keychain;
use pes_types::PartitionKey;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Receives the heads a task subscribed to.
///
/// Runs on the task's worker. A returned error or a panic is logged and
/// counted; delivery continues with the next object.
pub trait TaskCallback: Send + Sync {
    fn on_data(&self, object: &MaterializedObject) -> CallbackResult;
}

#[derive(Default)]
struct Counters {
    running: AtomicBool,
    delivered: AtomicU64,
    failures: AtomicU64,
}

/// One subscription: a callback, its filter and its private queue.
pub struct Task {
    partition: PartitionKey,
    entity_type: String,
    keychain: Option<Keychain>,
    callback: Arc<dyn TaskCallback>,
    queue: mpsc::UnboundedSender<Arc<MaterializedObject>>,
    shutdown: watch::Sender<bool>,
    counters: Arc<Counters>,
}

impl Task {
    pub(crate) fn spawn(
        runtime: &Handle,
        partition: PartitionKey,
        entity_type: &str,
        keychain: Option<Keychain>,
        callback: Arc<dyn TaskCallback>,
    ) -> Arc<Self> {
        let (queue, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());
        counters.running.store(true, Ordering::SeqCst);

        let task = Arc::new(Self {
            partition,
            entity_type: entity_type.to_string(),
            keychain,
            callback: Arc::clone(&callback),
            queue,
            shutdown,
            counters: Arc::clone(&counters),
        });

        let worker = Worker {
            partition: task.partition.clone(),
            entity_type: task.entity_type.clone(),
            callback,
            counters,
        };
        runtime.spawn(worker.run(rx, shutdown_rx));
        task
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Caller credentials restricting delivery to readable objects.
    pub fn keychain(&self) -> Option<&Keychain> {
        self.keychain.as_ref()
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown.borrow() && self.counters.running.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.counters.failures.load(Ordering::SeqCst)
    }

    pub(crate) fn has_callback(&self, callback: &Arc<dyn TaskCallback>) -> bool {
        Arc::ptr_eq(&self.callback, callback)
    }

    pub(crate) fn matches(&self, object: &MaterializedObject) -> bool {
        object.entity_type == self.entity_type
            && !object.deleted
            && self
                .keychain
                .as_ref()
                .map_or(true, |keys| object.rights.permits_read(keys))
    }

    /// Queue `object` if it passes the filter. Never blocks.
    pub(crate) fn offer(&self, object: &Arc<MaterializedObject>) -> bool {
        if !self.matches(object) || *self.shutdown.borrow() {
            return false;
        }
        self.queue.send(Arc::clone(object)).is_ok()
    }

    pub(crate) fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("partition", &self.partition)
            .field("entity_type", &self.entity_type)
            .field("running", &self.is_running())
            .finish()
    }
}

struct Worker {
    partition: PartitionKey,
    entity_type: String,
    callback: Arc<dyn TaskCallback>,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<Arc<MaterializedObject>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(partition = %self.partition, entity_type = %self.entity_type, "task started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = rx.recv() => match next {
                    Some(object) => self.deliver(&object),
                    None => break,
                },
            }
        }
        self.counters.running.store(false, Ordering::SeqCst);
        debug!(partition = %self.partition, entity_type = %self.entity_type, "task stopped");
    }

    fn deliver(&self, object: &MaterializedObject) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.callback.on_data(object)));
        match outcome {
            Ok(Ok(())) => {
                self.counters.delivered.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Err(e)) => {
                self.counters.failures.fetch_add(1, Ordering::SeqCst);
                warn!(
                    partition = %self.partition,
                    entity = %object.id,
                    version = %object.version,
                    error = %e,
                    "task callback failed"
                );
            }
            Err(_) => {
                self.counters.failures.fetch_add(1, Ordering::SeqCst);
                error!(
                    partition = %self.partition,
                    entity = %object.id,
                    version = %object.version,
                    "task callback panicked"
                );
            }
        }
    }
}
