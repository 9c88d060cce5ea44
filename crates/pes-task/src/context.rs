use std::sync::{Arc, Mutex};

use pes_chain::{MaterializedObject, MergeListener, PartitionChain};
use pes_crypto::Keychain;
use pes_types::PartitionKey;
use tokio::runtime::Handle;
use tracing::debug;

use crate::error::{TaskError, TaskResult};
use crate::task::{Task, TaskCallback};

#[derive(Default)]
struct Dispatcher {
    tasks: Mutex<Vec<Arc<Task>>>,
}

impl Dispatcher {
    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Task>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MergeListener for Dispatcher {
    fn on_merged(&self, object: &Arc<MaterializedObject>) {
        for task in self.tasks().iter() {
            task.offer(object);
        }
    }
}

/// The tasks subscribed to one partition chain.
///
/// Dropping the context stops every task and detaches from the chain.
pub struct TaskContext {
    chain: Arc<PartitionChain>,
    dispatcher: Arc<Dispatcher>,
    listener: Arc<dyn MergeListener>,
    runtime: Handle,
}

impl TaskContext {
    /// Attach to `chain`. Must be called from within a tokio runtime.
    pub fn new(chain: Arc<PartitionChain>) -> TaskResult<Self> {
        let runtime = Handle::try_current().map_err(|_| TaskError::NoRuntime)?;
        let dispatcher = Arc::new(Dispatcher::default());
        let listener: Arc<dyn MergeListener> = dispatcher.clone();
        chain.add_listener(Arc::clone(&listener))?;
        Ok(Self {
            chain,
            dispatcher,
            listener,
            runtime,
        })
    }

    pub fn partition(&self) -> &PartitionKey {
        self.chain.key()
    }

    /// Subscribe `callback` to live objects of `entity_type`.
    ///
    /// The new task first receives the current heads of that type (in log
    /// order), then every later merge. Adding a callback that is already
    /// subscribed returns its existing task.
    pub fn add_task(
        &self,
        callback: Arc<dyn TaskCallback>,
        entity_type: &str,
        keychain: Option<Keychain>,
    ) -> TaskResult<Arc<Task>> {
        // Holding the chain's read lock keeps merges out until the task is
        // both seeded and registered.
        let task = self.chain.read(|view| {
            let mut tasks = self.dispatcher.tasks();
            if let Some(existing) = tasks.iter().find(|t| t.has_callback(&callback)) {
                return Arc::clone(existing);
            }

            let task = Task::spawn(
                &self.runtime,
                self.chain.key().clone(),
                entity_type,
                keychain,
                callback,
            );
            let mut backlog: Vec<_> = view.objects_of_type(entity_type).collect();
            backlog.sort_by_key(|object| object.offset);
            let seeded = backlog.into_iter().filter(|o| task.offer(o)).count();

            debug!(partition = %self.chain.key(), entity_type, seeded, "task added");
            tasks.push(Arc::clone(&task));
            task
        })?;
        Ok(task)
    }

    /// Stop `task` and drop its queue. `false` if it was not registered here.
    pub fn remove_task(&self, task: &Arc<Task>) -> bool {
        let removed = {
            let mut tasks = self.dispatcher.tasks();
            let before = tasks.len();
            tasks.retain(|t| !Arc::ptr_eq(t, task));
            tasks.len() != before
        };
        if removed {
            task.stop();
            debug!(partition = %self.chain.key(), entity_type = task.entity_type(), "task removed");
        }
        removed
    }

    /// Offer `object` to every matching task.
    pub fn feed(&self, object: &Arc<MaterializedObject>) {
        self.dispatcher.on_merged(object);
    }

    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.dispatcher.tasks().clone()
    }
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        for task in self.dispatcher.tasks().drain(..) {
            task.stop();
        }
        let _ = self.chain.remove_listener(&self.listener);
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("partition", self.chain.key())
            .field("tasks", &self.dispatcher.tasks().len())
            .finish()
    }
}
