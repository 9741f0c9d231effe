//! Administrative surface for queue ETL tasks.
//!
//! [`EtlAdmin`] owns the connection registry and the task table. Each task
//! runs on its own runner; the admin only spawns, stops and inspects them.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{Config, ConnectionString, QueueEtlConfiguration};
use crate::error::EtlError;
use crate::feed::{ChangeFeed, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use crate::metrics::EtlMetrics;
use crate::publisher::PublisherFactory;
use crate::registry::ConnectionRegistry;
use crate::runner::{EtlTaskRunner, RunnerContext, TaskHandle, TaskStatus};
use crate::types::TaskId;
use crate::Result;

pub struct EtlAdmin {
    context: RunnerContext,
    tasks: DashMap<TaskId, Arc<TaskHandle>>,
    /// Task names to ids; claiming a name here is what makes it unique.
    names: DashMap<String, TaskId>,
    next_id: AtomicU64,
}

impl EtlAdmin {
    pub fn new(context: RunnerContext) -> Self {
        Self {
            context,
            tasks: DashMap::new(),
            names: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Builds an admin from a loaded configuration: registers its connection
    /// strings and adds its tasks. Must be called inside a tokio runtime.
    pub async fn from_config(
        config: &Config,
        feed: Arc<dyn ChangeFeed>,
        publishers: Arc<dyn PublisherFactory>,
    ) -> Result<Self> {
        config.validate()?;

        let checkpoints: Arc<dyn CheckpointStore> = match &config.checkpoint.directory {
            Some(directory) => Arc::new(FileCheckpointStore::open(directory).await?),
            None => {
                warn!("No checkpoint directory configured, progress is kept in memory only");
                Arc::new(MemoryCheckpointStore::new())
            }
        };

        let admin = Self::new(RunnerContext {
            registry: Arc::new(ConnectionRegistry::new()),
            feed,
            checkpoints,
            publishers,
            runner: config.runner.clone(),
            sandbox: config.sandbox.clone(),
            metrics: EtlMetrics::new()?,
        });

        for connection_string in &config.connection_strings {
            admin.put_connection_string(connection_string.clone())?;
        }
        for task in &config.tasks {
            admin.add_etl_task(task.clone())?;
        }
        Ok(admin)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.context.registry
    }

    pub fn metrics(&self) -> &Arc<EtlMetrics> {
        &self.context.metrics
    }

    pub fn put_connection_string(&self, connection_string: ConnectionString) -> Result<()> {
        connection_string.validate()?;
        self.context.registry.put(connection_string)
    }

    /// Fails while any registered task still references the connection string.
    pub fn remove_connection_string(&self, name: &str) -> Result<()> {
        let users: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| entry.config().connection_string_name == name)
            .map(|entry| entry.config().name.clone())
            .collect();
        if !users.is_empty() {
            return Err(EtlError::InvalidState(format!(
                "connection string '{}' is used by ETL task(s) {}",
                name,
                users.join(", ")
            )));
        }

        self.context.registry.remove(name)?;
        Ok(())
    }

    /// Validates and registers a task, starting it unless it is disabled.
    pub fn add_etl_task(&self, config: QueueEtlConfiguration) -> Result<TaskId> {
        config.validate()?;
        let id = match self.names.entry(config.name.clone()) {
            Entry::Occupied(_) => {
                return Err(EtlError::Config(format!(
                    "ETL task '{}' already exists",
                    config.name
                )))
            }
            Entry::Vacant(slot) => *slot.insert(self.next_id.fetch_add(1, Ordering::SeqCst)),
        };

        let handle = if config.disabled {
            info!("ETL task '{}' is disabled and will not be started", config.name);
            TaskHandle::idle(id, config)
        } else {
            EtlTaskRunner::spawn(id, config, self.context.clone())
        };

        self.tasks.insert(id, Arc::new(handle));
        Ok(id)
    }

    /// Stops the task and forgets it together with its checkpoint.
    pub async fn remove_etl_task(&self, id: TaskId) -> Result<TaskStatus> {
        let (_, handle) = self.tasks.remove(&id).ok_or(EtlError::TaskNotFound(id))?;
        self.names.remove(&handle.config().name);
        handle.stop().await;
        self.context.checkpoints.clear(&handle.config().name).await?;
        info!("Removed ETL task '{}'", handle.config().name);
        Ok(handle.status())
    }

    pub async fn stop_task(&self, id: TaskId) -> Result<TaskStatus> {
        let handle = self.handle(id)?;
        handle.stop().await;
        Ok(handle.status())
    }

    /// Starts a faulted or stopped task again from its last checkpoint.
    pub async fn restart_task(&self, id: TaskId) -> Result<()> {
        let current = self.handle(id)?;
        let status = current.status();

        if current.config().disabled {
            return Err(EtlError::InvalidState(format!(
                "ETL task '{}' is disabled",
                status.name
            )));
        }
        if !status.state.is_terminal() {
            return Err(EtlError::InvalidState(format!(
                "ETL task '{}' is {}, only faulted or stopped tasks can be restarted",
                status.name, status.state
            )));
        }

        current.stop().await;
        let next = Arc::new(EtlTaskRunner::spawn_with_status(
            current.config().clone(),
            self.context.clone(),
            current.status().restarted(),
        ));

        let replaced = match self.tasks.get_mut(&id) {
            Some(mut entry) if Arc::ptr_eq(entry.value(), &current) => {
                *entry = next.clone();
                true
            }
            _ => false,
        };
        if !replaced {
            next.stop().await;
            return Err(EtlError::InvalidState(format!(
                "ETL task '{}' changed while restarting",
                status.name
            )));
        }

        info!("Restarted ETL task '{}'", status.name);
        Ok(())
    }

    pub fn task_status(&self, id: TaskId) -> Result<TaskStatus> {
        Ok(self.handle(id)?.status())
    }

    /// Status of every task, ordered by id.
    pub fn list_tasks(&self) -> Vec<TaskStatus> {
        let mut statuses: Vec<TaskStatus> =
            self.tasks.iter().map(|entry| entry.status()).collect();
        statuses.sort_by_key(|status| status.id);
        statuses
    }

    pub fn find_task(&self, name: &str) -> Option<TaskId> {
        self.names.get(name).map(|entry| *entry.value())
    }

    /// Stops every task. Tasks stay registered.
    pub async fn shutdown(&self) {
        info!("Shutting down {} ETL task(s)", self.tasks.len());
        let handles: Vec<Arc<TaskHandle>> =
            self.tasks.iter().map(|entry| entry.value().clone()).collect();
        for handle in handles {
            handle.stop().await;
        }
    }

    fn handle(&self, id: TaskId) -> Result<Arc<TaskHandle>> {
        self.tasks
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(EtlError::TaskNotFound(id))
    }
}
