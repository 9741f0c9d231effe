//! ETL task execution
//!
//! One [`EtlTaskRunner`] per task, each on its own tokio task. A runner owns
//! its change feed consumer, compiled transformations and broker publisher;
//! the only state it shares is its [`TaskStatus`] and the stop signal.

pub mod status;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{QueueEtlConfiguration, RunnerConfig, SandboxConfig};
use crate::error::EtlError;
use crate::feed::{ChangeFeed, ChangeFeedConsumer, CheckpointStore};
use crate::metrics::EtlMetrics;
use crate::publisher::{BrokerPublisher, PublisherFactory};
use crate::registry::ConnectionRegistry;
use crate::transform::engine::TransformEngine;
use crate::types::{ChangeEvent, OutboundMessage, TaskId};
use crate::Result;

pub use status::{TaskState, TaskStatus};

/// Everything a runner needs from its host.
#[derive(Clone)]
pub struct RunnerContext {
    pub registry: Arc<ConnectionRegistry>,
    pub feed: Arc<dyn ChangeFeed>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub publishers: Arc<dyn PublisherFactory>,
    pub runner: RunnerConfig,
    pub sandbox: SandboxConfig,
    pub metrics: Arc<EtlMetrics>,
}

/// Control side of a spawned runner.
pub struct TaskHandle {
    id: TaskId,
    config: QueueEtlConfiguration,
    status: Arc<RwLock<TaskStatus>>,
    stop_tx: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn config(&self) -> &QueueEtlConfiguration {
        &self.config
    }

    pub fn status(&self) -> TaskStatus {
        self.status.read().clone()
    }

    /// A handle that never ran, used for disabled tasks.
    pub fn idle(id: TaskId, config: QueueEtlConfiguration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let status = TaskStatus::new(id, config.name.clone());
        Self {
            id,
            config,
            status: Arc::new(RwLock::new(status)),
            stop_tx,
            join: Mutex::new(None),
        }
    }

    /// Asks the runner to stop after its in-flight event and waits for it.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let join = self.join.lock().take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                error!("ETL task '{}' runner panicked: {}", self.config.name, e);
                let mut status = self.status.write();
                status.state = TaskState::Faulted;
                status.last_error = Some(format!("runner panicked: {e}"));
            }
        }

        let mut status = self.status.write();
        if !status.state.is_terminal() {
            status.state = TaskState::Stopped;
        }
    }
}

pub struct EtlTaskRunner {
    id: TaskId,
    config: QueueEtlConfiguration,
    context: RunnerContext,
    status: Arc<RwLock<TaskStatus>>,
    stop: watch::Receiver<bool>,
}

impl EtlTaskRunner {
    pub fn spawn(id: TaskId, config: QueueEtlConfiguration, context: RunnerContext) -> TaskHandle {
        let status = TaskStatus::new(id, config.name.clone());
        Self::spawn_with_status(config, context, status)
    }

    /// Spawns a runner that continues from an earlier status, keeping its
    /// counters.
    pub fn spawn_with_status(
        config: QueueEtlConfiguration,
        context: RunnerContext,
        initial: TaskStatus,
    ) -> TaskHandle {
        let id = initial.id;
        let status = Arc::new(RwLock::new(initial));
        let (stop_tx, stop_rx) = watch::channel(false);

        let runner = Self {
            id,
            config: config.clone(),
            context,
            status: status.clone(),
            stop: stop_rx,
        };
        let join = tokio::spawn(runner.run());

        TaskHandle {
            id,
            config,
            status,
            stop_tx,
            join: Mutex::new(Some(join)),
        }
    }

    async fn run(mut self) {
        self.update(|status| {
            status.state = TaskState::Starting;
            status.started_at = Some(Utc::now());
        });
        info!("Starting ETL task '{}' (id {})", self.config.name, self.id);

        let (mut consumer, mut publisher, engines) = match self.start().await {
            Ok(parts) => parts,
            Err(e) => {
                self.fault(&e);
                return;
            }
        };

        self.update(|status| status.state = TaskState::Running);
        self.context.metrics.running_tasks.inc();
        info!("ETL task '{}' running", self.config.name);

        let outcome = self.process(&mut consumer, publisher.as_mut(), &engines).await;

        publisher.close().await;
        self.context.metrics.running_tasks.dec();

        match outcome {
            Ok(()) => {
                self.update(|status| status.state = TaskState::Stopped);
                info!("ETL task '{}' stopped", self.config.name);
            }
            Err(e) => self.fault(&e),
        }
    }

    async fn start(
        &self,
    ) -> Result<(ChangeFeedConsumer, Box<dyn BrokerPublisher>, Vec<TransformEngine>)> {
        self.config.validate()?;

        let connection = self
            .context
            .registry
            .get(&self.config.connection_string_name)
            .map_err(|_| {
                EtlError::Config(format!(
                    "ETL task '{}' references unknown connection string '{}'",
                    self.config.name, self.config.connection_string_name
                ))
            })?;
        connection.validate()?;

        if connection.broker_type != self.config.broker_type {
            return Err(EtlError::Config(format!(
                "ETL task '{}' expects a {} broker but connection string '{}' is {}",
                self.config.name,
                self.config.broker_type,
                connection.name,
                connection.broker_type
            )));
        }

        let engines = self
            .config
            .transforms
            .iter()
            .filter(|transform| !transform.disabled)
            .map(|transform| {
                TransformEngine::compile(transform, &self.context.sandbox).map_err(EtlError::from)
            })
            .collect::<Result<Vec<_>>>()?;

        let publisher = self.context.publishers.create(&connection, &self.config).await?;

        let mut consumer = ChangeFeedConsumer::new(
            self.config.name.clone(),
            self.context.feed.clone(),
            self.context.checkpoints.clone(),
            self.config.collections(),
            self.config.applies_to_all_documents(),
            self.context.runner.feed_retry.clone(),
        );
        let position = consumer.resume().await?;
        self.update(|status| status.last_checkpoint = position);

        Ok((consumer, publisher, engines))
    }

    async fn process(
        &mut self,
        consumer: &mut ChangeFeedConsumer,
        publisher: &mut dyn BrokerPublisher,
        engines: &[TransformEngine],
    ) -> Result<()> {
        loop {
            if *self.stop.borrow() {
                return Ok(());
            }

            let next = tokio::select! {
                biased;
                _ = self.stop.changed() => return Ok(()),
                next = consumer.next() => next?,
            };

            let Some(event) = next else {
                info!("Change feed for ETL task '{}' is exhausted", self.config.name);
                return Ok(());
            };

            self.process_event(consumer, publisher, engines, &event).await?;
        }
    }

    async fn process_event(
        &self,
        consumer: &mut ChangeFeedConsumer,
        publisher: &mut dyn BrokerPublisher,
        engines: &[TransformEngine],
        event: &ChangeEvent,
    ) -> Result<()> {
        let task = self.config.name.as_str();
        let mut messages = Vec::new();

        for engine in engines.iter().filter(|e| e.applies_to(&event.collection)) {
            let timer = self.context.metrics.transform_latency.start_timer();
            let outcome = engine.run(event);
            timer.observe_duration();

            match outcome {
                Ok(emitted) => messages.extend(emitted),
                Err(e) => {
                    warn!("ETL task '{}' skipped a transformation: {}", task, e);
                    self.context
                        .metrics
                        .transform_failures
                        .with_label_values(&[task, engine.name()])
                        .inc();
                    self.update(|status| status.transform_failures += 1);
                }
            }
        }

        for message in &messages {
            self.publish_with_retry(publisher, message).await?;
            self.context
                .metrics
                .messages_published
                .with_label_values(&[task])
                .inc();
            self.update(|status| status.messages_published += 1);
        }

        consumer.acknowledge(event.offset).await?;
        self.context
            .metrics
            .events_processed
            .with_label_values(&[task])
            .inc();
        self.update(|status| {
            status.events_processed += 1;
            status.last_checkpoint = Some(event.offset);
        });
        debug!(
            "ETL task '{}' processed {} into {} message(s)",
            task,
            event.event_id(),
            messages.len()
        );
        Ok(())
    }

    async fn publish_with_retry(
        &self,
        publisher: &mut dyn BrokerPublisher,
        message: &OutboundMessage,
    ) -> Result<()> {
        let policy = &self.context.runner.publish_retry;
        let mut attempt = 0;

        loop {
            match publisher.publish(message).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    attempt += 1;
                    warn!(
                        "Publish to '{}' failed for ETL task '{}' (attempt {}/{}), retrying in {}ms: {}",
                        message.destination,
                        self.config.name,
                        attempt,
                        policy.max_attempts,
                        delay.as_millis(),
                        e
                    );
                    self.context
                        .metrics
                        .publish_retries
                        .with_label_values(&[self.config.name.as_str()])
                        .inc();
                    sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        "Publish to '{}' failed for ETL task '{}' after {} attempt(s): {}",
                        message.destination,
                        self.config.name,
                        attempt + 1,
                        e
                    );
                    return Err(e.into());
                }
            }
        }
    }

    fn fault(&self, cause: &EtlError) {
        error!("ETL task '{}' faulted: {}", self.config.name, cause);
        self.context.metrics.tasks_faulted.inc();
        self.update(|status| {
            status.state = TaskState::Faulted;
            status.last_error = Some(cause.to_string());
        });
    }

    fn update(&self, apply: impl FnOnce(&mut TaskStatus)) {
        apply(&mut self.status.write());
    }
}
