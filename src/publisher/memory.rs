use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use crate::config::{ConnectionString, QueueBrokerType, QueueEtlConfiguration};
use crate::error::PublishError;
use crate::publisher::{BrokerPublisher, PublisherFactory};
use crate::types::OutboundMessage;
use crate::Result;

/// Record of everything published through in-memory publishers.
///
/// Cloning shares the underlying log.
#[derive(Clone, Default)]
pub struct PublishLog {
    inner: Arc<Mutex<LogState>>,
}

#[derive(Default)]
struct LogState {
    delivered: Vec<OutboundMessage>,
    attempts: usize,
    failures: Vec<PublishError>,
    publishers_created: usize,
    publishers_closed: usize,
}

impl PublishLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.inner.lock().delivered.clone()
    }

    pub fn messages_for(&self, destination: &str) -> Vec<OutboundMessage> {
        self.inner
            .lock()
            .delivered
            .iter()
            .filter(|m| m.destination == destination)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().delivered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish calls made, failed ones included.
    pub fn attempts(&self) -> usize {
        self.inner.lock().attempts
    }

    /// The next `count` publishes fail with a retryable error.
    pub fn fail_next(&self, count: usize) {
        let error = PublishError::Unavailable("broker unavailable".to_string());
        self.fail_next_with(std::iter::repeat(error).take(count));
    }

    /// Queues specific failures for the next publishes, in order.
    pub fn fail_next_with(&self, errors: impl IntoIterator<Item = PublishError>) {
        let mut state = self.inner.lock();
        state.failures = errors.into_iter().collect();
        state.failures.reverse();
    }

    pub fn publishers_created(&self) -> usize {
        self.inner.lock().publishers_created
    }

    pub fn publishers_closed(&self) -> usize {
        self.inner.lock().publishers_closed
    }

    fn record(&self, message: &OutboundMessage) -> std::result::Result<(), PublishError> {
        let mut state = self.inner.lock();
        state.attempts += 1;
        if let Some(error) = state.failures.pop() {
            return Err(error);
        }
        state.delivered.push(message.clone());
        Ok(())
    }
}

/// Publisher that appends to a [`PublishLog`] instead of talking to a broker.
pub struct InMemoryPublisher {
    broker_type: QueueBrokerType,
    log: PublishLog,
}

impl InMemoryPublisher {
    pub fn new(broker_type: QueueBrokerType, log: PublishLog) -> Self {
        Self { broker_type, log }
    }
}

#[async_trait]
impl BrokerPublisher for InMemoryPublisher {
    fn broker_type(&self) -> QueueBrokerType {
        self.broker_type
    }

    async fn publish(&mut self, message: &OutboundMessage) -> std::result::Result<(), PublishError> {
        self.log.record(message)?;
        debug!(
            "Recorded {} message for '{}' ({} bytes)",
            self.broker_type,
            message.destination,
            message.body.len()
        );
        Ok(())
    }

    async fn close(&mut self) {
        self.log.inner.lock().publishers_closed += 1;
    }
}

#[derive(Clone, Default)]
pub struct InMemoryPublisherFactory {
    log: PublishLog,
}

impl InMemoryPublisherFactory {
    pub fn new(log: PublishLog) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &PublishLog {
        &self.log
    }
}

#[async_trait]
impl PublisherFactory for InMemoryPublisherFactory {
    async fn create(
        &self,
        connection: &ConnectionString,
        task: &QueueEtlConfiguration,
    ) -> Result<Box<dyn BrokerPublisher>> {
        connection.validate()?;
        self.log.inner.lock().publishers_created += 1;
        debug!(
            "Creating in-memory {} publisher for task '{}'",
            connection.broker_type, task.name
        );
        Ok(Box::new(InMemoryPublisher::new(
            connection.broker_type,
            self.log.clone(),
        )))
    }
}
