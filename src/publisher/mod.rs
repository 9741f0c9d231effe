//! Broker publishers
//!
//! Every broker is one variant behind [`BrokerPublisher`]. The runner only
//! sees the trait; adding a broker means a new implementation plus a branch in
//! [`DefaultPublisherFactory`].

pub mod kafka;
pub mod memory;
pub mod rabbitmq;

use async_trait::async_trait;
use tracing::info;

use crate::config::{ConnectionString, QueueBrokerType, QueueEtlConfiguration};
use crate::error::{EtlError, PublishError};
use crate::types::OutboundMessage;
use crate::Result;

pub use kafka::{KafkaRecord, KAFKA_DEFAULT_OPTIONS};
pub use memory::{InMemoryPublisher, InMemoryPublisherFactory, PublishLog};
pub use rabbitmq::{AmqpChannel, RabbitMqPublisher};

#[cfg(feature = "kafka")]
pub use kafka::KafkaPublisher;
#[cfg(feature = "rabbitmq")]
pub use rabbitmq::LapinChannel;

#[async_trait]
pub trait BrokerPublisher: Send {
    fn broker_type(&self) -> QueueBrokerType;

    /// Delivers one message. Returns once the broker has accepted it.
    async fn publish(&mut self, message: &OutboundMessage) -> std::result::Result<(), PublishError>;

    /// Releases broker connections.
    async fn close(&mut self) {}
}

/// Builds the publisher for a task from its resolved connection string.
#[async_trait]
pub trait PublisherFactory: Send + Sync {
    async fn create(
        &self,
        connection: &ConnectionString,
        task: &QueueEtlConfiguration,
    ) -> Result<Box<dyn BrokerPublisher>>;
}

/// Factory for the real broker clients.
#[derive(Debug, Clone)]
pub struct DefaultPublisherFactory {
    publish_timeout_ms: u64,
}

impl DefaultPublisherFactory {
    pub fn new(publish_timeout_ms: u64) -> Self {
        Self { publish_timeout_ms }
    }
}

#[async_trait]
impl PublisherFactory for DefaultPublisherFactory {
    async fn create(
        &self,
        connection: &ConnectionString,
        task: &QueueEtlConfiguration,
    ) -> Result<Box<dyn BrokerPublisher>> {
        connection.validate()?;
        info!(
            "Creating {} publisher for task '{}' using '{}'",
            connection.broker_type, task.name, connection.name
        );

        match connection.broker_type {
            QueueBrokerType::Kafka => create_kafka(connection, self.publish_timeout_ms),
            QueueBrokerType::RabbitMq => {
                create_rabbitmq(connection, task, self.publish_timeout_ms)
            }
            QueueBrokerType::None => Err(EtlError::Config(format!(
                "connection string '{}' has no broker type",
                connection.name
            ))),
        }
    }
}

#[cfg(feature = "kafka")]
fn create_kafka(connection: &ConnectionString, timeout_ms: u64) -> Result<Box<dyn BrokerPublisher>> {
    let settings = connection.kafka_settings.as_ref().ok_or_else(|| {
        EtlError::Config(format!("connection string '{}' is missing kafka settings", connection.name))
    })?;
    Ok(Box::new(KafkaPublisher::new(settings, timeout_ms)?))
}

#[cfg(not(feature = "kafka"))]
fn create_kafka(connection: &ConnectionString, _timeout_ms: u64) -> Result<Box<dyn BrokerPublisher>> {
    Err(EtlError::Config(format!(
        "connection string '{}' needs kafka support, which this build does not include",
        connection.name
    )))
}

#[cfg(feature = "rabbitmq")]
fn create_rabbitmq(
    connection: &ConnectionString,
    task: &QueueEtlConfiguration,
    timeout_ms: u64,
) -> Result<Box<dyn BrokerPublisher>> {
    let settings = connection.rabbitmq_settings.as_ref().ok_or_else(|| {
        EtlError::Config(format!(
            "connection string '{}' is missing rabbitmq settings",
            connection.name
        ))
    })?;
    let channel = LapinChannel::new(settings.connection_string.clone(), timeout_ms);
    let publisher = RabbitMqPublisher::new(Box::new(channel), task.skip_automatic_queue_declaration)
        .with_queues(task.queues.iter().map(|queue| queue.name.clone()));
    Ok(Box::new(publisher))
}

#[cfg(not(feature = "rabbitmq"))]
fn create_rabbitmq(
    connection: &ConnectionString,
    _task: &QueueEtlConfiguration,
    _timeout_ms: u64,
) -> Result<Box<dyn BrokerPublisher>> {
    Err(EtlError::Config(format!(
        "connection string '{}' needs rabbitmq support, which this build does not include",
        connection.name
    )))
}
