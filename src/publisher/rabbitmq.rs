use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

use crate::config::QueueBrokerType;
use crate::error::PublishError;
use crate::publisher::BrokerPublisher;
use crate::types::OutboundMessage;

#[cfg(feature = "rabbitmq")]
use {
    crate::types::{HEADER_CONTENT_TYPE, JSON_CONTENT_TYPE},
    lapin::options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    lapin::publisher_confirm::Confirmation,
    lapin::types::{AMQPValue, FieldTable, LongString, ShortString},
    lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind},
    std::future::Future,
    std::time::Duration,
    tracing::warn,
};

/// The AMQP operations the publisher needs.
#[async_trait]
pub trait AmqpChannel: Send {
    /// Declares an exchange named `name` and a queue of the same name bound
    /// to it.
    async fn declare_destination(&mut self, name: &str) -> Result<(), PublishError>;

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> Result<(), PublishError>;

    async fn close(&mut self);
}

/// Publishes to the exchange named by the destination. Exchanges and queues
/// are declared once per destination unless the task opts out. The task's
/// configured queues are declared before the first message goes out, even if
/// no script ever emits to them.
pub struct RabbitMqPublisher {
    channel: Box<dyn AmqpChannel>,
    skip_auto_declare: bool,
    configured: Vec<String>,
    declared: HashSet<String>,
}

impl RabbitMqPublisher {
    pub fn new(channel: Box<dyn AmqpChannel>, skip_auto_declare: bool) -> Self {
        Self {
            channel,
            skip_auto_declare,
            configured: Vec::new(),
            declared: HashSet::new(),
        }
    }

    pub fn with_queues(mut self, queues: impl IntoIterator<Item = String>) -> Self {
        self.configured.extend(queues);
        self
    }

    async fn declare_configured(&mut self) -> Result<(), PublishError> {
        if self.skip_auto_declare || self.configured.is_empty() {
            return Ok(());
        }
        for queue in self.configured.clone() {
            self.ensure_declared(&queue).await?;
        }
        self.configured.clear();
        Ok(())
    }

    async fn ensure_declared(&mut self, destination: &str) -> Result<(), PublishError> {
        if self.skip_auto_declare || self.declared.contains(destination) {
            return Ok(());
        }
        self.channel.declare_destination(destination).await?;
        info!("Declared RabbitMQ exchange and queue '{}'", destination);
        self.declared.insert(destination.to_string());
        Ok(())
    }
}

#[async_trait]
impl BrokerPublisher for RabbitMqPublisher {
    fn broker_type(&self) -> QueueBrokerType {
        QueueBrokerType::RabbitMq
    }

    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), PublishError> {
        self.declare_configured().await?;
        self.ensure_declared(&message.destination).await?;

        let routing_key = message.routing_key.as_deref().unwrap_or("");
        self.channel
            .publish(&message.destination, routing_key, &message.body, &message.headers)
            .await?;
        debug!(
            "Published message to exchange '{}' with routing key '{}'",
            message.destination, routing_key
        );
        Ok(())
    }

    async fn close(&mut self) {
        self.channel.close().await;
    }
}

/// Lapin-backed channel. Connects on first use and drops the connection on
/// any failure so the next call reconnects.
#[cfg(feature = "rabbitmq")]
pub struct LapinChannel {
    uri: String,
    timeout: Duration,
    session: Option<(Connection, Channel)>,
}

#[cfg(feature = "rabbitmq")]
impl LapinChannel {
    pub fn new(uri: String, timeout_ms: u64) -> Self {
        Self {
            uri,
            timeout: Duration::from_millis(timeout_ms),
            session: None,
        }
    }

    async fn bounded<T>(
        &self,
        operation: impl Future<Output = lapin::Result<T>>,
        on_error: impl FnOnce(lapin::Error) -> PublishError,
    ) -> Result<T, PublishError> {
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(on_error(e)),
            Err(_) => Err(PublishError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    async fn channel(&mut self) -> Result<Channel, PublishError> {
        if let Some((_, channel)) = &self.session {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let connection = self
            .bounded(
                Connection::connect(&self.uri, ConnectionProperties::default()),
                map_connect_error,
            )
            .await?;
        let channel = self
            .bounded(connection.create_channel(), |e| PublishError::Unavailable(e.to_string()))
            .await?;
        self.bounded(
            channel.confirm_select(ConfirmSelectOptions::default()),
            |e| PublishError::Unavailable(e.to_string()),
        )
        .await?;

        info!("Connected to RabbitMQ");
        self.session = Some((connection, channel.clone()));
        Ok(channel)
    }

    async fn declare(&mut self, channel: &Channel, name: &str) -> Result<(), PublishError> {
        let declare_error = |e: lapin::Error| PublishError::Declare {
            destination: name.to_string(),
            reason: e.to_string(),
        };

        self.bounded(
            channel.exchange_declare(
                name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            ),
            declare_error,
        )
        .await?;
        self.bounded(
            channel.queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            ),
            declare_error,
        )
        .await?;
        self.bounded(
            channel.queue_bind(
                name,
                name,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            ),
            declare_error,
        )
        .await
    }

    async fn send(
        &mut self,
        channel: &Channel,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> Result<(), PublishError> {
        let content_type = headers
            .get(HEADER_CONTENT_TYPE)
            .map(String::as_str)
            .unwrap_or(JSON_CONTENT_TYPE);
        let mut table = FieldTable::default();
        for (name, value) in headers.iter().filter(|(name, _)| *name != HEADER_CONTENT_TYPE) {
            table.insert(
                ShortString::from(name.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(content_type.to_string()))
            .with_delivery_mode(2)
            .with_headers(table);

        let confirm = self
            .bounded(
                channel.basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    body,
                    properties,
                ),
                |e| PublishError::Unavailable(e.to_string()),
            )
            .await?;

        match self
            .bounded(confirm, |e| PublishError::Unavailable(e.to_string()))
            .await?
        {
            Confirmation::Nack(_) => Err(PublishError::Rejected {
                destination: exchange.to_string(),
                reason: "broker sent nack".to_string(),
            }),
            Confirmation::Ack(Some(returned)) => Err(PublishError::Rejected {
                destination: exchange.to_string(),
                reason: format!("message returned: {}", returned.reply_text.as_str()),
            }),
            _ => Ok(()),
        }
    }

    fn reset(&mut self, error: &PublishError) {
        if self.session.take().is_some() {
            warn!("Dropping RabbitMQ connection after error: {}", error);
        }
    }
}

#[cfg(feature = "rabbitmq")]
fn map_connect_error(error: lapin::Error) -> PublishError {
    let message = error.to_string();
    if message.contains("ACCESS_REFUSED") || message.to_lowercase().contains("auth") {
        PublishError::Auth(message)
    } else {
        PublishError::Unavailable(message)
    }
}

#[cfg(feature = "rabbitmq")]
#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_destination(&mut self, name: &str) -> Result<(), PublishError> {
        let channel = self.channel().await?;
        let result = self.declare(&channel, name).await;
        if let Err(e) = &result {
            self.reset(e);
        }
        result
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> Result<(), PublishError> {
        let channel = self.channel().await?;
        let result = self.send(&channel, exchange, routing_key, body, headers).await;
        if let Err(e) = &result {
            if !matches!(e, PublishError::Rejected { .. }) {
                self.reset(e);
            }
        }
        result
    }

    async fn close(&mut self) {
        if let Some((connection, _)) = self.session.take() {
            if let Err(e) = connection.close(200, "ETL task stopped").await {
                debug!("RabbitMQ close failed: {}", e);
            }
        }
    }
}
