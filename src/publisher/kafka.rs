use crate::types::OutboundMessage;

#[cfg(feature = "kafka")]
use {
    crate::config::{KafkaConnectionSettings, QueueBrokerType},
    crate::error::{EtlError, PublishError},
    crate::publisher::BrokerPublisher,
    async_trait::async_trait,
    rdkafka::config::ClientConfig,
    rdkafka::error::{KafkaError, RDKafkaErrorCode},
    rdkafka::message::{Header, OwnedHeaders},
    rdkafka::producer::{FutureProducer, FutureRecord, Producer},
    std::time::Duration,
    tracing::{debug, info},
};

/// Producer properties applied before the connection string's own options.
pub const KAFKA_DEFAULT_OPTIONS: &[(&str, &str)] = &[
    ("acks", "all"),
    ("enable.idempotence", "true"),
    ("max.in.flight.requests.per.connection", "5"),
    ("linger.ms", "5"),
];

/// Kafka view of an outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaRecord<'a> {
    pub topic: &'a str,
    pub key: &'a str,
    pub headers: Vec<(&'a str, &'a str)>,
    pub payload: &'a [u8],
}

impl<'a> KafkaRecord<'a> {
    /// Destination becomes the topic and the partitioning key becomes the
    /// record key, so all messages for one key land on one partition.
    pub fn from_message(message: &'a OutboundMessage) -> Self {
        Self {
            topic: &message.destination,
            key: message.partitioning_key(),
            headers: message
                .headers
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str()))
                .collect(),
            payload: &message.body,
        }
    }
}

#[cfg(feature = "kafka")]
pub struct KafkaPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

#[cfg(feature = "kafka")]
impl KafkaPublisher {
    pub fn new(settings: &KafkaConnectionSettings, timeout_ms: u64) -> crate::Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .set("message.timeout.ms", timeout_ms.to_string());
        for (name, value) in KAFKA_DEFAULT_OPTIONS {
            client_config.set(*name, *value);
        }
        for (name, value) in &settings.connection_options {
            client_config.set(name, value);
        }

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| EtlError::Config(format!("invalid kafka settings: {e}")))?;

        info!("Kafka producer created for {}", settings.bootstrap_servers);
        Ok(Self {
            producer,
            timeout: Duration::from_millis(timeout_ms),
        })
    }
}

#[cfg(feature = "kafka")]
fn map_kafka_error(error: KafkaError, destination: &str, timeout: Duration) -> PublishError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageTimedOut) => PublishError::Timeout(timeout.as_millis() as u64),
        Some(RDKafkaErrorCode::SaslAuthenticationFailed)
        | Some(RDKafkaErrorCode::TopicAuthorizationFailed) => PublishError::Auth(error.to_string()),
        Some(RDKafkaErrorCode::MessageSizeTooLarge) => PublishError::Encoding(error.to_string()),
        Some(RDKafkaErrorCode::UnknownTopicOrPartition) => PublishError::Rejected {
            destination: destination.to_string(),
            reason: error.to_string(),
        },
        _ => PublishError::Unavailable(error.to_string()),
    }
}

#[cfg(feature = "kafka")]
#[async_trait]
impl BrokerPublisher for KafkaPublisher {
    fn broker_type(&self) -> QueueBrokerType {
        QueueBrokerType::Kafka
    }

    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), PublishError> {
        let record = KafkaRecord::from_message(message);

        let mut headers = OwnedHeaders::new();
        for (name, value) in &record.headers {
            headers = headers.insert(Header {
                key: *name,
                value: Some(*value),
            });
        }

        let future_record = FutureRecord::to(record.topic)
            .key(record.key)
            .payload(record.payload)
            .headers(headers);

        self.producer
            .send(future_record, self.timeout)
            .await
            .map(|_| debug!("Delivered message to topic {}", record.topic))
            .map_err(|(e, _)| map_kafka_error(e, record.topic, self.timeout))
    }

    async fn close(&mut self) {
        if let Err(e) = self.producer.flush(self.timeout) {
            debug!("Kafka producer flush failed on close: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_record_uses_partition_key_and_headers() {
        let mut message = OutboundMessage::new("Orders", "orders/1-A", Bytes::from_static(b"{\"a\":1}"));
        message.headers.insert("ce_type".to_string(), "com.github.users".to_string());
        message.headers.insert("ce_id".to_string(), "orders/1-A".to_string());

        let record = KafkaRecord::from_message(&message);
        assert_eq!(record.topic, "Orders");
        assert_eq!(record.key, "orders/1-A");
        assert_eq!(record.payload, b"{\"a\":1}");
        assert_eq!(
            record.headers,
            vec![("ce_id", "orders/1-A"), ("ce_type", "com.github.users")]
        );

        message.partition_key = Some("companies/1".to_string());
        assert_eq!(KafkaRecord::from_message(&message).key, "companies/1");
    }

    #[cfg(feature = "kafka")]
    #[test]
    fn test_producer_creation_does_not_connect() {
        let settings = KafkaConnectionSettings {
            bootstrap_servers: "localhost:9092".to_string(),
            connection_options: Default::default(),
        };
        let publisher = KafkaPublisher::new(&settings, 1_000).unwrap();
        assert_eq!(publisher.broker_type(), QueueBrokerType::Kafka);
    }
}
