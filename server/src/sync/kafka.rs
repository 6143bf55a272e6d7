//! Kafka-backed [`DistributedLog`].

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tokio::sync::mpsc;

use super::config::SyncConfig;
use super::log::{DistributedLog, LogError, LogRecord, RecordPosition};

const SUBSCRIPTION_BUFFER: usize = 1024;

pub struct KafkaLog {
    producer: FutureProducer,
    brokers: String,
    queue_timeout: Duration,
}

impl KafkaLog {
    /// Create the producer. Records are acknowledged by all in-sync replicas.
    pub fn connect(config: &SyncConfig) -> Result<Self, LogError> {
        let brokers = config.brokers.join(",");
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("acks", "all")
            .set("message.timeout.ms", config.publish_timeout_ms.to_string())
            .create()
            .map_err(|e| LogError::Backend(e.to_string()))?;

        tracing::info!(brokers = %brokers, "Kafka producer created");
        Ok(Self {
            producer,
            brokers,
            queue_timeout: Duration::from_millis(config.publish_timeout_ms),
        })
    }
}

#[async_trait]
impl DistributedLog for KafkaLog {
    async fn publish(&self, topic: &str, key: &str, value: Vec<u8>) -> Result<RecordPosition, LogError> {
        let record = FutureRecord::to(topic).key(key).payload(&value);
        match self
            .producer
            .send(record, Timeout::After(self.queue_timeout))
            .await
        {
            Ok((partition, offset)) => Ok(RecordPosition { partition, offset }),
            Err((e, _)) => Err(LogError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn subscribe(&self, topics: &[String], group: &str) -> Result<mpsc::Receiver<LogRecord>, LogError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()
            .map_err(|e| LogError::Subscribe(e.to_string()))?;

        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&names)
            .map_err(|e| LogError::Subscribe(e.to_string()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            loop {
                let record = tokio::select! {
                    _ = tx.closed() => break,
                    received = consumer.recv() => match received {
                        Ok(msg) => LogRecord {
                            topic: msg.topic().to_string(),
                            partition: msg.partition(),
                            offset: msg.offset(),
                            key: msg.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                            value: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                        },
                        Err(e) => {
                            tracing::warn!(error = %e, "Kafka receive error");
                            continue;
                        }
                    },
                };
                if tx.send(record).await.is_err() {
                    break;
                }
            }
            tracing::debug!("Kafka subscription closed");
        });
        Ok(rx)
    }
}
