//! Distributed log abstraction used for cross-instance synchronization.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// A record read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Vec<u8>,
}

/// Where an acknowledged record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPosition {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("publish to {topic} timed out")]
    Timeout { topic: String },
    #[error("log backend unavailable: {0}")]
    Backend(String),
}

/// A partitioned, keyed log shared by every instance of the fleet.
///
/// Records with the same key always land on the same partition. Within a
/// consumer group every partition is read by exactly one subscriber.
#[async_trait]
pub trait DistributedLog: Send + Sync {
    /// Append a record and wait for the backend's acknowledgment.
    async fn publish(&self, topic: &str, key: &str, value: Vec<u8>) -> Result<RecordPosition, LogError>;

    /// Join `group` and receive records from the partitions assigned to this
    /// subscriber. The stream ends when the subscription is torn down.
    async fn subscribe(&self, topics: &[String], group: &str) -> Result<mpsc::Receiver<LogRecord>, LogError>;
}
