use serde::{Deserialize, Serialize};

use super::envelope::EventClass;

/// Which distributed log implementation to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    /// In-process log; only fans out between hubs inside one process.
    Memory,
    /// Kafka cluster (requires the `kafka` cargo feature).
    Kafka,
}

/// Cross-instance synchronization settings.
/// Exposed in `push-hub.toml` under the `[sync]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Publish local events and consume remote ones (default: true)
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Log backend (default: memory)
    #[serde(default = "default_backend")]
    pub backend: LogBackend,

    /// Kafka bootstrap servers
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,

    /// Consumer group id. Instances sharing a group split the partitions
    /// between them.
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Partition count for the memory backend (default: 8)
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    #[serde(default)]
    pub topics: TopicConfig,

    /// Capacity of the producer queue; events are dropped when it is full
    #[serde(default = "default_producer_queue")]
    pub producer_queue: usize,

    /// Retries after the first failed publish attempt (default: 5)
    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,

    /// Per-attempt publish timeout in milliseconds (default: 5000)
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Linear backoff step between attempts in milliseconds (default: 100)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            backend: default_backend(),
            brokers: default_brokers(),
            group_id: default_group_id(),
            partitions: default_partitions(),
            topics: TopicConfig::default(),
            producer_queue: default_producer_queue(),
            publish_retries: default_publish_retries(),
            publish_timeout_ms: default_publish_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Topic names per event class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    #[serde(default = "default_user_topic")]
    pub user: String,
    #[serde(default = "default_room_topic")]
    pub room: String,
    #[serde(default = "default_system_topic")]
    pub system: String,
    #[serde(default = "default_presence_topic")]
    pub presence: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            user: default_user_topic(),
            room: default_room_topic(),
            system: default_system_topic(),
            presence: default_presence_topic(),
        }
    }
}

impl TopicConfig {
    pub fn topic_for(&self, class: EventClass) -> &str {
        match class {
            EventClass::User => &self.user,
            EventClass::Room => &self.room,
            EventClass::System => &self.system,
            EventClass::Presence => &self.presence,
        }
    }

    pub fn all(&self) -> Vec<String> {
        EventClass::ALL
            .iter()
            .map(|c| self.topic_for(*c).to_string())
            .collect()
    }
}

fn default_enabled() -> bool {
    true
}

fn default_backend() -> LogBackend {
    LogBackend::Memory
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_group_id() -> String {
    "push-hub".to_string()
}

fn default_partitions() -> u32 {
    8
}

fn default_producer_queue() -> usize {
    1024
}

fn default_publish_retries() -> u32 {
    5
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_user_topic() -> String {
    "user_messages".to_string()
}

fn default_room_topic() -> String {
    "room_messages".to_string()
}

fn default_system_topic() -> String {
    "system_messages".to_string()
}

fn default_presence_topic() -> String {
    "online_status".to_string()
}
