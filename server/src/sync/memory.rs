//! In-process partitioned log with consumer groups.
//!
//! Used for single-node deployments and tests. Partition assignment within a
//! group is `partition % members`; members whose receiver is dropped are
//! pruned on the next publish, which rebalances their partitions.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::log::{DistributedLog, LogError, LogRecord, RecordPosition};

/// Per-subscriber buffer. A full buffer applies backpressure to publishers.
const MEMBER_BUFFER: usize = 1024;

struct Member {
    topics: Vec<String>,
    tx: mpsc::Sender<LogRecord>,
}

#[derive(Default)]
struct LogState {
    next_offset: HashMap<(String, i32), i64>,
    groups: HashMap<String, Vec<Member>>,
}

pub struct MemoryLog {
    partitions: i32,
    state: Mutex<LogState>,
}

impl MemoryLog {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1) as i32,
            state: Mutex::new(LogState::default()),
        }
    }

    /// Stable key-to-partition mapping.
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as i32
    }
}

#[async_trait]
impl DistributedLog for MemoryLog {
    async fn publish(&self, topic: &str, key: &str, value: Vec<u8>) -> Result<RecordPosition, LogError> {
        let partition = self.partition_for(key);

        let (offset, targets) = {
            let mut state = self.state.lock().map_err(|_| LogError::Publish {
                topic: topic.to_string(),
                reason: "log state poisoned".to_string(),
            })?;

            let next = state
                .next_offset
                .entry((topic.to_string(), partition))
                .or_insert(0);
            let offset = *next;
            *next += 1;

            let mut targets = Vec::new();
            for members in state.groups.values_mut() {
                members.retain(|m| !m.tx.is_closed());
                let subscribed: Vec<&Member> = members
                    .iter()
                    .filter(|m| m.topics.iter().any(|t| t == topic))
                    .collect();
                if subscribed.is_empty() {
                    continue;
                }
                let owner = subscribed[partition as usize % subscribed.len()];
                targets.push(owner.tx.clone());
            }
            state.groups.retain(|_, members| !members.is_empty());
            (offset, targets)
        };

        let record = LogRecord {
            topic: topic.to_string(),
            partition,
            offset,
            key: Some(key.to_string()),
            value,
        };
        for tx in targets {
            if tx.send(record.clone()).await.is_err() {
                tracing::debug!(topic, partition, "Subscriber left before delivery");
            }
        }

        Ok(RecordPosition { partition, offset })
    }

    async fn subscribe(&self, topics: &[String], group: &str) -> Result<mpsc::Receiver<LogRecord>, LogError> {
        let (tx, rx) = mpsc::channel(MEMBER_BUFFER);
        let mut state = self
            .state
            .lock()
            .map_err(|_| LogError::Subscribe("log state poisoned".to_string()))?;
        state.groups.entry(group.to_string()).or_default().push(Member {
            topics: topics.to_vec(),
            tx,
        });
        Ok(rx)
    }
}
