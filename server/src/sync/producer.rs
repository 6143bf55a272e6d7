//! Producer side of cross-instance sync.
//!
//! Callers enqueue without blocking; a single task drains the queue and
//! publishes with per-attempt timeout and bounded retry. Failures are logged
//! and dropped. Local delivery never waits on this path.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::{SyncConfig, TopicConfig};
use super::envelope::{partition_key, EventClass, SyncEnvelope};
use super::log::{DistributedLog, LogError, RecordPosition};
use crate::hub::message::Message;
use crate::presence::PresenceRecord;

struct Outgoing {
    topic: String,
    key: String,
    value: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    retries: u32,
    timeout: Duration,
    backoff: Duration,
}

/// Cheap, cloneable publishing handle.
#[derive(Clone)]
pub struct SyncProducer {
    tx: mpsc::Sender<Outgoing>,
    instance_id: Arc<str>,
    topics: Arc<TopicConfig>,
}

impl SyncProducer {
    /// Start the producer task.
    pub fn spawn(
        log: Arc<dyn DistributedLog>,
        config: &SyncConfig,
        instance_id: &str,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.producer_queue.max(1));
        let policy = RetryPolicy {
            retries: config.publish_retries,
            timeout: Duration::from_millis(config.publish_timeout_ms),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        };
        let task = tokio::spawn(run_producer(log, rx, policy, shutdown));
        let producer = Self {
            tx,
            instance_id: Arc::from(instance_id),
            topics: Arc::new(config.topics.clone()),
        };
        (producer, task)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Queue a locally handled message for the other instances.
    pub fn publish_message(&self, msg: &Message) -> bool {
        match SyncEnvelope::for_message(&self.instance_id, msg) {
            Ok((class, envelope)) => self.enqueue(class, partition_key(msg), &envelope),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to wrap message for sync");
                false
            }
        }
    }

    /// Queue a presence change, keyed by user id.
    pub fn publish_presence(&self, record: &PresenceRecord) -> bool {
        match SyncEnvelope::for_presence(&self.instance_id, record) {
            Ok(envelope) => self.enqueue(EventClass::Presence, record.user_id.clone(), &envelope),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to wrap presence change for sync");
                false
            }
        }
    }

    fn enqueue(&self, class: EventClass, key: String, envelope: &SyncEnvelope) -> bool {
        let value = match envelope.encode() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode sync envelope");
                return false;
            }
        };
        let topic = self.topics.topic_for(class).to_string();
        match self.tx.try_send(Outgoing { topic, key, value }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(out)) => {
                tracing::warn!(topic = %out.topic, key = %out.key, "Sync producer queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Sync producer stopped, dropping event");
                false
            }
        }
    }
}

async fn run_producer(
    log: Arc<dyn DistributedLog>,
    mut rx: mpsc::Receiver<Outgoing>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
) {
    loop {
        let out = tokio::select! {
            _ = shutdown.cancelled() => break,
            out = rx.recv() => match out {
                Some(out) => out,
                None => break,
            },
        };

        match publish_with_retry(log.as_ref(), &out, policy).await {
            Ok(pos) => tracing::debug!(
                topic = %out.topic,
                key = %out.key,
                partition = pos.partition,
                offset = pos.offset,
                "Published sync envelope"
            ),
            Err(e) => tracing::warn!(
                topic = %out.topic,
                key = %out.key,
                error = %e,
                "Dropping sync envelope after retries"
            ),
        }
    }
    tracing::info!("Sync producer stopped");
}

async fn publish_with_retry(
    log: &dyn DistributedLog,
    out: &Outgoing,
    policy: RetryPolicy,
) -> Result<RecordPosition, LogError> {
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(
            policy.timeout,
            log.publish(&out.topic, &out.key, out.value.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LogError::Timeout {
                topic: out.topic.clone(),
            }),
        };

        match result {
            Ok(pos) => return Ok(pos),
            Err(e) if attempt < policy.retries => {
                attempt += 1;
                tracing::debug!(topic = %out.topic, attempt, error = %e, "Retrying publish");
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}
