//! Consumer side of cross-instance sync.
//!
//! One intake task reads the subscription and hands each record to the
//! worker owning its partition. Workers are created on the first record of a
//! partition, so per-key order is kept while partitions proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::config::SyncConfig;
use super::envelope::{EventClass, SyncEnvelope};
use super::log::{DistributedLog, LogError, LogRecord};
use crate::hub::message::Message;
use crate::hub::Hub;
use crate::presence::PresenceRecord;

const WORKER_BUFFER: usize = 256;

/// What a record from the log turns into on this instance.
#[derive(Debug)]
pub enum RemoteEvent {
    /// A message to route to local clients.
    Deliver(Message),
    /// A presence change on another instance.
    Presence(PresenceRecord),
    /// Published by this instance; already delivered here.
    OwnEcho,
    Malformed(String),
    Unsupported(String),
}

/// Decode a record's value relative to `instance_id`.
pub fn interpret(instance_id: &str, value: &[u8]) -> RemoteEvent {
    let envelope = match SyncEnvelope::decode(value) {
        Ok(env) => env,
        Err(e) => return RemoteEvent::Malformed(e.to_string()),
    };
    if envelope.is_from(instance_id) {
        return RemoteEvent::OwnEcho;
    }

    match envelope.class() {
        Some(EventClass::Presence) => match serde_json::from_value(envelope.content) {
            Ok(record) => RemoteEvent::Presence(record),
            Err(e) => RemoteEvent::Malformed(e.to_string()),
        },
        Some(_) => match Message::from_value(envelope.content) {
            Ok(msg) => RemoteEvent::Deliver(msg),
            Err(e) => RemoteEvent::Malformed(e.to_string()),
        },
        None => RemoteEvent::Unsupported(envelope.kind),
    }
}

pub struct SyncConsumer;

impl SyncConsumer {
    /// Join the consumer group and start the intake task.
    pub async fn spawn(
        log: Arc<dyn DistributedLog>,
        config: &SyncConfig,
        instance_id: &str,
        hub: Hub,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, LogError> {
        let topics = config.topics.all();
        let records = log.subscribe(&topics, &config.group_id).await?;
        tracing::info!(
            group_id = %config.group_id,
            topics = ?topics,
            "Sync consumer subscribed"
        );

        let instance_id: Arc<str> = Arc::from(instance_id);
        Ok(tokio::spawn(run_intake(records, instance_id, hub, shutdown)))
    }
}

async fn run_intake(
    mut records: mpsc::Receiver<LogRecord>,
    instance_id: Arc<str>,
    hub: Hub,
    shutdown: CancellationToken,
) {
    let mut workers: HashMap<(String, i32), mpsc::Sender<LogRecord>> = HashMap::new();
    let mut tasks = JoinSet::new();

    loop {
        let record = tokio::select! {
            _ = shutdown.cancelled() => break,
            record = records.recv() => match record {
                Some(record) => record,
                None => {
                    tracing::warn!("Sync subscription ended");
                    break;
                }
            },
        };

        let key = (record.topic.clone(), record.partition);
        let worker = workers.entry(key).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(WORKER_BUFFER);
            tracing::debug!(
                topic = %record.topic,
                partition = record.partition,
                "Starting partition worker"
            );
            tasks.spawn(run_worker(rx, instance_id.clone(), hub.clone()));
            tx
        });
        if worker.send(record).await.is_err() {
            tracing::warn!("Partition worker stopped, dropping record");
        }
    }

    drop(workers);
    tasks.shutdown().await;
    tracing::info!("Sync consumer stopped");
}

async fn run_worker(mut rx: mpsc::Receiver<LogRecord>, instance_id: Arc<str>, hub: Hub) {
    while let Some(record) = rx.recv().await {
        let msg = match interpret(&instance_id, &record.value) {
            RemoteEvent::Deliver(msg) => msg,
            RemoteEvent::Presence(presence) if hub.announces_presence() => presence.announcement(),
            RemoteEvent::Presence(_) => continue,
            RemoteEvent::OwnEcho => continue,
            RemoteEvent::Malformed(reason) => {
                tracing::warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    reason = %reason,
                    "Skipping malformed sync envelope"
                );
                continue;
            }
            RemoteEvent::Unsupported(kind) => {
                tracing::debug!(topic = %record.topic, kind = %kind, "Ignoring unknown envelope type");
                continue;
            }
        };

        if let Err(e) = hub.deliver_local(msg).await {
            tracing::warn!(topic = %record.topic, error = %e, "Failed to deliver remote event");
            if matches!(e, crate::hub::PushError::Stopped) {
                break;
            }
        }
    }
}
