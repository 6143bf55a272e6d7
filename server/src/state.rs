use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chat::history::{MemoryMessageStore, MessageStore, SqliteMessageStore};
use crate::chat::rooms::{MemoryRoomMembership, RoomMembership, SqliteRoomMembership};
use crate::config::{Config, StorageBackend};
use crate::db::{self, StoreError};
use crate::hub::{new_local_index, Hub};
use crate::longpoll::LongPollRegistry;
use crate::presence::{MemoryPresenceStore, PresenceStore, PresenceTracker, SqlitePresenceStore};
use crate::sync::{self, DistributedLog, LogError, SyncConsumer, SyncProducer};

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Connection registry and router
    pub hub: Hub,
    /// Waiting long-poll requests
    pub longpoll: LongPollRegistry,
    pub presence: PresenceTracker,
    pub messages: Arc<dyn MessageStore>,
    pub rooms: Arc<dyn RoomMembership>,
}

/// Collaborators supplied from outside. Anything left `None` is built from
/// the configuration.
#[derive(Default)]
pub struct Backends {
    pub log: Option<Arc<dyn DistributedLog>>,
    pub presence_store: Option<Arc<dyn PresenceStore>>,
    pub messages: Option<Arc<dyn MessageStore>>,
    pub rooms: Option<Arc<dyn RoomMembership>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Log(#[from] LogError),
}

impl AppState {
    /// Build the stores, start the producer, hub and consumer tasks, and
    /// return the state with the handles of the background tasks. All tasks
    /// stop when `shutdown` is cancelled.
    pub async fn start(
        config: Config,
        backends: Backends,
        shutdown: CancellationToken,
    ) -> Result<(Self, Vec<JoinHandle<()>>), StartupError> {
        let instance_id = config
            .instance_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(sync::generate_instance_id);

        let needs_db = backends.presence_store.is_none()
            || backends.messages.is_none()
            || backends.rooms.is_none();
        let pool = match config.storage {
            StorageBackend::Sqlite if needs_db => Some(db::init_db(&config.data_dir)?),
            _ => None,
        };

        let presence_store: Arc<dyn PresenceStore> = match (backends.presence_store, &pool) {
            (Some(store), _) => store,
            (None, Some(pool)) => Arc::new(SqlitePresenceStore::new(pool.clone())),
            (None, None) => Arc::new(MemoryPresenceStore::new()),
        };
        let messages: Arc<dyn MessageStore> = match (backends.messages, &pool) {
            (Some(store), _) => store,
            (None, Some(pool)) => Arc::new(SqliteMessageStore::new(pool.clone())),
            (None, None) => Arc::new(MemoryMessageStore::new()),
        };
        let rooms: Arc<dyn RoomMembership> = match (backends.rooms, &pool) {
            (Some(rooms), _) => rooms,
            (None, Some(pool)) => Arc::new(SqliteRoomMembership::new(pool.clone())),
            (None, None) => Arc::new(MemoryRoomMembership::new()),
        };

        let mut tasks = Vec::new();
        let log = if config.sync.enabled {
            Some(match backends.log {
                Some(log) => log,
                None => sync::connect(&config.sync)?,
            })
        } else {
            tracing::warn!("Cross-instance sync disabled, messages stay on this instance");
            None
        };

        let producer = log.as_ref().map(|log| {
            let (producer, task) =
                SyncProducer::spawn(log.clone(), &config.sync, &instance_id, shutdown.clone());
            tasks.push(task);
            producer
        });

        let index = new_local_index();
        let presence = PresenceTracker::new(presence_store, index.clone(), &instance_id, producer.clone());
        let (hub, hub_task) = Hub::spawn(
            &config.hub,
            index,
            &instance_id,
            Some(presence.clone()),
            producer,
            shutdown.clone(),
        );
        tasks.push(hub_task);

        if let Some(log) = log {
            let consumer =
                SyncConsumer::spawn(log, &config.sync, &instance_id, hub.clone(), shutdown.clone())
                    .await?;
            tasks.push(consumer);
        }

        tracing::info!(
            instance_id = %instance_id,
            storage = ?config.storage,
            sync = config.sync.enabled,
            "Push hub started"
        );

        let state = Self {
            config: Arc::new(config),
            hub,
            longpoll: LongPollRegistry::new(),
            presence,
            messages,
            rooms,
        };
        Ok((state, tasks))
    }
}
