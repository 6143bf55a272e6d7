use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::store::PresenceStore;
use super::PresenceRecord;
use crate::db::StoreError;
use crate::hub::LocalIndex;
use crate::sync::SyncProducer;

/// Answer to "is this user online, and where".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceView {
    pub user_id: String,
    pub online: bool,
    pub instance_id: String,
    /// True when the user holds a connection on this instance.
    pub local: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OnlineUser {
    pub user_id: String,
    pub instance_id: String,
}

/// Records presence changes in the shared store and replicates them to the
/// rest of the fleet.
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
    index: LocalIndex,
    instance_id: Arc<str>,
    producer: Option<SyncProducer>,
}

impl PresenceTracker {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        index: LocalIndex,
        instance_id: &str,
        producer: Option<SyncProducer>,
    ) -> Self {
        Self {
            store,
            index,
            instance_id: Arc::from(instance_id),
            producer,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Persist `{online, instance=self}` and publish the change.
    pub async fn mark_online(&self, user_id: &str) -> Result<(), StoreError> {
        self.record(PresenceRecord::online(user_id, &self.instance_id))
            .await
    }

    /// Persist `{offline, instance=""}` and publish the change.
    pub async fn mark_offline(&self, user_id: &str) -> Result<(), StoreError> {
        self.record(PresenceRecord::offline(user_id)).await
    }

    /// The change is published even when the store write fails, so the
    /// other instances still learn about it.
    async fn record(&self, record: PresenceRecord) -> Result<(), StoreError> {
        let stored = self.store.set_status(&record).await;
        if let Some(producer) = &self.producer {
            producer.publish_presence(&record);
        }
        match &stored {
            Ok(()) => tracing::debug!(
                user_id = %record.user_id,
                status = record.status.as_str(),
                "Presence updated"
            ),
            Err(e) => tracing::warn!(
                user_id = %record.user_id,
                status = record.status.as_str(),
                error = %e,
                "Failed to persist presence"
            ),
        }
        stored
    }

    /// Local registry first, then the shared store.
    pub async fn lookup(&self, user_id: &str) -> Result<PresenceView, StoreError> {
        if self.index.contains_key(user_id) {
            return Ok(PresenceView {
                user_id: user_id.to_string(),
                online: true,
                instance_id: self.instance_id.to_string(),
                local: true,
            });
        }

        let record = self.store.get_status(user_id).await?;
        Ok(match record {
            Some(record) if record.is_online() => PresenceView {
                user_id: user_id.to_string(),
                online: true,
                instance_id: record.instance_id,
                local: false,
            },
            _ => PresenceView {
                user_id: user_id.to_string(),
                online: false,
                instance_id: String::new(),
                local: false,
            },
        })
    }

    pub async fn is_online(&self, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.lookup(user_id).await?.online)
    }

    /// Users online anywhere in the fleet, local connections taking
    /// precedence over store records.
    pub async fn online_users(&self) -> Result<Vec<OnlineUser>, StoreError> {
        let mut users: BTreeMap<String, String> = self
            .store
            .online_users()
            .await?
            .into_iter()
            .map(|r| (r.user_id, r.instance_id))
            .collect();
        for entry in self.index.iter() {
            users.insert(entry.key().clone(), self.instance_id.to_string());
        }
        Ok(users
            .into_iter()
            .map(|(user_id, instance_id)| OnlineUser {
                user_id,
                instance_id,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::registry::{new_local_index, LocalEntry};
    use crate::presence::store::MemoryPresenceStore;
    use crate::presence::PresenceStatus;

    fn tracker(store: Arc<MemoryPresenceStore>, index: LocalIndex) -> PresenceTracker {
        PresenceTracker::new(store, index, "instance-self", None)
    }

    fn local_entry() -> LocalEntry {
        LocalEntry {
            room: None,
            transport: "socket",
            connected_at: 0,
        }
    }

    #[tokio::test]
    async fn test_mark_online_then_offline() {
        let store = Arc::new(MemoryPresenceStore::new());
        let t = tracker(store.clone(), new_local_index());

        t.mark_online("u1").await.unwrap();
        let rec = store.get_status("u1").await.unwrap().unwrap();
        assert_eq!(rec.status, PresenceStatus::Online);
        assert_eq!(rec.instance_id, "instance-self");

        t.mark_offline("u1").await.unwrap();
        let rec = store.get_status("u1").await.unwrap().unwrap();
        assert_eq!(rec.status, PresenceStatus::Offline);
        assert_eq!(rec.instance_id, "");
    }

    #[tokio::test]
    async fn test_lookup_prefers_local_index() {
        let store = Arc::new(MemoryPresenceStore::new());
        let index = new_local_index();
        index.insert("here".to_string(), local_entry());
        store
            .set_status(&PresenceRecord::online("elsewhere", "instance-2"))
            .await
            .unwrap();
        let t = tracker(store, index);

        let here = t.lookup("here").await.unwrap();
        assert!(here.online && here.local);
        assert_eq!(here.instance_id, "instance-self");

        let elsewhere = t.lookup("elsewhere").await.unwrap();
        assert!(elsewhere.online && !elsewhere.local);
        assert_eq!(elsewhere.instance_id, "instance-2");

        assert!(!t.is_online("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn test_online_users_merges_local_and_store() {
        let store = Arc::new(MemoryPresenceStore::new());
        let index = new_local_index();
        index.insert("a".to_string(), local_entry());
        store.set_status(&PresenceRecord::online("b", "instance-2")).await.unwrap();
        store.set_status(&PresenceRecord::offline("c")).await.unwrap();
        let t = tracker(store, index);

        let users = t.online_users().await.unwrap();
        assert_eq!(
            users,
            vec![
                OnlineUser { user_id: "a".into(), instance_id: "instance-self".into() },
                OnlineUser { user_id: "b".into(), instance_id: "instance-2".into() },
            ]
        );
    }
}
