//! Local notifications

use crate::error::{Error, Result};
use crate::hash::{decode_row, encode_row, joined_hex};
use crate::op::{ActorId, EntityId};
use concord_storage::{Predicate, Row, Storage, Table};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// Someone replied to a post or comment authored locally
    Reply,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    /// The reply that triggered the notification
    pub target_id: EntityId,
    pub from_actor: ActorId,
    pub title: String,
    pub created_at: i64,
    pub read: bool,
}

impl Notification {
    /// Reply notification for `local`; the id depends only on recipient and reply
    pub fn reply(
        local: &ActorId,
        reply_id: EntityId,
        from_actor: ActorId,
        title: impl Into<String>,
        created_at: i64,
    ) -> Self {
        Self {
            id: joined_hex(&[local.as_str(), reply_id.as_str()]),
            kind: NotificationKind::Reply,
            target_id: reply_id,
            from_actor,
            title: title.into(),
            created_at,
            read: false,
        }
    }
}

/// Append-only notification inbox
pub struct NotificationStore {
    storage: Arc<dyn Storage>,
    items: DashMap<String, Notification>,
    writes: Mutex<()>,
}

impl NotificationStore {
    pub async fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let items = DashMap::new();
        for row in storage
            .query(Table::Notifications, &Predicate::All, None)
            .await?
        {
            let n: Notification = decode_row(&row.value)?;
            items.insert(n.id.clone(), n);
        }
        Ok(Self {
            storage,
            items,
            writes: Mutex::new(()),
        })
    }

    /// Add unless already present; returns whether it was new
    pub async fn add(&self, notification: Notification) -> Result<bool> {
        let _guard = self.writes.lock().await;
        if self.items.contains_key(&notification.id) {
            return Ok(false);
        }
        self.persist(&notification).await?;
        self.items.insert(notification.id.clone(), notification);
        Ok(true)
    }

    pub async fn mark_read(&self, id: &str) -> Result<()> {
        let _guard = self.writes.lock().await;
        let mut n = self
            .items
            .get(id)
            .map(|n| n.value().clone())
            .ok_or_else(|| Error::not_found(format!("notification {}", id)))?;
        if n.read {
            return Ok(());
        }
        n.read = true;
        self.persist(&n).await?;
        self.items.insert(n.id.clone(), n);
        Ok(())
    }

    /// Newest first
    pub fn list(&self) -> Vec<Notification> {
        let mut all: Vec<_> = self.items.iter().map(|n| n.value().clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    async fn persist(&self, n: &Notification) -> Result<()> {
        self.storage
            .put(
                Table::Notifications,
                Row::new(n.id.as_str(), n.created_at, encode_row(n)?),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_storage::MemoryStorage;

    #[tokio::test]
    async fn test_add_and_mark_read() {
        let store = NotificationStore::open(Arc::new(MemoryStorage::new())).await.unwrap();
        let n = Notification::reply(
            &ActorId::from("alice"),
            EntityId::from("c1"),
            ActorId::from("bob"),
            "nice post",
            10,
        );

        assert!(store.add(n.clone()).await.unwrap());
        assert!(!store.add(n.clone()).await.unwrap());
        assert_eq!(store.unread_count(), 1);

        store.mark_read(&n.id).await.unwrap();
        assert_eq!(store.unread_count(), 0);
        assert!(store.list()[0].read);
        assert!(store.mark_read("missing").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_are_new_once() {
        let store = Arc::new(NotificationStore::open(Arc::new(MemoryStorage::new())).await.unwrap());
        let n = Notification::reply(
            &ActorId::from("alice"),
            EntityId::from("c1"),
            ActorId::from("bob"),
            "again",
            10,
        );

        let mut handles = Vec::new();
        for _ in 0..16 {
            let (store, n) = (store.clone(), n.clone());
            handles.push(tokio::spawn(async move { store.add(n).await.unwrap() }));
        }
        let mut fresh = 0;
        for handle in handles {
            fresh += usize::from(handle.await.unwrap());
        }
        assert_eq!(fresh, 1);
        assert_eq!(store.unread_count(), 1);
    }
}
