//! Content-addressed blob store

use crate::error::{Error, Result};
use crate::hash::sha256_hex;
use concord_storage::{Row, Storage, Table};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const CID_PREFIX: &str = "cid-";

string_id!(
    /// `"cid-" + hex(sha256(bytes))`
    ContentId
);

impl ContentId {
    pub fn of(bytes: &[u8]) -> Self {
        Self::new(format!("{}{}", CID_PREFIX, sha256_hex(bytes)))
    }

    /// True when `bytes` hash to this id
    pub fn matches(&self, bytes: &[u8]) -> bool {
        *self == Self::of(bytes)
    }
}

/// Immutable blob store keyed by content hash
pub struct ContentStore {
    storage: Arc<dyn Storage>,
}

impl ContentStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Store `bytes`, returning their id. Storing the same bytes twice is a no-op.
    pub async fn put(&self, bytes: &[u8]) -> Result<ContentId> {
        let id = ContentId::of(bytes);
        if !self.contains(&id).await? {
            self.storage
                .put(Table::Content, Row::new(id.as_str(), 0, bytes.to_vec()))
                .await?;
            debug!(content = %id, size = bytes.len(), "Stored content");
        }
        Ok(id)
    }

    /// Store bytes fetched from a peer under the id they were requested by
    pub async fn put_verified(&self, id: &ContentId, bytes: &[u8]) -> Result<()> {
        if !id.matches(bytes) {
            return Err(Error::validation(format!(
                "content hash mismatch for {}",
                id
            )));
        }
        self.put(bytes).await?;
        Ok(())
    }

    pub async fn get(&self, id: &ContentId) -> Result<Vec<u8>> {
        self.storage
            .get(Table::Content, id.as_str())
            .await?
            .map(|row| row.value)
            .ok_or_else(|| Error::not_found(format!("content {}", id)))
    }

    pub async fn contains(&self, id: &ContentId) -> Result<bool> {
        Ok(self.storage.get(Table::Content, id.as_str()).await?.is_some())
    }
}

/// Body of a post or comment as stored in the content store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumContent {
    /// Posts carry a title, comments do not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub body: String,
}

impl ForumContent {
    pub fn post(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            body: body.into(),
        }
    }

    pub fn comment(body: impl Into<String>) -> Self {
        Self {
            title: None,
            body: body.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Short single-line preview used in notifications
    pub fn preview(&self, max_chars: usize) -> String {
        let text = self.title.as_deref().unwrap_or(&self.body);
        let line = text.lines().next().unwrap_or_default().trim();
        if line.chars().count() <= max_chars {
            line.to_string()
        } else {
            let cut: String = line.chars().take(max_chars).collect();
            format!("{}...", cut)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_storage::MemoryStorage;

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = ContentStore::new(Arc::new(MemoryStorage::new()));

        let a = store.put(b"hello forum").await.unwrap();
        let b = store.put(b"hello forum").await.unwrap();
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("cid-"));
        assert_eq!(store.get(&a).await.unwrap(), b"hello forum");
    }

    #[tokio::test]
    async fn test_missing_content_is_not_found() {
        let store = ContentStore::new(Arc::new(MemoryStorage::new()));
        let err = store.get(&ContentId::of(b"nope")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_put_verified_rejects_mismatch() {
        let store = ContentStore::new(Arc::new(MemoryStorage::new()));
        let id = ContentId::of(b"original");

        assert!(store.put_verified(&id, b"tampered").await.is_err());
        assert!(!store.contains(&id).await.unwrap());

        store.put_verified(&id, b"original").await.unwrap();
        assert!(store.contains(&id).await.unwrap());
    }

    #[test]
    fn test_preview_truncates() {
        let content = ForumContent::comment("a fairly long first line\nsecond line");
        assert_eq!(content.preview(8), "a fairly...");
        assert_eq!(ForumContent::post("Title", "body").preview(20), "Title");
    }
}
