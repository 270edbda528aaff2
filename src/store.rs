//! Optional durable backing for the result cache
//!
//! The cache only needs get/put/evict from a store. [`SledStore`] keeps
//! results across restarts; [`MemoryStore`] is a process-local stand-in.

use crate::artifact::ArtifactRef;
use crate::core::errors::Result;
use crate::key::GenerationKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result as persisted by a store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub key: GenerationKey,
    pub result_ref: ArtifactRef,
    pub created_at: DateTime<Utc>,
}

impl StoredArtifact {
    pub fn new(key: GenerationKey, result_ref: ArtifactRef) -> Self {
        Self {
            key,
            result_ref,
            created_at: Utc::now(),
        }
    }

    /// Wall-clock age; zero if the clock went backwards
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Storage trait for completed results
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get(&self, key: &GenerationKey) -> Result<Option<StoredArtifact>>;

    async fn put(&self, artifact: &StoredArtifact) -> Result<()>;

    /// Remove results created more than `max_age` ago
    async fn evict(&self, max_age: Duration) -> Result<usize>;
}

/// Sled-backed store, values encoded with bincode
pub struct SledStore {
    db: sled::Db,
    artifacts: sled::Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let artifacts = db.open_tree("artifacts")?;
        info!(path = %path.as_ref().display(), entries = artifacts.len(), "opened artifact store");
        Ok(Self { db, artifacts })
    }

    /// Flush pending writes
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for SledStore {
    async fn get(&self, key: &GenerationKey) -> Result<Option<StoredArtifact>> {
        match self.artifacts.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, artifact: &StoredArtifact) -> Result<()> {
        let bytes = bincode::serialize(artifact)?;
        self.artifacts.insert(artifact.key.as_bytes(), bytes)?;
        Ok(())
    }

    async fn evict(&self, max_age: Duration) -> Result<usize> {
        let now = Utc::now();
        let mut expired = Vec::new();
        for item in self.artifacts.iter() {
            let (raw_key, bytes) = item?;
            match bincode::deserialize::<StoredArtifact>(&bytes) {
                Ok(artifact) if artifact.age(now) > max_age => expired.push(raw_key),
                Ok(_) => {}
                Err(e) => {
                    warn!("Dropping undecodable artifact entry: {}", e);
                    expired.push(raw_key);
                }
            }
        }

        let mut evicted = 0;
        for raw_key in expired {
            if self.artifacts.remove(raw_key)?.is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, "evicted artifacts from sled store");
        }
        Ok(evicted)
    }
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    artifacts: DashMap<GenerationKey, StoredArtifact>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn get(&self, key: &GenerationKey) -> Result<Option<StoredArtifact>> {
        Ok(self.artifacts.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, artifact: &StoredArtifact) -> Result<()> {
        self.artifacts.insert(artifact.key, artifact.clone());
        Ok(())
    }

    async fn evict(&self, max_age: Duration) -> Result<usize> {
        let now = Utc::now();
        let before = self.artifacts.len();
        self.artifacts.retain(|_, artifact| artifact.age(now) <= max_age);
        Ok(before.saturating_sub(self.artifacts.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn artifact(n: u8, age: Duration) -> StoredArtifact {
        let mut stored = StoredArtifact::new(
            GenerationKey::from_bytes([n; 32]),
            ArtifactRef::new(format!("https://cdn/img{}", n)),
        );
        stored.created_at = Utc::now() - chrono::Duration::from_std(age).unwrap();
        stored
    }

    async fn exercise(store: &dyn ArtifactStore) {
        let fresh = artifact(1, Duration::from_secs(5));
        let stale = artifact(2, Duration::from_secs(7200));
        store.put(&fresh).await.unwrap();
        store.put(&stale).await.unwrap();

        assert_eq!(store.get(&fresh.key).await.unwrap(), Some(fresh.clone()));
        assert_eq!(
            store.get(&GenerationKey::from_bytes([3; 32])).await.unwrap(),
            None
        );

        assert_eq!(store.evict(Duration::from_secs(3600)).await.unwrap(), 1);
        assert_eq!(store.evict(Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(store.get(&stale.key).await.unwrap().is_none());
        assert!(store.get(&fresh.key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        exercise(&store).await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_sled_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path().join("artifacts")).unwrap();
        exercise(&store).await;
        store.flush().await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_sled_overwrite_keeps_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        let mut first = artifact(4, Duration::from_secs(1));
        store.put(&first).await.unwrap();
        first.result_ref = ArtifactRef::new("https://cdn/replaced");
        store.put(&first).await.unwrap();

        let loaded = store.get(&first.key).await.unwrap().unwrap();
        assert_eq!(loaded.result_ref.as_str(), "https://cdn/replaced");
        assert_eq!(store.len(), 1);
    }
}
