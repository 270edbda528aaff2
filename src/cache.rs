use crate::artifact::ArtifactRef;
use crate::core::config::{CoalescerConfig, TtlPolicy};
use crate::key::GenerationKey;
use crate::store::{ArtifactStore, StoredArtifact};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for cache behavior
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Time-to-live for entries
    pub ttl: Duration,
    pub ttl_policy: TtlPolicy,
    /// Maximum number of entries (None = unbounded)
    pub max_entries: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 24 * 3600),
            ttl_policy: TtlPolicy::Absolute,
            max_entries: None,
        }
    }
}

impl From<&CoalescerConfig> for CacheConfig {
    fn from(config: &CoalescerConfig) -> Self {
        Self {
            ttl: config.cache_ttl,
            ttl_policy: config.ttl_policy,
            max_entries: config.cache_max_entries,
        }
    }
}

/// Cache entry with metadata
#[derive(Debug, Clone)]
pub struct ResultCacheEntry {
    pub key: GenerationKey,
    pub result_ref: ArtifactRef,
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    created: Instant,
    last_accessed: Instant,
}

impl ResultCacheEntry {
    fn new(key: GenerationKey, result_ref: ArtifactRef) -> Self {
        let now = Utc::now();
        let instant = Instant::now();
        Self {
            key,
            result_ref,
            access_count: 0,
            created_at: now,
            last_accessed_at: now,
            created: instant,
            last_accessed: instant,
        }
    }

    /// Rebuild an entry loaded from the durable store, keeping its age
    fn restored(stored: StoredArtifact, age: Duration) -> Self {
        let instant = Instant::now();
        let created = instant.checked_sub(age).unwrap_or(instant);
        Self {
            key: stored.key,
            result_ref: stored.result_ref,
            access_count: 0,
            created_at: stored.created_at,
            last_accessed_at: Utc::now(),
            created,
            last_accessed: instant,
        }
    }

    fn access(&mut self) {
        self.access_count += 1;
        self.last_accessed_at = Utc::now();
        self.last_accessed = Instant::now();
    }

    fn is_expired(&self, now: Instant, config: &CacheConfig) -> bool {
        let since = match config.ttl_policy {
            TtlPolicy::Absolute => self.created,
            TtlPolicy::Sliding => self.last_accessed,
        };
        now.saturating_duration_since(since) >= config.ttl
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub eviction_count: u64,
    pub store_hit_count: u64,
    pub store_error_count: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    store_hits: AtomicU64,
    store_errors: AtomicU64,
}

/// Completed results keyed by generation key.
///
/// Sharded map, so lookups and inserts on different keys do not share a
/// lock. With a store attached, `put` writes through and an in-memory miss
/// reads through.
pub struct ResultCache {
    entries: DashMap<GenerationKey, ResultCacheEntry>,
    config: CacheConfig,
    store: Option<Arc<dyn ArtifactStore>>,
    counters: Counters,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            store: None,
            counters: Counters::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a completed result, bumping its access stats on a hit
    pub async fn get(&self, key: &GenerationKey) -> Option<ArtifactRef> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now, &self.config) {
                entry.access();
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.result_ref.clone());
            }
        }
        // expired entries read as misses and are dropped on the spot
        if self
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now, &self.config))
            .is_some()
        {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(artifact) = self.read_through(key).await {
            return Some(artifact);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn read_through(&self, key: &GenerationKey) -> Option<ArtifactRef> {
        let store = self.store.as_ref()?;
        let stored = match store.get(key).await {
            Ok(stored) => stored?,
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, "Artifact store lookup failed: {}", e);
                return None;
            }
        };

        // the store keeps no access history, so its age counts from creation
        // even under a sliding TTL
        let age = stored.age(Utc::now());
        if age >= self.config.ttl {
            return None;
        }

        let mut entry = ResultCacheEntry::restored(stored, age);
        entry.access();
        let artifact = entry.result_ref.clone();
        self.entries.entry(*key).or_insert(entry);
        self.counters.store_hits.fetch_add(1, Ordering::Relaxed);
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "restored result from artifact store");
        Some(artifact)
    }

    /// Store a completed result, replacing any previous one for the key
    pub async fn put(&self, key: GenerationKey, result_ref: ArtifactRef) {
        let entry = ResultCacheEntry::new(key, result_ref.clone());
        let stored = StoredArtifact {
            key,
            result_ref,
            created_at: entry.created_at,
        };
        self.entries.insert(key, entry);
        self.enforce_capacity();

        if let Some(store) = &self.store {
            if let Err(e) = store.put(&stored).await {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, "Artifact store write failed: {}", e);
            }
        }
    }

    /// Entry metadata without counting as a hit
    pub fn peek(&self, key: &GenerationKey) -> Option<ResultCacheEntry> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Drop expired entries and trim to capacity; safe to call repeatedly.
    /// Store rows are pruned by creation age under either TTL policy.
    pub async fn evict(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.is_expired(now, &self.config));
        let mut evicted = before.saturating_sub(self.entries.len());
        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted += self.enforce_capacity();

        if let Some(store) = &self.store {
            if let Err(e) = store.evict(self.config.ttl).await {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Artifact store eviction failed: {}", e);
            }
        }

        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "Cache eviction completed");
        }
        evicted
    }

    // Oldest entries by creation go first
    fn enforce_capacity(&self) -> usize {
        let max = match self.config.max_entries {
            Some(max) => max,
            None => return 0,
        };
        let len = self.entries.len();
        if len <= max {
            return 0;
        }

        let mut by_age: Vec<(GenerationKey, Instant)> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().created))
            .collect();
        by_age.sort_by_key(|(_, created)| *created);

        let mut removed = 0;
        for (key, _) in by_age.into_iter().take(len - max) {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        self.counters
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            total_entries: self.entries.len(),
            hit_count: self.counters.hits.load(Ordering::Relaxed),
            miss_count: self.counters.misses.load(Ordering::Relaxed),
            eviction_count: self.counters.evictions.load(Ordering::Relaxed),
            store_hit_count: self.counters.store_hits.load(Ordering::Relaxed),
            store_error_count: self.counters.store_errors.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("entries", &self.entries.len())
            .field("config", &self.config)
            .field("durable", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn key(n: u8) -> GenerationKey {
        GenerationKey::from_bytes([n; 32])
    }

    fn cache(ttl: Duration, ttl_policy: TtlPolicy) -> ResultCache {
        ResultCache::new(CacheConfig {
            ttl,
            ttl_policy,
            max_entries: None,
        })
    }

    #[tokio::test]
    async fn test_cache_basic_operations() {
        let cache = ResultCache::new(CacheConfig::default());
        assert_eq!(cache.get(&key(1)).await, None);

        cache.put(key(1), ArtifactRef::new("https://cdn/1")).await;
        assert_eq!(cache.get(&key(1)).await, Some(ArtifactRef::new("https://cdn/1")));
        assert_eq!(cache.get(&key(1)).await, Some(ArtifactRef::new("https://cdn/1")));

        let entry = cache.peek(&key(1)).unwrap();
        assert_eq!(entry.access_count, 2);
        assert!(entry.last_accessed_at >= entry.created_at);

        let stats = cache.stats();
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.total_entries, 1);
    }

    #[tokio::test]
    async fn test_peek_does_not_count() {
        let cache = ResultCache::new(CacheConfig::default());
        cache.put(key(1), ArtifactRef::new("a")).await;
        cache.peek(&key(1));
        assert_eq!(cache.peek(&key(1)).unwrap().access_count, 0);
        assert_eq!(cache.stats().hit_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absolute_ttl_ignores_hits() {
        let cache = cache(Duration::from_secs(100), TtlPolicy::Absolute);
        cache.put(key(1), ArtifactRef::new("a")).await;

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(30)).await;
            assert!(cache.get(&key(1)).await.is_some());
        }
        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(cache.get(&key(1)).await, None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_ttl_refreshes_on_hit() {
        let cache = cache(Duration::from_secs(100), TtlPolicy::Sliding);
        cache.put(key(1), ArtifactRef::new("a")).await;

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(60)).await;
            assert!(cache.get(&key(1)).await.is_some());
        }
        tokio::time::advance(Duration::from_secs(101)).await;
        assert_eq!(cache.get(&key(1)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_is_idempotent() {
        let cache = cache(Duration::from_secs(10), TtlPolicy::Absolute);
        cache.put(key(1), ArtifactRef::new("old")).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.put(key(2), ArtifactRef::new("new")).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.evict().await, 1);
        assert_eq!(cache.evict().await, 0);
        assert!(cache.peek(&key(1)).is_none());
        assert!(cache.peek(&key(2)).is_some());
        assert_eq!(cache.stats().eviction_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_drops_oldest() {
        let cache = ResultCache::new(CacheConfig {
            max_entries: Some(2),
            ..Default::default()
        });
        for n in 1..=3 {
            cache.put(key(n), ArtifactRef::new(format!("img{}", n))).await;
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.peek(&key(1)).is_none());
        assert!(cache.peek(&key(2)).is_some());
        assert!(cache.peek(&key(3)).is_some());
        assert_eq!(cache.evict().await, 0);
    }

    #[tokio::test]
    async fn test_read_through_store() {
        let store = Arc::new(MemoryStore::new());
        let first = ResultCache::new(CacheConfig::default()).with_store(store.clone());
        first.put(key(1), ArtifactRef::new("https://cdn/durable")).await;
        assert_eq!(store.len(), 1);

        // a second cache over the same store stands in for a restarted process
        let second = ResultCache::new(CacheConfig::default()).with_store(store);
        assert!(second.peek(&key(1)).is_none());
        assert_eq!(
            second.get(&key(1)).await,
            Some(ArtifactRef::new("https://cdn/durable"))
        );
        assert!(second.peek(&key(1)).is_some());

        let stats = second.stats();
        assert_eq!(stats.store_hit_count, 1);
        assert_eq!(stats.miss_count, 0);
    }

    #[tokio::test]
    async fn test_read_through_respects_ttl() {
        let store = Arc::new(MemoryStore::new());
        let mut stale = StoredArtifact::new(key(1), ArtifactRef::new("stale"));
        stale.created_at = Utc::now() - chrono::Duration::hours(2);
        store.put(&stale).await.unwrap();

        let cache = cache(Duration::from_secs(3600), TtlPolicy::Absolute).with_store(store);
        assert_eq!(cache.get(&key(1)).await, None);
        assert_eq!(cache.stats().miss_count, 1);
    }

    #[tokio::test]
    async fn test_sliding_ttl_store_rows_age_from_creation() {
        let store = Arc::new(MemoryStore::new());
        let mut hot = StoredArtifact::new(key(1), ArtifactRef::new("hot"));
        hot.created_at = Utc::now() - chrono::Duration::hours(2);
        store.put(&hot).await.unwrap();
        let mut young = StoredArtifact::new(key(2), ArtifactRef::new("young"));
        young.created_at = Utc::now() - chrono::Duration::minutes(30);
        store.put(&young).await.unwrap();

        // whatever hits the row took before a restart are not known here
        let cache = cache(Duration::from_secs(3600), TtlPolicy::Sliding).with_store(store);
        assert_eq!(cache.get(&key(1)).await, None);
        assert_eq!(cache.get(&key(2)).await, Some(ArtifactRef::new("young")));
        assert_eq!(cache.stats().store_hit_count, 1);
    }
}
