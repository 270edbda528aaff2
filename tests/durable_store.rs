//! Result cache persistence through the sled-backed artifact store

use placegen::{
    ArtifactRef, ArtifactStore, Coalescer, CoalescerConfig, GenerationKey, RequestAttributes,
    ResolutionSource, SledStore, StoredArtifact, TtlPolicy, WaitPolicy,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn sunset() -> RequestAttributes {
    RequestAttributes::new("A beautiful sunset", 1024, 1024, "jpg")
}

#[tokio::test]
async fn test_store_path_enables_write_through() {
    let dir = tempfile::tempdir().unwrap();
    let config = CoalescerConfig::builder()
        .store_path(dir.path().join("artifacts"))
        .build()
        .unwrap();
    let coalescer = Coalescer::new(config).unwrap();

    coalescer
        .resolve(
            &sunset(),
            |_| async { Ok(ArtifactRef::new("https://cdn/img1")) },
            &WaitPolicy::default(),
        )
        .await
        .unwrap();

    let stats = coalescer.cache().stats();
    assert_eq!(stats.total_entries, 1);
    assert_eq!(stats.store_error_count, 0);
}

#[tokio::test]
async fn test_fresh_process_reads_through_store() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ArtifactStore> = Arc::new(SledStore::open(dir.path()).unwrap());
    let calls = Arc::new(AtomicUsize::new(0));

    let first = Coalescer::builder().store(Arc::clone(&store)).build().unwrap();
    let counter = Arc::clone(&calls);
    first
        .resolve(
            &sunset(),
            move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ArtifactRef::new("https://cdn/img1"))
            },
            &WaitPolicy::default(),
        )
        .await
        .unwrap();
    drop(first);

    // empty registry and cache, same store
    let second = Coalescer::builder().store(Arc::clone(&store)).build().unwrap();
    assert!(second.cache().is_empty());
    let counter = Arc::clone(&calls);
    let resolution = second
        .resolve(
            &sunset(),
            move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ArtifactRef::new("https://cdn/img2"))
            },
            &WaitPolicy::default(),
        )
        .await
        .unwrap();

    assert_eq!(resolution.source(), ResolutionSource::Cached);
    assert_eq!(resolution.artifact().as_str(), "https://cdn/img1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.cache().stats().store_hit_count, 1);
    assert!(second.registry().is_empty());
}

#[tokio::test]
async fn test_expired_store_entries_are_not_served() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SledStore::open(dir.path()).unwrap());
    let config = CoalescerConfig::builder()
        .cache_ttl(Duration::from_secs(60), TtlPolicy::Absolute)
        .record_retention(Duration::from_secs(30))
        .build()
        .unwrap();
    let coalescer = Coalescer::builder()
        .config(config)
        .store(store.clone())
        .build()
        .unwrap();

    let key: GenerationKey = coalescer.key_for(&sunset()).unwrap();
    let mut stale = StoredArtifact::new(key, ArtifactRef::new("https://cdn/stale"));
    stale.created_at = chrono::Utc::now() - chrono::Duration::seconds(120);
    store.put(&stale).await.unwrap();

    let resolution = coalescer
        .resolve(
            &sunset(),
            |_| async { Ok(ArtifactRef::new("https://cdn/fresh")) },
            &WaitPolicy::default(),
        )
        .await
        .unwrap();
    assert_eq!(resolution.source(), ResolutionSource::Fresh);
    assert_eq!(resolution.artifact().as_str(), "https://cdn/fresh");

    // the write-through replaced the stale row
    let stored = store.get(&key).await.unwrap().unwrap();
    assert_eq!(stored.result_ref.as_str(), "https://cdn/fresh");
    assert_eq!(coalescer.sweep().await.cache_entries, 0);
    assert_eq!(store.len(), 1);
}
