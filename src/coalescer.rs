//! Coalescing controller
//!
//! [`Coalescer::resolve`] is the single entry point: normalize, serve from the
//! result cache when possible, otherwise attach to the generation record for
//! the key. The first caller to attach leads and runs the executor; everyone
//! else follows through the waiter and sees the leader's outcome.

use crate::artifact::ArtifactRef;
use crate::cache::{CacheConfig, ResultCache};
use crate::core::config::{CoalescerConfig, WaitPolicy};
use crate::core::errors::Result;
use crate::core::metrics::{CoalescerMetrics, MetricsSnapshot};
use crate::executor::{GenerationExecutor, ImageBackend};
use crate::key::{GenerationKey, KeyLimits, NormalizedRequest, Normalizer, RequestAttributes};
use crate::registry::{GenerationRecord, GenerationRegistry};
use crate::store::{ArtifactStore, SledStore};
use crate::waiter::Waiter;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

/// Where a resolved artifact came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolutionSource {
    /// Served from the result cache, no registry interaction
    Cached,
    /// This caller led the generation
    Fresh,
    /// Another caller's generation was shared
    Coalesced,
}

impl ResolutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionSource::Cached => "cached",
            ResolutionSource::Fresh => "fresh",
            ResolutionSource::Coalesced => "coalesced",
        }
    }
}

/// Successful outcome of [`Coalescer::resolve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Cached(ArtifactRef),
    Fresh(ArtifactRef),
    Coalesced(ArtifactRef),
}

impl Resolution {
    pub fn artifact(&self) -> &ArtifactRef {
        match self {
            Resolution::Cached(artifact)
            | Resolution::Fresh(artifact)
            | Resolution::Coalesced(artifact) => artifact,
        }
    }

    pub fn into_artifact(self) -> ArtifactRef {
        match self {
            Resolution::Cached(artifact)
            | Resolution::Fresh(artifact)
            | Resolution::Coalesced(artifact) => artifact,
        }
    }

    pub fn source(&self) -> ResolutionSource {
        match self {
            Resolution::Cached(_) => ResolutionSource::Cached,
            Resolution::Fresh(_) => ResolutionSource::Fresh,
            Resolution::Coalesced(_) => ResolutionSource::Coalesced,
        }
    }
}

/// Counts from one eviction sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub records: usize,
    pub cache_entries: usize,
}

impl EvictionReport {
    pub fn total(&self) -> usize {
        self.records + self.cache_entries
    }
}

/// Request coalescing front for the generation backend.
///
/// Cloning is cheap; clones share the registry, cache and metrics.
#[derive(Debug, Clone)]
pub struct Coalescer {
    config: Arc<CoalescerConfig>,
    normalizer: Normalizer,
    registry: Arc<GenerationRegistry>,
    cache: Arc<ResultCache>,
    metrics: Arc<CoalescerMetrics>,
    executor: GenerationExecutor,
    waiter: Waiter,
}

impl Coalescer {
    /// Build from config, opening a sled store when `store_path` is set
    pub fn new(config: CoalescerConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> CoalescerBuilder {
        CoalescerBuilder::default()
    }

    fn assemble(config: CoalescerConfig, store: Option<Arc<dyn ArtifactStore>>) -> Self {
        let registry = Arc::new(GenerationRegistry::new());
        let mut cache = ResultCache::new(CacheConfig::from(&config));
        if let Some(store) = store {
            cache = cache.with_store(store);
        }
        let cache = Arc::new(cache);
        let metrics = Arc::new(CoalescerMetrics::new());
        let executor = GenerationExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&metrics),
            config.backend_timeout,
        );

        Self {
            normalizer: Normalizer::new(KeyLimits::from(&config)),
            waiter: Waiter::new(Arc::clone(&registry)),
            config: Arc::new(config),
            registry,
            cache,
            metrics,
            executor,
        }
    }

    /// Resolve `attrs` to an artifact, calling `generate` only if this caller
    /// ends up leading a new generation.
    ///
    /// Errors: `Normalization` for bad input, `UpstreamGeneration` when the
    /// shared generation failed, `Timeout` when a follower gave up waiting
    /// (the generation carries on).
    ///
    /// `generate` runs on its own task, so a leader that is dropped mid-call
    /// (client gone, outer timeout) does not cancel the generation its
    /// followers are waiting on.
    pub async fn resolve<F, Fut>(
        &self,
        attrs: &RequestAttributes,
        generate: F,
        policy: &WaitPolicy,
    ) -> Result<Resolution>
    where
        F: FnOnce(NormalizedRequest) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<ArtifactRef>> + Send + 'static,
    {
        let request = match self.normalizer.normalize(attrs) {
            Ok(request) => request,
            Err(e) => {
                self.metrics.record_rejected();
                debug!("Rejected generation request: {}", e);
                return Err(e);
            }
        };

        let span = info_span!(
            "resolve",
            request_id = %Uuid::new_v4(),
            key = %request.key,
        );
        self.resolve_normalized(request, generate, policy)
            .instrument(span)
            .await
    }

    /// [`resolve`](Self::resolve) with the configured default wait policy
    pub async fn resolve_with_default_wait<F, Fut>(
        &self,
        attrs: &RequestAttributes,
        generate: F,
    ) -> Result<Resolution>
    where
        F: FnOnce(NormalizedRequest) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<ArtifactRef>> + Send + 'static,
    {
        let policy = self.config.default_wait;
        self.resolve(attrs, generate, &policy).await
    }

    /// [`resolve`](Self::resolve) against a long-lived backend object
    pub async fn resolve_with_backend<B>(
        &self,
        attrs: &RequestAttributes,
        backend: Arc<B>,
        policy: &WaitPolicy,
    ) -> Result<Resolution>
    where
        B: ImageBackend + ?Sized + 'static,
    {
        self.resolve(
            attrs,
            move |request| async move { backend.generate(&request).await },
            policy,
        )
        .await
    }

    async fn resolve_normalized<F, Fut>(
        &self,
        request: NormalizedRequest,
        generate: F,
        policy: &WaitPolicy,
    ) -> Result<Resolution>
    where
        F: FnOnce(NormalizedRequest) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<ArtifactRef>> + Send + 'static,
    {
        let key = request.key;

        if let Some(artifact) = self.cache.get(&key).await {
            self.metrics.record_cache_hit();
            debug!("served from result cache");
            return Ok(Resolution::Cached(artifact));
        }
        self.metrics.record_cache_miss();

        let (record, is_leader) = self.registry.get_or_create(key);
        self.metrics.record_attach(is_leader);

        if is_leader {
            debug!("leading new generation");
            let artifact = self.executor.run(key, move || generate(request)).await?;
            return Ok(Resolution::Fresh(artifact));
        }

        debug!(
            status = record.status.as_str(),
            request_count = record.request_count,
            "following in-flight generation"
        );
        match self.waiter.wait_from(&record, policy).await {
            Ok(artifact) => Ok(Resolution::Coalesced(artifact)),
            Err(e) => {
                if e.is_still_generating() {
                    self.metrics.record_waiter_timeout();
                }
                Err(e)
            }
        }
    }

    /// Snapshot of the generation record for `attrs`, if one is live
    pub fn status(&self, attrs: &RequestAttributes) -> Result<Option<GenerationRecord>> {
        let key = self.normalizer.key_for(attrs)?;
        Ok(self.registry.get(&key))
    }

    /// Drop a terminal record for `attrs` ahead of retention, so the next
    /// request starts a new attempt. In-flight records are left alone.
    pub fn reset(&self, attrs: &RequestAttributes) -> Result<bool> {
        let key = self.normalizer.key_for(attrs)?;
        let removed = self.registry.remove_terminal(&key);
        if removed {
            info!(key = %key, "generation record reset");
        }
        Ok(removed)
    }

    /// One eviction pass over the registry and the result cache
    pub async fn sweep(&self) -> EvictionReport {
        let report = EvictionReport {
            records: self.registry.evict_expired(self.config.record_retention),
            cache_entries: self.cache.evict().await,
        };
        if report.total() > 0 {
            debug!(
                records = report.records,
                cache_entries = report.cache_entries,
                "eviction sweep completed"
            );
        }
        report
    }

    /// Run [`sweep`](Self::sweep) every `cleanup_interval` until the handle
    /// is shut down or dropped
    pub fn spawn_janitor(&self) -> JanitorHandle {
        let coalescer = self.clone();
        let period = self.config.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                coalescer.sweep().await;
            }
        });
        info!(interval_ms = period.as_millis() as u64, "janitor started");
        JanitorHandle {
            handle: Some(handle),
        }
    }

    pub fn key_for(&self, attrs: &RequestAttributes) -> Result<GenerationKey> {
        self.normalizer.key_for(attrs)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &CoalescerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<GenerationRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }
}

/// Builder for [`Coalescer`]
#[derive(Default)]
pub struct CoalescerBuilder {
    config: CoalescerConfig,
    store: Option<Arc<dyn ArtifactStore>>,
}

impl CoalescerBuilder {
    pub fn config(mut self, config: CoalescerConfig) -> Self {
        self.config = config;
        self
    }

    /// Durable store for the result cache; takes precedence over `store_path`
    pub fn store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Coalescer> {
        self.config.validate()?;
        let store = match (self.store, &self.config.store_path) {
            (Some(store), _) => Some(store),
            (None, Some(path)) => Some(Arc::new(SledStore::open(path)?) as Arc<dyn ArtifactStore>),
            (None, None) => None,
        };
        Ok(Coalescer::assemble(self.config, store))
    }
}

/// Owns the janitor task; aborts it on shutdown or drop
#[derive(Debug)]
pub struct JanitorHandle {
    handle: Option<JoinHandle<()>>,
}

impl JanitorHandle {
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("janitor stopped");
        }
    }
}

impl Drop for JanitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
