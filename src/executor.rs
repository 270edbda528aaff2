use crate::artifact::ArtifactRef;
use crate::cache::ResultCache;
use crate::core::errors::{PlacegenError, Result};
use crate::core::metrics::{CoalescerMetrics, ExecutionTimer};
use crate::key::{GenerationKey, NormalizedRequest};
use crate::registry::{GenerationRecord, GenerationRegistry, Transition};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Instrument, Span};

const ABORTED_DETAIL: &str = "generation task aborted";

/// Long-lived handle to the external image generation service
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn generate(&self, request: &NormalizedRequest) -> anyhow::Result<ArtifactRef>;
}

/// The only path that calls the backend; run by the leader of a key.
#[derive(Debug, Clone)]
pub struct GenerationExecutor {
    registry: Arc<GenerationRegistry>,
    cache: Arc<ResultCache>,
    metrics: Arc<CoalescerMetrics>,
    backend_timeout: Duration,
}

impl GenerationExecutor {
    pub fn new(
        registry: Arc<GenerationRegistry>,
        cache: Arc<ResultCache>,
        metrics: Arc<CoalescerMetrics>,
        backend_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            cache,
            metrics,
            backend_timeout,
        }
    }

    /// Drive the record for `key` from Pending to a terminal state.
    ///
    /// `generate` is called exactly once, on its own task: dropping the
    /// future returned here does not cancel the backend call, and the result
    /// is still cached and published to followers. A success is cached before
    /// the record is marked Completed; a failure (including the backend
    /// timeout) marks the record Failed and is returned as
    /// `UpstreamGeneration`.
    pub async fn run<F, Fut>(&self, key: GenerationKey, generate: F) -> Result<ArtifactRef>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<ArtifactRef>> + Send + 'static,
    {
        self.transition(&key, Transition::Start)?;
        let guard = LeaderGuard::new(Arc::clone(&self.registry), key);

        let executor = self.clone();
        let task = tokio::spawn(
            async move { executor.drive(key, generate, guard).await }.instrument(Span::current()),
        );
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(key = %key, "generation task did not finish: {}", e);
                Err(PlacegenError::upstream(key, ABORTED_DETAIL))
            }
        }
    }

    async fn drive<F, Fut>(
        &self,
        key: GenerationKey,
        generate: F,
        mut guard: LeaderGuard,
    ) -> Result<ArtifactRef>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<ArtifactRef>>,
    {
        let timer = ExecutionTimer::start();
        let outcome = match tokio::time::timeout(self.backend_timeout, generate()).await {
            Ok(Ok(artifact)) => Ok(artifact),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!(
                "backend timed out after {}ms",
                self.backend_timeout.as_millis()
            )),
        };
        let latency = timer.stop();

        match outcome {
            Ok(artifact) => {
                self.cache.put(key, artifact.clone()).await;
                let record = self.transition(&key, Transition::Complete(artifact.clone()))?;
                guard.disarm();
                self.metrics
                    .record_generation_completed(latency, record.request_count);
                info!(
                    key = %key,
                    latency_ms = latency.as_millis() as u64,
                    request_count = record.request_count,
                    "generation completed"
                );
                Ok(artifact)
            }
            Err(detail) => {
                let record = self.transition(&key, Transition::Fail(detail.clone()))?;
                guard.disarm();
                self.metrics.record_generation_failed(latency);
                warn!(
                    key = %key,
                    latency_ms = latency.as_millis() as u64,
                    request_count = record.request_count,
                    "generation failed: {}",
                    detail
                );
                Err(PlacegenError::upstream(key, detail))
            }
        }
    }

    fn transition(&self, key: &GenerationKey, transition: Transition) -> Result<GenerationRecord> {
        self.registry.transition(key, transition).map_err(|e| {
            self.metrics.record_invariant_violation();
            e
        })
    }
}

/// Settles the record if the generation task dies before reaching a
/// terminal state (backend panic, runtime shutdown). Followers observe the
/// failure, then the record is dropped so the next request starts over.
struct LeaderGuard {
    registry: Arc<GenerationRegistry>,
    key: GenerationKey,
    armed: bool,
}

impl LeaderGuard {
    fn new(registry: Arc<GenerationRegistry>, key: GenerationKey) -> Self {
        Self {
            registry,
            key,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(key = %self.key, "generation task ended before its record settled");
        if let Err(e) = self
            .registry
            .transition(&self.key, Transition::Fail(ABORTED_DETAIL.to_string()))
        {
            error!(key = %self.key, "could not fail aborted generation record: {}", e);
        }
        self.registry.remove_terminal(&self.key);
    }
}
