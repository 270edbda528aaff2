//! Follower side of coalescing.
//!
//! A follower only ever reads its record. Timing out is local to the caller:
//! the record is left alone and the leader keeps generating.

use crate::artifact::ArtifactRef;
use crate::core::config::{WaitPolicy, WaitStrategy};
use crate::core::errors::{PlacegenError, Result};
use crate::key::GenerationKey;
use crate::registry::{GenerationRecord, GenerationRegistry, GenerationStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

const EVICTED_DETAIL: &str = "generation record evicted before completion";

#[derive(Debug, Clone)]
pub struct Waiter {
    registry: Arc<GenerationRegistry>,
}

impl Waiter {
    pub fn new(registry: Arc<GenerationRegistry>) -> Self {
        Self { registry }
    }

    /// Block until the record for `key` is terminal or `policy.max_wait` elapses
    pub async fn wait(&self, key: &GenerationKey, policy: &WaitPolicy) -> Result<ArtifactRef> {
        match policy.strategy {
            WaitStrategy::Notify => self.wait_notified(key, policy.max_wait).await,
            WaitStrategy::Poll { interval } => {
                self.wait_polling(key, policy.max_wait, interval).await
            }
        }
    }

    /// Like [`Waiter::wait`], but settles straight from `observed` when the
    /// record was already terminal at attach time, so a sweep that removes the
    /// record afterwards cannot turn a finished generation into an error.
    pub async fn wait_from(
        &self,
        observed: &GenerationRecord,
        policy: &WaitPolicy,
    ) -> Result<ArtifactRef> {
        if let Some(outcome) = settle(observed) {
            return outcome;
        }
        self.wait(&observed.key, policy).await
    }

    async fn wait_notified(&self, key: &GenerationKey, max_wait: Duration) -> Result<ArtifactRef> {
        let mut rx = self
            .registry
            .subscribe(key)
            .ok_or_else(|| PlacegenError::upstream(*key, EVICTED_DETAIL))?;

        let waited = timeout(max_wait, async {
            rx.wait_for(|record| record.status.is_terminal())
                .await
                .map(|record| GenerationRecord::clone(&record))
        })
        .await;

        match waited {
            Ok(Ok(record)) => settle(&record).unwrap_or_else(|| {
                Err(PlacegenError::upstream(*key, EVICTED_DETAIL))
            }),
            // sender dropped, so the record left the registry
            Ok(Err(_)) => {
                let last = rx.borrow().clone();
                settle(&last).unwrap_or_else(|| Err(PlacegenError::upstream(*key, EVICTED_DETAIL)))
            }
            Err(_) => {
                debug!(key = %key, max_wait_ms = max_wait.as_millis() as u64, "follower wait timed out");
                Err(PlacegenError::timeout(*key, max_wait.as_millis() as u64))
            }
        }
    }

    async fn wait_polling(
        &self,
        key: &GenerationKey,
        max_wait: Duration,
        interval: Duration,
    ) -> Result<ArtifactRef> {
        let deadline = Instant::now() + max_wait;
        loop {
            let record = self
                .registry
                .get(key)
                .ok_or_else(|| PlacegenError::upstream(*key, EVICTED_DETAIL))?;
            if let Some(outcome) = settle(&record) {
                return outcome;
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(key = %key, max_wait_ms = max_wait.as_millis() as u64, "follower poll timed out");
                return Err(PlacegenError::timeout(*key, max_wait.as_millis() as u64));
            }
            // up to 10% jitter so followers of one key do not poll in lockstep
            let jitter_ms = fastrand::u64(0..=(interval.as_millis() as u64 / 10));
            let nap = (interval + Duration::from_millis(jitter_ms)).min(deadline - now);
            sleep(nap).await;
        }
    }
}

/// Outcome carried by a terminal record, None while still in flight
fn settle(record: &GenerationRecord) -> Option<Result<ArtifactRef>> {
    match record.status {
        GenerationStatus::Completed => Some(record.result_ref.clone().ok_or_else(|| {
            PlacegenError::invariant(record.key, Some(record.status), GenerationStatus::Completed)
        })),
        GenerationStatus::Failed => Some(Err(PlacegenError::upstream(
            record.key,
            record
                .error_detail
                .clone()
                .unwrap_or_else(|| "generation failed".to_string()),
        ))),
        GenerationStatus::Pending | GenerationStatus::Generating => None,
    }
}
