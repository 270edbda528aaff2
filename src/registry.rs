//! In-flight generation records
//!
//! The registry maps each [`GenerationKey`] to a [`GenerationRecord`] held in a
//! `tokio::sync::watch` channel. The map is a sharded `DashMap`, so operations
//! on one key only contend with keys in the same shard, and the entry API
//! makes `get_or_create` atomic per key: exactly one concurrent caller becomes
//! the leader. Every accepted transition is published on the record's channel,
//! which is what notification-based waiters block on.

use crate::artifact::ArtifactRef;
use crate::core::errors::{PlacegenError, Result};
use crate::key::GenerationKey;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Lifecycle of a generation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenerationStatus {
    Pending,
    Generating,
    Completed,
    Failed,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Generating => "generating",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GenerationStatus::Completed | GenerationStatus::Failed)
    }

    /// Pending -> Generating -> {Completed, Failed}; nothing leaves a terminal state
    pub fn can_transition_to(&self, next: GenerationStatus) -> bool {
        matches!(
            (self, next),
            (GenerationStatus::Pending, GenerationStatus::Generating)
                | (GenerationStatus::Generating, GenerationStatus::Completed)
                | (GenerationStatus::Generating, GenerationStatus::Failed)
        )
    }
}

/// A state change requested by the leader
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Start,
    Complete(ArtifactRef),
    Fail(String),
}

impl Transition {
    pub fn target(&self) -> GenerationStatus {
        match self {
            Transition::Start => GenerationStatus::Generating,
            Transition::Complete(_) => GenerationStatus::Completed,
            Transition::Fail(_) => GenerationStatus::Failed,
        }
    }
}

/// One unit of coalesced work
#[derive(Debug, Clone)]
pub struct GenerationRecord {
    pub key: GenerationKey,
    pub status: GenerationStatus,
    /// Set iff status is Completed
    pub result_ref: Option<ArtifactRef>,
    /// Set iff status is Failed
    pub error_detail: Option<String>,
    /// Callers attached to this record, leader included
    pub request_count: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    // monotonic twin of completed_at, drives retention
    settled_at: Option<Instant>,
}

impl GenerationRecord {
    fn pending(key: GenerationKey) -> Self {
        Self {
            key,
            status: GenerationStatus::Pending,
            result_ref: None,
            error_detail: None,
            request_count: 1,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            settled_at: None,
        }
    }

    /// Backend calls this record saved
    pub fn coalesced_calls(&self) -> u64 {
        self.request_count.saturating_sub(1)
    }

    fn expired(&self, now: Instant, max_age: Duration) -> bool {
        self.status.is_terminal()
            && self
                .settled_at
                .map_or(false, |settled| now.saturating_duration_since(settled) >= max_age)
    }

    fn apply(&mut self, transition: Transition) {
        let now = Utc::now();
        match transition {
            Transition::Start => {
                self.status = GenerationStatus::Generating;
                self.started_at = Some(now);
            }
            Transition::Complete(artifact) => {
                self.status = GenerationStatus::Completed;
                self.result_ref = Some(artifact);
                self.completed_at = Some(now);
                self.settled_at = Some(Instant::now());
            }
            Transition::Fail(detail) => {
                self.status = GenerationStatus::Failed;
                self.error_detail = Some(detail);
                self.completed_at = Some(now);
                self.settled_at = Some(Instant::now());
            }
        }
    }
}

/// Registry of generation records, one instance per coalescer
#[derive(Debug, Default)]
pub struct GenerationRegistry {
    records: DashMap<GenerationKey, watch::Sender<GenerationRecord>>,
}

impl GenerationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to the record for `key`, creating it if absent.
    ///
    /// Returns a snapshot of the record and whether the caller is the leader.
    /// Among any number of concurrent callers for one key, exactly one sees
    /// `true`.
    pub fn get_or_create(&self, key: GenerationKey) -> (GenerationRecord, bool) {
        match self.records.entry(key) {
            Entry::Occupied(entry) => {
                let sender = entry.get();
                // attach count is not a state change, so waiters are not woken
                sender.send_if_modified(|record| {
                    record.request_count += 1;
                    false
                });
                let record = sender.borrow().clone();
                debug!(
                    key = %key,
                    status = record.status.as_str(),
                    request_count = record.request_count,
                    "attached to existing generation record"
                );
                (record, false)
            }
            Entry::Vacant(entry) => {
                let record = GenerationRecord::pending(key);
                let (sender, _) = watch::channel(record.clone());
                entry.insert(sender);
                debug!(key = %key, "created generation record");
                (record, true)
            }
        }
    }

    /// Apply a leader transition, rejecting anything the state machine forbids
    pub fn transition(&self, key: &GenerationKey, transition: Transition) -> Result<GenerationRecord> {
        let target = transition.target();
        let sender = match self.records.get(key) {
            Some(sender) => sender,
            None => {
                error!(key = %key, to = target.as_str(), "transition on unknown generation record");
                return Err(PlacegenError::invariant(*key, None, target));
            }
        };

        let mut rejected_from = None;
        sender.send_if_modified(|record| {
            if !record.status.can_transition_to(target) {
                rejected_from = Some(record.status);
                return false;
            }
            record.apply(transition);
            true
        });
        let record = sender.borrow().clone();
        drop(sender);

        if let Some(from) = rejected_from {
            error!(
                key = %key,
                from = from.as_str(),
                to = target.as_str(),
                "rejected illegal generation record transition"
            );
            return Err(PlacegenError::invariant(*key, Some(from), target));
        }

        info!(key = %key, status = record.status.as_str(), "generation record transitioned");
        Ok(record)
    }

    /// Read-only snapshot of a record
    pub fn get(&self, key: &GenerationKey) -> Option<GenerationRecord> {
        self.records.get(key).map(|sender| sender.borrow().clone())
    }

    /// Change feed for one record; closes when the record is evicted
    pub fn subscribe(&self, key: &GenerationKey) -> Option<watch::Receiver<GenerationRecord>> {
        self.records.get(key).map(|sender| sender.subscribe())
    }

    /// Remove terminal records that settled at least `max_age` ago.
    ///
    /// Pending and Generating records are never removed, whatever their age.
    pub fn evict_expired(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut evicted = 0usize;
        self.records.retain(|_, sender| {
            let expired = sender.borrow().expired(now, max_age);
            if expired {
                evicted += 1;
            }
            !expired
        });
        if evicted > 0 {
            debug!(evicted, remaining = self.records.len(), "evicted expired generation records");
        }
        evicted
    }

    /// Drop a terminal record early so the next caller starts a fresh attempt.
    ///
    /// Returns false for unknown or still in-flight records.
    pub fn remove_terminal(&self, key: &GenerationKey) -> bool {
        self.records
            .remove_if(key, |_, sender| sender.borrow().status.is_terminal())
            .is_some()
    }

    /// Records that are not yet terminal
    pub fn in_flight(&self) -> usize {
        self.records
            .iter()
            .filter(|entry| !entry.value().borrow().status.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
