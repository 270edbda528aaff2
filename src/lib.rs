//! Request coalescing and result caching for placeholder image generation.
//!
//! Identical requests arriving together share one backend call; completed
//! results are cached for instant replay. See [`Coalescer`].

// Core infrastructure modules
pub mod core;

pub mod artifact;
pub mod cache;
pub mod coalescer;
pub mod executor;
pub mod key;
pub mod registry;
pub mod store;
pub mod waiter;

// Re-exports for convenience
pub use artifact::ArtifactRef;
pub use cache::{CacheConfig, CacheStats, ResultCache, ResultCacheEntry};
pub use coalescer::{Coalescer, CoalescerBuilder, EvictionReport, JanitorHandle, Resolution, ResolutionSource};
pub use core::config::{CoalescerConfig, CoalescerConfigBuilder, TtlPolicy, WaitPolicy, WaitStrategy};
pub use core::errors::{PlacegenError, Result};
pub use core::metrics::{LatencySnapshot, MetricsSnapshot};
pub use executor::{GenerationExecutor, ImageBackend};
pub use key::{GenerationKey, ImageFormat, KeyLimits, NormalizedRequest, Normalizer, RequestAttributes};
pub use registry::{GenerationRecord, GenerationRegistry, GenerationStatus, Transition};
pub use store::{ArtifactStore, MemoryStore, SledStore, StoredArtifact};
pub use waiter::Waiter;
