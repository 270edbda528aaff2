use crate::core::errors::{PlacegenError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How a follower learns that the record it is attached to became terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitStrategy {
    /// Wake on the record's change notification
    Notify,
    /// Re-read the registry every `interval`
    Poll { interval: Duration },
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::Notify
    }
}

/// Per-call waiting behaviour for followers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitPolicy {
    /// Upper bound before the follower gets a "still generating" answer
    pub max_wait: Duration,
    pub strategy: WaitStrategy,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(60),
            strategy: WaitStrategy::Notify,
        }
    }
}

impl WaitPolicy {
    pub fn notify(max_wait: Duration) -> Self {
        Self {
            max_wait,
            strategy: WaitStrategy::Notify,
        }
    }

    pub fn poll(max_wait: Duration, interval: Duration) -> Self {
        Self {
            max_wait,
            strategy: WaitStrategy::Poll { interval },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_wait.is_zero() {
            return Err(PlacegenError::configuration("max_wait must be greater than 0"));
        }
        if let WaitStrategy::Poll { interval } = self.strategy {
            if interval.is_zero() {
                return Err(PlacegenError::configuration(
                    "poll interval must be greater than 0",
                ));
            }
        }
        Ok(())
    }
}

/// Whether a cache hit extends an entry's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TtlPolicy {
    /// Lifetime measured from creation; hits never extend it
    Absolute,
    /// Lifetime measured from the last hit.
    ///
    /// Only the in-memory tier slides. The artifact store records no access
    /// history, so rows read back after a restart, and store pruning during
    /// eviction, still count age from creation.
    Sliding,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        TtlPolicy::Absolute
    }
}

/// Configuration for the coalescing layer with all tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalescerConfig {
    // Key normalization
    /// Longest accepted prompt, in chars, after whitespace normalization
    pub max_prompt_chars: usize,
    /// Largest accepted width or height
    pub max_dimension: u32,

    // Result cache
    /// Time-to-live for completed results
    pub cache_ttl: Duration,
    /// Whether hits refresh the TTL
    pub ttl_policy: TtlPolicy,
    /// Optional bound on cached results (None = unbounded)
    pub cache_max_entries: Option<usize>,
    /// Path of the sled database backing the cache (None = memory only)
    pub store_path: Option<PathBuf>,

    // Generation registry
    /// How long terminal records stay attachable after completion
    pub record_retention: Duration,
    /// Hard limit on a single backend call
    pub backend_timeout: Duration,

    // Waiting
    /// Policy used by `resolve_with_default_wait`
    pub default_wait: WaitPolicy,

    // Janitor
    /// Interval between background eviction sweeps
    pub cleanup_interval: Duration,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            max_prompt_chars: 1000,
            max_dimension: 4096,

            cache_ttl: Duration::from_secs(30 * 24 * 3600), // 30 days
            ttl_policy: TtlPolicy::Absolute,
            cache_max_entries: None,
            store_path: None,

            record_retention: Duration::from_secs(3600), // 1 hour
            backend_timeout: Duration::from_secs(120),

            default_wait: WaitPolicy::default(),

            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CoalescerConfig {
    /// Create a new builder for CoalescerConfig
    pub fn builder() -> CoalescerConfigBuilder {
        CoalescerConfigBuilder::new()
    }

    /// Parse a YAML document; missing fields take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CoalescerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_prompt_chars == 0 {
            return Err(PlacegenError::configuration(
                "max_prompt_chars must be greater than 0",
            ));
        }
        if self.max_dimension == 0 {
            return Err(PlacegenError::configuration(
                "max_dimension must be greater than 0",
            ));
        }
        if self.cache_ttl.is_zero() {
            return Err(PlacegenError::configuration("cache_ttl must be greater than 0"));
        }
        if self.cache_max_entries == Some(0) {
            return Err(PlacegenError::configuration(
                "cache_max_entries cannot be zero, use None for unbounded",
            ));
        }
        if self.record_retention.is_zero() {
            return Err(PlacegenError::configuration(
                "record_retention must be greater than 0",
            ));
        }
        // a Completed record answers callers too, so it must not outlive the cache entry
        if self.cache_ttl < self.record_retention {
            return Err(PlacegenError::configuration(
                "cache_ttl must be at least record_retention",
            ));
        }
        if self.backend_timeout.is_zero() {
            return Err(PlacegenError::configuration(
                "backend_timeout must be greater than 0",
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(PlacegenError::configuration(
                "cleanup_interval must be greater than 0",
            ));
        }
        self.default_wait.validate()
    }

    /// Short windows for tests and local development
    pub fn development() -> Self {
        Self {
            cache_ttl: Duration::from_secs(3600),
            record_retention: Duration::from_secs(60),
            backend_timeout: Duration::from_secs(30),
            default_wait: WaitPolicy::notify(Duration::from_secs(10)),
            cleanup_interval: Duration::from_secs(5),
            ..Default::default()
        }
    }
}

/// Builder for CoalescerConfig
pub struct CoalescerConfigBuilder {
    config: CoalescerConfig,
}

impl CoalescerConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: CoalescerConfig::default(),
        }
    }

    pub fn max_prompt_chars(mut self, max: usize) -> Self {
        self.config.max_prompt_chars = max;
        self
    }

    pub fn max_dimension(mut self, max: u32) -> Self {
        self.config.max_dimension = max;
        self
    }

    /// Set cache TTL and whether hits refresh it
    pub fn cache_ttl(mut self, ttl: Duration, policy: TtlPolicy) -> Self {
        self.config.cache_ttl = ttl;
        self.config.ttl_policy = policy;
        self
    }

    pub fn cache_max_entries(mut self, max: Option<usize>) -> Self {
        self.config.cache_max_entries = max;
        self
    }

    /// Back the result cache with a sled database at `path`
    pub fn store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.store_path = Some(path.into());
        self
    }

    pub fn record_retention(mut self, retention: Duration) -> Self {
        self.config.record_retention = retention;
        self
    }

    pub fn backend_timeout(mut self, timeout: Duration) -> Self {
        self.config.backend_timeout = timeout;
        self
    }

    pub fn default_wait(mut self, policy: WaitPolicy) -> Self {
        self.config.default_wait = policy;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<CoalescerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for CoalescerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
