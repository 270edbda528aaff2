// Shared infrastructure: configuration, errors and counters

pub mod config;
pub mod errors;
pub mod metrics;

// Re-export commonly used types
pub use config::{CoalescerConfig, CoalescerConfigBuilder, TtlPolicy, WaitPolicy, WaitStrategy};
pub use errors::{PlacegenError, Result};
pub use metrics::{CoalescerMetrics, MetricsSnapshot};
