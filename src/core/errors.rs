use thiserror::Error;

use crate::key::GenerationKey;
use crate::registry::GenerationStatus;

/// Unified error type for the coalescing and caching layer
#[derive(Debug, Error)]
pub enum PlacegenError {
    /// Malformed request attributes, rejected before the registry is touched
    #[error("Invalid request attribute `{field}`: {message}")]
    Normalization { field: String, message: String },

    /// The backend call failed; shared by every caller attached to the key
    #[error("Generation failed for {key}: {detail}")]
    UpstreamGeneration { key: GenerationKey, detail: String },

    /// A follower gave up waiting while the record was still in flight
    #[error("Still generating {key} after {waited_ms}ms, retry later")]
    Timeout { key: GenerationKey, waited_ms: u64 },

    /// Attempted transition that the record state machine forbids
    #[error("Illegal transition for {key}: {from:?} -> {to:?}")]
    RegistryInvariantViolation {
        key: GenerationKey,
        from: Option<GenerationStatus>,
        to: GenerationStatus,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Durable store errors
    #[error("Storage operation failed: {operation}")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl PlacegenError {
    /// Create a normalization error for a request field
    pub fn normalization<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Normalization {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create an upstream generation error
    pub fn upstream<S: Into<String>>(key: GenerationKey, detail: S) -> Self {
        Self::UpstreamGeneration {
            key,
            detail: detail.into(),
        }
    }

    /// Create a waiter timeout
    pub fn timeout(key: GenerationKey, waited_ms: u64) -> Self {
        Self::Timeout { key, waited_ms }
    }

    pub fn invariant(
        key: GenerationKey,
        from: Option<GenerationStatus>,
        to: GenerationStatus,
    ) -> Self {
        Self::RegistryInvariantViolation { key, from, to }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Storage {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// The caller should come back later; the work is still running
    pub fn is_still_generating(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The request itself was bad and will never succeed as-is
    pub fn is_bad_input(&self) -> bool {
        matches!(self, Self::Normalization { .. })
    }

    pub fn is_upstream_failure(&self) -> bool {
        matches!(self, Self::UpstreamGeneration { .. })
    }

    /// Check if retrying the same request can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            // Succeeds again once the failed record is evicted
            Self::UpstreamGeneration { .. } => true,
            Self::Storage { .. } => true,
            Self::Normalization { .. } | Self::Configuration { .. } => false,
            Self::RegistryInvariantViolation { .. } => false,
            Self::Serialization { .. } => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Normalization { .. } => "normalization",
            Self::UpstreamGeneration { .. } => "upstream",
            Self::Timeout { .. } => "timeout",
            Self::RegistryInvariantViolation { .. } => "invariant",
            Self::Configuration { .. } => "configuration",
            Self::Storage { .. } => "storage",
            Self::Serialization { .. } => "serialization",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, PlacegenError>;

impl From<std::io::Error> for PlacegenError {
    fn from(err: std::io::Error) -> Self {
        Self::storage("io_operation", err)
    }
}

impl From<sled::Error> for PlacegenError {
    fn from(err: sled::Error) -> Self {
        Self::storage("sled_operation", err)
    }
}

impl From<bincode::Error> for PlacegenError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization("bincode", err)
    }
}

impl From<serde_json::Error> for PlacegenError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for PlacegenError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> GenerationKey {
        GenerationKey::from_bytes([7u8; 32])
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(PlacegenError::normalization("width", "zero").category(), "normalization");
        assert_eq!(PlacegenError::upstream(key(), "boom").category(), "upstream");
        assert_eq!(PlacegenError::timeout(key(), 100).category(), "timeout");
        assert_eq!(
            PlacegenError::invariant(key(), None, GenerationStatus::Completed).category(),
            "invariant"
        );
    }

    #[test]
    fn test_outcome_helpers() {
        assert!(PlacegenError::timeout(key(), 100).is_still_generating());
        assert!(PlacegenError::normalization("prompt", "empty").is_bad_input());
        assert!(PlacegenError::upstream(key(), "rate limited").is_upstream_failure());
        assert!(!PlacegenError::upstream(key(), "rate limited").is_still_generating());
    }

    #[test]
    fn test_error_recoverability() {
        assert!(PlacegenError::timeout(key(), 1000).is_recoverable());
        assert!(!PlacegenError::normalization("format", "bmp").is_recoverable());
        assert!(!PlacegenError::configuration("test").is_recoverable());
        assert!(!PlacegenError::invariant(
            key(),
            Some(GenerationStatus::Completed),
            GenerationStatus::Failed
        )
        .is_recoverable());
    }

    #[test]
    fn test_display_mentions_key() {
        let err = PlacegenError::upstream(key(), "backend 503");
        let text = err.to_string();
        assert!(text.contains(&key().to_hex()));
        assert!(text.contains("backend 503"));
    }
}
