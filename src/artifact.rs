use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque reference to a generated image, usually a CDN URL
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ArtifactRef {
    fn from(location: String) -> Self {
        Self(location)
    }
}

impl From<&str> for ArtifactRef {
    fn from(location: &str) -> Self {
        Self(location.to_string())
    }
}
