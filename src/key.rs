//! Canonical request keys
//!
//! A [`GenerationKey`] is the SHA-256 digest of a length-prefixed encoding of
//! the normalized request fields. Equivalence policy:
//!
//! - prompt: trimmed, internal whitespace runs collapsed to one space, case kept
//! - format: case-insensitive, `jpg` and `jpeg` are the same format
//! - width/height: exact
//! - extra settings: canonical JSON with sorted keys

use crate::core::config::CoalescerConfig;
use crate::core::errors::{PlacegenError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const KEY_DOMAIN: &[u8] = b"placegen/generation-key/v1";

/// Fixed-length identity of a generation request
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GenerationKey([u8; 32]);

impl GenerationKey {
    /// Key for `attrs` under the default limits
    pub fn normalize(attrs: &RequestAttributes) -> Result<Self> {
        Normalizer::default().key_for(attrs)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| PlacegenError::normalization("key", e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PlacegenError::normalization("key", "expected 32 bytes"))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for GenerationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for GenerationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GenerationKey({})", &self.to_hex()[..12])
    }
}

/// Output formats the service can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
    Gif,
}

impl ImageFormat {
    /// Canonical extension, also the token that goes into the key
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Webp => "webp",
            ImageFormat::Gif => "gif",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Gif => "image/gif",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = PlacegenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
            "webp" => Ok(ImageFormat::Webp),
            "gif" => Ok(ImageFormat::Gif),
            other => Err(PlacegenError::normalization(
                "format",
                format!("unsupported format '{}'", other),
            )),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Raw attributes as supplied by the request entry point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestAttributes {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub format: String,
    /// Extension settings (style, seed, ...) that change the output
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl RequestAttributes {
    pub fn new(prompt: impl Into<String>, width: u32, height: u32, format: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            width,
            height,
            format: format.into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }
}

/// Attributes after validation, paired with their key
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    pub key: GenerationKey,
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub extra: BTreeMap<String, Value>,
}

/// Input limits enforced before a key is issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyLimits {
    pub max_prompt_chars: usize,
    pub max_dimension: u32,
}

impl Default for KeyLimits {
    fn default() -> Self {
        Self {
            max_prompt_chars: 1000,
            max_dimension: 4096,
        }
    }
}

impl From<&CoalescerConfig> for KeyLimits {
    fn from(config: &CoalescerConfig) -> Self {
        Self {
            max_prompt_chars: config.max_prompt_chars,
            max_dimension: config.max_dimension,
        }
    }
}

/// Builds canonical keys; pure and side-effect free
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    limits: KeyLimits,
}

impl Normalizer {
    pub fn new(limits: KeyLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &KeyLimits {
        &self.limits
    }

    pub fn normalize(&self, attrs: &RequestAttributes) -> Result<NormalizedRequest> {
        let prompt = normalize_prompt(&attrs.prompt);
        if prompt.is_empty() {
            return Err(PlacegenError::normalization("prompt", "prompt is empty"));
        }
        let prompt_chars = prompt.chars().count();
        if prompt_chars > self.limits.max_prompt_chars {
            return Err(PlacegenError::normalization(
                "prompt",
                format!(
                    "prompt has {} chars, limit is {}",
                    prompt_chars, self.limits.max_prompt_chars
                ),
            ));
        }
        self.check_dimension("width", attrs.width)?;
        self.check_dimension("height", attrs.height)?;
        let format: ImageFormat = attrs.format.parse()?;

        let key = digest(&prompt, attrs.width, attrs.height, format, &attrs.extra)?;

        Ok(NormalizedRequest {
            key,
            prompt,
            width: attrs.width,
            height: attrs.height,
            format,
            extra: attrs.extra.clone(),
        })
    }

    /// Convenience for callers that only need the key
    pub fn key_for(&self, attrs: &RequestAttributes) -> Result<GenerationKey> {
        self.normalize(attrs).map(|n| n.key)
    }

    fn check_dimension(&self, field: &str, value: u32) -> Result<()> {
        if value == 0 || value > self.limits.max_dimension {
            return Err(PlacegenError::normalization(
                field,
                format!("{} must be within 1..={}", value, self.limits.max_dimension),
            ));
        }
        Ok(())
    }
}

fn normalize_prompt(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn digest(
    prompt: &str,
    width: u32,
    height: u32,
    format: ImageFormat,
    extra: &BTreeMap<String, Value>,
) -> Result<GenerationKey> {
    let extra_json = serde_json::to_vec(extra)?;

    let mut hasher = Sha256::new();
    write_field(&mut hasher, KEY_DOMAIN);
    write_field(&mut hasher, prompt.as_bytes());
    write_field(&mut hasher, &width.to_be_bytes());
    write_field(&mut hasher, &height.to_be_bytes());
    write_field(&mut hasher, format.extension().as_bytes());
    write_field(&mut hasher, &extra_json);
    Ok(GenerationKey(hasher.finalize().into()))
}

// Length prefix keeps field boundaries unambiguous
fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::{assert_eq, assert_ne};
    use serde_json::json;

    fn key(attrs: &RequestAttributes) -> GenerationKey {
        Normalizer::default().key_for(attrs).unwrap()
    }

    #[test]
    fn test_deterministic() {
        let attrs = RequestAttributes::new("A beautiful sunset", 1024, 1024, "jpg");
        assert_eq!(key(&attrs), key(&attrs.clone()));
        assert_eq!(key(&attrs).to_hex().len(), 64);
        assert_eq!(GenerationKey::normalize(&attrs).unwrap(), key(&attrs));
    }

    #[test]
    fn test_whitespace_is_normalized() {
        let a = RequestAttributes::new("A beautiful sunset", 512, 512, "png");
        let b = RequestAttributes::new("  A   beautiful\tsunset \n", 512, 512, "png");
        assert_eq!(key(&a), key(&b));
    }

    #[test]
    fn test_case_is_preserved() {
        let a = RequestAttributes::new("A beautiful sunset", 512, 512, "png");
        let b = RequestAttributes::new("a beautiful sunset", 512, 512, "png");
        assert_ne!(key(&a), key(&b));
    }

    #[test]
    fn test_format_aliases() {
        let a = RequestAttributes::new("cat", 64, 64, "jpg");
        let b = RequestAttributes::new("cat", 64, 64, "JPEG");
        assert_eq!(key(&a), key(&b));
        let c = RequestAttributes::new("cat", 64, 64, "png");
        assert_ne!(key(&a), key(&c));
    }

    #[test]
    fn test_every_field_changes_the_key() {
        let base = RequestAttributes::new("cat", 64, 128, "png");
        let variants = [
            RequestAttributes::new("dog", 64, 128, "png"),
            RequestAttributes::new("cat", 65, 128, "png"),
            RequestAttributes::new("cat", 64, 129, "png"),
            RequestAttributes::new("cat", 64, 128, "webp"),
            base.clone().with_extra("seed", json!(7)),
        ];
        for variant in &variants {
            assert_ne!(key(&base), key(variant), "{:?}", variant);
        }
    }

    #[test]
    fn test_width_height_not_interchangeable() {
        let a = RequestAttributes::new("cat", 64, 128, "png");
        let b = RequestAttributes::new("cat", 128, 64, "png");
        assert_ne!(key(&a), key(&b));
    }

    #[test]
    fn test_extra_order_independent() {
        let a = RequestAttributes::new("cat", 64, 64, "png")
            .with_extra("style", json!("noir"))
            .with_extra("seed", json!(42));
        let b = RequestAttributes::new("cat", 64, 64, "png")
            .with_extra("seed", json!(42))
            .with_extra("style", json!("noir"));
        assert_eq!(key(&a), key(&b));
    }

    #[test]
    fn test_rejects_bad_input() {
        let normalizer = Normalizer::new(KeyLimits {
            max_prompt_chars: 10,
            max_dimension: 2048,
        });
        let cases = [
            (RequestAttributes::new("   ", 64, 64, "png"), "prompt"),
            (RequestAttributes::new("x".repeat(11), 64, 64, "png"), "prompt"),
            (RequestAttributes::new("cat", 0, 64, "png"), "width"),
            (RequestAttributes::new("cat", 64, 4096, "png"), "height"),
            (RequestAttributes::new("cat", 64, 64, "bmp"), "format"),
        ];
        for (attrs, expected_field) in cases {
            match normalizer.normalize(&attrs) {
                Err(PlacegenError::Normalization { field, .. }) => {
                    assert_eq!(field, expected_field)
                }
                other => panic!("expected normalization error, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_hex_round_trip() {
        let k = key(&RequestAttributes::new("cat", 64, 64, "gif"));
        assert_eq!(GenerationKey::from_hex(&k.to_hex()).unwrap(), k);
        assert!(GenerationKey::from_hex("abcd").is_err());
    }

    #[test]
    fn test_normalized_request_fields() {
        let normalized = Normalizer::default()
            .normalize(&RequestAttributes::new(" hello  world ", 320, 240, "Jpeg"))
            .unwrap();
        assert_eq!(normalized.prompt, "hello world");
        assert_eq!(normalized.format, ImageFormat::Jpeg);
        assert_eq!(normalized.format.mime_type(), "image/jpeg");
    }
}
