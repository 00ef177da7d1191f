//! Deterministic, parameter-addressed cache keys.
//!
//! A key is `tts:` followed by the hex SHA-256 of a canonical JSON object
//! holding every [`SynthesisParams`] field plus the lane isolation tag.
//! Object keys are sorted and values JSON-escaped, so field order never
//! matters and no choice of text can collide with a different field split.

use crate::lane::Lane;
use crate::params::SynthesisParams;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Namespace prefix shared by every key.
pub const KEY_PREFIX: &str = "tts:";

/// Cache key for one synthesized artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for `params` served on `lane`.
    pub fn derive(params: &SynthesisParams, lane: Lane) -> Self {
        let mut fields: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
        fields.insert("text", params.text.as_str().into());
        fields.insert(
            "voice_id",
            params
                .voice_id
                .as_deref()
                .map_or(serde_json::Value::Null, Into::into),
        );
        fields.insert("model_revision", params.model_revision.as_str().into());
        fields.insert("quality", params.quality.as_str().into());
        fields.insert("sampler", params.sampler.as_str().into());
        fields.insert("watermark", params.watermark.into());
        fields.insert("format_version", params.format_version.into());
        fields.insert("lane", lane.as_str().into());

        // String-keyed JSON values cannot fail to serialize.
        let canonical = serde_json::to_vec(&fields).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        Self(format!("{KEY_PREFIX}{}", hex::encode(digest)))
    }

    /// Key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable 64-bit value for shard selection.
    pub(crate) fn shard_hint(&self) -> u64 {
        let hex_digest = &self.0[KEY_PREFIX.len()..];
        u64::from_str_radix(&hex_digest[..16], 16).unwrap_or(0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
