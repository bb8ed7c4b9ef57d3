//! Canonical stream identity
//!
//! Two requests share one encode exactly when their keys are equal. The key is
//! built from the format, the effective resolution, whether frames are split,
//! and the encoder options sorted by name.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::device::Resolution;

/// Encoder options, ordered by name
pub type StreamOptions = BTreeMap<String, Value>;

/// Canonical key for "these requests can share one encode"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey(String);

impl StreamKey {
    /// Build the key for a session
    pub fn new(
        format: &str,
        resolution: Resolution,
        split_frames: bool,
        options: &StreamOptions,
    ) -> Self {
        Self::from_pairs(format, resolution, split_frames, options.iter())
    }

    /// Build the key from option pairs in any order
    pub fn from_pairs<'a, I>(format: &str, resolution: Resolution, split_frames: bool, pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        let mut pairs: Vec<_> = pairs.into_iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));

        let mut key = format!("{}_{}_{}_", format, resolution, split_frames);
        for (name, value) in pairs {
            key.push_str(name);
            key.push_str(&canonical_value(value));
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Strings without their JSON quotes; everything else in compact JSON, with
// object members already sorted by serde_json's map.
fn canonical_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
