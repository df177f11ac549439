//! Content fingerprints
//!
//! A fingerprint must be equal on every machine for the same set of
//! `(name, bytes)` pairs, whatever order the platform enumerated them in.
//! Dedup of local change signals and loop suppression across the mesh both
//! compare fingerprints computed on different hosts.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clipboard::ClipboardFormat;

/// Stable digest of a clipboard format set
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    /// The fingerprint stored before anything was broadcast or applied
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// SHA-256 over the formats sorted by name, then payload
    ///
    /// Each format contributes `len(name) || name || len(data) || data` with
    /// 64-bit little-endian lengths, so no two distinct sets share an input.
    pub fn of(formats: &[ClipboardFormat]) -> Self {
        let mut sorted: Vec<&ClipboardFormat> = formats.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.data.cmp(&b.data)));

        let mut hasher = Sha256::new();
        for format in sorted {
            hasher.update((format.name.len() as u64).to_le_bytes());
            hasher.update(format.name.as_bytes());
            hasher.update((format.data.len() as u64).to_le_bytes());
            hasher.update(&format.data);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for logs
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
