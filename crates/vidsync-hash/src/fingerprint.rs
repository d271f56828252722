//! File fingerprints for incremental sync comparisons.
//!
//! The composite strategy never reads content: it digests `"{size}-{mtime_ms}"`
//! and is only as trustworthy as the device clock. Full strategies read every
//! byte.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::UNIX_EPOCH;

use vidsync_core::config::HashAlgorithm;

/// Size and modify time as recorded for a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub size: u64,
    /// Modify time in milliseconds since the Unix epoch
    pub mtime_ms: i64,
}

impl FileStamp {
    pub fn of(path: &Path) -> Result<Self> {
        let meta =
            std::fs::metadata(path).with_context(|| format!("stat: {}", path.display()))?;
        Ok(Self::from_metadata(&meta))
    }

    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        FileStamp {
            size: meta.len(),
            mtime_ms,
        }
    }
}

/// 16-hex-char digest of size and modify time.
pub fn composite(stamp: FileStamp) -> String {
    let key = format!("{}-{}", stamp.size, stamp.mtime_ms);
    crate::blake3::hash_to_hex(&crate::blake3::hash_bytes(key.as_bytes()))[..16].to_string()
}

/// Fingerprint a file with the given strategy.
pub fn fingerprint(path: &Path, stamp: FileStamp, algorithm: HashAlgorithm) -> Result<String> {
    match algorithm {
        HashAlgorithm::Composite => Ok(composite(stamp)),
        HashAlgorithm::Blake3 => {
            crate::blake3::hash_file(path).map(|h| crate::blake3::hash_to_hex(&h))
        }
        HashAlgorithm::Sha256 => crate::sha256::hash_file_hex(path),
    }
}
