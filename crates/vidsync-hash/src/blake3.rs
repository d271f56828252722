//! BLAKE3 content hashing for footage files
//!
//! Video files run to several gigabytes, so files are always hashed through a
//! fixed read buffer rather than loaded whole.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;

/// A BLAKE3 hash digest (32 bytes), displayed as 64 hex chars
pub type Hash = blake3::Hash;

const READ_BUF: usize = 256 * 1024;

/// Hash a byte slice in memory.
pub fn hash_bytes(data: &[u8]) -> Hash {
    blake3::hash(data)
}

/// Hash a file's full content with a streaming reader.
pub fn hash_file(path: &Path) -> Result<Hash> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("opening file for hashing: {}", path.display()))?;

    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; READ_BUF];

    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("reading for hash: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize())
}

/// Format a hash as lowercase hex string (64 chars)
pub fn hash_to_hex(hash: &Hash) -> String {
    hash.to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    #[test]
    fn file_hash_matches_slice_hash() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        // Larger than one read buffer so the loop runs more than once
        let data: Vec<u8> = (0..(READ_BUF * 2 + 17)).map(|i| (i % 251) as u8).collect();
        tmp.write_all(&data).unwrap();

        let from_file = hash_file(tmp.path()).unwrap();
        assert_eq!(from_file, hash_bytes(&data));
        assert_eq!(hash_to_hex(&from_file).len(), 64);
    }

    #[test]
    fn missing_file_errors() {
        let err = hash_file(Path::new("/definitely/not/here.mp4")).unwrap_err();
        assert!(err.to_string().contains("opening file for hashing"));
    }

    proptest! {
        #[test]
        fn hash_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..=4096)) {
            let h1 = hash_bytes(&data);
            let h2 = hash_bytes(&data);
            prop_assert_eq!(h1, h2, "BLAKE3 must be deterministic for same input");
        }
    }
}
