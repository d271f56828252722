//! vidsync-hash: file fingerprints for incremental sync
//!
//! # Overview
//! - `blake3`: streaming BLAKE3 content hash
//! - `sha256`: streaming SHA-256 content hash
//! - `fingerprint`: strategy dispatch, including the cheap size+mtime composite

pub mod blake3;
pub mod fingerprint;
pub mod sha256;

pub use fingerprint::{composite, fingerprint, FileStamp};
