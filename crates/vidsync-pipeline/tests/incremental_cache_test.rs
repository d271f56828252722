//! Integration tests: copy decisions and fingerprint cache persistence.

mod common;

use tempfile::TempDir;

use common::{set_mtime, write_file};
use vidsync_core::config::{HashAlgorithm, IncrementalSyncConfig};
use vidsync_pipeline::cache::{
    cached_fingerprint, evict_expired_at, should_copy, CacheBackend, CopyReason, FingerprintStore,
    LookupOrigin,
};

fn enabled(algorithm: HashAlgorithm, size_only: bool) -> IncrementalSyncConfig {
    IncrementalSyncConfig {
        enabled: true,
        hash_algorithm: algorithm,
        verify_size_only: size_only,
        ..IncrementalSyncConfig::default()
    }
}

#[test]
fn identical_size_and_mtime_is_hash_match_or_size_match() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("usb/DJI_0001.MP4");
    let dest = tmp.path().join("share/DJI_0001.MP4");
    write_file(&src, &[9u8; 4096]);
    write_file(&dest, &[9u8; 4096]);
    set_mtime(&src, 1_714_557_600);
    set_mtime(&dest, 1_714_557_600);

    let mut store = CacheBackend::open(&tmp.path().join("cache.json")).unwrap();

    let full = should_copy(&mut store, &src, &dest, &enabled(HashAlgorithm::Composite, false)).unwrap();
    assert!(!full.should_copy);
    assert_eq!(full.reason, CopyReason::HashMatch);

    let fast = should_copy(&mut store, &src, &dest, &enabled(HashAlgorithm::Composite, true)).unwrap();
    assert!(!fast.should_copy);
    assert_eq!(fast.reason, CopyReason::SizeMatch);
}

#[test]
fn size_difference_forces_copy() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("a.mp4");
    let dest = tmp.path().join("b.mp4");
    write_file(&src, &[1u8; 100]);
    write_file(&dest, &[1u8; 99]);

    let mut store = CacheBackend::open(&tmp.path().join("cache.json")).unwrap();
    for size_only in [true, false] {
        let decision =
            should_copy(&mut store, &src, &dest, &enabled(HashAlgorithm::Blake3, size_only)).unwrap();
        assert!(decision.should_copy);
        assert_eq!(decision.reason, CopyReason::SizeMismatch);
    }
}

#[test]
fn content_hash_catches_same_size_edits() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("a.mp4");
    let dest = tmp.path().join("b.mp4");
    write_file(&src, b"aaaa");
    write_file(&dest, b"aaab");

    let mut store = CacheBackend::open(&tmp.path().join("cache.json")).unwrap();
    let decision = should_copy(&mut store, &src, &dest, &enabled(HashAlgorithm::Sha256, false)).unwrap();
    assert_eq!(decision.reason, CopyReason::HashMismatch);
    assert!(decision.should_copy);
}

#[test]
fn disabled_or_missing_dest_always_copies() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("a.mp4");
    write_file(&src, b"x");
    let mut store = CacheBackend::open(&tmp.path().join("cache.json")).unwrap();

    let off = should_copy(&mut store, &src, &src, &IncrementalSyncConfig::default()).unwrap();
    assert_eq!(off.reason, CopyReason::IncrementalDisabled);

    let missing = should_copy(
        &mut store,
        &src,
        &tmp.path().join("nope.mp4"),
        &enabled(HashAlgorithm::Blake3, false),
    )
    .unwrap();
    assert_eq!(missing.reason, CopyReason::DestNotFound);
    assert!(store.is_empty());
}

#[test]
fn cached_fingerprint_survives_reopen_and_detects_changes() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("cache.json");
    let file = tmp.path().join("clip.mp4");
    write_file(&file, &[3u8; 1000]);
    set_mtime(&file, 1_700_000_000);

    let first = {
        let mut store = CacheBackend::open(&db).unwrap();
        let (hash, origin) = cached_fingerprint(&mut store, &file, HashAlgorithm::Blake3).unwrap();
        assert_eq!(origin, LookupOrigin::Miss);
        store.flush().unwrap();
        hash
    };

    let mut store = CacheBackend::open(&db).unwrap();
    let (hash, origin) = cached_fingerprint(&mut store, &file, HashAlgorithm::Blake3).unwrap();
    assert_eq!(origin, LookupOrigin::Hit);
    assert_eq!(hash, first);

    write_file(&file, &[4u8; 1000]);
    set_mtime(&file, 1_700_000_500);
    let (changed, origin) = cached_fingerprint(&mut store, &file, HashAlgorithm::Blake3).unwrap();
    assert_eq!(origin, LookupOrigin::Stale);
    assert_ne!(changed, first);
}

#[test]
fn sweep_evicts_entries_past_expiry() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("clip.mp4");
    write_file(&file, b"x");
    let mut store = CacheBackend::open(&tmp.path().join("cache.json")).unwrap();
    cached_fingerprint(&mut store, &file, HashAlgorithm::Composite).unwrap();
    assert_eq!(store.len(), 1);

    let now = chrono::Utc::now().timestamp_millis();
    assert_eq!(evict_expired_at(&mut store, 30, now), 0);
    let later = now + 31 * 24 * 60 * 60 * 1000;
    assert_eq!(evict_expired_at(&mut store, 30, later), 1);
    assert!(store.is_empty());
    assert_eq!(store.last_cleanup(), later);
}
