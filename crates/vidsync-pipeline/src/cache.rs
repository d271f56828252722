//! Incremental sync fingerprint cache.
//!
//! Remembers a fingerprint per file path together with the size and modify
//! time it was computed for. A cached fingerprint is reused only while the
//! file's current stat still matches; anything else is recomputed.
//!
//! Two backends are available:
//!   - **JSON** (default): loads entirely into memory, flushed atomically via temp+rename.
//!   - **RocksDB** (behind the `rocksdb` feature): write-through with an in-memory mirror.
//!
//! Both implement `FingerprintStore`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use vidsync_core::config::{HashAlgorithm, IncrementalSyncConfig};
use vidsync_hash::FileStamp;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Fingerprint of one file at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub hash: String,
    pub algorithm: HashAlgorithm,
    pub size: u64,
    /// Modify time (ms) the hash was computed for
    pub mtime: i64,
    /// Last time (ms) this entry was used or refreshed
    pub last_check: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    files: HashMap<String, CacheEntry>,
    #[serde(default)]
    last_cleanup: i64,
}

/// In-memory fingerprint cache, persisted to a JSON file
pub struct FingerprintCache {
    db_path: PathBuf,
    data: CacheFile,
    dirty: bool,
}

impl FingerprintCache {
    /// Load or create a cache at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let data = if db_path.exists() {
            let content = std::fs::read_to_string(db_path)
                .with_context(|| format!("reading fingerprint cache: {}", db_path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing fingerprint cache: {}", db_path.display()))?
        } else {
            CacheFile::default()
        };

        Ok(FingerprintCache {
            db_path: db_path.to_path_buf(),
            data,
            dirty: false,
        })
    }

    pub fn get(&self, path: &Path) -> Option<&CacheEntry> {
        self.data.files.get(&path_key(path))
    }

    pub fn set(&mut self, path: &Path, entry: CacheEntry) {
        self.data.files.insert(path_key(path), entry);
        self.dirty = true;
    }

    pub fn remove(&mut self, path: &Path) {
        if self.data.files.remove(&path_key(path)).is_some() {
            self.dirty = true;
        }
    }

    pub fn len(&self) -> usize {
        self.data.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.files.is_empty()
    }

    /// Flush dirty changes to disk using an atomic write (write then rename).
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating cache dir: {}", parent.display()))?;
        }

        let json =
            serde_json::to_string_pretty(&self.data).context("serializing fingerprint cache")?;

        let tmp_path = self.db_path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)
            .with_context(|| format!("writing fingerprint cache temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.db_path)
            .with_context(|| format!("renaming fingerprint cache: {}", self.db_path.display()))?;

        self.dirty = false;
        Ok(())
    }
}

impl Drop for FingerprintCache {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                tracing::warn!("failed to flush fingerprint cache on drop: {e}");
            }
        }
    }
}

/// Trait for fingerprint cache backends (JSON and RocksDB).
pub trait FingerprintStore: Send {
    fn get(&self, path: &Path) -> Option<&CacheEntry>;
    fn set(&mut self, path: &Path, entry: CacheEntry);
    fn remove(&mut self, path: &Path);
    fn flush(&mut self) -> Result<()>;
    /// All entries as (key, entry) pairs.
    fn entries(&self) -> Vec<(String, &CacheEntry)>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool;
    fn last_cleanup(&self) -> i64;
    fn set_last_cleanup(&mut self, at_ms: i64);
}

impl FingerprintStore for FingerprintCache {
    fn get(&self, path: &Path) -> Option<&CacheEntry> {
        self.get(path)
    }
    fn set(&mut self, path: &Path, entry: CacheEntry) {
        self.set(path, entry);
    }
    fn remove(&mut self, path: &Path) {
        self.remove(path);
    }
    fn flush(&mut self) -> Result<()> {
        self.flush()
    }
    fn entries(&self) -> Vec<(String, &CacheEntry)> {
        self.data.files.iter().map(|(k, v)| (k.clone(), v)).collect()
    }
    fn len(&self) -> usize {
        self.len()
    }
    fn is_empty(&self) -> bool {
        self.is_empty()
    }
    fn last_cleanup(&self) -> i64 {
        self.data.last_cleanup
    }
    fn set_last_cleanup(&mut self, at_ms: i64) {
        self.data.last_cleanup = at_ms;
        self.dirty = true;
    }
}

// ── RocksDB backend ──────────────────────────────────────────────────────────

#[cfg(feature = "rocksdb")]
mod rocksdb_backend {
    use super::*;

    const LAST_CLEANUP_KEY: &[u8] = b"\0meta:last_cleanup";

    /// RocksDB-backed cache with an in-memory mirror so `get()` can hand out
    /// references. Writes go straight through; `flush()` is a no-op.
    pub struct RocksFingerprintCache {
        db: rocksdb::DB,
        entries: HashMap<String, CacheEntry>,
        last_cleanup: i64,
    }

    impl RocksFingerprintCache {
        pub fn open(db_path: &Path) -> Result<Self> {
            let mut opts = rocksdb::Options::default();
            opts.create_if_missing(true);

            let db = rocksdb::DB::open(&opts, db_path)
                .with_context(|| format!("opening RocksDB: {}", db_path.display()))?;

            let mut entries = HashMap::new();
            let mut last_cleanup = 0;
            for item in db.iterator(rocksdb::IteratorMode::Start) {
                let (key_bytes, value_bytes) = item.context("iterating RocksDB entries")?;
                if &*key_bytes == LAST_CLEANUP_KEY {
                    last_cleanup = serde_json::from_slice(&value_bytes).unwrap_or(0);
                    continue;
                }
                let key = String::from_utf8_lossy(&key_bytes).to_string();
                if let Ok(entry) = serde_json::from_slice::<CacheEntry>(&value_bytes) {
                    entries.insert(key, entry);
                }
            }

            Ok(RocksFingerprintCache {
                db,
                entries,
                last_cleanup,
            })
        }
    }

    impl FingerprintStore for RocksFingerprintCache {
        fn get(&self, path: &Path) -> Option<&CacheEntry> {
            self.entries.get(&path_key(path))
        }

        fn set(&mut self, path: &Path, entry: CacheEntry) {
            let key = path_key(path);
            if let Ok(json) = serde_json::to_vec(&entry) {
                if let Err(e) = self.db.put(key.as_bytes(), &json) {
                    tracing::warn!("RocksDB put failed for {key}: {e}");
                }
            }
            self.entries.insert(key, entry);
        }

        fn remove(&mut self, path: &Path) {
            let key = path_key(path);
            if let Err(e) = self.db.delete(key.as_bytes()) {
                tracing::warn!("RocksDB delete failed for {key}: {e}");
            }
            self.entries.remove(&key);
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }

        fn entries(&self) -> Vec<(String, &CacheEntry)> {
            self.entries.iter().map(|(k, v)| (k.clone(), v)).collect()
        }

        fn len(&self) -> usize {
            self.entries.len()
        }

        fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }

        fn last_cleanup(&self) -> i64 {
            self.last_cleanup
        }

        fn set_last_cleanup(&mut self, at_ms: i64) {
            self.last_cleanup = at_ms;
            if let Ok(json) = serde_json::to_vec(&at_ms) {
                if let Err(e) = self.db.put(LAST_CLEANUP_KEY, &json) {
                    tracing::warn!("RocksDB put failed for last_cleanup: {e}");
                }
            }
        }
    }
}

#[cfg(feature = "rocksdb")]
pub use rocksdb_backend::RocksFingerprintCache;

/// Dispatch enum over the compiled-in backends.
pub enum CacheBackend {
    Json(FingerprintCache),
    #[cfg(feature = "rocksdb")]
    Rocks(RocksFingerprintCache),
}

impl CacheBackend {
    /// Paths ending in `.json` use the JSON backend; anything else is a
    /// RocksDB directory when compiled with `rocksdb`.
    pub fn open(db_path: &Path) -> Result<Self> {
        let is_json = db_path
            .extension()
            .map(|ext| ext == "json")
            .unwrap_or(false);

        #[cfg(feature = "rocksdb")]
        if !is_json {
            return Ok(CacheBackend::Rocks(RocksFingerprintCache::open(db_path)?));
        }

        #[cfg(not(feature = "rocksdb"))]
        if !is_json {
            tracing::warn!(
                "RocksDB not compiled in (missing 'rocksdb' feature), falling back to JSON backend"
            );
            return Ok(CacheBackend::Json(FingerprintCache::open(
                &db_path.with_extension("json"),
            )?));
        }

        Ok(CacheBackend::Json(FingerprintCache::open(db_path)?))
    }

    fn store(&self) -> &dyn FingerprintStore {
        match self {
            CacheBackend::Json(c) => c,
            #[cfg(feature = "rocksdb")]
            CacheBackend::Rocks(c) => c,
        }
    }

    fn store_mut(&mut self) -> &mut dyn FingerprintStore {
        match self {
            CacheBackend::Json(c) => c,
            #[cfg(feature = "rocksdb")]
            CacheBackend::Rocks(c) => c,
        }
    }
}

impl FingerprintStore for CacheBackend {
    fn get(&self, path: &Path) -> Option<&CacheEntry> {
        self.store().get(path)
    }
    fn set(&mut self, path: &Path, entry: CacheEntry) {
        self.store_mut().set(path, entry)
    }
    fn remove(&mut self, path: &Path) {
        self.store_mut().remove(path)
    }
    fn flush(&mut self) -> Result<()> {
        self.store_mut().flush()
    }
    fn entries(&self) -> Vec<(String, &CacheEntry)> {
        self.store().entries()
    }
    fn len(&self) -> usize {
        self.store().len()
    }
    fn is_empty(&self) -> bool {
        self.store().is_empty()
    }
    fn last_cleanup(&self) -> i64 {
        self.store().last_cleanup()
    }
    fn set_last_cleanup(&mut self, at_ms: i64) {
        self.store_mut().set_last_cleanup(at_ms)
    }
}

/// Cache shared by concurrent sync jobs. Lock only for single calls.
pub type SharedCache = Arc<Mutex<CacheBackend>>;

pub fn shared(backend: CacheBackend) -> SharedCache {
    Arc::new(Mutex::new(backend))
}

// ── Decisions ────────────────────────────────────────────────────────────────

/// Why a copy is or is not needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyReason {
    IncrementalDisabled,
    DestNotFound,
    SizeMismatch,
    SizeMatch,
    HashMismatch,
    HashMatch,
}

impl std::fmt::Display for CopyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CopyReason::IncrementalDisabled => "incremental_disabled",
            CopyReason::DestNotFound => "dest_not_found",
            CopyReason::SizeMismatch => "size_mismatch",
            CopyReason::SizeMatch => "size_match",
            CopyReason::HashMismatch => "hash_mismatch",
            CopyReason::HashMatch => "hash_match",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOrigin {
    /// Cached fingerprint reused
    Hit,
    /// Cached entry existed but the file changed since
    Stale,
    Miss,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyDecision {
    pub should_copy: bool,
    pub reason: CopyReason,
    /// A cached source fingerprint was found but no longer matched the file
    pub source_stale: bool,
}

impl CopyDecision {
    fn new(should_copy: bool, reason: CopyReason) -> Self {
        CopyDecision {
            should_copy,
            reason,
            source_stale: false,
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fingerprint `path`, reusing the cached value while size and mtime match.
pub fn cached_fingerprint(
    store: &mut dyn FingerprintStore,
    path: &Path,
    algorithm: HashAlgorithm,
) -> Result<(String, LookupOrigin)> {
    let stamp = FileStamp::of(path)?;
    let now = now_ms();

    let origin = match store.get(path).cloned() {
        Some(mut entry)
            if entry.algorithm == algorithm
                && entry.size == stamp.size
                && entry.mtime == stamp.mtime_ms =>
        {
            entry.last_check = now;
            let hash = entry.hash.clone();
            store.set(path, entry);
            return Ok((hash, LookupOrigin::Hit));
        }
        Some(_) => LookupOrigin::Stale,
        None => LookupOrigin::Miss,
    };

    let hash = vidsync_hash::fingerprint(path, stamp, algorithm)?;
    store.set(
        path,
        CacheEntry {
            hash: hash.clone(),
            algorithm,
            size: stamp.size,
            mtime: stamp.mtime_ms,
            last_check: now,
        },
    );
    Ok((hash, origin))
}

/// Decide whether `source` must be copied over `dest`.
pub fn should_copy(
    store: &mut dyn FingerprintStore,
    source: &Path,
    dest: &Path,
    settings: &IncrementalSyncConfig,
) -> Result<CopyDecision> {
    if !settings.enabled {
        return Ok(CopyDecision::new(true, CopyReason::IncrementalDisabled));
    }

    let dest_meta = match std::fs::metadata(dest) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(CopyDecision::new(true, CopyReason::DestNotFound));
        }
        Err(e) => return Err(e).with_context(|| format!("stat: {}", dest.display())),
    };
    let source_meta =
        std::fs::metadata(source).with_context(|| format!("stat: {}", source.display()))?;

    if source_meta.len() != dest_meta.len() {
        return Ok(CopyDecision::new(true, CopyReason::SizeMismatch));
    }
    if settings.verify_size_only {
        return Ok(CopyDecision::new(false, CopyReason::SizeMatch));
    }

    let (source_hash, origin) = cached_fingerprint(store, source, settings.hash_algorithm)?;
    let (dest_hash, _) = cached_fingerprint(store, dest, settings.hash_algorithm)?;

    let mut decision = if source_hash == dest_hash {
        CopyDecision::new(false, CopyReason::HashMatch)
    } else {
        CopyDecision::new(true, CopyReason::HashMismatch)
    };
    decision.source_stale = origin == LookupOrigin::Stale;
    Ok(decision)
}

/// Drop entries not used within `expiry_days`. Returns how many were removed.
pub fn evict_expired(store: &mut dyn FingerprintStore, expiry_days: u64) -> usize {
    evict_expired_at(store, expiry_days, now_ms())
}

pub fn evict_expired_at(store: &mut dyn FingerprintStore, expiry_days: u64, now: i64) -> usize {
    let cutoff = now - expiry_days as i64 * DAY_MS;
    let expired: Vec<String> = store
        .entries()
        .into_iter()
        .filter(|(_, e)| e.last_check < cutoff)
        .map(|(k, _)| k)
        .collect();
    for key in &expired {
        store.remove(Path::new(key));
    }
    store.set_last_cleanup(now);
    expired.len()
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(last_check: i64) -> CacheEntry {
        CacheEntry {
            hash: "abc".into(),
            algorithm: HashAlgorithm::Composite,
            size: 1,
            mtime: 1,
            last_check,
        }
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("cache.json");
        {
            let mut cache = FingerprintCache::open(&db).unwrap();
            cache.set(Path::new("/share/a.mp4"), entry(5));
            cache.flush().unwrap();
        }
        let cache = FingerprintCache::open(&db).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(Path::new("/share/a.mp4")).unwrap().last_check, 5);
        assert!(!db.with_extension("tmp").exists());
    }

    #[test]
    fn test_drop_flushes_dirty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("cache.json");
        {
            let mut cache = FingerprintCache::open(&db).unwrap();
            cache.set(Path::new("/x.mp4"), entry(1));
        }
        assert_eq!(FingerprintCache::open(&db).unwrap().len(), 1);
    }

    #[test]
    fn test_eviction_uses_last_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = FingerprintCache::open(&dir.path().join("c.json")).unwrap();
        let now = 100 * DAY_MS;
        cache.set(Path::new("/old.mp4"), entry(now - 31 * DAY_MS));
        cache.set(Path::new("/fresh.mp4"), entry(now - 29 * DAY_MS));

        let removed = evict_expired_at(&mut cache, 30, now);
        assert_eq!(removed, 1);
        assert!(cache.get(Path::new("/old.mp4")).is_none());
        assert!(cache.get(Path::new("/fresh.mp4")).is_some());
        assert_eq!(FingerprintStore::last_cleanup(&cache), now);
    }

    #[test]
    fn test_disabled_always_copies() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = FingerprintCache::open(&dir.path().join("c.json")).unwrap();
        let settings = IncrementalSyncConfig::default();
        let decision = should_copy(
            &mut cache,
            Path::new("/nope/src"),
            Path::new("/nope/dst"),
            &settings,
        )
        .unwrap();
        assert!(decision.should_copy);
        assert_eq!(decision.reason, CopyReason::IncrementalDisabled);
    }
}
