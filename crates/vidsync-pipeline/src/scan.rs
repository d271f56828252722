//! Catalog scan of a mounted device.
//!
//! Walks the source root, keeps video files, and resolves each file's
//! capture date through: SRT sidecar → date in the path → birth time →
//! modify time → sync start.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use vidsync_core::config::SyncConfig;
use vidsync_core::types::DateSource;

use crate::dates::{self, MIN_FILE_CLOCK_YEAR};

/// Which files a scan picks up.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Lower-case extensions without the dot
    pub extensions: Vec<String>,
    pub exclude: Vec<glob::Pattern>,
}

impl ScanOptions {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let exclude = config
            .exclude_patterns
            .iter()
            .map(|p| glob::Pattern::new(p).with_context(|| format!("invalid exclude pattern: {p}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(ScanOptions {
            extensions: config
                .video_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            exclude,
        })
    }

    pub fn is_video(&self, path: &Path) -> bool {
        path.extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .is_some_and(|e| self.extensions.iter().any(|x| *x == e))
    }

    fn is_excluded(&self, rel: &str) -> bool {
        self.exclude.iter().any(|p| p.matches(rel))
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            extensions: SyncConfig::default().video_extensions,
            exclude: Vec::new(),
        }
    }
}

/// One video found on the device.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub path: PathBuf,
    /// Path relative to the source root, `/`-separated
    pub rel: String,
    pub size: u64,
    pub date: DateTime<Utc>,
    pub date_source: DateSource,
}

/// Resolve a capture date for `path`.
pub fn resolve_date(
    path: &Path,
    rel: &str,
    meta: &std::fs::Metadata,
    sync_start: DateTime<Utc>,
) -> (DateTime<Utc>, DateSource) {
    if let Some(t) = dates::sidecar_date(path) {
        return (t, DateSource::Sidecar);
    }
    if let Some(t) = dates::path_date(rel) {
        return (t, DateSource::PathPattern);
    }
    if let Some(t) = meta
        .created()
        .ok()
        .map(dates::system_time_to_utc)
        .filter(|t| dates::is_plausible(*t, MIN_FILE_CLOCK_YEAR))
    {
        return (t, DateSource::BirthTime);
    }
    if let Some(t) = meta
        .modified()
        .ok()
        .map(dates::system_time_to_utc)
        .filter(|t| dates::is_plausible(*t, MIN_FILE_CLOCK_YEAR))
    {
        return (t, DateSource::ModifyTime);
    }
    (sync_start, DateSource::SyncStart)
}

/// Recursively catalog the videos under `root`, in path order.
pub fn scan(
    root: &Path,
    options: &ScanOptions,
    sync_start: DateTime<Utc>,
) -> Result<Vec<CatalogEntry>> {
    let mut entries = Vec::new();
    walk(root, root, options, sync_start, &mut entries)?;
    Ok(entries)
}

fn walk(
    root: &Path,
    dir: &Path,
    options: &ScanOptions,
    sync_start: DateTime<Utc>,
    out: &mut Vec<CatalogEntry>,
) -> Result<()> {
    let mut children: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("reading dir: {}", dir.display()))?
        .filter_map(|e| e.ok())
        .collect();
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let path = child.path();
        let file_type = match child.file_type() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(path = %path.display(), "skipping unreadable entry: {e}");
                continue;
            }
        };
        let rel = rel_path(root, &path);
        if options.is_excluded(&rel) {
            continue;
        }
        if file_type.is_dir() {
            walk(root, &path, options, sync_start, out)?;
        } else if file_type.is_file() && options.is_video(&path) {
            let meta = child
                .metadata()
                .with_context(|| format!("stat: {}", path.display()))?;
            let (date, date_source) = resolve_date(&path, &rel, &meta, sync_start);
            out.push(CatalogEntry {
                size: meta.len(),
                path,
                rel,
                date,
                date_source,
            });
        }
    }
    Ok(())
}

fn rel_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_scan_filters_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("DCIM/100MEDIA")).unwrap();
        std::fs::create_dir_all(root.join("MISC")).unwrap();
        std::fs::write(root.join("DCIM/100MEDIA/DJI_0002.MP4"), b"22").unwrap();
        std::fs::write(root.join("DCIM/100MEDIA/DJI_0001.mov"), b"1").unwrap();
        std::fs::write(root.join("DCIM/100MEDIA/DJI_0001.SRT"), b"srt").unwrap();
        std::fs::write(root.join("MISC/readme.txt"), b"x").unwrap();
        std::fs::write(root.join("MISC/clip.MKV"), b"333").unwrap();

        let entries = scan(root, &ScanOptions::default(), Utc::now()).unwrap();
        let rels: Vec<_> = entries.iter().map(|e| e.rel.as_str()).collect();
        assert_eq!(
            rels,
            [
                "DCIM/100MEDIA/DJI_0001.mov",
                "DCIM/100MEDIA/DJI_0002.MP4",
                "MISC/clip.MKV"
            ]
        );
        assert_eq!(entries[1].size, 2);
    }

    #[test]
    fn test_exclude_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join(".Trashes")).unwrap();
        std::fs::write(root.join(".Trashes/old.mp4"), b"x").unwrap();
        std::fs::write(root.join("keep.mp4"), b"x").unwrap();

        let config = SyncConfig {
            exclude_patterns: vec![".Trashes/**".into(), ".Trashes".into()],
            ..Default::default()
        };
        let options = ScanOptions::from_config(&config).unwrap();
        let entries = scan(root, &options, Utc::now()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].rel, "keep.mp4");
    }

    #[test]
    fn test_sidecar_wins_over_path() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("2023-01-02")).unwrap();
        let video = root.join("2023-01-02/DJI_0001.MP4");
        std::fs::write(&video, b"v").unwrap();
        std::fs::write(
            root.join("2023-01-02/DJI_0001.SRT"),
            "1\n00:00:00,000 --> 00:00:00,033\n2024-05-01 10:11:12\n",
        )
        .unwrap();

        let entries = scan(root, &ScanOptions::default(), Utc::now()).unwrap();
        assert_eq!(entries[0].date_source, DateSource::Sidecar);
        assert_eq!(
            entries[0].date,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 11, 12).unwrap()
        );

        std::fs::remove_file(root.join("2023-01-02/DJI_0001.SRT")).unwrap();
        let entries = scan(root, &ScanOptions::default(), Utc::now()).unwrap();
        assert_eq!(entries[0].date_source, DateSource::PathPattern);
        assert_eq!(
            entries[0].date,
            Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_reset_clock_falls_back_to_sync_start() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("clip.mp4");
        let file = std::fs::File::create(&video).unwrap();
        // FAT cards without an RTC stamp files at the 1970 epoch
        file.set_modified(std::time::UNIX_EPOCH).unwrap();
        drop(file);

        let meta = std::fs::metadata(&video).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let (date, source) = resolve_date(&video, "clip.mp4", &meta, start);
        // Birth time on a fresh tmpfs file is "now", which is plausible
        if source != DateSource::BirthTime {
            assert_eq!(source, DateSource::SyncStart);
            assert_eq!(date, start);
        }
    }
}
