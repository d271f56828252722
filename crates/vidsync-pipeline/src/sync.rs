//! Device sync stage.
//!
//! Mounts a removable device, catalogs its videos, and moves them into a new
//! timestamp-named folder under the device's destination:
//!
//! ```text
//! <dest_root>/<outputPath>/<YYYY-MM-DD_HH-mm-ss>/<relative path>
//! ```
//!
//! Each copy goes through a verified `.part` transfer. With incremental sync
//! on, a file whose previous copy in an earlier sync folder is unchanged is
//! left on the device.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use vidsync_core::config::{IncrementalSyncConfig, VidsyncConfig};
use vidsync_core::types::{JobProgress, LogEntry, ProcessedFile, SyncPayload, TerminalStatus};
use vidsync_core::{PipelineError, PipelineResult, ProgressReporter};

use crate::cache::{self, CopyDecision, FingerprintStore, SharedCache};
use crate::copy::{self, format_bytes};
use crate::dates;
use crate::mount::{MountAdapter, MountMode};
use crate::scan::{self, CatalogEntry, ScanOptions};
use crate::thumbnail;
use crate::tools::ToolRunner;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub dest_root: PathBuf,
    pub ffmpeg: PathBuf,
    pub scan: ScanOptions,
    pub thumbnails: bool,
    pub incremental: IncrementalSyncConfig,
    /// Bytes per second per device; `None` is unthrottled
    pub bandwidth_limit: Option<u64>,
}

impl SyncSettings {
    pub fn from_config(config: &VidsyncConfig) -> anyhow::Result<Self> {
        Ok(SyncSettings {
            dest_root: config.paths.dest_root.clone(),
            ffmpeg: config.tools.ffmpeg.clone(),
            scan: ScanOptions::from_config(&config.sync)?,
            thumbnails: config.sync.thumbnails,
            incremental: config.incremental_sync.clone(),
            bandwidth_limit: config.parallel_processing.bandwidth_limit_bytes(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub success: bool,
    pub uuid: String,
    pub device_name: String,
    pub status: TerminalStatus,
    pub files_moved: u64,
    pub files_skipped: u64,
    pub total_size: u64,
    pub duration_seconds: f64,
    /// `<dest_root>/<outputPath>`
    pub device_folder: PathBuf,
    /// This run's sync folder; removed again when nothing was copied
    pub target_folder: PathBuf,
    pub files: Vec<ProcessedFile>,
    pub logs: Vec<LogEntry>,
    pub dry_run: bool,
    pub read_only: bool,
}

/// Earlier sync folders of a device, newest first.
pub fn prior_sync_folders(device_folder: &Path, before: DateTime<Utc>) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(device_folder) else {
        return Vec::new();
    };
    let mut folders: Vec<(DateTime<Utc>, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|e| {
            let t = dates::sync_folder_time(&e.file_name().to_string_lossy())?;
            (t < before).then(|| (t, e.path()))
        })
        .collect();
    folders.sort_by(|a, b| b.0.cmp(&a.0));
    folders.into_iter().map(|(_, p)| p).collect()
}

/// Most recent earlier copy of `rel`, if any.
pub fn previous_copy(prior: &[PathBuf], rel: &str) -> Option<PathBuf> {
    prior.iter().map(|dir| dir.join(rel)).find(|p| p.is_file())
}

pub struct SyncStage {
    settings: SyncSettings,
    runner: Arc<dyn ToolRunner>,
    mount: MountAdapter,
    cache: SharedCache,
    /// One device at a time may hold the shared mount point
    mount_lock: tokio::sync::Mutex<()>,
}

impl SyncStage {
    pub fn new(
        settings: SyncSettings,
        runner: Arc<dyn ToolRunner>,
        mount: MountAdapter,
        cache: SharedCache,
    ) -> Self {
        SyncStage {
            settings,
            runner,
            mount,
            cache,
            mount_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn run(
        &self,
        payload: &SyncPayload,
        reporter: &ProgressReporter,
    ) -> PipelineResult<SyncReport> {
        let _mount_guard = self.mount_lock.lock().await;
        let started = Instant::now();
        let sync_start = Utc::now();

        let device = payload.device_path();
        reporter.info(format!(
            "Starting sync of {} ({})",
            payload.config.display_name(),
            device.display()
        ));
        let mode = self.mount.mount(&device, reporter).await?;

        let result = self
            .transfer_all(payload, reporter, &mode, sync_start, started)
            .await;
        self.mount.unmount(reporter).await;

        if let Err(e) = &result {
            reporter.error(format!("Sync failed: {e}"));
        }
        result
    }

    async fn transfer_all(
        &self,
        payload: &SyncPayload,
        reporter: &ProgressReporter,
        mode: &MountMode,
        sync_start: DateTime<Utc>,
        started: Instant,
    ) -> PipelineResult<SyncReport> {
        let config = &payload.config;
        let dry_run = config.dry_run || mode.is_read_only();
        if mode.is_read_only() && !config.dry_run {
            reporter.warn("Read-only mount: files will be copied but not removed from the device");
        }

        let subpath = config.source_subpath();
        let source_root = if subpath.is_empty() {
            self.mount.mount_point().to_path_buf()
        } else {
            self.mount.mount_point().join(subpath)
        };
        if !source_root.is_dir() {
            return Err(PipelineError::not_found(
                "source path",
                source_root.display().to_string(),
            ));
        }

        let device_folder = self.settings.dest_root.join(config.out_folder());
        let target = device_folder.join(dates::sync_folder_name(sync_start));

        let entries = {
            let root = source_root.clone();
            let options = self.settings.scan.clone();
            tokio::task::spawn_blocking(move || scan::scan(&root, &options, sync_start))
                .await
                .context("scan task panicked")??
        };
        let total = entries.len() as u64;
        reporter.info(format!(
            "Found {total} video files in {}",
            source_root.display()
        ));

        let mut report = SyncReport {
            success: true,
            uuid: payload.uuid.clone(),
            device_name: config.display_name().to_string(),
            status: TerminalStatus::Completed,
            files_moved: 0,
            files_skipped: 0,
            total_size: 0,
            duration_seconds: 0.0,
            device_folder: device_folder.clone(),
            target_folder: target.clone(),
            files: Vec::with_capacity(entries.len()),
            logs: Vec::new(),
            dry_run,
            read_only: mode.is_read_only(),
        };

        let prior = if self.settings.incremental.enabled {
            prior_sync_folders(&device_folder, sync_start)
        } else {
            Vec::new()
        };

        // Created lazily by the first copy; a same-second earlier run may own it.
        let target_preexisted = target.exists();

        let mut checked = 0u64;
        let mut stale = 0u64;
        for (i, entry) in entries.iter().enumerate() {
            if let Some(decision) = self.check_previous(&prior, entry).await? {
                checked += 1;
                stale += decision.source_stale as u64;
                if !decision.should_copy && self.settings.incremental.skip_unchanged {
                    reporter.info(format!("Unchanged: {} ({})", entry.rel, decision.reason));
                    report.files_skipped += 1;
                    report.files.push(processed(entry, None, true));
                    self.report_file(reporter, &report, i, total, &entry.rel);
                    continue;
                }
            }

            let dest = target.join(&entry.rel);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let size = copy::transfer(
                entry.path.clone(),
                dest.clone(),
                self.settings.bandwidth_limit,
                !dry_run,
            )
            .await?;

            let thumb = if self.settings.thumbnails {
                match thumbnail::generate(self.runner.as_ref(), &self.settings.ffmpeg, &dest).await
                {
                    Ok(p) => p.file_name().map(|n| n.to_string_lossy().into_owned()),
                    Err(e) => {
                        reporter.warn(format!("Thumbnail failed for {}: {e}", entry.rel));
                        None
                    }
                }
            } else {
                None
            };

            report.files_moved += 1;
            report.total_size += size;
            report.files.push(processed(entry, thumb, false));
            let remaining = total - (i as u64 + 1);
            reporter.info(format!(
                "Completed: {} ({}) - {}/{total} ({remaining} remaining)",
                entry.rel,
                format_bytes(size),
                report.files_moved
            ));
            self.report_file(reporter, &report, i, total, &entry.rel);
        }

        let threshold = self.settings.incremental.rescan_threshold_percent as u64;
        if stale > 0 && stale * 100 / checked >= threshold {
            reporter.warn(format!(
                "{stale} of {checked} cached fingerprints were stale; device contents changed since the last sync"
            ));
        }
        self.flush_cache().await;

        if report.files_moved == 0 {
            if !target_preexisted && target.exists() {
                if let Err(e) = tokio::fs::remove_dir(&target).await {
                    tracing::debug!(target = %target.display(), "could not remove empty sync folder: {e}");
                }
            }
            reporter.info("Nothing to do");
            report.status = TerminalStatus::NothingToDo;
        } else {
            reporter.success(format!(
                "Synced {} files ({}) to {}",
                report.files_moved,
                format_bytes(report.total_size),
                target.display()
            ));
        }

        report.logs = reporter.logs();
        report.duration_seconds = started.elapsed().as_secs_f64();
        Ok(report)
    }

    /// Compare against the newest earlier copy of the same file.
    async fn check_previous(
        &self,
        prior: &[PathBuf],
        entry: &CatalogEntry,
    ) -> PipelineResult<Option<CopyDecision>> {
        let Some(previous) = previous_copy(prior, &entry.rel) else {
            return Ok(None);
        };
        let cache = Arc::clone(&self.cache);
        let source = entry.path.clone();
        let settings = self.settings.incremental.clone();
        let decision = tokio::task::spawn_blocking(move || {
            let mut store = cache.lock().unwrap_or_else(|e| e.into_inner());
            cache::should_copy(&mut *store, &source, &previous, &settings)
        })
        .await
        .context("cache task panicked")??;
        Ok(Some(decision))
    }

    async fn flush_cache(&self) {
        let cache = Arc::clone(&self.cache);
        let flushed = tokio::task::spawn_blocking(move || {
            cache.lock().unwrap_or_else(|e| e.into_inner()).flush()
        })
        .await;
        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("fingerprint cache flush failed: {e:#}"),
            Err(e) => tracing::warn!("fingerprint cache flush panicked: {e}"),
        }
    }

    fn report_file(
        &self,
        reporter: &ProgressReporter,
        report: &SyncReport,
        index: usize,
        total: u64,
        rel: &str,
    ) {
        let done = index as u64 + 1;
        reporter.progress(JobProgress {
            percent: (done * 100 / total.max(1)) as u8,
            current_file: Some(rel.to_string()),
            moved: report.files_moved,
            total,
            status: "Running".into(),
        });
    }
}

fn processed(entry: &CatalogEntry, thumbnail: Option<String>, skipped: bool) -> ProcessedFile {
    ProcessedFile {
        path: entry.rel.clone(),
        size: entry.size,
        date: entry.date,
        date_source: entry.date_source,
        thumbnail,
        skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_prior_sync_folders_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "2024-05-01_10-00-00",
            "2024-05-03_10-00-00",
            "2024-05-02_10-00-00",
            "2024-06-01_10-00-00",
            "output",
        ] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        let before = Utc.with_ymd_and_hms(2024, 5, 20, 0, 0, 0).unwrap();
        let folders = prior_sync_folders(dir.path(), before);
        let names: Vec<_> = folders
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            ["2024-05-03_10-00-00", "2024-05-02_10-00-00", "2024-05-01_10-00-00"]
        );
    }

    #[test]
    fn test_previous_copy_prefers_newest() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("2024-05-01_10-00-00");
        let new = dir.path().join("2024-05-02_10-00-00");
        std::fs::create_dir_all(old.join("DCIM")).unwrap();
        std::fs::create_dir_all(new.join("DCIM")).unwrap();
        std::fs::write(old.join("DCIM/a.mp4"), b"old").unwrap();
        std::fs::write(new.join("DCIM/a.mp4"), b"new").unwrap();
        std::fs::write(old.join("DCIM/b.mp4"), b"old").unwrap();

        let prior = vec![new.clone(), old.clone()];
        assert_eq!(previous_copy(&prior, "DCIM/a.mp4"), Some(new.join("DCIM/a.mp4")));
        assert_eq!(previous_copy(&prior, "DCIM/b.mp4"), Some(old.join("DCIM/b.mp4")));
        assert_eq!(previous_copy(&prior, "DCIM/c.mp4"), None);
    }
}
