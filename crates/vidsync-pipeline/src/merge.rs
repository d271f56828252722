//! Merge stage: one output file per flight.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use vidsync_core::config::VidsyncConfig;
use vidsync_core::types::{JobProgress, LogEntry, MergePayload, MergeRecord, TerminalStatus};
use vidsync_core::{PipelineError, PipelineResult, ProgressReporter, ToolFailureKind};

use crate::dates::{self, MIN_CAPTURE_YEAR};
use crate::flight::{self, Flight};
use crate::thumbnail::remove_thumbnail;
use crate::tools::{run_checked, ToolCommand, ToolRunner};

#[derive(Debug, Clone)]
pub struct MergeSettings {
    pub mp4_merge: PathBuf,
    pub ffprobe: PathBuf,
    pub default_time_gap_secs: u64,
    /// Output folder name under the target, when the payload names none
    pub output_folder: String,
}

impl MergeSettings {
    pub fn from_config(config: &VidsyncConfig) -> Self {
        MergeSettings {
            mp4_merge: config.tools.mp4_merge.clone(),
            ffprobe: config.tools.ffprobe.clone(),
            default_time_gap_secs: config.merge.default_time_gap_secs,
            output_folder: config.merge.output_folder.clone(),
        }
    }
}

/// Which clue a flight's timestamp was taken from, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSource {
    FolderMetadata,
    DjiFileName,
    FlightCreation,
    SyncFolder,
    FileTime,
    Now,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub success: bool,
    pub uuid: String,
    pub status: TerminalStatus,
    pub target_folder: PathBuf,
    pub output_folder: PathBuf,
    pub flights: usize,
    /// Output basenames in flight order, merged or already present
    pub outputs: Vec<String>,
    pub merges: Vec<MergeRecord>,
    /// Outputs that already existed and were left alone
    pub skipped: Vec<String>,
    pub logs: Vec<LogEntry>,
    pub duration_seconds: f64,
}

impl MergeReport {
    pub fn output_paths(&self) -> Vec<PathBuf> {
        self.outputs
            .iter()
            .map(|name| self.output_folder.join(name))
            .collect()
    }
}

/// Pick the timestamp that names a flight's merged output.
pub fn resolve_flight_time(flight: &Flight, now: DateTime<Utc>) -> (DateTime<Utc>, TimeSource) {
    if let Some(t) = flight
        .extra_metadata
        .as_deref()
        .and_then(dates::folder_metadata_time)
    {
        return (t, TimeSource::FolderMetadata);
    }

    let first = flight.file_paths.first();
    if let Some(t) = first
        .and_then(|p| p.file_name())
        .and_then(|n| dates::dji_filename_time(&n.to_string_lossy()))
    {
        return (t, TimeSource::DjiFileName);
    }

    if let Some(t) = flight
        .created_time
        .filter(|t| dates::is_plausible(*t, MIN_CAPTURE_YEAR))
    {
        return (t, TimeSource::FlightCreation);
    }

    if let Some(t) = first.and_then(|p| {
        p.ancestors()
            .skip(1)
            .filter_map(|a| a.file_name())
            .find_map(|n| dates::sync_folder_time(&n.to_string_lossy()))
    }) {
        return (t, TimeSource::SyncFolder);
    }

    if let Some(t) = first.and_then(|p| file_time(p)) {
        return (t, TimeSource::FileTime);
    }

    (now, TimeSource::Now)
}

fn file_time(path: &Path) -> Option<DateTime<Utc>> {
    let meta = std::fs::metadata(path).ok()?;
    [meta.modified().ok(), meta.created().ok()]
        .into_iter()
        .flatten()
        .map(dates::system_time_to_utc)
        .find(|t| dates::is_plausible(*t, MIN_CAPTURE_YEAR))
}

/// `<prefix>_<YYYYMMDDThhmmssmmmZ>_<folderCount>.mp4`
pub fn output_name(prefix: &str, time: DateTime<Utc>, folder_count: usize) -> String {
    format!("{prefix}_{}_{folder_count}.mp4", dates::compact_iso(time))
}

/// Names handed out during one merge run. A name already claimed moves to
/// the next free index, so flights from different subfolders that resolve
/// to the same time never share an output.
#[derive(Debug, Default)]
pub struct OutputNames {
    claimed: HashSet<String>,
}

impl OutputNames {
    pub fn claim(&mut self, prefix: &str, time: DateTime<Utc>, folder_count: usize) -> String {
        let mut index = folder_count;
        loop {
            let name = output_name(prefix, time, index);
            if self.claimed.insert(name.clone()) {
                return name;
            }
            index += 1;
        }
    }
}

pub fn merge_command(mp4_merge: &Path, inputs: &[PathBuf], output: &Path) -> ToolCommand {
    ToolCommand::new(mp4_merge)
        .args(inputs.iter().map(|p| p.as_os_str()))
        .arg("--out")
        .arg(output.as_os_str())
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn stamp_times(path: &Path, time: DateTime<Utc>) -> std::io::Result<()> {
    let t = SystemTime::from(time);
    std::fs::File::options()
        .write(true)
        .open(path)?
        .set_times(FileTimes::new().set_accessed(t).set_modified(t))
}

pub struct MergeStage {
    settings: MergeSettings,
    runner: Arc<dyn ToolRunner>,
}

impl MergeStage {
    pub fn new(settings: MergeSettings, runner: Arc<dyn ToolRunner>) -> Self {
        MergeStage { settings, runner }
    }

    pub fn output_folder(&self, payload: &MergePayload) -> PathBuf {
        payload
            .output_folder
            .clone()
            .unwrap_or_else(|| payload.target_folder.join(&self.settings.output_folder))
    }

    pub async fn run(
        &self,
        payload: &MergePayload,
        reporter: &ProgressReporter,
    ) -> PipelineResult<MergeReport> {
        let started = Instant::now();
        let target = &payload.target_folder;
        if !target.is_dir() {
            return Err(PipelineError::not_found(
                "folder",
                target.display().to_string(),
            ));
        }

        let output_folder = self.output_folder(payload);
        tokio::fs::create_dir_all(&output_folder).await?;

        let gap = payload
            .config
            .time_gap_secs(self.settings.default_time_gap_secs);
        reporter.info(format!(
            "Grouping flights in {} (gap {gap}s)",
            target.display()
        ));
        let flights = flight::group_flights(
            self.runner.as_ref(),
            &self.settings.ffprobe,
            target,
            gap,
            reporter,
        )
        .await?;

        let mut report = MergeReport {
            success: true,
            uuid: payload.uuid.clone(),
            status: TerminalStatus::Completed,
            target_folder: target.clone(),
            output_folder: output_folder.clone(),
            flights: flights.len(),
            outputs: Vec::new(),
            merges: Vec::new(),
            skipped: Vec::new(),
            logs: Vec::new(),
            duration_seconds: 0.0,
        };

        if flights.is_empty() {
            reporter.info("No flights found");
            report.status = TerminalStatus::NothingToDo;
            report.logs = reporter.logs();
            report.duration_seconds = started.elapsed().as_secs_f64();
            return Ok(report);
        }

        let prefix = payload.config.merge_name();
        let total = flights.len() as u64;
        let mut names = OutputNames::default();
        for (i, flight) in flights.iter().enumerate() {
            let (time, source) = resolve_flight_time(flight, Utc::now());
            let name = names.claim(prefix, time, flight.folder_count);
            let output = output_folder.join(&name);

            reporter.progress(JobProgress {
                percent: (i as u64 * 100 / total) as u8,
                current_file: Some(name.clone()),
                moved: i as u64,
                total,
                status: format!("Merging flight {}/{}", i + 1, total),
            });

            if output.exists() {
                reporter.info(format!("Skipping {name}: already merged"));
                report.skipped.push(name.clone());
                report.outputs.push(name);
                continue;
            }

            tracing::debug!(output = %name, ?source, fragments = flight.file_paths.len(), "merging flight");
            let cmd = merge_command(&self.settings.mp4_merge, &flight.file_paths, &output);
            run_checked(self.runner.as_ref(), &cmd).await?;
            if !output.is_file() {
                return Err(PipelineError::ToolInvocationFailure {
                    tool: cmd.tool_name(),
                    classification: ToolFailureKind::Generic,
                    detail: format!("no output written to {}", output.display()),
                });
            }
            if let Err(e) = stamp_times(&output, time) {
                reporter.warn(format!("Could not set times on {name}: {e}"));
            }

            let mut removed = Vec::new();
            if payload.config.delete_after_merge {
                for input in &flight.file_paths {
                    match std::fs::remove_file(input) {
                        Ok(()) => removed.push(basename(input)),
                        Err(e) => reporter.warn(format!("Could not remove {}: {e}", input.display())),
                    }
                    if let Err(e) = remove_thumbnail(input) {
                        reporter.warn(format!("Could not remove thumbnail of {}: {e}", input.display()));
                    }
                }
            }

            reporter.success(format!(
                "Merged {} fragments into {name}",
                flight.file_paths.len()
            ));
            report.merges.push(MergeRecord {
                output: name.clone(),
                inputs: flight.file_paths.iter().map(|p| basename(p)).collect(),
                removed,
            });
            report.outputs.push(name);
        }

        reporter.progress(JobProgress {
            percent: 100,
            current_file: None,
            moved: total,
            total,
            status: "Completed".into(),
        });
        report.logs = reporter.logs();
        report.duration_seconds = started.elapsed().as_secs_f64();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn flight(paths: &[&str], created: Option<DateTime<Utc>>, extra: Option<&str>) -> Flight {
        Flight {
            file_paths: paths.iter().map(PathBuf::from).collect(),
            created_time: created,
            folder_count: 0,
            extra_metadata: extra.map(str::to_string),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_output_name() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 14, 30, 0).unwrap();
        assert_eq!(output_name("Mavic", t, 2), "Mavic_20240501T143000000Z_2.mp4");
    }

    #[test]
    fn test_output_names_disambiguate_within_run() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 14, 30, 0).unwrap();
        let mut names = OutputNames::default();
        assert_eq!(names.claim("Mavic", t, 0), "Mavic_20240501T143000000Z_0.mp4");
        assert_eq!(names.claim("Mavic", t, 1), "Mavic_20240501T143000000Z_1.mp4");
        assert_eq!(names.claim("Mavic", t, 0), "Mavic_20240501T143000000Z_2.mp4");
        let later = Utc.with_ymd_and_hms(2024, 5, 1, 15, 0, 0).unwrap();
        assert_eq!(names.claim("Mavic", later, 0), "Mavic_20240501T150000000Z_0.mp4");
    }

    #[test]
    fn test_folder_metadata_wins() {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let f = flight(
            &["/x/DJI_20240501143000_0001_D.MP4"],
            Some(created),
            Some("03-12-2024_02-15-09 pm"),
        );
        let (t, source) = resolve_flight_time(&f, now());
        assert_eq!(source, TimeSource::FolderMetadata);
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 12, 3, 14, 15, 9).unwrap());
    }

    #[test]
    fn test_dji_name_before_creation_time() {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let f = flight(&["/x/DJI_20240501143000_0001_D.MP4"], Some(created), None);
        assert_eq!(resolve_flight_time(&f, now()).1, TimeSource::DjiFileName);
    }

    #[test]
    fn test_unset_clock_falls_through_to_sync_folder() {
        let unset = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        let f = flight(&["/share/drone/2024-05-01_10-00-00/DJI_0001.MP4"], Some(unset), None);
        let (t, source) = resolve_flight_time(&f, now());
        assert_eq!(source, TimeSource::SyncFolder);
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_nothing_known_uses_now() {
        let f = flight(&["/nonexistent/clip.mp4"], None, None);
        assert_eq!(resolve_flight_time(&f, now()), (now(), TimeSource::Now));
    }

    #[test]
    fn test_merge_command_args() {
        let cmd = merge_command(
            Path::new("/usr/local/bin/mp4_merge"),
            &[PathBuf::from("a.mp4"), PathBuf::from("b.mp4")],
            Path::new("out.mp4"),
        );
        assert_eq!(cmd.display(), "/usr/local/bin/mp4_merge a.mp4 b.mp4 --out out.mp4");
    }
}
