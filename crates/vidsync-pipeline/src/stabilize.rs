//! Stabilization stage.
//!
//! Two modes:
//!
//! - **merged**: each merged flight file becomes `<stem>_stabilized.mp4`
//!   next to it.
//! - **fragments**: raw fragments are stabilized one by one into the output
//!   folder and then concatenated per flight into
//!   `<prefix>_flight_<n>_stabilized.mp4`.
//!
//! The stabilizer reports no progress of its own, so a [`ProgressSampler`]
//! watches the output file grow while the tool runs.

use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vidsync_core::config::VidsyncConfig;
use vidsync_core::types::{JobProgress, LogEntry, StabilizeMode, StabilizePayload, TerminalStatus};
use vidsync_core::{PipelineError, PipelineResult, ProgressReporter, ToolFailureKind};

use crate::flight::{self, Flight};
use crate::thumbnail::remove_thumbnail;
use crate::tools::{run_checked, stderr_tail, ToolCommand, ToolRunner};

/// Percent complete of a running tool, if it can be estimated.
pub trait ProgressSampler: Send {
    fn sample(&mut self) -> Option<u8>;
}

/// Estimates progress from the output size relative to the input size.
/// Never reports 100 while the tool is still running.
#[derive(Debug, Clone)]
pub struct FileGrowthSampler {
    output: PathBuf,
    expected_bytes: u64,
}

impl FileGrowthSampler {
    pub fn new(output: PathBuf, expected_bytes: u64) -> Self {
        FileGrowthSampler {
            output,
            expected_bytes,
        }
    }
}

impl ProgressSampler for FileGrowthSampler {
    fn sample(&mut self) -> Option<u8> {
        if self.expected_bytes == 0 {
            return None;
        }
        let written = std::fs::metadata(&self.output).ok()?.len();
        Some((written.saturating_mul(100) / self.expected_bytes).min(99) as u8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuStatus {
    pub available: bool,
    pub detail: String,
}

/// Run the GPU probe command once. Any failure means no GPU.
pub async fn probe_gpu(runner: &dyn ToolRunner, program: &Path, args: &[String]) -> GpuStatus {
    let cmd = ToolCommand::new(program).args(args);
    match runner.run(&cmd).await {
        Ok(out) if out.success() && !out.stdout.trim().is_empty() => GpuStatus {
            available: true,
            detail: out.stdout.lines().next().unwrap_or_default().trim().to_string(),
        },
        Ok(out) => GpuStatus {
            available: false,
            detail: format!("{} reported no GPU: {}", cmd.tool_name(), stderr_tail(&out.stderr)),
        },
        Err(e) => GpuStatus {
            available: false,
            detail: format!("could not run {}: {e}", cmd.tool_name()),
        },
    }
}

#[derive(Debug, Clone)]
pub struct StabilizeSettings {
    pub enabled: bool,
    pub require_gpu: bool,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub sample_interval: Duration,
    pub default_time_gap_secs: u64,
    pub output_folder: String,
}

impl StabilizeSettings {
    pub fn from_config(config: &VidsyncConfig) -> Self {
        let s = &config.stabilization;
        StabilizeSettings {
            enabled: s.enabled,
            require_gpu: s.require_gpu,
            program: s.program.clone(),
            args: s.args.clone(),
            ffmpeg: config.tools.ffmpeg.clone(),
            ffprobe: config.tools.ffprobe.clone(),
            sample_interval: Duration::from_secs(s.sample_interval_secs.max(1)),
            default_time_gap_secs: config.merge.default_time_gap_secs,
            output_folder: config.merge.output_folder.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StabilizedFile {
    pub input: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StabilizeReport {
    pub success: bool,
    pub uuid: String,
    pub status: TerminalStatus,
    pub mode: StabilizeMode,
    pub target_folder: PathBuf,
    /// Final stabilized files, produced now or already present
    pub outputs: Vec<String>,
    pub stabilized: Vec<StabilizedFile>,
    pub skipped: Vec<String>,
    pub removed: Vec<String>,
    pub logs: Vec<LogEntry>,
    pub duration_seconds: f64,
}

/// `flight.mp4` → `flight_stabilized.mp4`
pub fn stabilized_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{stem}_stabilized.mp4")
}

/// Substitute `{input}` and `{output}` in the argument template.
pub fn render_args(template: &[String], input: &Path, output: &Path) -> Vec<OsString> {
    let input = input.to_string_lossy();
    let output = output.to_string_lossy();
    template
        .iter()
        .map(|a| {
            OsString::from(
                a.replace("{input}", &input)
                    .replace("{output}", &output),
            )
        })
        .collect()
}

/// ffmpeg concat demuxer list.
pub fn concat_manifest(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', r"'\''")))
        .collect()
}

pub fn concat_command(ffmpeg: &Path, manifest: &Path, output: &Path) -> ToolCommand {
    ToolCommand::new(ffmpeg)
        .args(["-y", "-loglevel", "error", "-f", "concat", "-safe", "0", "-i"])
        .arg(manifest.as_os_str())
        .args(["-c", "copy"])
        .arg(output.as_os_str())
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Merged flight files in `folder` that have not been stabilized.
fn merged_candidates(folder: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(folder)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            let name = basename(p).to_lowercase();
            name.ends_with(".mp4") && !name.contains("stabilized")
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Where a step falls in the whole run, for progress reporting.
#[derive(Debug, Clone, Copy)]
struct Step {
    index: usize,
    total: usize,
}

impl Step {
    fn overall(&self, within: u8) -> u8 {
        let total = self.total.max(1) as u64;
        ((self.index as u64 * 100 + within as u64) / total) as u8
    }
}

pub struct StabilizeStage {
    settings: StabilizeSettings,
    runner: Arc<dyn ToolRunner>,
    gpu: GpuStatus,
}

impl StabilizeStage {
    pub fn new(settings: StabilizeSettings, runner: Arc<dyn ToolRunner>, gpu: GpuStatus) -> Self {
        StabilizeStage {
            settings,
            runner,
            gpu,
        }
    }

    pub fn gpu(&self) -> &GpuStatus {
        &self.gpu
    }

    /// Fail fast when stabilization cannot run on this worker.
    pub fn check_capability(&self) -> PipelineResult<()> {
        if !self.settings.enabled {
            return Err(PipelineError::CapabilityUnavailable {
                capability: "stabilization".into(),
                detail: "stabilization is disabled in configuration".into(),
            });
        }
        if self.settings.require_gpu && !self.gpu.available {
            return Err(PipelineError::CapabilityUnavailable {
                capability: "gpu".into(),
                detail: self.gpu.detail.clone(),
            });
        }
        Ok(())
    }

    pub fn stabilizer_command(&self, input: &Path, output: &Path) -> ToolCommand {
        ToolCommand::new(&self.settings.program).args(render_args(
            &self.settings.args,
            input,
            output,
        ))
    }

    pub async fn run(
        &self,
        payload: &StabilizePayload,
        reporter: &ProgressReporter,
    ) -> PipelineResult<StabilizeReport> {
        self.check_capability()?;

        let started = Instant::now();
        if !payload.target_folder.is_dir() {
            return Err(PipelineError::not_found(
                "folder",
                payload.target_folder.display().to_string(),
            ));
        }

        let mut report = StabilizeReport {
            success: true,
            uuid: payload.uuid.clone(),
            status: TerminalStatus::Completed,
            mode: payload.mode,
            target_folder: payload.target_folder.clone(),
            outputs: Vec::new(),
            stabilized: Vec::new(),
            skipped: Vec::new(),
            removed: Vec::new(),
            logs: Vec::new(),
            duration_seconds: 0.0,
        };

        match payload.mode {
            StabilizeMode::Merged => self.run_merged(payload, reporter, &mut report).await?,
            StabilizeMode::Fragments => self.run_fragments(payload, reporter, &mut report).await?,
        }

        if report.outputs.is_empty() {
            reporter.info("Nothing to stabilize");
            report.status = TerminalStatus::NothingToDo;
        }
        report.logs = reporter.logs();
        report.duration_seconds = started.elapsed().as_secs_f64();
        Ok(report)
    }

    async fn run_merged(
        &self,
        payload: &StabilizePayload,
        reporter: &ProgressReporter,
        report: &mut StabilizeReport,
    ) -> PipelineResult<()> {
        let inputs = if payload.inputs.is_empty() {
            merged_candidates(&payload.target_folder)?
        } else {
            payload.inputs.clone()
        };

        let total = inputs.len();
        for (index, input) in inputs.iter().enumerate() {
            let output = input.with_file_name(stabilized_name(input));
            let out_name = basename(&output);
            if output.exists() {
                reporter.info(format!("Skipping {}: already stabilized", basename(input)));
                report.skipped.push(out_name.clone());
                report.outputs.push(out_name);
                continue;
            }
            if !input.is_file() {
                reporter.warn(format!("Skipping {}: file not found", input.display()));
                continue;
            }

            self.stabilize_file(input, &output, reporter, Step { index, total })
                .await?;
            reporter.success(format!("Stabilized {}", basename(input)));
            report.stabilized.push(StabilizedFile {
                input: basename(input),
                output: out_name.clone(),
            });
            report.outputs.push(out_name);

            if payload.config.delete_after_stabilize {
                remove_input(input, reporter, &mut report.removed);
            }
        }
        Ok(())
    }

    async fn run_fragments(
        &self,
        payload: &StabilizePayload,
        reporter: &ProgressReporter,
        report: &mut StabilizeReport,
    ) -> PipelineResult<()> {
        let gap = payload
            .config
            .time_gap_secs(self.settings.default_time_gap_secs);
        let flights = flight::group_flights(
            self.runner.as_ref(),
            &self.settings.ffprobe,
            &payload.target_folder,
            gap,
            reporter,
        )
        .await?;

        let output_dir = payload.target_folder.join(&self.settings.output_folder);
        tokio::fs::create_dir_all(&output_dir).await?;

        let prefix = payload.config.merge_name();
        let total = flights.iter().map(|f| f.file_paths.len()).sum();
        let mut index = 0;
        for (n, flight) in flights.iter().enumerate() {
            let final_name = format!("{prefix}_flight_{}_stabilized.mp4", n + 1);
            let final_path = output_dir.join(&final_name);
            if final_path.exists() {
                reporter.info(format!("Skipping flight {}: {final_name} exists", n + 1));
                index += flight.file_paths.len();
                report.skipped.push(final_name.clone());
                report.outputs.push(final_name);
                continue;
            }

            let segments = self
                .stabilize_fragments(flight, &output_dir, reporter, report, &mut index, total)
                .await?;
            self.join_segments(&segments, &final_path, &output_dir, n + 1)
                .await?;
            reporter.success(format!(
                "Flight {} stabilized into {final_name} ({} segments)",
                n + 1,
                segments.len()
            ));
            report.outputs.push(final_name);

            if payload.config.delete_after_stabilize {
                for input in &flight.file_paths {
                    remove_input(input, reporter, &mut report.removed);
                }
            }
        }
        Ok(())
    }

    async fn stabilize_fragments(
        &self,
        flight: &Flight,
        output_dir: &Path,
        reporter: &ProgressReporter,
        report: &mut StabilizeReport,
        index: &mut usize,
        total: usize,
    ) -> PipelineResult<Vec<PathBuf>> {
        let mut segments = Vec::with_capacity(flight.file_paths.len());
        for input in &flight.file_paths {
            let segment = output_dir.join(stabilized_name(input));
            if segment.exists() {
                reporter.info(format!("Reusing {}", basename(&segment)));
            } else {
                self.stabilize_file(input, &segment, reporter, Step { index: *index, total })
                    .await?;
                report.stabilized.push(StabilizedFile {
                    input: basename(input),
                    output: basename(&segment),
                });
            }
            *index += 1;
            segments.push(segment);
        }
        Ok(segments)
    }

    /// Concatenate stabilized segments into `final_path`, then drop them.
    async fn join_segments(
        &self,
        segments: &[PathBuf],
        final_path: &Path,
        output_dir: &Path,
        flight_no: usize,
    ) -> PipelineResult<()> {
        if let [only] = segments {
            tokio::fs::rename(only, final_path).await?;
            return Ok(());
        }

        let manifest = output_dir.join(format!("concat_{flight_no}.txt"));
        tokio::fs::write(&manifest, concat_manifest(segments)).await?;
        let cmd = concat_command(&self.settings.ffmpeg, &manifest, final_path);
        let result = run_checked(self.runner.as_ref(), &cmd).await;
        let _ = tokio::fs::remove_file(&manifest).await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(final_path).await;
            return Err(e);
        }

        for segment in segments {
            if let Err(e) = tokio::fs::remove_file(segment).await {
                tracing::warn!(segment = %segment.display(), "could not remove segment: {e}");
            }
        }
        Ok(())
    }

    /// Run the stabilizer on one file while sampling output growth.
    async fn stabilize_file(
        &self,
        input: &Path,
        output: &Path,
        reporter: &ProgressReporter,
        step: Step,
    ) -> PipelineResult<()> {
        let expected = std::fs::metadata(input)?.len();
        let mut sampler = FileGrowthSampler::new(output.to_path_buf(), expected);
        let name = basename(input);
        let cmd = self.stabilizer_command(input, output);
        reporter.info(format!("Stabilizing {name}"));

        let run = run_checked(self.runner.as_ref(), &cmd);
        tokio::pin!(run);
        let mut ticker = tokio::time::interval(self.settings.sample_interval);
        ticker.tick().await;

        let result = loop {
            tokio::select! {
                res = &mut run => break res,
                _ = ticker.tick() => {
                    if let Some(within) = sampler.sample() {
                        reporter.progress(JobProgress {
                            percent: step.overall(within),
                            current_file: Some(name.clone()),
                            moved: step.index as u64,
                            total: step.total as u64,
                            status: format!("Stabilizing {}/{}", step.index + 1, step.total),
                        });
                    }
                }
            }
        };

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(output).await;
            return Err(e);
        }
        if !output.is_file() {
            return Err(PipelineError::ToolInvocationFailure {
                tool: cmd.tool_name(),
                classification: ToolFailureKind::Generic,
                detail: format!("no output written to {}", output.display()),
            });
        }

        reporter.progress(JobProgress {
            percent: step.overall(100),
            current_file: Some(name),
            moved: step.index as u64 + 1,
            total: step.total as u64,
            status: format!("Stabilizing {}/{}", step.index + 1, step.total),
        });
        Ok(())
    }
}

fn remove_input(input: &Path, reporter: &ProgressReporter, removed: &mut Vec<String>) {
    match std::fs::remove_file(input) {
        Ok(()) => removed.push(basename(input)),
        Err(e) => reporter.warn(format!("Could not remove {}: {e}", input.display())),
    }
    if let Err(e) = remove_thumbnail(input) {
        reporter.warn(format!("Could not remove thumbnail of {}: {e}", input.display()));
    }
}
