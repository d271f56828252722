//! vidsync: operator CLI for the footage ingestion pipeline
//!
//! Commands:
//!   config show                 - display the effective configuration
//!   devices list                - list registered devices
//!   flights <folder>            - group a folder's fragments into flights (dry run)
//!   merge <folder>              - merge flights locally with mp4-merge
//!   stabilize <folder>          - stabilize merged flights or raw fragments
//!   should-copy <src> <dest>    - explain the incremental copy decision
//!   cache stats | cache sweep   - inspect or evict the fingerprint cache
//!   jobs [--state <state>]      - read the daemon's job queue

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use vidsync_core::config::{HashAlgorithm, VidsyncConfig};
use vidsync_core::device::{DeviceConfig, DeviceRegistry, DeviceStatus};
use vidsync_core::types::{
    JobRecord, JobState, LogEntry, LogLevel, MergePayload, StabilizeMode, StabilizePayload,
};
use vidsync_core::{ProgressReporter, StageUpdate};
use vidsync_pipeline::cache::{self, CacheBackend, FingerprintStore};
use vidsync_pipeline::copy::format_bytes;
use vidsync_pipeline::merge::{resolve_flight_time, MergeSettings, OutputNames};
use vidsync_pipeline::stabilize::{probe_gpu, StabilizeSettings};
use vidsync_pipeline::{group_flights, MergeStage, StabilizeStage, SystemRunner, ToolRunner};
use vidsync_queue::JobQueue;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "vidsync",
    version,
    about = "vidsync footage pipeline client",
    long_about = "vidsync: inspect flights, run merges and stabilization locally, \
                  maintain the fingerprint cache and read the job queue"
)]
struct Cli {
    /// Path to vidsync.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "VIDSYNC_CONFIG",
        default_value = "/etc/vidsync/vidsync.toml"
    )]
    config: PathBuf,

    /// Log level for diagnostics on stderr
    #[arg(long, env = "VIDSYNC_LOG", default_value = "error")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Device registry
    Devices {
        #[command(subcommand)]
        action: DevicesAction,
    },

    /// Group a folder's fragments into flights without merging anything
    Flights {
        folder: PathBuf,
        /// Time gap in seconds that splits flights (default: [merge] default_time_gap_secs)
        #[arg(long)]
        gap: Option<u64>,
        /// Name prefix used to preview output file names
        #[arg(long, short = 'p', default_value = "flight")]
        prefix: String,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    // ── Local stage runs ───────────────────────────────────────────────────────

    /// Merge each flight in a folder into one file
    Merge {
        folder: PathBuf,
        /// Output folder (default: <folder>/<[merge] output_folder>)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        /// Output name prefix
        #[arg(long, short = 'p', default_value = "flight")]
        prefix: String,
        /// Time gap in seconds that splits flights
        #[arg(long)]
        gap: Option<u64>,
        /// Delete fragments once their flight is merged
        #[arg(long)]
        delete: bool,
    },

    /// Stabilize merged flights in a folder (or raw fragments with --fragments)
    Stabilize {
        folder: PathBuf,
        /// Stabilize raw fragments, then re-merge them per flight
        #[arg(long)]
        fragments: bool,
        /// Output name prefix used when re-merging fragments
        #[arg(long, short = 'p', default_value = "flight")]
        prefix: String,
        /// Delete inputs once their stabilized copy exists
        #[arg(long)]
        delete: bool,
    },

    // ── Incremental cache ──────────────────────────────────────────────────────

    /// Explain whether <source> would be copied over <dest>
    #[command(name = "should-copy")]
    ShouldCopy {
        source: PathBuf,
        dest: PathBuf,
        /// Compare sizes only
        #[arg(long)]
        size_only: bool,
        /// Fingerprint algorithm (default: [incremental_sync] hash_algorithm)
        #[arg(long, value_enum)]
        algorithm: Option<AlgorithmArg>,
    },

    /// Fingerprint cache maintenance (stop vidsyncd first when using RocksDB)
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show jobs from the daemon's queue file
    Jobs {
        /// Only jobs in this state
        #[arg(long, short = 's', value_enum)]
        state: Option<StateArg>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Subcommand, Debug)]
enum DevicesAction {
    /// List devices in the registry
    List {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Entry counts and last sweep time
    Stats,
    /// Evict entries not checked within the expiry window
    Sweep {
        /// Expiry in days (default: [incremental_sync] cache_expiry_days)
        #[arg(long)]
        days: Option<u64>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AlgorithmArg {
    Composite,
    Blake3,
    Sha256,
}

impl From<AlgorithmArg> for HashAlgorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Composite => HashAlgorithm::Composite,
            AlgorithmArg::Blake3 => HashAlgorithm::Blake3,
            AlgorithmArg::Sha256 => HashAlgorithm::Sha256,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StateArg {
    Queued,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl From<StateArg> for JobState {
    fn from(arg: StateArg) -> Self {
        match arg {
            StateArg::Queued => JobState::Queued,
            StateArg::Active => JobState::Active,
            StateArg::Completed => JobState::Completed,
            StateArg::Failed => JobState::Failed,
            StateArg::Cancelled => JobState::Cancelled,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries command output; diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config),
        Commands::Devices { action: DevicesAction::List { json } } => {
            cmd_devices_list(&config, json)
        }
        Commands::Flights { folder, gap, prefix, json } => {
            cmd_flights(&config, &folder, gap, &prefix, json).await
        }
        Commands::Merge { folder, output, prefix, gap, delete } => {
            cmd_merge(&config, &folder, output, &prefix, gap, delete).await
        }
        Commands::Stabilize { folder, fragments, prefix, delete } => {
            cmd_stabilize(&config, &folder, fragments, &prefix, delete).await
        }
        Commands::ShouldCopy { source, dest, size_only, algorithm } => {
            cmd_should_copy(&config, &source, &dest, size_only, algorithm)
        }
        Commands::Cache { action: CacheAction::Stats } => cmd_cache_stats(&config),
        Commands::Cache { action: CacheAction::Sweep { days } } => cmd_cache_sweep(&config, days),
        Commands::Jobs { state, json } => cmd_jobs(&config, state.map(JobState::from), json),
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<VidsyncConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(VidsyncConfig::default())
    }
}

// ── Progress display ──────────────────────────────────────────────────────────

fn make_progress_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Render stage updates on `pb` until every reporter clone is dropped.
fn follow_progress(mut rx: UnboundedReceiver<StageUpdate>, pb: ProgressBar) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            match update {
                StageUpdate::Progress(p) => {
                    pb.set_position(u64::from(p.percent.min(100)));
                    pb.set_message(p.current_file.unwrap_or(p.status));
                }
                StageUpdate::Log(entry) => pb.println(log_line(&entry)),
            }
        }
        pb.finish_and_clear();
    })
}

fn log_line(entry: &LogEntry) -> String {
    let tag = match entry.level {
        LogLevel::Info => "  ",
        LogLevel::Success => "✓ ",
        LogLevel::Warning => "! ",
        LogLevel::Error => "✗ ",
    };
    format!("{tag}{}", entry.msg)
}

/// Device config for local runs that are not tied to a registered device.
fn local_device(prefix: &str) -> DeviceConfig {
    DeviceConfig {
        friendly_name: Some("local".into()),
        merger_name: Some(prefix.to_string()),
        ..DeviceConfig::new("local")
    }
}

// ── `vidsync config show` ─────────────────────────────────────────────────────

fn cmd_config_show(config: &VidsyncConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `vidsync devices list` ────────────────────────────────────────────────────

fn cmd_devices_list(config: &VidsyncConfig, json: bool) -> Result<()> {
    let path = &config.paths.devices_file;
    let registry = DeviceRegistry::load(path)
        .with_context(|| format!("loading device registry: {}", path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&registry)?);
        return Ok(());
    }
    if registry.devices.is_empty() {
        println!("no devices registered in {}", path.display());
        return Ok(());
    }

    println!("{:<38} {:<20} {:<7} {:<20} flags", "uuid", "name", "status", "folder");
    for device in &registry.devices {
        println!(
            "{:<38} {:<20} {:<7} {:<20} {}",
            device.uuid,
            device.display_name(),
            match device.status {
                DeviceStatus::Active => "active",
                DeviceStatus::Paused => "paused",
            },
            device.out_folder(),
            device_flags(device),
        );
    }
    Ok(())
}

fn device_flags(device: &DeviceConfig) -> String {
    let flags: Vec<&str> = [
        (device.merger_enabled, "merge"),
        (device.delete_after_merge, "delete-after-merge"),
        (device.stabilize_after_merge, "stabilize"),
        (device.delete_after_stabilize, "delete-after-stabilize"),
        (device.dry_run, "dry-run"),
    ]
    .into_iter()
    .filter_map(|(on, name)| on.then_some(name))
    .collect();
    if flags.is_empty() {
        "-".into()
    } else {
        flags.join(",")
    }
}

// ── `vidsync flights` ─────────────────────────────────────────────────────────

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct FlightRow {
    output: String,
    time: DateTime<Utc>,
    time_source: vidsync_pipeline::merge::TimeSource,
    folder_count: usize,
    extra_metadata: Option<String>,
    fragments: Vec<PathBuf>,
}

async fn cmd_flights(
    config: &VidsyncConfig,
    folder: &Path,
    gap: Option<u64>,
    prefix: &str,
    json: bool,
) -> Result<()> {
    anyhow::ensure!(folder.is_dir(), "not a directory: {}", folder.display());
    let gap = gap.unwrap_or(config.merge.default_time_gap_secs);

    let (reporter, rx) = ProgressReporter::channel("flights");
    let display = follow_progress(rx, make_spinner("probing"));
    let flights = group_flights(&SystemRunner, &config.tools.ffprobe, folder, gap, &reporter).await;
    drop(reporter);
    let _ = display.await;
    let flights = flights.with_context(|| format!("grouping flights in {}", folder.display()))?;

    let now = Utc::now();
    let mut names = OutputNames::default();
    let rows: Vec<FlightRow> = flights
        .into_iter()
        .map(|flight| {
            let (time, time_source) = resolve_flight_time(&flight, now);
            FlightRow {
                output: names.claim(prefix, time, flight.folder_count),
                time,
                time_source,
                folder_count: flight.folder_count,
                extra_metadata: flight.extra_metadata,
                fragments: flight.file_paths,
            }
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("no flights found in {} (gap {gap}s)", folder.display());
        return Ok(());
    }
    println!("{} flights in {} (gap {gap}s)", rows.len(), folder.display());
    for row in &rows {
        println!();
        println!(
            "{}  [{} fragments, time from {:?}]",
            row.output,
            row.fragments.len(),
            row.time_source
        );
        for fragment in &row.fragments {
            println!("    {}", fragment.display());
        }
    }
    Ok(())
}

// ── `vidsync merge` ───────────────────────────────────────────────────────────

async fn cmd_merge(
    config: &VidsyncConfig,
    folder: &Path,
    output: Option<PathBuf>,
    prefix: &str,
    gap: Option<u64>,
    delete: bool,
) -> Result<()> {
    let payload = MergePayload {
        uuid: "local".into(),
        config: DeviceConfig {
            merger_enabled: true,
            merger_time_gap: gap,
            delete_after_merge: delete,
            ..local_device(prefix)
        },
        target_folder: folder.to_path_buf(),
        output_folder: output,
        should_stabilize_after_merge: false,
    };

    let runner: Arc<dyn ToolRunner> = Arc::new(SystemRunner);
    let stage = MergeStage::new(MergeSettings::from_config(config), runner);

    let (reporter, rx) = ProgressReporter::channel("merge");
    let display = follow_progress(rx, make_progress_bar("merge"));
    let result = stage.run(&payload, &reporter).await;
    drop(reporter);
    let _ = display.await;
    let report = result.with_context(|| format!("merging {}", folder.display()))?;

    println!(
        "{}: {} flights, {} merged, {} already present ({:.1}s)",
        report.status,
        report.flights,
        report.merges.len(),
        report.skipped.len(),
        report.duration_seconds
    );
    for merged in &report.merges {
        println!("  {} <- {} fragments", merged.output, merged.inputs.len());
        if !merged.removed.is_empty() {
            println!("    removed {}", merged.removed.join(", "));
        }
    }
    if !report.outputs.is_empty() {
        println!("  output folder: {}", report.output_folder.display());
    }
    Ok(())
}

// ── `vidsync stabilize` ───────────────────────────────────────────────────────

async fn cmd_stabilize(
    config: &VidsyncConfig,
    folder: &Path,
    fragments: bool,
    prefix: &str,
    delete: bool,
) -> Result<()> {
    let runner: Arc<dyn ToolRunner> = Arc::new(SystemRunner);
    let stab = &config.stabilization;
    let gpu = probe_gpu(runner.as_ref(), &stab.gpu_probe_program, &stab.gpu_probe_args).await;
    tracing::debug!(available = gpu.available, detail = %gpu.detail, "GPU probe");

    let stage = StabilizeStage::new(StabilizeSettings::from_config(config), runner, gpu);
    let payload = StabilizePayload {
        uuid: "local".into(),
        config: DeviceConfig {
            delete_after_stabilize: delete,
            ..local_device(prefix)
        },
        target_folder: folder.to_path_buf(),
        mode: if fragments {
            StabilizeMode::Fragments
        } else {
            StabilizeMode::Merged
        },
        inputs: Vec::new(),
    };

    let (reporter, rx) = ProgressReporter::channel("stabilize");
    let display = follow_progress(rx, make_progress_bar("stabilize"));
    let result = stage.run(&payload, &reporter).await;
    drop(reporter);
    let _ = display.await;
    let report = result.with_context(|| format!("stabilizing {}", folder.display()))?;

    println!(
        "{}: {} stabilized, {} already present ({:.1}s)",
        report.status,
        report.stabilized.len(),
        report.skipped.len(),
        report.duration_seconds
    );
    for file in &report.stabilized {
        println!("  {} -> {}", file.input, file.output);
    }
    if !report.removed.is_empty() {
        println!("  removed {}", report.removed.join(", "));
    }
    Ok(())
}

// ── `vidsync should-copy` ─────────────────────────────────────────────────────

fn cmd_should_copy(
    config: &VidsyncConfig,
    source: &Path,
    dest: &Path,
    size_only: bool,
    algorithm: Option<AlgorithmArg>,
) -> Result<()> {
    let mut settings = config.incremental_sync.clone();
    settings.enabled = true;
    settings.verify_size_only |= size_only;
    if let Some(algorithm) = algorithm {
        settings.hash_algorithm = algorithm.into();
    }

    let path = &config.paths.cache_db;
    let mut store = CacheBackend::open(path)
        .with_context(|| format!("opening file cache: {}", path.display()))?;
    // Read-only: fingerprints computed here are not written back
    let decision = cache::should_copy(&mut store, source, dest, &settings)?;

    println!(
        "{}: {}",
        if decision.should_copy { "copy" } else { "skip" },
        decision.reason
    );
    if decision.source_stale {
        println!("  cached fingerprint for {} was stale", source.display());
    }
    if let Ok(meta) = std::fs::metadata(source) {
        println!("  source: {} ({})", source.display(), format_bytes(meta.len()));
    }
    if let Ok(meta) = std::fs::metadata(dest) {
        println!("  dest:   {} ({})", dest.display(), format_bytes(meta.len()));
    }
    Ok(())
}

// ── `vidsync cache` ───────────────────────────────────────────────────────────

fn cmd_cache_stats(config: &VidsyncConfig) -> Result<()> {
    let path = &config.paths.cache_db;
    let store = CacheBackend::open(path)
        .with_context(|| format!("opening file cache: {}", path.display()))?;

    let expiry_days = config.incremental_sync.cache_expiry_days;
    let cutoff = Utc::now().timestamp_millis() - expiry_days as i64 * 86_400_000;
    let entries = store.entries();
    let expired = entries.iter().filter(|(_, e)| e.last_check < cutoff).count();
    let tracked: u64 = entries.iter().map(|(_, e)| e.size).sum();

    println!("cache:        {}", path.display());
    println!("entries:      {}", store.len());
    println!("tracked size: {}", format_bytes(tracked));
    println!("expired:      {expired} (older than {expiry_days} days)");
    println!("last sweep:   {}", fmt_millis(store.last_cleanup()));
    Ok(())
}

fn cmd_cache_sweep(config: &VidsyncConfig, days: Option<u64>) -> Result<()> {
    let path = &config.paths.cache_db;
    let mut store = CacheBackend::open(path)
        .with_context(|| format!("opening file cache: {}", path.display()))?;

    let days = days.unwrap_or(config.incremental_sync.cache_expiry_days);
    let removed = cache::evict_expired(&mut store, days);
    store
        .flush()
        .with_context(|| format!("writing file cache: {}", path.display()))?;
    println!("removed {removed} entries older than {days} days, {} remain", store.len());
    Ok(())
}

fn fmt_millis(ms: i64) -> String {
    if ms <= 0 {
        return "never".into();
    }
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "invalid".into())
}

// ── `vidsync jobs` ────────────────────────────────────────────────────────────

fn cmd_jobs(config: &VidsyncConfig, state: Option<JobState>, json: bool) -> Result<()> {
    let path = &config.paths.queue_db;
    let jobs: Vec<JobRecord> = JobQueue::read_snapshot(path)
        .with_context(|| format!("reading job queue: {}", path.display()))?
        .into_iter()
        .filter(|job| state.is_none_or(|s| job.state == s))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }

    println!(
        "{:<44} {:<9} {:<10} {:<14} {:>4} {:>8}  device",
        "id", "type", "state", "status", "pct", "attempts"
    );
    for job in &jobs {
        println!("{}", job_row(job));
        if let Some(err) = &job.last_error {
            println!("    last error: {err}");
        }
    }
    Ok(())
}

fn job_row(job: &JobRecord) -> String {
    format!(
        "{:<44} {:<9} {:<10} {:<14} {:>3}% {:>8}  {}",
        job.id,
        job.kind,
        state_label(job),
        job.status.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
        job.progress.percent,
        format!("{}/{}", job.attempts, job.max_attempts),
        job.device_name,
    )
}

/// Queued jobs waiting out a retry backoff show as "delayed".
fn state_label(job: &JobRecord) -> &'static str {
    match job.state {
        JobState::Queued if job.is_delayed(Utc::now()) => "delayed",
        JobState::Queued => "queued",
        JobState::Active => "active",
        JobState::Completed => "completed",
        JobState::Failed => "failed",
        JobState::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use vidsync_core::types::{JobKind, JobProgress, TerminalStatus};

    fn record(state: JobState, available_at: DateTime<Utc>) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: "merge-1".into(),
            kind: JobKind::Merge,
            device_id: "ABCD-1234".into(),
            device_name: "Mavic".into(),
            payload: serde_json::json!({}),
            priority: 2,
            state,
            status: None,
            progress: JobProgress::default(),
            result: None,
            attempts: 1,
            max_attempts: 3,
            stall_count: 0,
            last_error: None,
            logs: Vec::new(),
            created_at: now,
            started_at: None,
            finished_at: None,
            heartbeat_at: None,
            available_at,
            lease: 1,
            seq: 0,
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_jobs_state_filter() {
        let cli = Cli::try_parse_from(["vidsync", "jobs", "--state", "failed"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Jobs { state: Some(StateArg::Failed), json: false }
        ));
    }

    #[test]
    fn backoff_shows_as_delayed() {
        let later = Utc::now() + chrono::TimeDelta::minutes(5);
        assert_eq!(state_label(&record(JobState::Queued, later)), "delayed");
        assert_eq!(state_label(&record(JobState::Queued, Utc::now())), "queued");
    }

    #[test]
    fn job_row_includes_status_and_attempts() {
        let mut job = record(JobState::Completed, Utc::now());
        job.status = Some(TerminalStatus::NothingToDo);
        let row = job_row(&job);
        assert!(row.contains("Nothing to do"));
        assert!(row.contains("1/3"));
        assert!(row.ends_with("Mavic"));
    }

    #[test]
    fn device_flags_lists_enabled_options() {
        let mut device = DeviceConfig::new("ABCD-1234");
        assert_eq!(device_flags(&device), "-");
        device.merger_enabled = true;
        device.dry_run = true;
        assert_eq!(device_flags(&device), "merge,dry-run");
    }

    #[test]
    fn local_runs_use_prefix_for_names() {
        let device = local_device("Mavic");
        assert_eq!(device.merge_name(), "Mavic");
        assert_eq!(device.display_name(), "local");
    }

    #[tokio::test]
    async fn missing_config_falls_back_to_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.merge.output_folder, "output");
    }

    #[test]
    fn never_swept_cache_reads_never() {
        assert_eq!(fmt_millis(0), "never");
        assert!(fmt_millis(1_700_000_000_000).starts_with("2023-11-14"));
    }
}
