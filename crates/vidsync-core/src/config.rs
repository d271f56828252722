use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level worker configuration (loaded from vidsync.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VidsyncConfig {
    pub daemon: DaemonConfig,
    pub paths: PathsConfig,
    pub queue: QueueConfig,
    pub sync: SyncConfig,
    pub parallel_processing: ParallelProcessingConfig,
    pub incremental_sync: IncrementalSyncConfig,
    pub tools: ToolsConfig,
    pub stabilization: StabilizationConfig,
    pub merge: MergeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Control API + event stream listen address (default: 127.0.0.1:8700)
    pub listen: String,
    /// Prometheus metrics endpoint (default: 127.0.0.1:9100)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
    /// Mirror events to NATS (daemon built with the `nats` feature)
    pub nats_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the network share that receives synced footage
    pub dest_root: PathBuf,
    /// Fixed mount point used for every device
    pub mount_point: PathBuf,
    /// JSON device registry (`{ "devices": [...] }`)
    pub devices_file: PathBuf,
    /// Persistent job queue document
    pub queue_db: PathBuf,
    /// Incremental sync fingerprint cache (`.json`, or a RocksDB dir with the `rocksdb` feature)
    pub cache_db: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts per job before it is marked failed
    pub max_attempts: u32,
    /// First retry delay; doubles on every further attempt
    pub backoff_base_ms: u64,
    /// Upper bound on a single retry delay
    pub backoff_max_ms: u64,
    /// How often the watchdog looks for stalled jobs
    pub stall_check_interval_secs: u64,
    /// Heartbeat age after which an active job counts as stalled
    pub stall_timeout_secs: u64,
    /// Stalls tolerated before a job is marked failed
    pub max_stalled: u32,
    /// How often a running job's heartbeat is renewed
    pub heartbeat_interval_secs: u64,
    /// Finished jobs kept for history
    pub retain_finished: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Video extensions picked up by the catalog scan (case-insensitive)
    pub video_extensions: Vec<String>,
    /// Glob patterns (relative to the source root) excluded from the scan
    pub exclude_patterns: Vec<String>,
    /// Generate a `<stem>_thumb.jpg` next to every copied video
    pub thumbnails: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityMode {
    /// Dispatch strictly in enqueue order
    #[default]
    Fifo,
    /// Lower priority numbers first, FIFO within a priority
    Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelProcessingConfig {
    pub enabled: bool,
    /// Sync pool size when enabled
    pub max_concurrent_devices: usize,
    /// Merge and stabilize pool size when enabled
    pub max_concurrent_jobs: usize,
    pub priority_mode: PriorityMode,
    /// Copy throttle per device in megabits per second (0 = unlimited)
    pub per_device_bandwidth_limit_mbps: u64,
}

impl ParallelProcessingConfig {
    pub fn sync_concurrency(&self) -> usize {
        if self.enabled {
            self.max_concurrent_devices.max(1)
        } else {
            1
        }
    }

    pub fn job_concurrency(&self) -> usize {
        if self.enabled {
            self.max_concurrent_jobs.max(1)
        } else {
            1
        }
    }

    /// Copy throttle in bytes per second, if any.
    pub fn bandwidth_limit_bytes(&self) -> Option<u64> {
        (self.per_device_bandwidth_limit_mbps > 0)
            .then(|| self.per_device_bandwidth_limit_mbps * 1_000_000 / 8)
    }
}

/// Fingerprint strategy for incremental sync comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// Size + modify time only; never reads file content
    #[serde(alias = "xxhash")]
    Composite,
    /// Full-content BLAKE3
    Blake3,
    /// Full-content SHA-256
    Sha256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncrementalSyncConfig {
    pub enabled: bool,
    pub hash_algorithm: HashAlgorithm,
    pub skip_unchanged: bool,
    /// Fast mode: compare sizes only
    pub verify_size_only: bool,
    pub cache_expiry_days: u64,
    /// Warn when more than this share of cached fingerprints turned out stale
    pub rescan_threshold_percent: u8,
    /// How often the daemon sweeps expired cache entries
    pub sweep_interval_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub mount: PathBuf,
    pub umount: PathBuf,
    /// Flushes pending writes before unmounting
    pub sync: PathBuf,
    /// Resolves a filesystem UUID to its block device
    pub findfs: PathBuf,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub mp4_merge: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationConfig {
    pub enabled: bool,
    /// Refuse to stabilize when the GPU probe fails
    pub require_gpu: bool,
    /// Stabilizer executable
    pub program: PathBuf,
    /// Argument template; `{input}` and `{output}` are substituted
    pub args: Vec<String>,
    pub gpu_probe_program: PathBuf,
    pub gpu_probe_args: Vec<String>,
    /// Output-growth sampling period
    pub sample_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Gap between clips that starts a new flight, unless the device overrides it
    pub default_time_gap_secs: u64,
    /// Name of the folder merged output lands in
    pub output_folder: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8700".into(),
            metrics_addr: Some("127.0.0.1:9100".into()),
            log_level: "info".into(),
            log_format: "json".into(),
            nats_url: None,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            dest_root: PathBuf::from("/mnt/network_share"),
            mount_point: PathBuf::from("/mnt/usb_incoming"),
            devices_file: PathBuf::from("/etc/vidsync/devices.json"),
            queue_db: PathBuf::from("/var/lib/vidsync/queue.json"),
            cache_db: PathBuf::from("/var/lib/vidsync/file-cache.json"),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 2000,
            backoff_max_ms: 5 * 60 * 1000,
            stall_check_interval_secs: 30,
            stall_timeout_secs: 90,
            max_stalled: 2,
            heartbeat_interval_secs: 10,
            retain_finished: 500,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            video_extensions: vec!["mp4".into(), "mov".into(), "avi".into(), "mkv".into()],
            exclude_patterns: Vec::new(),
            thumbnails: true,
        }
    }
}

impl Default for ParallelProcessingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent_devices: 2,
            max_concurrent_jobs: 4,
            priority_mode: PriorityMode::Fifo,
            per_device_bandwidth_limit_mbps: 0,
        }
    }
}

impl Default for IncrementalSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hash_algorithm: HashAlgorithm::Composite,
            skip_unchanged: true,
            verify_size_only: false,
            cache_expiry_days: 30,
            rescan_threshold_percent: 10,
            sweep_interval_hours: 24,
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mount: PathBuf::from("mount"),
            umount: PathBuf::from("umount"),
            sync: PathBuf::from("sync"),
            findfs: PathBuf::from("findfs"),
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            mp4_merge: PathBuf::from("/usr/local/bin/mp4_merge"),
        }
    }
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            require_gpu: true,
            program: PathBuf::from("gyroflow"),
            args: vec![
                "{input}".into(),
                "--output".into(),
                "{output}".into(),
                "--overwrite".into(),
            ],
            gpu_probe_program: PathBuf::from("nvidia-smi"),
            gpu_probe_args: vec!["-L".into()],
            sample_interval_secs: 5,
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            default_time_gap_secs: 10,
            output_folder: "output".into(),
        }
    }
}
