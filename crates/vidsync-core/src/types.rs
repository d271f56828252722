use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::device::DeviceConfig;

// ── Jobs ─────────────────────────────────────────────────────────────────────

/// Pipeline stage a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Sync,
    Merge,
    Stabilize,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Sync, JobKind::Merge, JobKind::Stabilize];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Sync => "sync",
            JobKind::Merge => "merge",
            JobKind::Stabilize => "stabilize",
        }
    }

    /// Default dispatch priority; earlier stages go first.
    pub fn default_priority(&self) -> u8 {
        match self {
            JobKind::Sync => 1,
            JobKind::Merge => 2,
            JobKind::Stabilize => 3,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue-owned lifecycle state.
///
/// A `Queued` job whose `available_at` lies in the future is "delayed"
/// (waiting out a retry backoff).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// Terminal status label shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalStatus {
    Completed,
    #[serde(rename = "Nothing to do")]
    NothingToDo,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TerminalStatus::Completed => "Completed",
            TerminalStatus::NothingToDo => "Nothing to do",
            TerminalStatus::Failed => "Failed",
            TerminalStatus::Cancelled => "Cancelled",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    pub moved: u64,
    pub total: u64,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// One line of a job's log array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub level: LogLevel,
    pub msg: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, msg: impl Into<String>) -> Self {
        LogEntry {
            timestamp: Utc::now(),
            level,
            msg: msg.into(),
        }
    }
}

/// A job as persisted by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub kind: JobKind,
    /// Device UUID the job belongs to
    pub device_id: String,
    /// Display label of the device
    #[serde(default)]
    pub device_name: String,
    pub payload: serde_json::Value,
    pub priority: u8,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TerminalStatus>,
    #[serde(default)]
    pub progress: JobProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub stall_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Earliest dispatch time (later than `created_at` while backing off)
    pub available_at: DateTime<Utc>,
    /// Dispatch generation; outcomes reported under an older lease are dropped
    #[serde(default)]
    pub lease: u64,
    /// Enqueue order, used for FIFO tie-breaks
    pub seq: u64,
}

impl JobRecord {
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Queued && self.available_at > now
    }
}

// ── Job payloads ─────────────────────────────────────────────────────────────

/// Sync job input: which block device to mount for which configured device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    /// Block device node, e.g. `sdb1` or `/dev/sdb1`
    pub device_handle: String,
    pub uuid: String,
    pub config: DeviceConfig,
}

impl SyncPayload {
    pub fn device_path(&self) -> PathBuf {
        if self.device_handle.starts_with('/') {
            PathBuf::from(&self.device_handle)
        } else {
            PathBuf::from("/dev").join(&self.device_handle)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergePayload {
    pub uuid: String,
    pub config: DeviceConfig,
    /// Folder whose fragments are grouped and merged
    pub target_folder: PathBuf,
    /// Where merged files go (default: `<target>/output`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_folder: Option<PathBuf>,
    #[serde(default)]
    pub should_stabilize_after_merge: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilizeMode {
    /// Stabilize already-merged flight files in place
    #[default]
    Merged,
    /// Stabilize raw fragments, then re-merge them per flight
    Fragments,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StabilizePayload {
    pub uuid: String,
    pub config: DeviceConfig,
    pub target_folder: PathBuf,
    #[serde(default)]
    pub mode: StabilizeMode,
    /// Restrict merged-mode runs to these files (empty = whole folder)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<PathBuf>,
}

/// A job a finished stage asks the scheduler to enqueue next.
#[derive(Debug, Clone)]
pub struct FollowUp {
    pub kind: JobKind,
    pub device_id: String,
    pub device_name: String,
    pub payload: serde_json::Value,
}

impl FollowUp {
    pub fn merge(payload: &MergePayload) -> serde_json::Result<Self> {
        Ok(FollowUp {
            kind: JobKind::Merge,
            device_id: payload.uuid.clone(),
            device_name: payload.config.display_name().to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn stabilize(payload: &StabilizePayload) -> serde_json::Result<Self> {
        Ok(FollowUp {
            kind: JobKind::Stabilize,
            device_id: payload.uuid.clone(),
            device_name: payload.config.display_name().to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }
}

// ── Stage records ────────────────────────────────────────────────────────────

/// Where a file's resolved capture date came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateSource {
    Sidecar,
    PathPattern,
    BirthTime,
    ModifyTime,
    SyncStart,
}

/// One file handled by a sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedFile {
    /// Path relative to the source root
    pub path: String,
    pub size: u64,
    pub date: DateTime<Utc>,
    pub date_source: DateSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    /// Unchanged since an earlier sync; not copied
    #[serde(default)]
    pub skipped: bool,
}

/// One merge-tool invocation. Paths are basenames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub output: String,
    pub inputs: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_status_labels() {
        assert_eq!(TerminalStatus::NothingToDo.to_string(), "Nothing to do");
        let json = serde_json::to_string(&TerminalStatus::NothingToDo).unwrap();
        assert_eq!(json, "\"Nothing to do\"");
    }

    #[test]
    fn test_device_path_accepts_bare_node() {
        let payload = SyncPayload {
            device_handle: "sdb1".into(),
            uuid: "1234-ABCD".into(),
            config: DeviceConfig::new("1234-ABCD"),
        };
        assert_eq!(payload.device_path(), PathBuf::from("/dev/sdb1"));

        let payload = SyncPayload {
            device_handle: "/dev/mmcblk0p1".into(),
            ..payload
        };
        assert_eq!(payload.device_path(), PathBuf::from("/dev/mmcblk0p1"));
    }

    #[test]
    fn test_merge_payload_uses_camel_case() {
        let payload = MergePayload {
            uuid: "u".into(),
            config: DeviceConfig::new("u"),
            target_folder: PathBuf::from("/share/drone/2024-05-01_10-00-00"),
            output_folder: None,
            should_stabilize_after_merge: true,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["shouldStabilizeAfterMerge"], true);
        assert!(value.get("outputFolder").is_none());
    }

    #[test]
    fn test_log_entry_type_field() {
        let entry = LogEntry::new(LogLevel::Warning, "thumbnail failed");
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "warning");
        assert_eq!(value["msg"], "thumbnail failed");
    }
}
