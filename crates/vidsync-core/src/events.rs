//! Events published to dashboard observers.
//!
//! Stages and the scheduler receive a `Publisher` at construction; there is
//! no process-global channel. Event names on the wire (`event` tag) are
//! snake_case, payload fields are camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::types::{JobKind, LogEntry, LogLevel, TerminalStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Event {
    Progress {
        job_id: String,
        uuid: String,
        percent: u8,
        current_file: Option<String>,
        moved: u64,
        total: u64,
        status: String,
        device_name: String,
    },
    JobQueued {
        job_id: String,
        uuid: String,
        job_type: JobKind,
        device_name: String,
    },
    JobComplete {
        id: String,
        status: TerminalStatus,
        uuid: String,
    },
    Log {
        timestamp: DateTime<Utc>,
        msg: String,
        #[serde(rename = "type")]
        level: LogLevel,
    },
    JobLog {
        job_id: String,
        entry: LogEntry,
    },
    WorkerCapabilities {
        #[serde(rename = "gpu_support")]
        gpu_support: bool,
        #[serde(rename = "gpu_available")]
        gpu_available: bool,
        #[serde(rename = "stabilization_enabled")]
        stabilization_enabled: bool,
        #[serde(rename = "merge_enabled")]
        merge_enabled: bool,
        #[serde(rename = "sync_enabled")]
        sync_enabled: bool,
    },
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::Progress { .. } => "progress",
            Event::JobQueued { .. } => "job_queued",
            Event::JobComplete { .. } => "job_complete",
            Event::Log { .. } => "log",
            Event::JobLog { .. } => "job_log",
            Event::WorkerCapabilities { .. } => "worker_capabilities",
        }
    }

    pub fn log(level: LogLevel, msg: impl Into<String>) -> Self {
        Event::Log {
            timestamp: Utc::now(),
            msg: msg.into(),
            level,
        }
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| anyhow::anyhow!("serializing Event: {e}"))
    }

    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(data).map_err(|e| anyhow::anyhow!("deserializing Event: {e}"))
    }
}

/// Sink for pipeline events.
///
/// Implementations must not block: stages call `emit` from inside hot loops.
pub trait Publisher: Send + Sync {
    fn emit(&self, event: Event);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopPublisher;

impl Publisher for NoopPublisher {
    fn emit(&self, _event: Event) {}
}

/// Keeps every event in memory; used by the CLI and tests.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<Event>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Events of one type, in publish order.
    pub fn of_type(&self, event_type: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type() == event_type)
            .collect()
    }
}

impl Publisher for MemoryPublisher {
    fn emit(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
