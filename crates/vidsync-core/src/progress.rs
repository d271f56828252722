//! Per-job progress channel.
//!
//! A stage holds a `ProgressReporter` and never touches the queue directly;
//! the scheduler drains the receiving end into the job record and the event
//! publisher. Log lines are also kept locally so the stage can return them in
//! its result.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::types::{JobProgress, LogEntry, LogLevel};

#[derive(Debug, Clone, PartialEq)]
pub enum StageUpdate {
    Progress(JobProgress),
    Log(LogEntry),
}

#[derive(Clone)]
pub struct ProgressReporter {
    label: Arc<str>,
    tx: Option<mpsc::UnboundedSender<StageUpdate>>,
    logs: Arc<Mutex<Vec<LogEntry>>>,
}

impl ProgressReporter {
    /// Reporter wired to a receiver the caller drains.
    pub fn channel(label: &str) -> (Self, mpsc::UnboundedReceiver<StageUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = ProgressReporter {
            label: Arc::from(label),
            tx: Some(tx),
            logs: Arc::default(),
        };
        (reporter, rx)
    }

    /// Reporter with no listener (CLI runs, tests).
    pub fn detached(label: &str) -> Self {
        ProgressReporter {
            label: Arc::from(label),
            tx: None,
            logs: Arc::default(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn progress(&self, progress: JobProgress) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(StageUpdate::Progress(progress));
        }
    }

    pub fn log(&self, level: LogLevel, msg: impl Into<String>) {
        let entry = LogEntry::new(level, msg);
        match level {
            LogLevel::Info | LogLevel::Success => {
                tracing::info!(job = %self.label, "{}", entry.msg)
            }
            LogLevel::Warning => tracing::warn!(job = %self.label, "{}", entry.msg),
            LogLevel::Error => tracing::error!(job = %self.label, "{}", entry.msg),
        }
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        if let Some(tx) = &self.tx {
            let _ = tx.send(StageUpdate::Log(entry));
        }
    }

    pub fn info(&self, msg: impl Into<String>) {
        self.log(LogLevel::Info, msg);
    }

    pub fn success(&self, msg: impl Into<String>) {
        self.log(LogLevel::Success, msg);
    }

    pub fn warn(&self, msg: impl Into<String>) {
        self.log(LogLevel::Warning, msg);
    }

    pub fn error(&self, msg: impl Into<String>) {
        self.log(LogLevel::Error, msg);
    }

    /// Every log line reported so far.
    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
