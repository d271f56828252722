//! Persistent job queue.
//!
//! The whole queue is one JSON document, rewritten atomically (temp file +
//! rename) on every state transition. Progress and log updates only mark the
//! document dirty; the scheduler's watchdog flushes them periodically.
//!
//! Every dispatch bumps the job's `lease`. Workers report back with the lease
//! they were given, and the queue drops reports carrying an older lease. That
//! is how a run that was cancelled, or declared stalled and handed to another
//! worker, is kept from overwriting newer state.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

use vidsync_core::config::{PriorityMode, QueueConfig};
use vidsync_core::types::{
    FollowUp, JobKind, JobProgress, JobRecord, JobState, LogEntry, TerminalStatus,
};

/// Upper bound on how long an idle worker sleeps before re-checking.
const IDLE_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {id} is {state:?}, cannot {action}")]
    InvalidState {
        id: String,
        state: JobState,
        action: &'static str,
    },

    #[error("queue persistence failed: {0:#}")]
    Persist(#[from] anyhow::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Retry, stall and retention rules.
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Stalls tolerated before a job is failed outright
    pub max_stalled: u32,
    pub retain_finished: usize,
    pub priority_mode: PriorityMode,
}

impl QueuePolicy {
    pub fn from_config(queue: &QueueConfig, priority_mode: PriorityMode) -> Self {
        QueuePolicy {
            max_attempts: queue.max_attempts.max(1),
            backoff_base: Duration::from_millis(queue.backoff_base_ms),
            backoff_max: Duration::from_millis(queue.backoff_max_ms),
            max_stalled: queue.max_stalled,
            retain_finished: queue.retain_finished,
            priority_mode,
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }
}

impl Default for QueuePolicy {
    fn default() -> Self {
        QueuePolicy::from_config(&QueueConfig::default(), PriorityMode::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Lower numbers dispatch first in priority mode
    pub priority: Option<u8>,
    /// Caller-chosen id; enqueueing an existing id returns that job
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { attempt: u32, delay: Duration },
    Failed,
    /// The report carried an old lease and was ignored
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Queued job withdrawn before it ran
    Removed,
    /// Active job marked failed; its handler is not interrupted
    MarkedFailed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueDocument {
    next_seq: u64,
    jobs: BTreeMap<String, JobRecord>,
}

struct Inner {
    doc: QueueDocument,
    dirty: bool,
}

pub struct JobQueue {
    path: Option<PathBuf>,
    policy: QueuePolicy,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl JobQueue {
    /// Load or create the queue document at `path`.
    ///
    /// Jobs found active belonged to a process that died mid-run; they are
    /// treated as stalled.
    pub fn open(path: &Path, policy: QueuePolicy) -> QueueResult<Self> {
        let doc = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading queue: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing queue: {}", path.display()))?
        } else {
            QueueDocument::default()
        };

        let queue = JobQueue {
            path: Some(path.to_path_buf()),
            policy,
            inner: Mutex::new(Inner { doc, dirty: false }),
            notify: Notify::new(),
        };

        let orphans = {
            let mut inner = queue.lock();
            let now = Utc::now();
            let ids: Vec<String> = inner
                .doc
                .jobs
                .values()
                .filter(|j| j.state == JobState::Active)
                .map(|j| j.id.clone())
                .collect();
            for id in &ids {
                queue.mark_stalled(&mut inner, id, now);
            }
            queue.persist(&mut inner)?;
            ids.len()
        };
        if orphans > 0 {
            tracing::warn!(orphans, "recovered jobs left active by a previous run");
        }
        Ok(queue)
    }

    /// Jobs in a queue document, read without taking ownership of it.
    ///
    /// Unlike [`JobQueue::open`] this never recovers orphaned jobs, so it is
    /// safe to call while a daemon holds the queue.
    pub fn read_snapshot(path: &Path) -> QueueResult<Vec<JobRecord>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading queue: {}", path.display()))?;
        let doc: QueueDocument = serde_json::from_str(&content)
            .with_context(|| format!("parsing queue: {}", path.display()))?;
        let mut jobs: Vec<JobRecord> = doc.jobs.into_values().collect();
        jobs.sort_by_key(|j| j.seq);
        Ok(jobs)
    }

    /// Queue without persistence.
    pub fn in_memory(policy: QueuePolicy) -> Self {
        JobQueue {
            path: None,
            policy,
            inner: Mutex::new(Inner {
                doc: QueueDocument::default(),
                dirty: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, inner: &mut Inner) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            inner.dirty = false;
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating queue dir: {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(&inner.doc).context("serializing queue")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("writing queue tmp: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming queue: {}", path.display()))?;
        inner.dirty = false;
        Ok(())
    }

    /// Write pending progress/log updates, if any.
    pub fn flush(&self) -> QueueResult<()> {
        let mut inner = self.lock();
        if inner.dirty {
            self.persist(&mut inner)?;
        }
        Ok(())
    }

    // ── Submission ───────────────────────────────────────────────────────────

    pub fn enqueue(
        &self,
        kind: JobKind,
        device_id: &str,
        device_name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> QueueResult<JobRecord> {
        let mut inner = self.lock();
        if let Some(existing) = options
            .job_id
            .as_ref()
            .and_then(|id| inner.doc.jobs.get(id))
        {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let seq = inner.doc.next_seq;
        inner.doc.next_seq += 1;
        let job = JobRecord {
            id: options
                .job_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            kind,
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            payload,
            priority: options.priority.unwrap_or_else(|| kind.default_priority()),
            state: JobState::Queued,
            status: None,
            progress: JobProgress::default(),
            result: None,
            attempts: 0,
            max_attempts: self.policy.max_attempts,
            stall_count: 0,
            last_error: None,
            logs: Vec::new(),
            created_at: now,
            started_at: None,
            finished_at: None,
            heartbeat_at: None,
            available_at: now,
            lease: 0,
            seq,
        };
        inner.doc.jobs.insert(job.id.clone(), job.clone());
        self.persist(&mut inner)?;
        drop(inner);

        tracing::debug!(job_id = %job.id, kind = %kind, device = %device_name, "job enqueued");
        self.notify.notify_waiters();
        Ok(job)
    }

    pub fn enqueue_follow_up(&self, follow_up: FollowUp) -> QueueResult<JobRecord> {
        self.enqueue(
            follow_up.kind,
            &follow_up.device_id,
            &follow_up.device_name,
            follow_up.payload,
            EnqueueOptions::default(),
        )
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Lease the next runnable job of `kind`, if one is due.
    pub fn try_lease(&self, kind: JobKind) -> QueueResult<Option<JobRecord>> {
        let mut inner = self.lock();
        let now = Utc::now();
        let by_priority = self.policy.priority_mode == PriorityMode::Priority;

        let next = inner
            .doc
            .jobs
            .values()
            .filter(|j| j.kind == kind && j.state == JobState::Queued && j.available_at <= now)
            .min_by_key(|j| {
                let rank = if by_priority { j.priority } else { 0 };
                (rank, j.seq)
            })
            .map(|j| j.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = inner.doc.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.state = JobState::Active;
        job.attempts += 1;
        job.lease += 1;
        job.started_at = Some(now);
        job.heartbeat_at = Some(now);
        let leased = job.clone();
        self.persist(&mut inner)?;
        Ok(Some(leased))
    }

    /// Wait until a job of `kind` can be leased.
    pub async fn next_job(&self, kind: JobKind) -> QueueResult<JobRecord> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.try_lease(kind)? {
                return Ok(job);
            }
            let wait = self.next_wakeup(kind).unwrap_or(IDLE_POLL).min(IDLE_POLL);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// Time until the earliest delayed job of `kind` becomes due.
    fn next_wakeup(&self, kind: JobKind) -> Option<Duration> {
        let inner = self.lock();
        let now = Utc::now();
        inner
            .doc
            .jobs
            .values()
            .filter(|j| j.kind == kind && j.is_delayed(now))
            .map(|j| j.available_at)
            .min()
            .and_then(|t| (t - now).to_std().ok())
    }

    // ── Worker reports ───────────────────────────────────────────────────────

    fn active_mut<'a>(inner: &'a mut Inner, id: &str, lease: u64) -> Option<&'a mut JobRecord> {
        inner
            .doc
            .jobs
            .get_mut(id)
            .filter(|j| j.state == JobState::Active && j.lease == lease)
    }

    /// Renew the heartbeat of a running job.
    pub fn touch(&self, id: &str, lease: u64) -> bool {
        let mut inner = self.lock();
        match Self::active_mut(&mut inner, id, lease) {
            Some(job) => {
                job.heartbeat_at = Some(Utc::now());
                inner.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn update_progress(&self, id: &str, lease: u64, progress: JobProgress) -> bool {
        let mut inner = self.lock();
        match Self::active_mut(&mut inner, id, lease) {
            Some(job) => {
                job.progress = progress;
                job.heartbeat_at = Some(Utc::now());
                inner.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn append_log(&self, id: &str, lease: u64, entry: LogEntry) -> bool {
        let mut inner = self.lock();
        match Self::active_mut(&mut inner, id, lease) {
            Some(job) => {
                job.logs.push(entry);
                inner.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Record a successful run. Returns `false` for a stale lease.
    pub fn complete(
        &self,
        id: &str,
        lease: u64,
        status: TerminalStatus,
        result: Option<serde_json::Value>,
    ) -> QueueResult<bool> {
        let mut inner = self.lock();
        let now = Utc::now();
        let Some(job) = Self::active_mut(&mut inner, id, lease) else {
            tracing::debug!(job_id = id, lease, "ignoring completion under stale lease");
            return Ok(false);
        };
        job.state = JobState::Completed;
        job.status = Some(status);
        job.result = result;
        job.finished_at = Some(now);
        job.progress.percent = 100;
        job.progress.status = status.to_string();
        self.evict_finished(&mut inner);
        self.persist(&mut inner)?;
        Ok(true)
    }

    /// Record a failed run; retry with backoff while attempts remain.
    pub fn fail(
        &self,
        id: &str,
        lease: u64,
        error: &str,
        retryable: bool,
    ) -> QueueResult<FailOutcome> {
        let mut inner = self.lock();
        let now = Utc::now();
        let Some(job) = Self::active_mut(&mut inner, id, lease) else {
            return Ok(FailOutcome::Stale);
        };
        job.last_error = Some(error.to_string());

        let outcome = if retryable && job.attempts < job.max_attempts {
            let delay = self.policy.backoff(job.attempts);
            job.state = JobState::Queued;
            job.available_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            FailOutcome::Retrying {
                attempt: job.attempts,
                delay,
            }
        } else {
            job.state = JobState::Failed;
            job.status = Some(TerminalStatus::Failed);
            job.finished_at = Some(now);
            job.progress.status = TerminalStatus::Failed.to_string();
            FailOutcome::Failed
        };
        if outcome == FailOutcome::Failed {
            self.evict_finished(&mut inner);
        }
        self.persist(&mut inner)?;
        drop(inner);

        if matches!(outcome, FailOutcome::Retrying { .. }) {
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    // ── Operator actions ─────────────────────────────────────────────────────

    /// Cancel a job. Queued jobs never run; an active job is marked failed
    /// and its eventual outcome is discarded.
    pub fn cancel(&self, id: &str) -> QueueResult<CancelOutcome> {
        let mut inner = self.lock();
        let now = Utc::now();
        let job = inner
            .doc
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        let outcome = match job.state {
            JobState::Queued => {
                job.state = JobState::Cancelled;
                job.status = Some(TerminalStatus::Cancelled);
                job.progress.status = TerminalStatus::Cancelled.to_string();
                CancelOutcome::Removed
            }
            JobState::Active => {
                job.state = JobState::Failed;
                job.status = Some(TerminalStatus::Failed);
                job.last_error = Some("Cancelled by user".into());
                job.progress.status = TerminalStatus::Failed.to_string();
                job.lease += 1;
                CancelOutcome::MarkedFailed
            }
            state => {
                return Err(QueueError::InvalidState {
                    id: id.to_string(),
                    state,
                    action: "cancel",
                })
            }
        };
        job.finished_at = Some(now);
        self.evict_finished(&mut inner);
        self.persist(&mut inner)?;
        Ok(outcome)
    }

    // ── Stall recovery ───────────────────────────────────────────────────────

    fn mark_stalled(&self, inner: &mut Inner, id: &str, now: DateTime<Utc>) {
        let Some(job) = inner.doc.jobs.get_mut(id) else {
            return;
        };
        job.stall_count += 1;
        job.lease += 1;
        if job.stall_count > self.policy.max_stalled {
            job.state = JobState::Failed;
            job.status = Some(TerminalStatus::Failed);
            job.finished_at = Some(now);
            job.last_error = Some(format!(
                "job stalled more than {} times",
                self.policy.max_stalled
            ));
            tracing::error!(job_id = id, stalls = job.stall_count, "job failed after repeated stalls");
        } else {
            // The interrupted run does not use up an attempt
            job.attempts = job.attempts.saturating_sub(1);
            job.state = JobState::Queued;
            job.available_at = now;
            tracing::warn!(job_id = id, stalls = job.stall_count, "stalled job requeued");
        }
    }

    /// Requeue (or fail) active jobs whose heartbeat is older than `timeout`.
    /// Returns the affected job ids.
    pub fn check_stalled(&self, timeout: Duration) -> QueueResult<Vec<String>> {
        let mut inner = self.lock();
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(timeout).unwrap_or_default();
        let stalled: Vec<String> = inner
            .doc
            .jobs
            .values()
            .filter(|j| j.state == JobState::Active)
            .filter(|j| j.heartbeat_at.or(j.started_at).is_none_or(|t| t < cutoff))
            .map(|j| j.id.clone())
            .collect();
        if stalled.is_empty() {
            return Ok(stalled);
        }
        for id in &stalled {
            self.mark_stalled(&mut inner, id, now);
        }
        self.evict_finished(&mut inner);
        self.persist(&mut inner)?;
        drop(inner);

        self.notify.notify_waiters();
        Ok(stalled)
    }

    /// Drop the oldest finished jobs beyond the retention limit.
    fn evict_finished(&self, inner: &mut Inner) {
        let mut finished: Vec<(DateTime<Utc>, u64, String)> = inner
            .doc
            .jobs
            .values()
            .filter(|j| j.state.is_finished())
            .map(|j| (j.finished_at.unwrap_or(j.created_at), j.seq, j.id.clone()))
            .collect();
        if finished.len() <= self.policy.retain_finished {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.policy.retain_finished;
        for (_, _, id) in finished.into_iter().take(excess) {
            inner.doc.jobs.remove(&id);
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<JobRecord> {
        self.lock().doc.jobs.get(id).cloned()
    }

    /// Jobs in enqueue order, optionally filtered by state.
    pub fn list(&self, state: Option<JobState>) -> Vec<JobRecord> {
        let inner = self.lock();
        let mut jobs: Vec<JobRecord> = inner
            .doc
            .jobs
            .values()
            .filter(|j| state.is_none_or(|s| j.state == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.seq);
        jobs
    }

    pub fn counts(&self) -> QueueCounts {
        let inner = self.lock();
        let now = Utc::now();
        let mut counts = QueueCounts::default();
        for job in inner.doc.jobs.values() {
            match job.state {
                JobState::Queued if job.is_delayed(now) => counts.delayed += 1,
                JobState::Queued => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }
}
