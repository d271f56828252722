//! Worker pools on top of [`JobQueue`].
//!
//! One pool per job kind, each a loop that leases the next job once a
//! semaphore permit is free and runs the registered [`JobHandler`] on its own
//! task. Stage updates flow from the handler's [`ProgressReporter`] into the
//! job record and the event publisher. Follow-up jobs are enqueued only after
//! the queue accepts the completion, so a run that lost its lease (cancelled
//! or declared stalled) never chains.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vidsync_core::config::QueueConfig;
use vidsync_core::types::{FollowUp, JobKind, JobRecord, JobState, TerminalStatus};
use vidsync_core::{Event, PipelineResult, ProgressReporter, Publisher, StageUpdate};

use crate::queue::{EnqueueOptions, FailOutcome, JobQueue, QueueResult};

/// Back-off after the queue itself errors (e.g. the document cannot be written).
const QUEUE_ERROR_PAUSE: Duration = Duration::from_secs(1);

pub struct JobContext {
    pub job: JobRecord,
    pub reporter: ProgressReporter,
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: TerminalStatus,
    pub result: Option<serde_json::Value>,
    pub follow_ups: Vec<FollowUp>,
}

impl JobOutcome {
    pub fn new(status: TerminalStatus, result: serde_json::Value) -> Self {
        JobOutcome {
            status,
            result: Some(result),
            follow_ups: Vec::new(),
        }
    }

    pub fn with_follow_up(mut self, follow_up: FollowUp) -> Self {
        self.follow_ups.push(follow_up);
        self
    }
}

/// Runs jobs of one kind.
pub trait JobHandler: Send + Sync + 'static {
    fn kind(&self) -> JobKind;

    fn run(&self, ctx: JobContext) -> BoxFuture<'_, PipelineResult<JobOutcome>>;
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub heartbeat_interval: Duration,
    pub stall_check_interval: Duration,
    pub stall_timeout: Duration,
}

impl SchedulerSettings {
    pub fn from_config(queue: &QueueConfig) -> Self {
        SchedulerSettings {
            heartbeat_interval: Duration::from_secs(queue.heartbeat_interval_secs.max(1)),
            stall_check_interval: Duration::from_secs(queue.stall_check_interval_secs.max(1)),
            stall_timeout: Duration::from_secs(queue.stall_timeout_secs.max(1)),
        }
    }
}

pub struct Scheduler {
    queue: Arc<JobQueue>,
    publisher: Arc<dyn Publisher>,
    settings: SchedulerSettings,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<JobQueue>,
        publisher: Arc<dyn Publisher>,
        settings: SchedulerSettings,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Scheduler {
            queue,
            publisher,
            settings,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Enqueue a job and announce it to observers.
    pub fn submit(
        &self,
        kind: JobKind,
        device_id: &str,
        device_name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> QueueResult<JobRecord> {
        let job = self
            .queue
            .enqueue(kind, device_id, device_name, payload, options)?;
        announce(self.publisher.as_ref(), &job);
        Ok(job)
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Start a pool running at most `concurrency` jobs of `handler.kind()`.
    pub fn register(&self, handler: Arc<dyn JobHandler>, concurrency: usize) {
        let concurrency = concurrency.max(1);
        let kind = handler.kind();
        let queue = self.queue.clone();
        let publisher = self.publisher.clone();
        let settings = self.settings.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(kind = %kind, concurrency, "worker pool ready");
        let pool = tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(concurrency));
            loop {
                let permit = tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };
                let job = tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    job = queue.next_job(kind) => job,
                };
                let job = match job {
                    Ok(job) => job,
                    Err(e) => {
                        error!(kind = %kind, "leasing job failed: {e}");
                        tokio::time::sleep(QUEUE_ERROR_PAUSE).await;
                        continue;
                    }
                };

                let queue = queue.clone();
                let publisher = publisher.clone();
                let handler = handler.clone();
                let settings = settings.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    execute(queue, publisher, handler, job, settings).await;
                });
            }

            info!(kind = %kind, "worker pool draining");
            let _ = semaphore.acquire_many(concurrency as u32).await;
            info!(kind = %kind, "worker pool stopped");
        });
        self.track(pool);
    }

    /// Periodically requeue stalled jobs and flush pending progress.
    pub fn start_watchdog(&self) {
        let queue = self.queue.clone();
        let publisher = self.publisher.clone();
        let settings = self.settings.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let watchdog = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(settings.stall_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {}
                }
                match queue.check_stalled(settings.stall_timeout) {
                    Ok(ids) => {
                        for id in ids {
                            if let Some(job) = queue.get(&id).filter(|j| j.state == JobState::Failed) {
                                publisher.emit(Event::JobComplete {
                                    id: job.id,
                                    status: TerminalStatus::Failed,
                                    uuid: job.device_id,
                                });
                            }
                        }
                    }
                    Err(e) => error!("stall check failed: {e}"),
                }
                if let Err(e) = queue.flush() {
                    warn!("flushing queue failed: {e}");
                }
            }
        });
        self.track(watchdog);
    }

    /// Stop leasing, wait for in-flight jobs, and flush the queue.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            let _ = task.await;
        }
        if let Err(e) = self.queue.flush() {
            warn!("final queue flush failed: {e}");
        }
        info!("scheduler stopped");
    }
}

fn announce(publisher: &dyn Publisher, job: &JobRecord) {
    publisher.emit(Event::JobQueued {
        job_id: job.id.clone(),
        uuid: job.device_id.clone(),
        job_type: job.kind,
        device_name: job.device_name.clone(),
    });
}

// ── Job execution ────────────────────────────────────────────────────────────

fn forward(queue: &JobQueue, publisher: &dyn Publisher, job: &JobRecord, update: StageUpdate) {
    match update {
        StageUpdate::Progress(progress) => {
            if queue.update_progress(&job.id, job.lease, progress.clone()) {
                publisher.emit(Event::Progress {
                    job_id: job.id.clone(),
                    uuid: job.device_id.clone(),
                    percent: progress.percent,
                    current_file: progress.current_file,
                    moved: progress.moved,
                    total: progress.total,
                    status: progress.status,
                    device_name: job.device_name.clone(),
                });
            }
        }
        StageUpdate::Log(entry) => {
            if queue.append_log(&job.id, job.lease, entry.clone()) {
                publisher.emit(Event::JobLog {
                    job_id: job.id.clone(),
                    entry,
                });
            }
        }
    }
}

async fn execute(
    queue: Arc<JobQueue>,
    publisher: Arc<dyn Publisher>,
    handler: Arc<dyn JobHandler>,
    job: JobRecord,
    settings: SchedulerSettings,
) {
    info!(job_id = %job.id, kind = %job.kind, attempt = job.attempts, device = %job.device_name, "job started");
    let start = std::time::Instant::now();

    let (reporter, mut updates) = ProgressReporter::channel(&job.id);
    let run = handler.run(JobContext {
        job: job.clone(),
        reporter,
    });
    tokio::pin!(run);

    let mut heartbeat = tokio::time::interval(settings.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            Some(update) = updates.recv() => forward(&queue, publisher.as_ref(), &job, update),
            _ = heartbeat.tick() => {
                queue.touch(&job.id, job.lease);
            }
        }
    };
    while let Ok(update) = updates.try_recv() {
        forward(&queue, publisher.as_ref(), &job, update);
    }
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(outcome) => {
            let accepted = match queue.complete(&job.id, job.lease, outcome.status, outcome.result) {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(job_id = %job.id, "recording completion failed: {e}");
                    return;
                }
            };
            if !accepted {
                info!(job_id = %job.id, "discarding outcome of a superseded run");
                return;
            }
            for follow_up in outcome.follow_ups {
                let kind = follow_up.kind;
                match queue.enqueue_follow_up(follow_up) {
                    Ok(next) => {
                        debug!(job_id = %job.id, next = %next.id, kind = %kind, "follow-up queued");
                        announce(publisher.as_ref(), &next);
                    }
                    Err(e) => error!(job_id = %job.id, kind = %kind, "queueing follow-up failed: {e}"),
                }
            }
            info!(job_id = %job.id, status = %outcome.status, elapsed_secs = elapsed, "job finished");
            publisher.emit(Event::JobComplete {
                id: job.id.clone(),
                status: outcome.status,
                uuid: job.device_id.clone(),
            });
        }
        Err(err) => {
            let message = err.to_string();
            match queue.fail(&job.id, job.lease, &message, err.is_retryable()) {
                Ok(FailOutcome::Retrying { attempt, delay }) => {
                    warn!(
                        job_id = %job.id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %message,
                        "job failed, will retry"
                    );
                }
                Ok(FailOutcome::Failed) => {
                    error!(job_id = %job.id, kind = err.kind(), error = %message, elapsed_secs = elapsed, "job failed");
                    publisher.emit(Event::JobComplete {
                        id: job.id.clone(),
                        status: TerminalStatus::Failed,
                        uuid: job.device_id.clone(),
                    });
                }
                Ok(FailOutcome::Stale) => {
                    debug!(job_id = %job.id, "ignoring failure of a superseded run");
                }
                Err(e) => error!(job_id = %job.id, "recording failure failed: {e}"),
            }
        }
    }
}
