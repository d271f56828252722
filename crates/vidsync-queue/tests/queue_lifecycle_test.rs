//! Integration tests: leasing, retries, stalls, cancellation and reopen.

use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

use vidsync_core::config::PriorityMode;
use vidsync_core::types::{JobKind, JobProgress, JobState, TerminalStatus};
use vidsync_queue::{CancelOutcome, EnqueueOptions, FailOutcome, JobQueue, QueuePolicy};

fn policy() -> QueuePolicy {
    QueuePolicy {
        max_attempts: 3,
        backoff_base: Duration::from_secs(2),
        backoff_max: Duration::from_secs(300),
        max_stalled: 1,
        retain_finished: 100,
        priority_mode: PriorityMode::Fifo,
    }
}

fn enqueue(queue: &JobQueue, kind: JobKind, priority: Option<u8>) -> String {
    queue
        .enqueue(
            kind,
            "ABCD-1234",
            "Mavic",
            json!({"uuid": "ABCD-1234"}),
            EnqueueOptions {
                priority,
                job_id: None,
            },
        )
        .expect("enqueue")
        .id
}

#[test]
fn retryable_failure_backs_off_then_exhausts_attempts() {
    let queue = JobQueue::in_memory(policy());
    let id = enqueue(&queue, JobKind::Sync, None);

    let job = queue.try_lease(JobKind::Sync).unwrap().unwrap();
    let outcome = queue.fail(&id, job.lease, "mount busy", true).unwrap();
    assert_eq!(
        outcome,
        FailOutcome::Retrying {
            attempt: 1,
            delay: Duration::from_secs(2)
        }
    );

    let counts = queue.counts();
    assert_eq!(counts.delayed, 1);
    assert_eq!(counts.waiting, 0);
    assert!(queue.try_lease(JobKind::Sync).unwrap().is_none(), "still backing off");

    let mut fast = policy();
    fast.backoff_base = Duration::ZERO;
    fast.max_attempts = 2;
    let queue = JobQueue::in_memory(fast);
    let id = enqueue(&queue, JobKind::Sync, None);
    let first = queue.try_lease(JobKind::Sync).unwrap().unwrap();
    assert!(matches!(
        queue.fail(&id, first.lease, "boom", true).unwrap(),
        FailOutcome::Retrying { attempt: 1, .. }
    ));
    let second = queue.try_lease(JobKind::Sync).unwrap().unwrap();
    assert_eq!(second.attempts, 2);
    assert_eq!(
        queue.fail(&id, second.lease, "boom again", true).unwrap(),
        FailOutcome::Failed
    );

    let job = queue.get(&id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.last_error.as_deref(), Some("boom again"));
    assert!(job.finished_at.is_some());
}

#[test]
fn fifo_ignores_priority_and_priority_mode_honours_it() {
    let fifo = JobQueue::in_memory(policy());
    let first = enqueue(&fifo, JobKind::Merge, Some(9));
    enqueue(&fifo, JobKind::Merge, Some(1));
    assert_eq!(fifo.try_lease(JobKind::Merge).unwrap().unwrap().id, first);

    let mut by_priority = policy();
    by_priority.priority_mode = PriorityMode::Priority;
    let queue = JobQueue::in_memory(by_priority);
    enqueue(&queue, JobKind::Merge, Some(9));
    let urgent = enqueue(&queue, JobKind::Merge, Some(1));
    let also_urgent = enqueue(&queue, JobKind::Merge, Some(1));
    assert_eq!(queue.try_lease(JobKind::Merge).unwrap().unwrap().id, urgent);
    assert_eq!(queue.try_lease(JobKind::Merge).unwrap().unwrap().id, also_urgent);
}

#[test]
fn default_priority_follows_stage_order() {
    let queue = JobQueue::in_memory(policy());
    let sync = enqueue(&queue, JobKind::Sync, None);
    let stabilize = enqueue(&queue, JobKind::Stabilize, None);
    assert_eq!(queue.get(&sync).unwrap().priority, 1);
    assert_eq!(queue.get(&stabilize).unwrap().priority, 3);
}

#[test]
fn stalled_job_is_requeued_once_then_failed() {
    let queue = JobQueue::in_memory(policy());
    let id = enqueue(&queue, JobKind::Stabilize, None);

    let first = queue.try_lease(JobKind::Stabilize).unwrap().unwrap();
    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(queue.check_stalled(Duration::ZERO).unwrap(), vec![id.clone()]);

    let job = queue.get(&id).unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.stall_count, 1);
    assert_eq!(job.attempts, 0, "a stall does not use up an attempt");

    // The interrupted run reports late and is ignored
    assert!(!queue
        .complete(&id, first.lease, TerminalStatus::Completed, None)
        .unwrap());

    queue.try_lease(JobKind::Stabilize).unwrap().unwrap();
    std::thread::sleep(Duration::from_millis(5));
    queue.check_stalled(Duration::ZERO).unwrap();
    let job = queue.get(&id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.stall_count, 2);
}

#[test]
fn heartbeat_keeps_job_alive() {
    let queue = JobQueue::in_memory(policy());
    let id = enqueue(&queue, JobKind::Sync, None);
    let job = queue.try_lease(JobKind::Sync).unwrap().unwrap();

    assert!(queue.touch(&id, job.lease));
    assert!(queue.check_stalled(Duration::from_secs(60)).unwrap().is_empty());
    assert_eq!(queue.get(&id).unwrap().state, JobState::Active);
}

#[test]
fn cancel_queued_job_never_runs() {
    let queue = JobQueue::in_memory(policy());
    let id = enqueue(&queue, JobKind::Sync, None);

    assert_eq!(queue.cancel(&id).unwrap(), CancelOutcome::Removed);
    assert!(queue.try_lease(JobKind::Sync).unwrap().is_none());
    let job = queue.get(&id).unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(job.status, Some(TerminalStatus::Cancelled));
}

#[test]
fn cancel_active_job_rejects_its_later_reports() {
    let queue = JobQueue::in_memory(policy());
    let id = enqueue(&queue, JobKind::Merge, None);
    let job = queue.try_lease(JobKind::Merge).unwrap().unwrap();

    assert_eq!(queue.cancel(&id).unwrap(), CancelOutcome::MarkedFailed);
    assert!(!queue.update_progress(&id, job.lease, JobProgress::default()));
    assert!(!queue
        .complete(&id, job.lease, TerminalStatus::Completed, None)
        .unwrap());

    let job = queue.get(&id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.last_error.as_deref(), Some("Cancelled by user"));
}

#[test]
fn reopen_restores_jobs_and_recovers_orphans() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("state/queue.json");

    let (done, orphan, waiting) = {
        let queue = JobQueue::open(&path, policy()).expect("open");
        let done = enqueue(&queue, JobKind::Sync, None);
        let lease = queue.try_lease(JobKind::Sync).unwrap().unwrap().lease;
        queue
            .complete(&done, lease, TerminalStatus::NothingToDo, Some(json!({"filesMoved": 0})))
            .unwrap();
        let orphan = enqueue(&queue, JobKind::Merge, None);
        queue.try_lease(JobKind::Merge).unwrap().unwrap();
        let waiting = enqueue(&queue, JobKind::Stabilize, None);
        (done, orphan, waiting)
    };
    assert!(path.exists());

    let queue = JobQueue::open(&path, policy()).expect("reopen");
    let done = queue.get(&done).unwrap();
    assert_eq!(done.status, Some(TerminalStatus::NothingToDo));
    assert_eq!(done.result, Some(json!({"filesMoved": 0})));

    let orphan = queue.get(&orphan).unwrap();
    assert_eq!(orphan.state, JobState::Queued);
    assert_eq!(orphan.stall_count, 1);

    assert_eq!(queue.get(&waiting).unwrap().state, JobState::Queued);
    let listed: Vec<_> = queue.list(None).into_iter().map(|j| j.kind).collect();
    assert_eq!(listed, [JobKind::Sync, JobKind::Merge, JobKind::Stabilize]);

    // Sequence numbers keep increasing across restarts
    let next = enqueue(&queue, JobKind::Sync, None);
    assert_eq!(queue.get(&next).unwrap().seq, 3);
}

#[test]
fn progress_updates_are_flushed_on_demand() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("queue.json");
    let queue = JobQueue::open(&path, policy()).expect("open");
    let id = enqueue(&queue, JobKind::Sync, None);
    let job = queue.try_lease(JobKind::Sync).unwrap().unwrap();

    queue.update_progress(
        &id,
        job.lease,
        JobProgress {
            percent: 40,
            current_file: Some("DCIM/DJI_0001.MP4".into()),
            moved: 2,
            total: 5,
            status: "Running".into(),
        },
    );
    let on_disk = std::fs::read_to_string(&path).unwrap();
    assert!(!on_disk.contains("DJI_0001"));

    queue.flush().unwrap();
    let on_disk = std::fs::read_to_string(&path).unwrap();
    assert!(on_disk.contains("DCIM/DJI_0001.MP4"));
}

#[tokio::test]
async fn next_job_wakes_on_enqueue() {
    let queue = std::sync::Arc::new(JobQueue::in_memory(policy()));
    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.next_job(JobKind::Merge).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let id = enqueue(&queue, JobKind::Merge, None);

    let job = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("woken")
        .expect("join")
        .expect("lease");
    assert_eq!(job.id, id);
    assert_eq!(job.state, JobState::Active);
}

#[test]
fn snapshot_reads_without_recovering() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("queue.json");
    let queue = JobQueue::open(&path, policy()).expect("open");
    let id = enqueue(&queue, JobKind::Sync, None);
    queue.try_lease(JobKind::Sync).unwrap().unwrap();

    let jobs = JobQueue::read_snapshot(&path).expect("snapshot");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, id);
    assert_eq!(jobs[0].state, JobState::Active);
    assert_eq!(jobs[0].stall_count, 0);
}

#[test]
fn next_job_returns_due_retry_without_waiting_for_enqueue() {
    let mut fast = policy();
    fast.backoff_base = Duration::from_millis(50);
    let queue = JobQueue::in_memory(fast);
    let id = enqueue(&queue, JobKind::Sync, None);
    let first = queue.try_lease(JobKind::Sync).unwrap().unwrap();
    queue.fail(&id, first.lease, "mount busy", true).unwrap();

    // Nothing notifies the waiter; it must wake when the backoff elapses
    let job = tokio_test::block_on(async {
        tokio::time::timeout(Duration::from_secs(2), queue.next_job(JobKind::Sync)).await
    })
    .expect("woken after backoff")
    .expect("lease");
    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 2);
}
