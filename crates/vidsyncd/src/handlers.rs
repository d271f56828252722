//! Job handlers: decode the payload, run the stage, derive follow-ups.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use vidsync_core::types::{FollowUp, JobKind, MergePayload, StabilizePayload, SyncPayload};
use vidsync_core::{PipelineError, PipelineResult};
use vidsync_pipeline::{chain, MergeStage, StabilizeStage, SyncStage};
use vidsync_queue::{JobContext, JobHandler, JobOutcome};

fn decode<T: DeserializeOwned>(ctx: &JobContext) -> PipelineResult<T> {
    serde_json::from_value(ctx.job.payload.clone()).map_err(|e| {
        PipelineError::Other(anyhow::anyhow!(
            "invalid {} payload for job {}: {e}",
            ctx.job.kind,
            ctx.job.id
        ))
    })
}

fn encode<T: Serialize>(report: &T) -> PipelineResult<serde_json::Value> {
    serde_json::to_value(report)
        .map_err(|e| PipelineError::Other(anyhow::anyhow!("serializing report: {e}")))
}

fn follow_up(built: serde_json::Result<FollowUp>) -> PipelineResult<FollowUp> {
    built.map_err(|e| PipelineError::Other(anyhow::anyhow!("building follow-up job: {e}")))
}

// ── Sync ─────────────────────────────────────────────────────────────────────

pub struct SyncHandler {
    stage: SyncStage,
    /// Merge output folder name under the device folder
    output_folder: String,
}

impl SyncHandler {
    pub fn new(stage: SyncStage, output_folder: String) -> Self {
        SyncHandler {
            stage,
            output_folder,
        }
    }
}

impl JobHandler for SyncHandler {
    fn kind(&self) -> JobKind {
        JobKind::Sync
    }

    fn run(&self, ctx: JobContext) -> BoxFuture<'_, PipelineResult<JobOutcome>> {
        Box::pin(async move {
            let payload: SyncPayload = decode(&ctx)?;
            let report = self.stage.run(&payload, &ctx.reporter).await?;
            let mut outcome = JobOutcome::new(report.status, encode(&report)?);
            if let Some(next) = chain::after_sync(&payload, &report, &self.output_folder) {
                ctx.reporter
                    .info(format!("Queueing merge for {}", next.target_folder.display()));
                outcome = outcome.with_follow_up(follow_up(FollowUp::merge(&next))?);
            }
            Ok(outcome)
        })
    }
}

// ── Merge ────────────────────────────────────────────────────────────────────

pub struct MergeHandler {
    stage: MergeStage,
}

impl MergeHandler {
    pub fn new(stage: MergeStage) -> Self {
        MergeHandler { stage }
    }
}

impl JobHandler for MergeHandler {
    fn kind(&self) -> JobKind {
        JobKind::Merge
    }

    fn run(&self, ctx: JobContext) -> BoxFuture<'_, PipelineResult<JobOutcome>> {
        Box::pin(async move {
            let payload: MergePayload = decode(&ctx)?;
            let report = self.stage.run(&payload, &ctx.reporter).await?;
            let mut outcome = JobOutcome::new(report.status, encode(&report)?);
            if let Some(next) = chain::after_merge(&payload, &report) {
                ctx.reporter.info(format!(
                    "Queueing stabilization of {} merged file(s)",
                    next.inputs.len()
                ));
                outcome = outcome.with_follow_up(follow_up(FollowUp::stabilize(&next))?);
            }
            Ok(outcome)
        })
    }
}

// ── Stabilize ────────────────────────────────────────────────────────────────

pub struct StabilizeHandler {
    stage: StabilizeStage,
}

impl StabilizeHandler {
    pub fn new(stage: StabilizeStage) -> Self {
        StabilizeHandler { stage }
    }
}

impl JobHandler for StabilizeHandler {
    fn kind(&self) -> JobKind {
        JobKind::Stabilize
    }

    fn run(&self, ctx: JobContext) -> BoxFuture<'_, PipelineResult<JobOutcome>> {
        Box::pin(async move {
            let payload: StabilizePayload = decode(&ctx)?;
            let report = self.stage.run(&payload, &ctx.reporter).await?;
            Ok(JobOutcome::new(report.status, encode(&report)?))
        })
    }
}
