//! Stuck-job detection.
//!
//! A phase invocation that dies between dequeue and dispatch leaves its job
//! parked in a non-terminal status with no callback in flight. The reaper
//! fails such jobs so the next trigger can start fresh instead of being
//! refused forever.

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use tracing::warn;

use crate::store::models::Job;

use super::Orchestrator;

pub(crate) struct Reaper<'a> {
    orchestrator: &'a Orchestrator,
}

impl<'a> Reaper<'a> {
    pub(crate) fn new(orchestrator: &'a Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Whether the job has gone without a heartbeat for longer than the
    /// stuck-job timeout.
    pub(crate) fn is_stale(&self, job: &Job, now: DateTime<Utc>) -> bool {
        let timeout = TimeDelta::from_std(self.orchestrator.config.stuck_job_timeout())
            .unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(job.updated_at) > timeout
    }

    /// Fails a stale job, releasing the active pointer.
    pub(crate) async fn reap(&self, job: &mut Job) -> Result<()> {
        warn!(
            job_id = %job.id,
            status = job.status.as_ref(),
            updated_at = %job.updated_at.to_rfc3339(),
            "reaping stuck job"
        );
        self.orchestrator
            .fail_job(
                job,
                &anyhow!("no progress since {}", job.updated_at.to_rfc3339()),
            )
            .await?;
        self.orchestrator.metrics.jobs_reaped.inc();
        Ok(())
    }
}
