//! Run admission: at most one digest run in flight at a time.

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::models::Job;

use super::reaper::Reaper;
use super::{Orchestrator, Phase};

/// What came of a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LaunchOutcome {
    /// A new run was admitted and its opening discover callback published.
    Started { job_id: Uuid, message_id: String },
    /// Another run is still in flight.
    Refused { active_job_id: Uuid },
}

pub(crate) struct Launcher<'a> {
    orchestrator: &'a Orchestrator,
}

impl<'a> Launcher<'a> {
    pub(crate) fn new(orchestrator: &'a Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Admits a new digest run unless one is already active.
    ///
    /// A stale active job is reaped on the way in. `force` additionally
    /// clears the pointer of a live active job without touching the job
    /// itself; callbacks still in flight for it keep landing against it.
    /// Forced restarts do not clean up after the run they displace.
    pub(crate) async fn launch(&self, force: bool) -> Result<LaunchOutcome> {
        let o = self.orchestrator;
        if let Some(active_id) = o.jobs.active_job_id().await? {
            match o.jobs.load_job(active_id).await? {
                None => {
                    warn!(job_id = %active_id, "active pointer without a job, clearing");
                    o.jobs.clear_active_job().await?;
                }
                Some(mut active) if !active.status.is_terminal() => {
                    let reaper = Reaper::new(o);
                    if reaper.is_stale(&active, Utc::now()) {
                        reaper.reap(&mut active).await?;
                    } else if force {
                        warn!(job_id = %active_id, "forced past a live job");
                        o.jobs.clear_active_job().await?;
                    } else {
                        info!(job_id = %active_id, "run refused, a job is still active");
                        return Ok(LaunchOutcome::Refused {
                            active_job_id: active_id,
                        });
                    }
                }
                Some(_) => {
                    // A terminal job normally clears its own pointer, so this
                    // one is leftover from a crash mid-transition.
                    o.jobs.clear_active_job().await?;
                }
            }
        }

        let watches = o.config.watches().to_vec();
        let targets = u32::try_from(watches.len()).unwrap_or(u32::MAX);
        let job = Job::new(Uuid::now_v7(), Utc::now(), targets);
        o.jobs.save_job(&job).await?;
        o.jobs.set_active_job(job.id).await?;
        o.jobs.set_last_job(job.id).await?;
        o.jobs.enqueue_discovery(job.id, &watches).await?;
        o.metrics.jobs_started.inc();
        o.metrics.active_jobs.set(1.0);

        match o.dispatch(Phase::Discover, job.id, 0).await {
            Ok(message_id) => {
                info!(
                    job_id = %job.id,
                    watches = watches.len(),
                    message_id,
                    "digest run started"
                );
                Ok(LaunchOutcome::Started {
                    job_id: job.id,
                    message_id,
                })
            }
            Err(error) => {
                let mut failed = job;
                o.fail_job(&mut failed, &error).await?;
                Err(error)
            }
        }
    }
}
