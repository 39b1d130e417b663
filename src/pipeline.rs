//! Phase choreography for digest runs.
//!
//! A run is not a resident process. Each phase executes as one short HTTP
//! callback: it claims a bounded batch from its queue, works through it,
//! persists progress, and hands the next invocation to the push relay.
//! The orchestrator owns the collaborators every phase needs and decides
//! whether an incoming callback still applies to the job it names.

pub(crate) mod discover;
pub(crate) mod fetch;
pub(crate) mod finalize;
pub(crate) mod launch;
pub(crate) mod reaper;

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::clients::notifier::NotifierClient;
use crate::clients::relay::RelayClient;
use crate::clients::scraper::ScraperClient;
use crate::config::Config;
use crate::observability::metrics::Metrics;
use crate::store::models::{Job, JobStatus};
use crate::store::{JobStore, KvStore, SeenLedger};

/// The three relay-driven phases of a digest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Discover,
    Fetch,
    Finalize,
}

impl Phase {
    pub(crate) const fn callback_path(self) -> &'static str {
        match self {
            Self::Discover => "/v1/phase/discover",
            Self::Fetch => "/v1/phase/fetch",
            Self::Finalize => "/v1/phase/finalize",
        }
    }

    /// The job status a callback for this phase is valid against.
    pub(crate) const fn expected_status(self) -> JobStatus {
        match self {
            Self::Discover => JobStatus::Discovering,
            Self::Fetch => JobStatus::Fetching,
            Self::Finalize => JobStatus::Finalizing,
        }
    }

    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::Fetch => "fetch",
            Self::Finalize => "finalize",
        }
    }
}

/// What a phase invocation did with its callback.
///
/// `Ignored` and `Failed` are successes from the relay's point of view;
/// answering an error would only provoke redelivery of a callback that
/// can never apply again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhaseOutcome {
    Processed,
    Ignored,
    Failed,
}

impl PhaseOutcome {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Ignored => "ignored",
            Self::Failed => "failed",
        }
    }
}

/// Holds every collaborator the phases need.
pub(crate) struct Orchestrator {
    config: Arc<Config>,
    jobs: JobStore,
    ledger: SeenLedger,
    scraper: Arc<ScraperClient>,
    notifier: Arc<NotifierClient>,
    relay: Arc<RelayClient>,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    pub(crate) fn new(
        config: Arc<Config>,
        kv: Arc<dyn KvStore>,
        scraper: Arc<ScraperClient>,
        notifier: Arc<NotifierClient>,
        relay: Arc<RelayClient>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let jobs = JobStore::new(Arc::clone(&kv), config.job_retention());
        let ledger = SeenLedger::new(kv);
        Self {
            config,
            jobs,
            ledger,
            scraper,
            notifier,
            relay,
            metrics,
        }
    }

    pub(crate) fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub(crate) fn ledger(&self) -> &SeenLedger {
        &self.ledger
    }

    pub(crate) fn scraper(&self) -> &ScraperClient {
        &self.scraper
    }

    pub(crate) fn notifier(&self) -> &NotifierClient {
        &self.notifier
    }

    /// Executes one phase invocation against the named job.
    ///
    /// Callbacks for unknown jobs or for jobs no longer in the matching
    /// status are dropped without touching any state; the relay may
    /// redeliver a callback long after the run has moved on.
    pub(crate) async fn run_phase(&self, phase: Phase, job_id: Uuid) -> Result<PhaseOutcome> {
        let Some(mut job) = self.jobs.load_job(job_id).await? else {
            info!(job_id = %job_id, phase = phase.as_str(), "callback for unknown job ignored");
            self.metrics.phase_callbacks_ignored.inc();
            return Ok(PhaseOutcome::Ignored);
        };

        if job.status != phase.expected_status() {
            info!(
                job_id = %job.id,
                phase = phase.as_str(),
                status = job.status.as_ref(),
                "callback no longer matches job status, ignored"
            );
            self.metrics.phase_callbacks_ignored.inc();
            return Ok(PhaseOutcome::Ignored);
        }

        let timer = match phase {
            Phase::Discover => self.metrics.discover_batch_duration.start_timer(),
            Phase::Fetch => self.metrics.fetch_batch_duration.start_timer(),
            Phase::Finalize => self.metrics.finalize_duration.start_timer(),
        };

        let result = match phase {
            Phase::Discover => discover::DiscoverPhase::new(self).run(&mut job).await,
            Phase::Fetch => fetch::FetchPhase::new(self).run(&mut job).await,
            Phase::Finalize => finalize::FinalizePhase::new(self).run(&mut job).await,
        };
        drop(timer);

        match result {
            Ok(()) => Ok(PhaseOutcome::Processed),
            Err(error) => {
                self.fail_job(&mut job, &error).await?;
                Ok(PhaseOutcome::Failed)
            }
        }
    }

    /// Hands the next invocation of `phase` to the relay.
    pub(crate) async fn dispatch(
        &self,
        phase: Phase,
        job_id: Uuid,
        batch_index: u32,
    ) -> Result<String> {
        let destination = format!(
            "{}{}",
            self.config.callback_base_url(),
            phase.callback_path()
        );
        let body = serde_json::json!({ "job_id": job_id, "batch_index": batch_index });

        match self.relay.publish(&destination, &body).await {
            Ok(message_id) => {
                self.metrics.relay_publishes.inc();
                debug!(
                    job_id = %job_id,
                    phase = phase.as_str(),
                    batch_index,
                    message_id = %message_id,
                    "phase callback published"
                );
                Ok(message_id)
            }
            Err(error) => {
                self.metrics.relay_publish_failures.inc();
                Err(error.context(format!("failed to publish {} callback", phase.as_str())))
            }
        }
    }

    /// Moves a job to failed and records why. Safe to call from any
    /// non-terminal status.
    pub(crate) async fn fail_job(&self, job: &mut Job, error: &anyhow::Error) -> Result<()> {
        error!(job_id = %job.id, error = ?error, "digest job failed");
        job.error = Some(format!("{error:#}"));
        self.jobs.transition(job, JobStatus::Failed, Utc::now()).await?;
        self.metrics.jobs_failed.inc();
        self.metrics.active_jobs.set(0.0);
        Ok(())
    }
}

// Counter deltas come in as usize; prometheus counters take f64.
pub(crate) fn metric_count(n: usize) -> f64 {
    f64::from(u32::try_from(n).unwrap_or(u32::MAX))
}
