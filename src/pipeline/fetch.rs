//! Fetch phase: pulling full content for the items discovery queued.

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, warn};

use crate::store::models::{ItemStatus, Job, JobStatus};

use super::{Orchestrator, Phase};

/// Works through one batch of the fetch queue.
///
/// A failed fetch is recorded on the item and does not abort the batch;
/// the digest later carries the item without an excerpt. Only
/// infrastructure failures (the store itself) fail the job.
pub(crate) struct FetchPhase<'a> {
    orchestrator: &'a Orchestrator,
}

impl<'a> FetchPhase<'a> {
    pub(crate) fn new(orchestrator: &'a Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub(crate) async fn run(&self, job: &mut Job) -> Result<()> {
        let o = self.orchestrator;
        let batch = o
            .jobs
            .dequeue_fetch(job.id, o.config.fetch_batch_size().get())
            .await?;

        for (index, item_id) in batch.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(o.config.scrape_delay()).await;
            }
            self.fetch_one(job, item_id).await?;
            job.fetch_targets_complete += 1;
        }

        let remaining = o.jobs.fetch_queue_len(job.id).await?;
        if remaining > 0 {
            job.touch(Utc::now());
            o.jobs.save_job(job).await?;
            o.dispatch(Phase::Fetch, job.id, job.fetch_targets_complete)
                .await?;
            return Ok(());
        }

        o.jobs
            .transition(job, JobStatus::Finalizing, Utc::now())
            .await?;
        o.dispatch(Phase::Finalize, job.id, 0).await?;
        Ok(())
    }

    async fn fetch_one(&self, job: &mut Job, item_id: &str) -> Result<()> {
        let o = self.orchestrator;
        let Some(mut item) = o.jobs.load_item(job.id, item_id).await? else {
            warn!(job_id = %job.id, item_id, "fetch target has no recorded item, skipping");
            return Ok(());
        };
        if item.status != ItemStatus::Pending {
            debug!(job_id = %job.id, item_id, status = item.status.as_ref(), "item already settled");
            return Ok(());
        }

        match o.scraper.fetch_document(&item.source_url).await {
            Ok(content) => {
                item.status = ItemStatus::Fetched;
                item.content = Some(content);
                o.metrics.items_fetched.inc();
            }
            Err(error) => {
                warn!(
                    job_id = %job.id,
                    item_id,
                    error = ?error,
                    "content fetch failed, item kept without content"
                );
                item.status = ItemStatus::Skipped;
                item.fetch_error = Some(format!("{error:#}"));
                o.metrics.fetch_failures.inc();
                o.metrics.items_skipped.inc();
            }
        }

        o.jobs.save_item(job.id, &item).await
    }
}
