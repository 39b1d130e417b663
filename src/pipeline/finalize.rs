//! Finalize phase: one digest per run, then the permanent ledger.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info};

use crate::clients::notifier::{DigestEntry, DigestGroup};
use crate::store::models::{Item, ItemStatus, Job, JobStatus};

use super::Orchestrator;

const EXCERPT_MAX_CHARS: usize = 280;

/// Closes out a run: groups everything the run recorded, attempts the
/// digest delivery exactly once, and writes the ledger either way.
pub(crate) struct FinalizePhase<'a> {
    orchestrator: &'a Orchestrator,
}

impl<'a> FinalizePhase<'a> {
    pub(crate) fn new(orchestrator: &'a Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub(crate) async fn run(&self, job: &mut Job) -> Result<()> {
        let o = self.orchestrator;
        let now = Utc::now();
        let items = o.jobs.load_items(job.id).await?;

        if items.is_empty() {
            job.notification_sent = false;
            o.ledger.mark_run(now).await?;
            o.jobs.transition(job, JobStatus::Complete, now).await?;
            o.metrics.jobs_completed.inc();
            o.metrics.active_jobs.set(0.0);
            info!(job_id = %job.id, "digest run complete, nothing new");
            return Ok(());
        }

        let groups = group_items(&items);
        let delivered = match o.notifier.send_digest(job.id, now, &groups).await {
            Ok(()) => {
                o.metrics.notifications_sent.inc();
                true
            }
            Err(error) => {
                error!(
                    job_id = %job.id,
                    error = ?error,
                    "digest delivery failed, items are still recorded as seen"
                );
                o.metrics.notifications_failed.inc();
                false
            }
        };

        // The ledger is written regardless of delivery. An item gets one
        // chance to appear in a digest, never a second.
        let item_ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
        o.ledger.record(&item_ids).await?;
        o.ledger.mark_run(now).await?;

        job.notification_sent = delivered;
        o.jobs.transition(job, JobStatus::Complete, now).await?;
        o.metrics.jobs_completed.inc();
        o.metrics.active_jobs.set(0.0);
        info!(
            job_id = %job.id,
            items = items.len(),
            notification_sent = delivered,
            "digest run complete"
        );
        Ok(())
    }
}

/// Groups recorded items by watch name, alphabetically. Each group keeps
/// the items in the order they were given.
pub(crate) fn group_items(items: &[Item]) -> Vec<DigestGroup> {
    let mut by_group: BTreeMap<&str, Vec<DigestEntry>> = BTreeMap::new();
    for item in items {
        by_group
            .entry(item.group_key.as_str())
            .or_default()
            .push(DigestEntry {
                title: item.title.clone(),
                url: item.source_url.clone(),
                excerpt: item.content.as_deref().map(excerpt),
                fetched: item.status == ItemStatus::Fetched,
            });
    }
    by_group
        .into_iter()
        .map(|(name, entries)| DigestGroup {
            name: name.to_string(),
            entries,
        })
        .collect()
}

fn excerpt(content: &str) -> String {
    let trimmed = content.trim();
    match trimmed.char_indices().nth(EXCERPT_MAX_CHARS) {
        Some((offset, _)) => format!("{}...", &trimmed[..offset]),
        None => trimmed.to_string(),
    }
}
