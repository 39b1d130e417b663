use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Watch;

use super::keys;
use super::kv::KvStore;
use super::models::{Item, Job, JobStatus};

/// Persistence facade for jobs, their items, queues and pointers.
///
/// Job-scoped keys carry the retention TTL on every write so an abandoned
/// run ages out of the store on its own. The active and last pointers get
/// the same treatment; the dedup ledger (owned by
/// [`super::SeenLedger`]) deliberately does not.
pub(crate) struct JobStore {
    kv: Arc<dyn KvStore>,
    retention: Duration,
}

impl JobStore {
    pub(crate) fn new(kv: Arc<dyn KvStore>, retention: Duration) -> Self {
        Self { kv, retention }
    }

    pub(crate) async fn save_job(&self, job: &Job) -> Result<()> {
        let blob = serde_json::to_string(job).context("failed to serialize job")?;
        self.kv
            .set(&keys::job(job.id), &blob, Some(self.retention))
            .await
            .context("failed to store job")
    }

    pub(crate) async fn load_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let Some(blob) = self
            .kv
            .get(&keys::job(job_id))
            .await
            .context("failed to read job")?
        else {
            return Ok(None);
        };
        let job = serde_json::from_str(&blob).context("failed to deserialize job")?;
        Ok(Some(job))
    }

    /// Advances a job along the state machine, stamping timestamps and
    /// maintaining the active pointer.
    ///
    /// Rejects transitions the machine does not permit; the phase guards
    /// should make that unreachable, so a rejection here means a logic bug
    /// and is worth failing loudly over.
    pub(crate) async fn transition(
        &self,
        job: &mut Job,
        next: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !job.status.can_advance_to(next) {
            bail!(
                "illegal job transition: {} -> {}",
                job.status.as_ref(),
                next.as_ref()
            );
        }
        job.status = next;
        job.touch(now);
        if next.is_terminal() {
            job.completed_at = Some(now);
        }
        self.save_job(job).await?;
        if next.is_terminal() {
            self.clear_active_job().await?;
        }
        Ok(())
    }

    pub(crate) async fn active_job_id(&self) -> Result<Option<Uuid>> {
        read_pointer(self.kv.as_ref(), keys::ACTIVE_JOB).await
    }

    pub(crate) async fn set_active_job(&self, job_id: Uuid) -> Result<()> {
        self.kv
            .set(
                keys::ACTIVE_JOB,
                &job_id.to_string(),
                Some(self.retention),
            )
            .await
            .context("failed to set active job pointer")
    }

    pub(crate) async fn clear_active_job(&self) -> Result<()> {
        self.kv
            .delete(keys::ACTIVE_JOB)
            .await
            .context("failed to clear active job pointer")
    }

    pub(crate) async fn last_job_id(&self) -> Result<Option<Uuid>> {
        read_pointer(self.kv.as_ref(), keys::LAST_JOB).await
    }

    pub(crate) async fn set_last_job(&self, job_id: Uuid) -> Result<()> {
        self.kv
            .set(keys::LAST_JOB, &job_id.to_string(), Some(self.retention))
            .await
            .context("failed to set last job pointer")
    }

    pub(crate) async fn save_item(&self, job_id: Uuid, item: &Item) -> Result<()> {
        let key = keys::job_items(job_id);
        let blob = serde_json::to_string(item).context("failed to serialize item")?;
        self.kv
            .hash_set(&key, &item.id, &blob)
            .await
            .context("failed to store item")?;
        self.kv.expire(&key, self.retention).await
    }

    pub(crate) async fn load_item(&self, job_id: Uuid, item_id: &str) -> Result<Option<Item>> {
        let Some(blob) = self
            .kv
            .hash_get(&keys::job_items(job_id), item_id)
            .await
            .context("failed to read item")?
        else {
            return Ok(None);
        };
        let item = serde_json::from_str(&blob).context("failed to deserialize item")?;
        Ok(Some(item))
    }

    /// All items of a job, ordered by identifier for deterministic output.
    pub(crate) async fn load_items(&self, job_id: Uuid) -> Result<Vec<Item>> {
        let fields = self
            .kv
            .hash_get_all(&keys::job_items(job_id))
            .await
            .context("failed to read items")?;
        let mut items = Vec::with_capacity(fields.len());
        for blob in fields.values() {
            items.push(serde_json::from_str(blob).context("failed to deserialize item")?);
        }
        items.sort_by(|a: &Item, b: &Item| a.id.cmp(&b.id));
        Ok(items)
    }

    pub(crate) async fn enqueue_discovery(&self, job_id: Uuid, watches: &[Watch]) -> Result<u64> {
        let key = keys::discover_queue(job_id);
        let mut entries = Vec::with_capacity(watches.len());
        for watch in watches {
            entries.push(serde_json::to_string(watch).context("failed to serialize watch")?);
        }
        let len = self
            .kv
            .list_push(&key, &entries)
            .await
            .context("failed to enqueue discovery targets")?;
        self.kv.expire(&key, self.retention).await?;
        Ok(len)
    }

    pub(crate) async fn dequeue_discovery(&self, job_id: Uuid, max: usize) -> Result<Vec<Watch>> {
        let entries = self
            .kv
            .list_pop(&keys::discover_queue(job_id), max)
            .await
            .context("failed to dequeue discovery targets")?;
        let mut watches = Vec::with_capacity(entries.len());
        for entry in entries {
            watches.push(serde_json::from_str(&entry).context("failed to deserialize watch")?);
        }
        Ok(watches)
    }

    pub(crate) async fn discovery_queue_len(&self, job_id: Uuid) -> Result<u64> {
        self.kv
            .list_len(&keys::discover_queue(job_id))
            .await
            .context("failed to read discovery queue length")
    }

    pub(crate) async fn enqueue_fetch(&self, job_id: Uuid, item_ids: &[String]) -> Result<u64> {
        if item_ids.is_empty() {
            return self.fetch_queue_len(job_id).await;
        }
        let key = keys::fetch_queue(job_id);
        let len = self
            .kv
            .list_push(&key, item_ids)
            .await
            .context("failed to enqueue fetch targets")?;
        self.kv.expire(&key, self.retention).await?;
        Ok(len)
    }

    pub(crate) async fn dequeue_fetch(&self, job_id: Uuid, max: usize) -> Result<Vec<String>> {
        self.kv
            .list_pop(&keys::fetch_queue(job_id), max)
            .await
            .context("failed to dequeue fetch targets")
    }

    pub(crate) async fn fetch_queue_len(&self, job_id: Uuid) -> Result<u64> {
        self.kv
            .list_len(&keys::fetch_queue(job_id))
            .await
            .context("failed to read fetch queue length")
    }

    /// Deletes every job-scoped key, including the pointers. Returns how
    /// many keys went away. The dedup ledger is not touched.
    pub(crate) async fn delete_job_keys(&self) -> Result<u64> {
        let keys = self
            .kv
            .keys_matching(keys::JOB_KEY_PATTERN)
            .await
            .context("failed to list job keys")?;
        let mut deleted = 0;
        for key in keys {
            self.kv.delete(&key).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

async fn read_pointer(kv: &dyn KvStore, key: &str) -> Result<Option<Uuid>> {
    let Some(raw) = kv
        .get(key)
        .await
        .with_context(|| format!("failed to read pointer {key}"))?
    else {
        return Ok(None);
    };
    let id = raw
        .parse()
        .with_context(|| format!("pointer {key} holds a malformed id"))?;
    Ok(Some(id))
}
