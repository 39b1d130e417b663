use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub(crate) const JOB_SCHEMA_VERSION: u32 = 1;

/// Lifecycle of a digest run.
///
/// Forward-only: `discovering → fetching → finalizing → complete`, with
/// `failed` reachable from any non-terminal state and a direct
/// `discovering → finalizing` hop when a run produced nothing to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Discovering,
    Fetching,
    Finalizing,
    Complete,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    #[must_use]
    pub(crate) fn can_advance_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Discovering, JobStatus::Fetching | JobStatus::Finalizing)
            | (JobStatus::Fetching, JobStatus::Finalizing)
            | (JobStatus::Finalizing, JobStatus::Complete) => true,
            (current, JobStatus::Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl AsRef<str> for JobStatus {
    fn as_ref(&self) -> &str {
        match self {
            JobStatus::Discovering => "discovering",
            JobStatus::Fetching => "fetching",
            JobStatus::Finalizing => "finalizing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ItemStatus {
    Pending,
    Fetched,
    Skipped,
}

impl AsRef<str> for ItemStatus {
    fn as_ref(&self) -> &str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Fetched => "fetched",
            ItemStatus::Skipped => "skipped",
        }
    }
}

/// One digest run, serialized as a single JSON blob in the store.
///
/// `updated_at` doubles as the liveness heartbeat the reaper reads; every
/// mutation refreshes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Job {
    pub(crate) id: Uuid,
    pub(crate) status: JobStatus,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) error: Option<String>,
    pub(crate) discovery_targets_total: u32,
    pub(crate) discovery_targets_complete: u32,
    pub(crate) fetch_targets_total: u32,
    pub(crate) fetch_targets_complete: u32,
    pub(crate) total_new_items: u32,
    pub(crate) notification_sent: bool,
    pub(crate) schema_version: u32,
}

impl Job {
    #[must_use]
    pub(crate) fn new(id: Uuid, now: DateTime<Utc>, discovery_targets_total: u32) -> Self {
        Self {
            id,
            status: JobStatus::Discovering,
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            discovery_targets_total,
            discovery_targets_complete: 0,
            fetch_targets_total: 0,
            fetch_targets_complete: 0,
            total_new_items: 0,
            notification_sent: false,
            schema_version: JOB_SCHEMA_VERSION,
        }
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// One discovered content item, owned by exactly one job.
///
/// Written once by the discover phase and at most once more by the fetch
/// phase; `content` and `fetch_error` are mutually exclusive in practice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Item {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) source_url: String,
    pub(crate) author: Option<String>,
    pub(crate) published_at: Option<NaiveDate>,
    pub(crate) size_hint: Option<u64>,
    pub(crate) group_key: String,
    pub(crate) status: ItemStatus,
    pub(crate) content: Option<String>,
    pub(crate) fetch_error: Option<String>,
    pub(crate) schema_version: u32,
}
