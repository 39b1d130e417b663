//! Key layout for everything the worker stores.
//!
//! Job-scoped keys all live under `digest:job:` so retention cleanup and the
//! admin reset can find them with one pattern. The ledger and last-run marker
//! live outside that prefix because they are permanent.

use uuid::Uuid;

pub(crate) const ACTIVE_JOB: &str = "digest:job:active";
pub(crate) const LAST_JOB: &str = "digest:job:last";
pub(crate) const SEEN_LEDGER: &str = "digest:seen";
pub(crate) const LAST_RUN: &str = "digest:last_run";

pub(crate) const JOB_KEY_PATTERN: &str = "digest:job:*";

pub(crate) fn job(job_id: Uuid) -> String {
    format!("digest:job:{job_id}")
}

pub(crate) fn job_items(job_id: Uuid) -> String {
    format!("digest:job:{job_id}:items")
}

pub(crate) fn discover_queue(job_id: Uuid) -> String {
    format!("digest:job:{job_id}:queue:discover")
}

pub(crate) fn fetch_queue(job_id: Uuid) -> String {
    format!("digest:job:{job_id}:queue:fetch")
}
