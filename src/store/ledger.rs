use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use super::keys;
use super::kv::KvStore;

/// Permanent record of every item identifier that has appeared in a digest.
///
/// Entries are written once, at finalize time, and never expire; retention
/// cleanup and the admin reset leave the ledger alone unless the extended
/// wipe is requested explicitly.
pub(crate) struct SeenLedger {
    kv: Arc<dyn KvStore>,
}

impl SeenLedger {
    pub(crate) fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub(crate) async fn contains(&self, item_id: &str) -> Result<bool> {
        self.kv
            .set_is_member(keys::SEEN_LEDGER, item_id)
            .await
            .context("failed to check dedup ledger")
    }

    /// Records identifiers in the ledger; returns how many were new.
    pub(crate) async fn record(&self, item_ids: &[String]) -> Result<u64> {
        if item_ids.is_empty() {
            return Ok(0);
        }
        self.kv
            .set_add(keys::SEEN_LEDGER, item_ids)
            .await
            .context("failed to record items in dedup ledger")
    }

    pub(crate) async fn size(&self) -> Result<u64> {
        self.kv
            .set_card(keys::SEEN_LEDGER)
            .await
            .context("failed to read dedup ledger size")
    }

    pub(crate) async fn mark_run(&self, at: DateTime<Utc>) -> Result<()> {
        self.kv
            .set(keys::LAST_RUN, &at.to_rfc3339(), None)
            .await
            .context("failed to record last run timestamp")
    }

    pub(crate) async fn last_run(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self
            .kv
            .get(keys::LAST_RUN)
            .await
            .context("failed to read last run timestamp")?
        else {
            return Ok(None);
        };
        let parsed = DateTime::parse_from_rfc3339(&raw)
            .context("last run timestamp is malformed")?
            .with_timezone(&Utc);
        Ok(Some(parsed))
    }

    /// Drops the ledger and the last-run marker. Only the extended admin
    /// reset calls this; after it, previously digested items can reappear.
    pub(crate) async fn clear(&self) -> Result<()> {
        self.kv
            .delete(keys::SEEN_LEDGER)
            .await
            .context("failed to clear dedup ledger")?;
        self.kv
            .delete(keys::LAST_RUN)
            .await
            .context("failed to clear last run timestamp")
    }
}
