use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// The durable key-value store the orchestrator persists through.
///
/// Everything the worker remembers between invocations goes through this
/// trait: job blobs, item hashes, the batch queues, the dedup ledger and the
/// active/last pointers. The selected backend is decided once at startup
/// ([`crate::config::KvBackend`]), never sniffed at call sites.
#[async_trait]
pub(crate) trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Sets a string value, with an optional time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Applies a time-to-live to an existing key. Required because hash and
    /// list writes cannot carry one inline the way [`KvStore::set`] can.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Appends to the tail of a list, returning the new length.
    async fn list_push(&self, key: &str, values: &[String]) -> Result<u64>;

    /// Removes and returns up to `count` entries from the head of a list.
    ///
    /// The removal is destructive and not transactional with whatever the
    /// caller does next; entries popped by a crashed invocation are gone.
    async fn list_pop(&self, key: &str, count: usize) -> Result<Vec<String>>;

    async fn list_len(&self, key: &str) -> Result<u64>;

    /// Adds members to a set, returning how many were newly inserted.
    async fn set_add(&self, key: &str, members: &[String]) -> Result<u64>;

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool>;

    #[allow(dead_code)]
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    async fn set_card(&self, key: &str) -> Result<u64>;

    /// Lists keys matching a glob-style pattern such as `digest:job:*`.
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>>;
}
