use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::kv::KvStore;

/// In-process [`KvStore`] backend for tests and local runs.
///
/// Expirations are honored lazily: a key past its deadline is dropped the
/// next time any operation touches it.
#[derive(Debug, Default)]
pub(crate) struct MemoryKvStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    deadlines: HashMap<String, DateTime<Utc>>,
}

impl Inner {
    fn purge_if_expired(&mut self, key: &str) {
        let expired = self
            .deadlines
            .get(key)
            .is_some_and(|deadline| *deadline <= Utc::now());
        if expired {
            self.remove_key(key);
        }
    }

    fn remove_key(&mut self, key: &str) {
        self.strings.remove(key);
        self.hashes.remove(key);
        self.lists.remove(key);
        self.sets.remove(key);
        self.deadlines.remove(key);
    }

    fn key_exists(&self, key: &str) -> bool {
        self.strings.contains_key(key)
            || self.hashes.contains_key(key)
            || self.lists.contains_key(key)
            || self.sets.contains_key(key)
    }
}

impl MemoryKvStore {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory kv store mutex poisoned"))
    }
}

fn deadline_from(ttl: Duration) -> Result<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl).map_err(|_| anyhow!("ttl out of range"))?;
    Ok(Utc::now() + ttl)
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.locked()?;
        inner.purge_if_expired(key);
        Ok(inner.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.locked()?;
        inner.strings.insert(key.to_string(), value.to_string());
        match ttl {
            Some(ttl) => {
                let deadline = deadline_from(ttl)?;
                inner.deadlines.insert(key.to_string(), deadline);
            }
            None => {
                inner.deadlines.remove(key);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.locked()?;
        inner.remove_key(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.locked()?;
        inner.purge_if_expired(key);
        if inner.key_exists(key) {
            let deadline = deadline_from(ttl)?;
            inner.deadlines.insert(key.to_string(), deadline);
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut inner = self.locked()?;
        inner.purge_if_expired(key);
        Ok(inner
            .hashes
            .get(key)
            .and_then(|fields| fields.get(field))
            .cloned())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.locked()?;
        inner.purge_if_expired(key);
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut inner = self.locked()?;
        inner.purge_if_expired(key);
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn list_push(&self, key: &str, values: &[String]) -> Result<u64> {
        let mut inner = self.locked()?;
        inner.purge_if_expired(key);
        let list = inner.lists.entry(key.to_string()).or_default();
        list.extend(values.iter().cloned());
        Ok(list.len() as u64)
    }

    async fn list_pop(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let mut inner = self.locked()?;
        inner.purge_if_expired(key);
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(Vec::new());
        };
        let take = count.min(list.len());
        let popped = list.drain(..take).collect();
        if list.is_empty() {
            inner.lists.remove(key);
        }
        Ok(popped)
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let mut inner = self.locked()?;
        inner.purge_if_expired(key);
        Ok(inner.lists.get(key).map_or(0, |list| list.len() as u64))
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<u64> {
        let mut inner = self.locked()?;
        inner.purge_if_expired(key);
        let set = inner.sets.entry(key.to_string()).or_default();
        let mut added = 0;
        for member in members {
            if set.insert(member.clone()) {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.locked()?;
        inner.purge_if_expired(key);
        Ok(inner.sets.get(key).is_some_and(|set| set.contains(member)))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut inner = self.locked()?;
        inner.purge_if_expired(key);
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_card(&self, key: &str) -> Result<u64> {
        let mut inner = self.locked()?;
        inner.purge_if_expired(key);
        Ok(inner.sets.get(key).map_or(0, |set| set.len() as u64))
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let inner = self.locked()?;
        let mut keys: Vec<String> = inner
            .strings
            .keys()
            .chain(inner.hashes.keys())
            .chain(inner.lists.keys())
            .chain(inner.sets.keys())
            .filter(|key| glob_matches(pattern, key))
            .cloned()
            .collect();
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}

/// Minimal glob support: a literal pattern, or a literal prefix followed by
/// a single trailing `*`. That is all the key layout needs.
fn glob_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}
