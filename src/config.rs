use std::{env, net::SocketAddr, num::NonZeroUsize, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

/// A tracked remote source: every digest run walks the full list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watch {
    pub name: String,
    pub url: String,
}

/// Which key-value backend the worker persists through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvBackend {
    Rest,
    Memory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    http_bind: SocketAddr,
    kv_backend: KvBackend,
    kv_rest_url: Option<String>,
    kv_rest_token: Option<String>,
    kv_connect_timeout: Duration,
    kv_total_timeout: Duration,
    scraper_base_url: String,
    scraper_service_token: Option<String>,
    scraper_connect_timeout: Duration,
    scraper_total_timeout: Duration,
    notifier_base_url: String,
    notifier_service_token: Option<String>,
    notifier_connect_timeout: Duration,
    notifier_total_timeout: Duration,
    relay_base_url: String,
    relay_api_token: Option<String>,
    relay_connect_timeout: Duration,
    relay_total_timeout: Duration,
    relay_signing_key: String,
    relay_issuer: String,
    callback_base_url: String,
    trigger_secret: String,
    phase_auth_bypass: bool,
    watches: Vec<Watch>,
    discover_batch_size: NonZeroUsize,
    fetch_batch_size: NonZeroUsize,
    recency_window_days: u32,
    min_fetch_size_bytes: u64,
    scrape_delay: Duration,
    stuck_job_timeout: Duration,
    job_retention: Duration,
    dispatch_max_retries: u32,
    http_max_retries: usize,
    http_backoff_base_ms: u64,
    http_backoff_cap_ms: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// Loads and validates the worker configuration from environment variables.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when a required variable is unset or a value
    /// fails to parse. `KV_REST_URL` is required only for the `rest` backend.
    pub fn from_env() -> Result<Self, ConfigError> {
        let http_bind = parse_socket_addr("DIGEST_WORKER_HTTP_BIND", "0.0.0.0:9105")?;

        let scraper_base_url = env_var("SCRAPER_BASE_URL")?;
        let scraper_service_token = env::var("SCRAPER_SERVICE_TOKEN").ok();
        let scraper_connect_timeout = parse_duration_ms("SCRAPER_CONNECT_TIMEOUT_MS", 3000)?;
        let scraper_total_timeout = parse_duration_ms("SCRAPER_TOTAL_TIMEOUT_MS", 30000)?;

        let notifier_base_url = env_var("NOTIFIER_BASE_URL")?;
        let notifier_service_token = env::var("NOTIFIER_SERVICE_TOKEN").ok();
        let notifier_connect_timeout = parse_duration_ms("NOTIFIER_CONNECT_TIMEOUT_MS", 3000)?;
        let notifier_total_timeout = parse_duration_ms("NOTIFIER_TOTAL_TIMEOUT_MS", 30000)?;

        let relay_base_url = env_var("RELAY_BASE_URL")?;
        let relay_api_token = env::var("RELAY_API_TOKEN").ok();
        let relay_connect_timeout = parse_duration_ms("RELAY_CONNECT_TIMEOUT_MS", 3000)?;
        let relay_total_timeout = parse_duration_ms("RELAY_TOTAL_TIMEOUT_MS", 10000)?;
        let relay_signing_key = env_var("RELAY_SIGNING_KEY")?;
        let relay_issuer = env::var("RELAY_ISSUER").unwrap_or_else(|_| "push-relay".to_string());

        // Phase callbacks are delivered back to this worker through the relay,
        // so the worker must know its own externally reachable base URL.
        let callback_base_url = env_var("CALLBACK_BASE_URL")?
            .trim_end_matches('/')
            .to_string();

        let trigger_secret = env_var("TRIGGER_SECRET")?;
        let phase_auth_bypass = parse_bool("PHASE_AUTH_BYPASS", false)?;

        let watches = parse_watches("WATCHES", &env_var("WATCHES")?)?;

        let kv_backend = parse_kv_backend("KV_BACKEND", KvBackend::Rest)?;
        let kv_rest_url = env::var("KV_REST_URL").ok();
        if kv_backend == KvBackend::Rest && kv_rest_url.is_none() {
            return Err(ConfigError::Missing("KV_REST_URL"));
        }
        let kv_rest_token = env::var("KV_REST_TOKEN").ok();
        let kv_connect_timeout = parse_duration_ms("KV_CONNECT_TIMEOUT_MS", 3000)?;
        let kv_total_timeout = parse_duration_ms("KV_TOTAL_TIMEOUT_MS", 10000)?;

        let discover_batch_size = parse_non_zero_usize("DISCOVER_BATCH_SIZE", 3)?;
        let fetch_batch_size = parse_non_zero_usize("FETCH_BATCH_SIZE", 5)?;
        let recency_window_days = parse_u32("RECENCY_WINDOW_DAYS", 3)?;
        let min_fetch_size_bytes = parse_u64("MIN_FETCH_SIZE_BYTES", 2048)?;
        let scrape_delay = parse_duration_ms("SCRAPE_DELAY_MS", 1500)?;
        let stuck_job_timeout = parse_duration_secs("STUCK_JOB_TIMEOUT_SECS", 600)?;
        let job_retention = parse_duration_secs("JOB_RETENTION_SECS", 86400)?;
        let dispatch_max_retries = parse_u32("DISPATCH_MAX_RETRIES", 3)?;

        // Retry settings for outbound HTTP (exponential backoff + jitter)
        let http_max_retries = parse_usize("HTTP_MAX_RETRIES", 3)?;
        let http_backoff_base_ms = parse_u64("HTTP_BACKOFF_BASE_MS", 250)?;
        let http_backoff_cap_ms = parse_u64("HTTP_BACKOFF_CAP_MS", 10000)?;

        Ok(Self {
            http_bind,
            kv_backend,
            kv_rest_url,
            kv_rest_token,
            kv_connect_timeout,
            kv_total_timeout,
            scraper_base_url,
            scraper_service_token,
            scraper_connect_timeout,
            scraper_total_timeout,
            notifier_base_url,
            notifier_service_token,
            notifier_connect_timeout,
            notifier_total_timeout,
            relay_base_url,
            relay_api_token,
            relay_connect_timeout,
            relay_total_timeout,
            relay_signing_key,
            relay_issuer,
            callback_base_url,
            trigger_secret,
            phase_auth_bypass,
            watches,
            discover_batch_size,
            fetch_batch_size,
            recency_window_days,
            min_fetch_size_bytes,
            scrape_delay,
            stuck_job_timeout,
            job_retention,
            dispatch_max_retries,
            http_max_retries,
            http_backoff_base_ms,
            http_backoff_cap_ms,
        })
    }

    #[must_use]
    pub fn http_bind(&self) -> SocketAddr {
        self.http_bind
    }

    #[must_use]
    pub fn kv_backend(&self) -> KvBackend {
        self.kv_backend
    }

    #[must_use]
    pub fn kv_rest_url(&self) -> Option<&str> {
        self.kv_rest_url.as_deref()
    }

    #[must_use]
    pub fn kv_rest_token(&self) -> Option<&str> {
        self.kv_rest_token.as_deref()
    }

    #[must_use]
    pub fn kv_connect_timeout(&self) -> Duration {
        self.kv_connect_timeout
    }

    #[must_use]
    pub fn kv_total_timeout(&self) -> Duration {
        self.kv_total_timeout
    }

    #[must_use]
    pub fn scraper_base_url(&self) -> &str {
        &self.scraper_base_url
    }

    #[must_use]
    pub fn scraper_service_token(&self) -> Option<&str> {
        self.scraper_service_token.as_deref()
    }

    #[must_use]
    pub fn scraper_connect_timeout(&self) -> Duration {
        self.scraper_connect_timeout
    }

    #[must_use]
    pub fn scraper_total_timeout(&self) -> Duration {
        self.scraper_total_timeout
    }

    #[must_use]
    pub fn notifier_base_url(&self) -> &str {
        &self.notifier_base_url
    }

    #[must_use]
    pub fn notifier_service_token(&self) -> Option<&str> {
        self.notifier_service_token.as_deref()
    }

    #[must_use]
    pub fn notifier_connect_timeout(&self) -> Duration {
        self.notifier_connect_timeout
    }

    #[must_use]
    pub fn notifier_total_timeout(&self) -> Duration {
        self.notifier_total_timeout
    }

    #[must_use]
    pub fn relay_base_url(&self) -> &str {
        &self.relay_base_url
    }

    #[must_use]
    pub fn relay_api_token(&self) -> Option<&str> {
        self.relay_api_token.as_deref()
    }

    #[must_use]
    pub fn relay_connect_timeout(&self) -> Duration {
        self.relay_connect_timeout
    }

    #[must_use]
    pub fn relay_total_timeout(&self) -> Duration {
        self.relay_total_timeout
    }

    #[must_use]
    pub fn relay_signing_key(&self) -> &str {
        &self.relay_signing_key
    }

    #[must_use]
    pub fn relay_issuer(&self) -> &str {
        &self.relay_issuer
    }

    #[must_use]
    pub fn callback_base_url(&self) -> &str {
        &self.callback_base_url
    }

    #[must_use]
    pub fn trigger_secret(&self) -> &str {
        &self.trigger_secret
    }

    #[must_use]
    pub fn phase_auth_bypass(&self) -> bool {
        self.phase_auth_bypass
    }

    #[must_use]
    pub fn watches(&self) -> &[Watch] {
        &self.watches
    }

    #[must_use]
    pub fn discover_batch_size(&self) -> NonZeroUsize {
        self.discover_batch_size
    }

    #[must_use]
    pub fn fetch_batch_size(&self) -> NonZeroUsize {
        self.fetch_batch_size
    }

    #[must_use]
    pub fn recency_window_days(&self) -> u32 {
        self.recency_window_days
    }

    #[must_use]
    pub fn min_fetch_size_bytes(&self) -> u64 {
        self.min_fetch_size_bytes
    }

    #[must_use]
    pub fn scrape_delay(&self) -> Duration {
        self.scrape_delay
    }

    #[must_use]
    pub fn stuck_job_timeout(&self) -> Duration {
        self.stuck_job_timeout
    }

    #[must_use]
    pub fn job_retention(&self) -> Duration {
        self.job_retention
    }

    #[must_use]
    pub fn dispatch_max_retries(&self) -> u32 {
        self.dispatch_max_retries
    }

    #[must_use]
    pub fn http_max_retries(&self) -> usize {
        self.http_max_retries
    }

    #[must_use]
    pub fn http_backoff_base_ms(&self) -> u64 {
        self.http_backoff_base_ms
    }

    #[must_use]
    pub fn http_backoff_cap_ms(&self) -> u64 {
        self.http_backoff_cap_ms
    }
}

#[cfg(test)]
impl Config {
    /// A fixed configuration for unit tests: memory backend, unroutable
    /// service URLs, no scrape delay, no outbound retries. Tests override
    /// the parts they exercise through the `with_*` setters.
    pub(crate) fn for_tests() -> Self {
        Self {
            http_bind: "127.0.0.1:0".parse().unwrap(),
            kv_backend: KvBackend::Memory,
            kv_rest_url: None,
            kv_rest_token: None,
            kv_connect_timeout: Duration::from_millis(200),
            kv_total_timeout: Duration::from_millis(500),
            scraper_base_url: "http://127.0.0.1:9".to_string(),
            scraper_service_token: None,
            scraper_connect_timeout: Duration::from_millis(200),
            scraper_total_timeout: Duration::from_millis(2000),
            notifier_base_url: "http://127.0.0.1:9".to_string(),
            notifier_service_token: None,
            notifier_connect_timeout: Duration::from_millis(200),
            notifier_total_timeout: Duration::from_millis(2000),
            relay_base_url: "http://127.0.0.1:9".to_string(),
            relay_api_token: None,
            relay_connect_timeout: Duration::from_millis(200),
            relay_total_timeout: Duration::from_millis(2000),
            relay_signing_key: "test-signing-key".to_string(),
            relay_issuer: "push-relay".to_string(),
            callback_base_url: "http://worker.test".to_string(),
            trigger_secret: "test-trigger-secret".to_string(),
            phase_auth_bypass: false,
            watches: vec![Watch {
                name: "blog".to_string(),
                url: "https://example.com/feed".to_string(),
            }],
            discover_batch_size: NonZeroUsize::new(3).unwrap(),
            fetch_batch_size: NonZeroUsize::new(5).unwrap(),
            recency_window_days: 3,
            min_fetch_size_bytes: 0,
            scrape_delay: Duration::ZERO,
            stuck_job_timeout: Duration::from_secs(600),
            job_retention: Duration::from_secs(3600),
            dispatch_max_retries: 3,
            http_max_retries: 1,
            http_backoff_base_ms: 1,
            http_backoff_cap_ms: 5,
        }
    }

    pub(crate) fn with_scraper_base_url(mut self, url: &str) -> Self {
        self.scraper_base_url = url.to_string();
        self
    }

    pub(crate) fn with_notifier_base_url(mut self, url: &str) -> Self {
        self.notifier_base_url = url.to_string();
        self
    }

    pub(crate) fn with_relay_base_url(mut self, url: &str) -> Self {
        self.relay_base_url = url.to_string();
        self
    }

    pub(crate) fn with_watches(mut self, watches: Vec<Watch>) -> Self {
        self.watches = watches;
        self
    }

    pub(crate) fn with_discover_batch_size(mut self, size: usize) -> Self {
        self.discover_batch_size = NonZeroUsize::new(size).unwrap();
        self
    }

    pub(crate) fn with_fetch_batch_size(mut self, size: usize) -> Self {
        self.fetch_batch_size = NonZeroUsize::new(size).unwrap();
        self
    }

    pub(crate) fn with_min_fetch_size_bytes(mut self, bytes: u64) -> Self {
        self.min_fetch_size_bytes = bytes;
        self
    }

    pub(crate) fn with_stuck_job_timeout(mut self, seconds: u64) -> Self {
        self.stuck_job_timeout = Duration::from_secs(seconds);
        self
    }

    pub(crate) fn with_phase_auth_bypass(mut self, bypass: bool) -> Self {
        self.phase_auth_bypass = bypass;
        self
    }
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_socket_addr(name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());

    raw.parse().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_non_zero_usize(name: &'static str, default: usize) -> Result<NonZeroUsize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let parsed = raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })?;
    NonZeroUsize::new(parsed).ok_or_else(|| ConfigError::Invalid {
        name,
        source: anyhow::anyhow!("must be greater than zero"),
    })
}

fn parse_duration_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_secs)?;
    Ok(Duration::from_secs(value))
}

fn parse_duration_ms(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default_ms.to_string());
    let ms = raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })?;
    Ok(Duration::from_millis(ms))
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u32>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("invalid boolean value: {raw}"),
        }),
    }
}

fn parse_kv_backend(name: &'static str, default: KvBackend) -> Result<KvBackend, ConfigError> {
    let Ok(raw) = env::var(name) else {
        return Ok(default);
    };
    match raw.to_lowercase().as_str() {
        "rest" => Ok(KvBackend::Rest),
        "memory" => Ok(KvBackend::Memory),
        _ => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("expected \"rest\" or \"memory\", got: {raw}"),
        }),
    }
}

/// Parses the `WATCHES` list: comma-separated `name=url` pairs.
fn parse_watches(name: &'static str, raw: &str) -> Result<Vec<Watch>, ConfigError> {
    let mut watches = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((watch_name, url)) = entry.split_once('=') else {
            return Err(ConfigError::Invalid {
                name,
                source: anyhow::anyhow!("watch entry must be name=url, got: {entry}"),
            });
        };
        let watch_name = watch_name.trim();
        let url = url.trim();
        if watch_name.is_empty() || url.is_empty() {
            return Err(ConfigError::Invalid {
                name,
                source: anyhow::anyhow!("watch entry has empty name or url: {entry}"),
            });
        }
        watches.push(Watch {
            name: watch_name.to_string(),
            url: url.to_string(),
        });
    }
    if watches.is_empty() {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("at least one watch must be configured"),
        });
    }
    Ok(watches)
}
