/// Client for the notification service that delivers the digest.
///
/// A digest is sent at most once per run, so there is deliberately no
/// retry loop here; a failed send is recorded on the job and the run
/// still completes.
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::Serialize;
use uuid::Uuid;

const ERROR_BODY_LIMIT: usize = 256;

/// One item inside a digest group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct DigestEntry {
    pub(crate) title: String,
    pub(crate) url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) excerpt: Option<String>,
    pub(crate) fetched: bool,
}

/// All items of one watched source, in the order they were discovered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct DigestGroup {
    pub(crate) name: String,
    pub(crate) entries: Vec<DigestEntry>,
}

#[derive(Debug, Serialize)]
struct DigestRequest<'a> {
    run_id: Uuid,
    generated_at: DateTime<Utc>,
    item_count: usize,
    groups: &'a [DigestGroup],
}

#[derive(Debug, Clone)]
pub(crate) struct NotifierConfig {
    pub(crate) base_url: String,
    pub(crate) token: Option<String>,
    pub(crate) connect_timeout: Duration,
    pub(crate) total_timeout: Duration,
}

#[derive(Debug, Clone)]
pub(crate) struct NotifierClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl NotifierClient {
    /// # Errors
    /// Returns an error when the URL does not parse or the HTTP client
    /// cannot be built.
    pub(crate) fn new(config: NotifierConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .build()
            .context("failed to build notifier HTTP client")?;

        let base_url = Url::parse(&config.base_url).context("invalid notifier base URL")?;

        Ok(Self {
            client,
            base_url,
            token: config.token,
        })
    }

    /// Sends one aggregated digest for a run.
    ///
    /// # Errors
    /// Returns an error when the request fails or the notifier answers with
    /// an error status.
    pub(crate) async fn send_digest(
        &self,
        run_id: Uuid,
        generated_at: DateTime<Utc>,
        groups: &[DigestGroup],
    ) -> Result<()> {
        let url = self
            .base_url
            .join("v1/notifications")
            .context("failed to build notifications URL")?;

        let item_count = groups.iter().map(|group| group.entries.len()).sum();
        let request = DigestRequest {
            run_id,
            generated_at,
            item_count,
            groups,
        };

        let mut builder = self.client.post(url).json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .context("notifier digest request failed")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            bail!(
                "notifier returned error status {status}: {}",
                truncate_error(&error_body)
            );
        }

        Ok(())
    }

    /// # Errors
    /// Returns an error when the request fails or the notifier reports an
    /// unhealthy status.
    pub(crate) async fn ping(&self) -> Result<()> {
        let url = self
            .base_url
            .join("v1/health")
            .context("failed to build health URL")?;

        let mut builder = self.client.get(url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        builder
            .send()
            .await
            .context("notifier health request failed")?
            .error_for_status()
            .context("notifier health endpoint returned error status")?;

        Ok(())
    }
}

// Upstream error pages can be whole HTML documents; keep the log readable.
fn truncate_error(body: &str) -> &str {
    match body.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((offset, _)) => &body[..offset],
        None => body,
    }
}
