/// Client for the scraper service that reads remote sources on our behalf.
///
/// Listing calls retry with backoff; content fetches are single-shot and
/// leave failure handling to the caller, which records the error on the
/// item instead of failing the whole batch.
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::warn;

use crate::util::retry::{RetryConfig, is_retryable_error};

/// One entry of a source listing, as the scraper reports it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct ListingEntry {
    #[serde(default)]
    pub(crate) id: Option<String>,
    pub(crate) title: String,
    pub(crate) url: String,
    #[serde(default)]
    pub(crate) author: Option<String>,
    #[serde(default)]
    pub(crate) published_at: Option<String>,
    #[serde(default)]
    pub(crate) size_hint: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ListingResponse {
    entries: Vec<ListingEntry>,
}

#[derive(Debug, Deserialize)]
struct DocumentResponse {
    content: String,
}

#[derive(Debug, Clone)]
pub(crate) struct ScraperConfig {
    pub(crate) base_url: String,
    pub(crate) token: Option<String>,
    pub(crate) connect_timeout: Duration,
    pub(crate) total_timeout: Duration,
    pub(crate) retry: RetryConfig,
}

#[derive(Debug, Clone)]
pub(crate) struct ScraperClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
    retry: RetryConfig,
}

impl ScraperClient {
    /// # Errors
    /// Returns an error when the URL does not parse or the HTTP client
    /// cannot be built.
    pub(crate) fn new(config: ScraperConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .build()
            .context("failed to build scraper HTTP client")?;

        let base_url = Url::parse(&config.base_url).context("invalid scraper base URL")?;

        Ok(Self {
            client,
            base_url,
            token: config.token,
            retry: config.retry,
        })
    }

    /// Lists the items a source currently offers, newest first.
    ///
    /// # Errors
    /// Returns an error when the scraper stays unreachable across all retry
    /// attempts or answers with a non-retryable failure.
    pub(crate) async fn list_source(&self, source_url: &str) -> Result<Vec<ListingEntry>> {
        let mut attempt = 0;

        loop {
            match self.list_once(source_url).await {
                Ok(entries) => return Ok(entries),
                Err(err) => {
                    attempt += 1;

                    if !self.retry.can_retry(attempt) {
                        warn!(
                            attempt,
                            max_attempts = self.retry.max_attempts,
                            source_url,
                            "listing failed after all retries"
                        );
                        return Err(err);
                    }

                    let retryable = err
                        .downcast_ref::<reqwest::Error>()
                        .is_some_and(is_retryable_error);
                    if !retryable {
                        warn!(?err, source_url, "listing error is not retryable");
                        return Err(err);
                    }

                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        source_url,
                        "listing failed, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn list_once(&self, source_url: &str) -> Result<Vec<ListingEntry>> {
        let mut url = self
            .base_url
            .join("v1/listing")
            .context("failed to build listing URL")?;
        url.query_pairs_mut().append_pair("url", source_url);

        let response = self
            .request(url)
            .send()
            .await
            .context("scraper listing request failed")?
            .error_for_status()
            .context("scraper listing returned error status")?;

        let listing: ListingResponse = response
            .json()
            .await
            .context("failed to deserialize scraper listing response")?;
        Ok(listing.entries)
    }

    /// Fetches the full content of one item. Single attempt; callers record
    /// failures on the item rather than aborting the batch.
    ///
    /// # Errors
    /// Returns an error when the request fails or the scraper answers with
    /// an error status.
    pub(crate) async fn fetch_document(&self, item_url: &str) -> Result<String> {
        let mut url = self
            .base_url
            .join("v1/content")
            .context("failed to build content URL")?;
        url.query_pairs_mut().append_pair("url", item_url);

        let response = self
            .request(url)
            .send()
            .await
            .context("scraper content request failed")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            bail!("scraper returned error status {status}: {error_body}");
        }

        let document: DocumentResponse = response
            .json()
            .await
            .context("failed to deserialize scraper content response")?;
        Ok(document.content)
    }

    /// # Errors
    /// Returns an error when the request fails or the scraper reports an
    /// unhealthy status.
    pub(crate) async fn ping(&self) -> Result<()> {
        let url = self
            .base_url
            .join("v1/health")
            .context("failed to build health URL")?;

        self.request(url)
            .send()
            .await
            .context("scraper health request failed")?
            .error_for_status()
            .context("scraper health endpoint returned error status")?;

        Ok(())
    }

    fn request(&self, url: Url) -> reqwest::RequestBuilder {
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request
    }
}
