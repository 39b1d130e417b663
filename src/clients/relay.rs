/// Client for the push relay that redelivers phase callbacks.
///
/// The relay accepts a publish request, signs the body, and POSTs it to
/// the given destination with at-least-once semantics. Phase handlers
/// verify that signature before acting.
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    destination: &'a str,
    body: &'a Value,
    retries: u32,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    message_id: String,
}

#[derive(Debug, Clone)]
pub(crate) struct RelayConfig {
    pub(crate) base_url: String,
    pub(crate) token: Option<String>,
    pub(crate) connect_timeout: Duration,
    pub(crate) total_timeout: Duration,
    pub(crate) publish_retries: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct RelayClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
    publish_retries: u32,
}

impl RelayClient {
    /// # Errors
    /// Returns an error when the URL does not parse or the HTTP client
    /// cannot be built.
    pub(crate) fn new(config: RelayConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .build()
            .context("failed to build relay HTTP client")?;

        let base_url = Url::parse(&config.base_url).context("invalid relay base URL")?;

        Ok(Self {
            client,
            base_url,
            token: config.token,
            publish_retries: config.publish_retries,
        })
    }

    /// Hands a callback body to the relay for signed delivery.
    ///
    /// Returns the relay's message id for the accepted publication.
    ///
    /// # Errors
    /// Returns an error when the request fails or the relay refuses the
    /// publication.
    pub(crate) async fn publish(&self, destination: &str, body: &Value) -> Result<String> {
        let url = self
            .base_url
            .join("v1/messages")
            .context("failed to build publish URL")?;

        let request = PublishRequest {
            destination,
            body,
            retries: self.publish_retries,
        };

        let mut builder = self.client.post(url).json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.context("relay publish request failed")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            bail!("relay returned error status {status}: {error_body}");
        }

        let accepted: PublishResponse = response
            .json()
            .await
            .context("failed to deserialize relay publish response")?;
        Ok(accepted.message_id)
    }
}
