use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;

use crate::{
    api,
    api::auth::PhaseAuthenticator,
    clients::notifier::{NotifierClient, NotifierConfig},
    clients::relay::{RelayClient, RelayConfig},
    clients::scraper::{ScraperClient, ScraperConfig},
    config::{Config, KvBackend},
    observability::Telemetry,
    pipeline::Orchestrator,
    store::kv::KvStore,
    store::memory::MemoryKvStore,
    store::rest::{RestKvConfig, RestKvStore},
    util::retry::RetryConfig,
};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

pub struct ComponentRegistry {
    config: Arc<Config>,
    telemetry: Telemetry,
    kv: Arc<dyn KvStore>,
    orchestrator: Orchestrator,
    authenticator: PhaseAuthenticator,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn orchestrator(&self) -> &Orchestrator {
        self.registry.orchestrator()
    }

    pub(crate) fn kv(&self) -> &Arc<dyn KvStore> {
        &self.registry.kv
    }

    pub(crate) fn authenticator(&self) -> &PhaseAuthenticator {
        &self.registry.authenticator
    }
}

impl ComponentRegistry {
    /// Wires every component from the given configuration.
    ///
    /// # Errors
    /// Returns an error when telemetry cannot be installed, the key-value
    /// backend is misconfigured, or an HTTP client cannot be built.
    pub fn build(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let telemetry = Telemetry::new()?;

        let kv: Arc<dyn KvStore> = match config.kv_backend() {
            KvBackend::Rest => {
                let base_url = config
                    .kv_rest_url()
                    .context("KV_REST_URL is required for the rest backend")?;
                Arc::new(RestKvStore::new(RestKvConfig {
                    base_url: base_url.to_string(),
                    token: config.kv_rest_token().map(ToString::to_string),
                    connect_timeout: config.kv_connect_timeout(),
                    total_timeout: config.kv_total_timeout(),
                })?)
            }
            KvBackend::Memory => Arc::new(MemoryKvStore::new()),
        };

        let retry = RetryConfig::new(
            config.http_max_retries(),
            config.http_backoff_base_ms(),
            config.http_backoff_cap_ms(),
        );
        let scraper = Arc::new(ScraperClient::new(ScraperConfig {
            base_url: config.scraper_base_url().to_string(),
            token: config.scraper_service_token().map(ToString::to_string),
            connect_timeout: config.scraper_connect_timeout(),
            total_timeout: config.scraper_total_timeout(),
            retry,
        })?);
        let notifier = Arc::new(NotifierClient::new(NotifierConfig {
            base_url: config.notifier_base_url().to_string(),
            token: config.notifier_service_token().map(ToString::to_string),
            connect_timeout: config.notifier_connect_timeout(),
            total_timeout: config.notifier_total_timeout(),
        })?);
        let relay = Arc::new(RelayClient::new(RelayConfig {
            base_url: config.relay_base_url().to_string(),
            token: config.relay_api_token().map(ToString::to_string),
            connect_timeout: config.relay_connect_timeout(),
            total_timeout: config.relay_total_timeout(),
            publish_retries: config.dispatch_max_retries(),
        })?);

        let orchestrator = Orchestrator::new(
            Arc::clone(&config),
            Arc::clone(&kv),
            scraper,
            notifier,
            relay,
            telemetry.metrics_arc(),
        );
        let authenticator = PhaseAuthenticator::new(&config);

        Ok(Self {
            config,
            telemetry,
            kv,
            orchestrator,
            authenticator,
        })
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    pub(crate) fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

#[must_use]
pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}
