/// Prometheus metric definitions.
use std::sync::Arc;

use prometheus::{
    Counter, Gauge, Histogram, Registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_with_registry,
};

/// Metric collector for the digest pipeline.
#[derive(Debug, Clone)]
pub struct Metrics {
    // Job lifecycle
    pub jobs_started: Counter,
    pub jobs_completed: Counter,
    pub jobs_failed: Counter,
    pub jobs_reaped: Counter,

    // Item flow
    pub items_discovered: Counter,
    pub items_enqueued_for_fetch: Counter,
    pub items_skipped: Counter,
    pub items_fetched: Counter,
    pub fetch_failures: Counter,
    pub watch_listing_failures: Counter,

    // Outbound deliveries
    pub notifications_sent: Counter,
    pub notifications_failed: Counter,
    pub relay_publishes: Counter,
    pub relay_publish_failures: Counter,

    // Callback hygiene
    pub phase_callbacks_ignored: Counter,

    // Durations
    pub discover_batch_duration: Histogram,
    pub fetch_batch_duration: Histogram,
    pub finalize_duration: Histogram,

    // Gauges
    pub active_jobs: Gauge,
}

impl Metrics {
    /// Registers every metric on the given registry.
    ///
    /// # Errors
    /// Returns an error when a metric cannot be registered.
    #[allow(clippy::too_many_lines)]
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            jobs_started: register_counter_with_registry!(
                "digest_jobs_started_total",
                "Total number of digest jobs launched",
                registry
            )?,
            jobs_completed: register_counter_with_registry!(
                "digest_jobs_completed_total",
                "Total number of digest jobs that reached complete",
                registry
            )?,
            jobs_failed: register_counter_with_registry!(
                "digest_jobs_failed_total",
                "Total number of digest jobs that failed",
                registry
            )?,
            jobs_reaped: register_counter_with_registry!(
                "digest_jobs_reaped_total",
                "Total number of stuck jobs force-failed by the reaper",
                registry
            )?,
            items_discovered: register_counter_with_registry!(
                "digest_items_discovered_total",
                "Total number of listing entries inspected",
                registry
            )?,
            items_enqueued_for_fetch: register_counter_with_registry!(
                "digest_items_enqueued_for_fetch_total",
                "Total number of items queued for content fetch",
                registry
            )?,
            items_skipped: register_counter_with_registry!(
                "digest_items_skipped_total",
                "Total number of items recorded without content",
                registry
            )?,
            items_fetched: register_counter_with_registry!(
                "digest_items_fetched_total",
                "Total number of items whose content was fetched",
                registry
            )?,
            fetch_failures: register_counter_with_registry!(
                "digest_fetch_failures_total",
                "Total number of per-item content fetch failures",
                registry
            )?,
            watch_listing_failures: register_counter_with_registry!(
                "digest_watch_listing_failures_total",
                "Total number of watch listings that failed and were skipped",
                registry
            )?,
            notifications_sent: register_counter_with_registry!(
                "digest_notifications_sent_total",
                "Total number of digests delivered to the notifier",
                registry
            )?,
            notifications_failed: register_counter_with_registry!(
                "digest_notifications_failed_total",
                "Total number of digest deliveries that failed",
                registry
            )?,
            relay_publishes: register_counter_with_registry!(
                "digest_relay_publishes_total",
                "Total number of phase callbacks handed to the relay",
                registry
            )?,
            relay_publish_failures: register_counter_with_registry!(
                "digest_relay_publish_failures_total",
                "Total number of relay publications that failed",
                registry
            )?,
            phase_callbacks_ignored: register_counter_with_registry!(
                "digest_phase_callbacks_ignored_total",
                "Total number of callbacks dropped as stale or mismatched",
                registry
            )?,
            discover_batch_duration: register_histogram_with_registry!(
                "digest_discover_batch_duration_seconds",
                "Duration of one discovery batch",
                registry
            )?,
            fetch_batch_duration: register_histogram_with_registry!(
                "digest_fetch_batch_duration_seconds",
                "Duration of one fetch batch",
                registry
            )?,
            finalize_duration: register_histogram_with_registry!(
                "digest_finalize_duration_seconds",
                "Duration of the finalize phase",
                registry
            )?,
            active_jobs: register_gauge_with_registry!(
                "digest_active_jobs",
                "Number of currently active digest jobs",
                registry
            )?,
        })
    }
}
