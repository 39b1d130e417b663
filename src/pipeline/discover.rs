//! Discovery phase: listing watched sources and deciding what is new.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::clients::scraper::ListingEntry;
use crate::config::Watch;
use crate::store::models::{Item, ItemStatus, JOB_SCHEMA_VERSION, Job, JobStatus};
use crate::util::ident::stable_item_id;
use crate::util::time::{is_within_window, parse_published_date};

use super::{Orchestrator, Phase, metric_count};

/// Works through one batch of the discovery queue.
///
/// Every watch in the batch is listed; entries are dropped when the
/// listing repeats them, when they carry no usable date, when they fall
/// outside the recency window, or when the ledger has seen them before.
/// Surviving entries become recorded items, and those above the size
/// floor are queued for content fetch. A watch whose listing fails is
/// logged and sat out; it never fails the batch.
pub(crate) struct DiscoverPhase<'a> {
    orchestrator: &'a Orchestrator,
}

impl<'a> DiscoverPhase<'a> {
    pub(crate) fn new(orchestrator: &'a Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub(crate) async fn run(&self, job: &mut Job) -> Result<()> {
        let o = self.orchestrator;
        let batch = o
            .jobs
            .dequeue_discovery(job.id, o.config.discover_batch_size().get())
            .await?;
        let today = Utc::now().date_naive();

        for (index, watch) in batch.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(o.config.scrape_delay()).await;
            }
            self.process_watch(job, watch, today).await?;
            job.discovery_targets_complete += 1;
        }

        // Emptiness is decided after the dequeue: another invocation may
        // have drained the queue between callbacks.
        let remaining = o.jobs.discovery_queue_len(job.id).await?;
        if remaining > 0 {
            job.touch(Utc::now());
            o.jobs.save_job(job).await?;
            o.dispatch(Phase::Discover, job.id, job.discovery_targets_complete)
                .await?;
            return Ok(());
        }

        let fetch_backlog = o.jobs.fetch_queue_len(job.id).await?;
        if fetch_backlog == 0 {
            info!(job_id = %job.id, "no fetch targets, going straight to finalize");
            o.jobs
                .transition(job, JobStatus::Finalizing, Utc::now())
                .await?;
            o.dispatch(Phase::Finalize, job.id, 0).await?;
        } else {
            job.fetch_targets_total = u32::try_from(fetch_backlog).unwrap_or(u32::MAX);
            o.jobs
                .transition(job, JobStatus::Fetching, Utc::now())
                .await?;
            o.dispatch(Phase::Fetch, job.id, 0).await?;
        }
        Ok(())
    }

    async fn process_watch(&self, job: &mut Job, watch: &Watch, today: NaiveDate) -> Result<()> {
        let o = self.orchestrator;
        // A watch whose listing is down sits out this run; the rest of the
        // batch still gets discovered.
        let entries = match o.scraper.list_source(&watch.url).await {
            Ok(entries) => entries,
            Err(error) => {
                o.metrics.watch_listing_failures.inc();
                warn!(
                    job_id = %job.id,
                    watch = %watch.name,
                    error = ?error,
                    "watch listing failed, skipped for this run"
                );
                return Ok(());
            }
        };
        o.metrics.items_discovered.inc_by(metric_count(entries.len()));

        let mut seen_in_listing = HashSet::new();
        let mut fetch_targets = Vec::new();
        let mut recorded = 0_usize;
        let mut skipped = 0_usize;

        for entry in entries {
            let item_id = entry
                .id
                .clone()
                .unwrap_or_else(|| stable_item_id(&entry.url));
            if !seen_in_listing.insert(item_id.clone()) {
                continue;
            }

            // Undated entries cannot be placed inside the window, so they
            // are dropped rather than digested on a guess.
            let Some(published) = entry.published_at.as_deref().and_then(parse_published_date)
            else {
                debug!(watch = %watch.name, url = %entry.url, "entry without usable date dropped");
                continue;
            };
            if !is_within_window(published, today, o.config.recency_window_days()) {
                continue;
            }
            if o.ledger.contains(&item_id).await? {
                continue;
            }

            let wants_fetch = entry
                .size_hint
                .is_none_or(|hint| hint >= o.config.min_fetch_size_bytes());
            let item = build_item(item_id.clone(), &entry, published, watch, wants_fetch);
            o.jobs.save_item(job.id, &item).await?;
            job.total_new_items += 1;
            recorded += 1;

            if wants_fetch {
                fetch_targets.push(item_id);
            } else {
                skipped += 1;
            }
        }

        o.jobs.enqueue_fetch(job.id, &fetch_targets).await?;
        o.metrics
            .items_enqueued_for_fetch
            .inc_by(metric_count(fetch_targets.len()));
        o.metrics.items_skipped.inc_by(metric_count(skipped));

        info!(
            job_id = %job.id,
            watch = %watch.name,
            recorded,
            queued_for_fetch = fetch_targets.len(),
            skipped,
            "watch listed"
        );
        Ok(())
    }
}

fn build_item(
    id: String,
    entry: &ListingEntry,
    published: NaiveDate,
    watch: &Watch,
    wants_fetch: bool,
) -> Item {
    Item {
        id,
        title: entry.title.clone(),
        source_url: entry.url.clone(),
        author: entry.author.clone(),
        published_at: Some(published),
        size_hint: entry.size_hint,
        group_key: watch.name.clone(),
        status: if wants_fetch {
            ItemStatus::Pending
        } else {
            ItemStatus::Skipped
        },
        content: None,
        fetch_error: None,
        schema_version: JOB_SCHEMA_VERSION,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Days;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::config::Config;
    use crate::pipeline::testkit::registry;
    use crate::pipeline::{Phase, PhaseOutcome};
    use crate::store::models::JobStatus;

    use super::*;

    fn days_ago(days: u64) -> String {
        let date = Utc::now()
            .date_naive()
            .checked_sub_days(Days::new(days))
            .unwrap();
        date.format("%Y-%m-%d").to_string()
    }

    async fn relay_accepting(relay: &MockServer, phase_path: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({
                "destination": format!("http://worker.test{phase_path}")
            })))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"message_id": "m-1"})),
            )
            .expect(1)
            .mount(relay)
            .await;
    }

    async fn seeded_job(orchestrator: &Orchestrator, watches: &[Watch]) -> Job {
        let job = Job::new(Uuid::now_v7(), Utc::now(), u32::try_from(watches.len()).unwrap());
        orchestrator.jobs().save_job(&job).await.unwrap();
        orchestrator
            .jobs()
            .enqueue_discovery(job.id, watches)
            .await
            .unwrap();
        job
    }

    #[tokio::test]
    async fn records_fresh_items_and_advances_to_fetching() {
        let scraper = MockServer::start().await;
        let relay = MockServer::start().await;
        relay_accepting(&relay, "/v1/phase/fetch").await;

        let listing = json!({"entries": [
            {"id": "big", "title": "Big", "url": "https://example.com/big",
             "published_at": days_ago(1), "size_hint": 4096},
            {"id": "small", "title": "Small", "url": "https://example.com/small",
             "published_at": days_ago(1), "size_hint": 16},
            {"id": "old", "title": "Old", "url": "https://example.com/old",
             "published_at": days_ago(30), "size_hint": 4096},
        ]});
        Mock::given(method("GET"))
            .and(path("/v1/listing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing))
            .mount(&scraper)
            .await;

        let watches = vec![Watch {
            name: "blog".to_string(),
            url: "https://example.com/feed".to_string(),
        }];
        let config = Config::for_tests()
            .with_scraper_base_url(&scraper.uri())
            .with_relay_base_url(&relay.uri())
            .with_min_fetch_size_bytes(1024)
            .with_watches(watches.clone());
        let registry = registry(config);
        let orchestrator = registry.orchestrator();

        let job = seeded_job(orchestrator, &watches).await;
        let outcome = orchestrator.run_phase(Phase::Discover, job.id).await.unwrap();
        assert_eq!(outcome, PhaseOutcome::Processed);

        let stored = orchestrator.jobs().load_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Fetching);
        assert_eq!(stored.discovery_targets_complete, 1);
        assert_eq!(stored.fetch_targets_total, 1);
        assert_eq!(stored.total_new_items, 2);

        let items = orchestrator.jobs().load_items(job.id).await.unwrap();
        assert_eq!(items.len(), 2);
        let big = items.iter().find(|item| item.id == "big").unwrap();
        assert_eq!(big.status, ItemStatus::Pending);
        assert_eq!(big.group_key, "blog");
        let small = items.iter().find(|item| item.id == "small").unwrap();
        assert_eq!(small.status, ItemStatus::Skipped);

        assert_eq!(orchestrator.jobs().fetch_queue_len(job.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn requeues_itself_while_watches_remain() {
        let scraper = MockServer::start().await;
        let relay = MockServer::start().await;
        relay_accepting(&relay, "/v1/phase/discover").await;

        Mock::given(method("GET"))
            .and(path("/v1/listing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"entries": []})))
            .mount(&scraper)
            .await;

        let watches = vec![
            Watch {
                name: "blog".to_string(),
                url: "https://example.com/blog".to_string(),
            },
            Watch {
                name: "news".to_string(),
                url: "https://example.com/news".to_string(),
            },
        ];
        let config = Config::for_tests()
            .with_scraper_base_url(&scraper.uri())
            .with_relay_base_url(&relay.uri())
            .with_discover_batch_size(1)
            .with_watches(watches.clone());
        let registry = registry(config);
        let orchestrator = registry.orchestrator();

        let job = seeded_job(orchestrator, &watches).await;
        let outcome = orchestrator.run_phase(Phase::Discover, job.id).await.unwrap();
        assert_eq!(outcome, PhaseOutcome::Processed);

        let stored = orchestrator.jobs().load_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Discovering);
        assert_eq!(stored.discovery_targets_complete, 1);
        assert_eq!(
            orchestrator
                .jobs()
                .discovery_queue_len(job.id)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn ledger_hits_leave_nothing_to_fetch() {
        let scraper = MockServer::start().await;
        let relay = MockServer::start().await;
        relay_accepting(&relay, "/v1/phase/finalize").await;

        let listing = json!({"entries": [
            {"id": "seen-before", "title": "Seen", "url": "https://example.com/seen",
             "published_at": days_ago(1), "size_hint": 4096},
        ]});
        Mock::given(method("GET"))
            .and(path("/v1/listing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing))
            .mount(&scraper)
            .await;

        let watches = vec![Watch {
            name: "blog".to_string(),
            url: "https://example.com/feed".to_string(),
        }];
        let config = Config::for_tests()
            .with_scraper_base_url(&scraper.uri())
            .with_relay_base_url(&relay.uri())
            .with_watches(watches.clone());
        let registry = registry(config);
        let orchestrator = registry.orchestrator();
        orchestrator
            .ledger()
            .record(&["seen-before".to_string()])
            .await
            .unwrap();

        let job = seeded_job(orchestrator, &watches).await;
        let outcome = orchestrator.run_phase(Phase::Discover, job.id).await.unwrap();
        assert_eq!(outcome, PhaseOutcome::Processed);

        let stored = orchestrator.jobs().load_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Finalizing);
        assert_eq!(stored.total_new_items, 0);
        assert!(orchestrator.jobs().load_items(job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_and_undated_entries_collapse() {
        let scraper = MockServer::start().await;
        let relay = MockServer::start().await;
        relay_accepting(&relay, "/v1/phase/fetch").await;

        let listing = json!({"entries": [
            {"id": "twice", "title": "First copy", "url": "https://example.com/a",
             "published_at": days_ago(0), "size_hint": 4096},
            {"id": "twice", "title": "Second copy", "url": "https://example.com/a",
             "published_at": days_ago(0), "size_hint": 4096},
            {"title": "No date", "url": "https://example.com/undated", "size_hint": 4096},
        ]});
        Mock::given(method("GET"))
            .and(path("/v1/listing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing))
            .mount(&scraper)
            .await;

        let watches = vec![Watch {
            name: "blog".to_string(),
            url: "https://example.com/feed".to_string(),
        }];
        let config = Config::for_tests()
            .with_scraper_base_url(&scraper.uri())
            .with_relay_base_url(&relay.uri())
            .with_watches(watches.clone());
        let registry = registry(config);
        let orchestrator = registry.orchestrator();

        let job = seeded_job(orchestrator, &watches).await;
        orchestrator.run_phase(Phase::Discover, job.id).await.unwrap();

        let items = orchestrator.jobs().load_items(job.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "twice");
        assert_eq!(items[0].title, "First copy");
    }

    #[tokio::test]
    async fn failing_listing_sits_out_while_the_batch_continues() {
        let scraper = MockServer::start().await;
        let relay = MockServer::start().await;
        relay_accepting(&relay, "/v1/phase/fetch").await;

        Mock::given(method("GET"))
            .and(path("/v1/listing"))
            .and(query_param("url", "https://example.com/down"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&scraper)
            .await;
        let listing = json!({"entries": [
            {"id": "alive", "title": "Alive", "url": "https://example.com/alive",
             "published_at": days_ago(1), "size_hint": 4096},
        ]});
        Mock::given(method("GET"))
            .and(path("/v1/listing"))
            .and(query_param("url", "https://example.com/up"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing))
            .mount(&scraper)
            .await;

        let watches = vec![
            Watch {
                name: "down".to_string(),
                url: "https://example.com/down".to_string(),
            },
            Watch {
                name: "up".to_string(),
                url: "https://example.com/up".to_string(),
            },
        ];
        let config = Config::for_tests()
            .with_scraper_base_url(&scraper.uri())
            .with_relay_base_url(&relay.uri())
            .with_discover_batch_size(2)
            .with_watches(watches.clone());
        let registry = registry(config);
        let orchestrator = registry.orchestrator();

        let job = seeded_job(orchestrator, &watches).await;
        let outcome = orchestrator.run_phase(Phase::Discover, job.id).await.unwrap();
        assert_eq!(outcome, PhaseOutcome::Processed);

        let stored = orchestrator.jobs().load_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Fetching);
        assert_eq!(stored.discovery_targets_complete, 2);
        assert_eq!(stored.total_new_items, 1);
        assert_eq!(stored.fetch_targets_total, 1);
        assert!(stored.error.is_none());

        let items = orchestrator.jobs().load_items(job.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].group_key, "up");
    }
}
