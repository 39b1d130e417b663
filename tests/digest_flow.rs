//! End-to-end runs against the real router: wiremock stands in for the
//! scraper, notifier and push relay, and the test plays the relay's role of
//! re-invoking phase callbacks until the job settles.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use digest_worker::app::{ComponentRegistry, build_router};
use digest_worker::config::Config;

const WATCH_URL: &str = "https://blog.example.com/feed";

struct Services {
    scraper: MockServer,
    notifier: MockServer,
    relay: MockServer,
}

async fn services() -> Services {
    let scraper = MockServer::start().await;
    let notifier = MockServer::start().await;
    let relay = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message_id": "m-0"})))
        .mount(&relay)
        .await;
    Services {
        scraper,
        notifier,
        relay,
    }
}

fn worker_app(services: &Services, overrides: &[(&str, &str)]) -> Router {
    let mut vars: Vec<(&str, Option<String>)> = vec![
        ("DIGEST_WORKER_HTTP_BIND", Some("127.0.0.1:0".into())),
        ("KV_BACKEND", Some("memory".into())),
        ("KV_REST_URL", None),
        ("SCRAPER_BASE_URL", Some(services.scraper.uri())),
        ("SCRAPER_CONNECT_TIMEOUT_MS", Some("200".into())),
        ("SCRAPER_TOTAL_TIMEOUT_MS", Some("2000".into())),
        ("NOTIFIER_BASE_URL", Some(services.notifier.uri())),
        ("NOTIFIER_CONNECT_TIMEOUT_MS", Some("200".into())),
        ("NOTIFIER_TOTAL_TIMEOUT_MS", Some("2000".into())),
        ("RELAY_BASE_URL", Some(services.relay.uri())),
        ("RELAY_CONNECT_TIMEOUT_MS", Some("200".into())),
        ("RELAY_TOTAL_TIMEOUT_MS", Some("2000".into())),
        ("RELAY_SIGNING_KEY", Some("itest-signing-key".into())),
        ("CALLBACK_BASE_URL", Some("http://worker.itest".into())),
        ("TRIGGER_SECRET", Some("itest-trigger".into())),
        ("PHASE_AUTH_BYPASS", Some("true".into())),
        ("WATCHES", Some(format!("blog={WATCH_URL}"))),
        ("DISCOVER_BATCH_SIZE", Some("2".into())),
        ("FETCH_BATCH_SIZE", Some("1".into())),
        ("RECENCY_WINDOW_DAYS", Some("3".into())),
        ("MIN_FETCH_SIZE_BYTES", Some("1000".into())),
        ("SCRAPE_DELAY_MS", Some("0".into())),
        ("STUCK_JOB_TIMEOUT_SECS", Some("600".into())),
        ("JOB_RETENTION_SECS", Some("3600".into())),
        ("DISPATCH_MAX_RETRIES", Some("1".into())),
        ("HTTP_MAX_RETRIES", Some("1".into())),
        ("HTTP_BACKOFF_BASE_MS", Some("1".into())),
        ("HTTP_BACKOFF_CAP_MS", Some("2".into())),
    ];
    for (key, value) in overrides {
        if let Some(entry) = vars.iter_mut().find(|entry| entry.0 == *key) {
            entry.1 = Some((*value).to_string());
        } else {
            vars.push((*key, Some((*value).to_string())));
        }
    }
    let config = temp_env::with_vars(vars, || {
        Config::from_env().expect("worker config should parse")
    });
    let registry = ComponentRegistry::build(config).expect("registry should build");
    build_router(registry)
}

async fn mount_listing(services: &Services, watch_url: &str, entries: Value) {
    Mock::given(method("GET"))
        .and(path("/v1/listing"))
        .and(query_param("url", watch_url))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "entries": entries })))
        .mount(&services.scraper)
        .await;
}

async fn mount_content(services: &Services, item_url: &str, content: &str) {
    Mock::given(method("GET"))
        .and(path("/v1/content"))
        .and(query_param("url", item_url))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "content": content })))
        .mount(&services.scraper)
        .await;
}

async fn mount_notifier(services: &Services, status: u16) {
    Mock::given(method("POST"))
        .and(path("/v1/notifications"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&services.notifier)
        .await;
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    serde_json::from_slice(&bytes).expect("valid json")
}

async fn trigger(app: &Router) -> Value {
    let response = app
        .clone()
        .oneshot(
            Request::get("/v1/digest/trigger?token=itest-trigger")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    body_json(response).await
}

async fn status(app: &Router) -> Value {
    let response = app
        .clone()
        .oneshot(
            Request::get("/v1/digest/status")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

async fn post_phase(app: &Router, phase: &str, job_id: &str, batch_index: u32) -> Value {
    let body = serde_json::to_vec(&json!({"job_id": job_id, "batch_index": batch_index}))
        .expect("callback serializes");
    let response = app
        .clone()
        .oneshot(
            Request::post(format!("/v1/phase/{phase}"))
                .header("content-type", "application/json")
                .body(Body::from(body))
                .expect("request builds"),
        )
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), StatusCode::OK, "phase {phase}");
    body_json(response).await
}

/// Plays the relay: reads the job status and posts the matching phase
/// callback until the job reaches a terminal state.
async fn drive_to_terminal(app: &Router, job_id: &str) -> Value {
    for round in 0..32_u32 {
        let snapshot = status(app).await;
        match snapshot["status"].as_str().expect("status string") {
            "complete" | "failed" => return snapshot,
            "discovering" => post_phase(app, "discover", job_id, round).await,
            "fetching" => post_phase(app, "fetch", job_id, round).await,
            "finalizing" => post_phase(app, "finalize", job_id, round).await,
            other => panic!("unexpected job status {other}"),
        };
    }
    panic!("job never settled");
}

fn today() -> String {
    Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

#[tokio::test]
async fn full_run_delivers_one_digest_and_completes() {
    let services = services().await;
    let published = today();
    mount_listing(
        &services,
        WATCH_URL,
        json!([
            {"title": "Alpha post", "url": "https://blog.example.com/alpha",
             "published_at": published, "size_hint": 4096},
            {"title": "Beta post", "url": "https://blog.example.com/beta",
             "published_at": published, "size_hint": 4096},
            {"title": "Undated post", "url": "https://blog.example.com/undated",
             "size_hint": 4096},
            {"title": "Tiny note", "url": "https://blog.example.com/tiny",
             "published_at": published, "size_hint": 10},
        ]),
    )
    .await;
    mount_content(&services, "https://blog.example.com/alpha", "Alpha body text.").await;
    mount_content(&services, "https://blog.example.com/beta", "Beta body text.").await;
    mount_notifier(&services, 202).await;

    let app = worker_app(&services, &[]);
    let started = trigger(&app).await;
    let job_id = started["job_id"].as_str().expect("job id").to_string();

    let settled = drive_to_terminal(&app, &job_id).await;
    assert_eq!(settled["status"], "complete");
    assert_eq!(settled["job_id"], job_id);
    assert_eq!(settled["total_new_items"], 3);
    assert_eq!(settled["fetch_targets_total"], 2);
    assert_eq!(settled["fetch_targets_complete"], 2);
    assert_eq!(settled["notification_sent"], true);
    assert_eq!(settled["ledger_size"], 3);
    assert!(settled.get("error").is_none());

    // One digest, covering fetched and skipped items alike.
    let notifications = services.notifier.received_requests().await.expect("recorded");
    assert_eq!(notifications.len(), 1);
    let digest: Value = serde_json::from_slice(&notifications[0].body).expect("digest json");
    assert_eq!(digest["run_id"], job_id);
    assert_eq!(digest["item_count"], 3);
    assert_eq!(digest["groups"][0]["name"], "blog");
    let entries = digest["groups"][0]["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 3);
    let tiny = entries
        .iter()
        .find(|entry| entry["title"] == "Tiny note")
        .expect("skipped item still appears");
    assert_eq!(tiny["fetched"], false);
    assert!(tiny.get("excerpt").is_none());
    let alpha = entries
        .iter()
        .find(|entry| entry["title"] == "Alpha post")
        .expect("fetched item appears");
    assert_eq!(alpha["fetched"], true);
    assert_eq!(alpha["excerpt"], "Alpha body text.");

    // Callback per batch: discover once, one fetch per item, finalize once.
    let publishes = services.relay.received_requests().await.expect("recorded");
    let destinations: Vec<String> = publishes
        .iter()
        .map(|request| {
            let body: Value = serde_json::from_slice(&request.body).expect("publish json");
            body["destination"].as_str().expect("destination").to_string()
        })
        .collect();
    assert_eq!(
        destinations,
        vec![
            "http://worker.itest/v1/phase/discover".to_string(),
            "http://worker.itest/v1/phase/fetch".to_string(),
            "http://worker.itest/v1/phase/fetch".to_string(),
            "http://worker.itest/v1/phase/finalize".to_string(),
        ]
    );
}

#[tokio::test]
async fn every_discovery_batch_gets_its_own_invocation() {
    let services = services().await;
    let published = today();
    let news_url = "https://news.example.com/feed";
    mount_listing(
        &services,
        WATCH_URL,
        json!([
            {"title": "Alpha post", "url": "https://blog.example.com/alpha",
             "published_at": published, "size_hint": 4096},
        ]),
    )
    .await;
    mount_listing(
        &services,
        news_url,
        json!([
            {"title": "News brief", "url": "https://news.example.com/brief",
             "published_at": published, "size_hint": 10},
        ]),
    )
    .await;
    mount_content(&services, "https://blog.example.com/alpha", "Alpha body text.").await;
    mount_notifier(&services, 202).await;

    // Two watches, one per batch: discovery must be re-invoked once.
    let app = worker_app(
        &services,
        &[
            ("DISCOVER_BATCH_SIZE", "1"),
            ("WATCHES", &format!("blog={WATCH_URL},news={news_url}")),
        ],
    );
    let started = trigger(&app).await;
    let job_id = started["job_id"].as_str().expect("job id").to_string();

    let settled = drive_to_terminal(&app, &job_id).await;
    assert_eq!(settled["status"], "complete");
    assert_eq!(settled["discovery_targets_total"], 2);
    assert_eq!(settled["discovery_targets_complete"], 2);
    assert_eq!(settled["total_new_items"], 2);
    assert_eq!(settled["fetch_targets_total"], 1);
    assert_eq!(settled["ledger_size"], 2);

    let notifications = services.notifier.received_requests().await.expect("recorded");
    assert_eq!(notifications.len(), 1);
    let digest: Value = serde_json::from_slice(&notifications[0].body).expect("digest json");
    assert_eq!(digest["item_count"], 2);
    assert_eq!(digest["groups"][0]["name"], "blog");
    assert_eq!(digest["groups"][0]["entries"][0]["fetched"], true);
    assert_eq!(digest["groups"][1]["name"], "news");
    assert_eq!(digest["groups"][1]["entries"][0]["fetched"], false);

    let publishes = services.relay.received_requests().await.expect("recorded");
    let destinations: Vec<String> = publishes
        .iter()
        .map(|request| {
            let body: Value = serde_json::from_slice(&request.body).expect("publish json");
            body["destination"].as_str().expect("destination").to_string()
        })
        .collect();
    assert_eq!(
        destinations,
        vec![
            "http://worker.itest/v1/phase/discover".to_string(),
            "http://worker.itest/v1/phase/discover".to_string(),
            "http://worker.itest/v1/phase/fetch".to_string(),
            "http://worker.itest/v1/phase/finalize".to_string(),
        ]
    );
}

#[tokio::test]
async fn already_digested_items_never_reappear() {
    let services = services().await;
    let published = today();
    mount_listing(
        &services,
        WATCH_URL,
        json!([
            {"title": "Alpha post", "url": "https://blog.example.com/alpha",
             "published_at": published, "size_hint": 4096},
        ]),
    )
    .await;
    mount_content(&services, "https://blog.example.com/alpha", "Alpha body text.").await;
    mount_notifier(&services, 202).await;

    let app = worker_app(&services, &[]);

    let first = trigger(&app).await;
    let first_id = first["job_id"].as_str().expect("job id").to_string();
    let settled = drive_to_terminal(&app, &first_id).await;
    assert_eq!(settled["status"], "complete");
    assert_eq!(settled["total_new_items"], 1);

    // Same listing again: everything is in the ledger now.
    let second = trigger(&app).await;
    let second_id = second["job_id"].as_str().expect("job id").to_string();
    assert_ne!(second_id, first_id);
    let settled = drive_to_terminal(&app, &second_id).await;
    assert_eq!(settled["status"], "complete");
    assert_eq!(settled["total_new_items"], 0);
    assert_eq!(settled["notification_sent"], false);
    assert_eq!(settled["ledger_size"], 1);

    let notifications = services.notifier.received_requests().await.expect("recorded");
    assert_eq!(notifications.len(), 1, "empty run sends nothing");
}

#[tokio::test]
async fn digest_delivery_failure_still_completes_the_run() {
    let services = services().await;
    let published = today();
    mount_listing(
        &services,
        WATCH_URL,
        json!([
            {"title": "Alpha post", "url": "https://blog.example.com/alpha",
             "published_at": published, "size_hint": 4096},
        ]),
    )
    .await;
    mount_content(&services, "https://blog.example.com/alpha", "Alpha body text.").await;
    mount_notifier(&services, 500).await;

    let app = worker_app(&services, &[]);
    let started = trigger(&app).await;
    let job_id = started["job_id"].as_str().expect("job id").to_string();

    let settled = drive_to_terminal(&app, &job_id).await;
    assert_eq!(settled["status"], "complete");
    assert_eq!(settled["notification_sent"], false);
    assert!(settled.get("error").is_none());
    // The item had its one digest chance; it stays recorded.
    assert_eq!(settled["ledger_size"], 1);
}

#[tokio::test]
async fn listing_outage_skips_the_watch_and_the_run_completes() {
    let services = services().await;
    Mock::given(method("GET"))
        .and(path("/v1/listing"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&services.scraper)
        .await;

    let app = worker_app(&services, &[]);
    let started = trigger(&app).await;
    let job_id = started["job_id"].as_str().expect("job id").to_string();

    let reply = post_phase(&app, "discover", &job_id, 0).await;
    assert_eq!(reply["outcome"], "processed");
    let reply = post_phase(&app, "finalize", &job_id, 0).await;
    assert_eq!(reply["outcome"], "processed");

    // The unreachable watch sat the run out; nothing new, nothing notified.
    let settled = status(&app).await;
    assert_eq!(settled["status"], "complete");
    assert_eq!(settled["discovery_targets_complete"], 1);
    assert_eq!(settled["total_new_items"], 0);
    assert_eq!(settled["notification_sent"], false);
    assert!(settled.get("error").is_none());

    let notified = services
        .notifier
        .received_requests()
        .await
        .expect("recorded");
    assert!(notified.is_empty());

    let publishes = services.relay.received_requests().await.expect("recorded");
    assert_eq!(publishes.len(), 2);
}

#[tokio::test]
async fn relay_outage_mid_run_fails_the_job() {
    let scraper = MockServer::start().await;
    let notifier = MockServer::start().await;
    let relay = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message_id": "m-0"})))
        .up_to_n_times(1)
        .mount(&relay)
        .await;
    let services = Services {
        scraper,
        notifier,
        relay,
    };
    mount_listing(
        &services,
        WATCH_URL,
        json!([
            {"id": "a1", "title": "Alpha", "url": "https://blog.example.com/a1",
             "published_at": today(), "size_hint": 4096}
        ]),
    )
    .await;

    let app = worker_app(&services, &[]);
    let started = trigger(&app).await;
    let job_id = started["job_id"].as_str().expect("job id").to_string();

    // The discover batch itself succeeds, but handing the fetch callback to
    // the relay cannot, so the job fails while still answering 200.
    let reply = post_phase(&app, "discover", &job_id, 0).await;
    assert_eq!(reply["outcome"], "failed");

    let settled = status(&app).await;
    assert_eq!(settled["status"], "failed");
    assert!(
        settled["error"]
            .as_str()
            .is_some_and(|error| error.contains("fetch"))
    );

    // Exactly the trigger publish and the refused one; nothing was retried
    // against a dead relay and the failed callback was not handed back.
    let publishes = services.relay.received_requests().await.expect("recorded");
    assert_eq!(publishes.len(), 2);
}

#[tokio::test]
async fn stuck_job_is_reaped_on_the_next_trigger() {
    let services = services().await;
    let app = worker_app(&services, &[("STUCK_JOB_TIMEOUT_SECS", "0")]);

    let first = trigger(&app).await;
    let first_id = first["job_id"].as_str().expect("job id").to_string();

    // With a zero stuck-job timeout any heartbeat is already too old.
    tokio::time::sleep(std::time::Duration::from_millis(25)).await;

    let second = trigger(&app).await;
    let second_id = second["job_id"].as_str().expect("job id").to_string();
    assert_ne!(second_id, first_id);

    let snapshot = status(&app).await;
    assert_eq!(snapshot["job_id"], second_id);
    assert_eq!(snapshot["status"], "discovering");
}
