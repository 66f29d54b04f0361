//! Integration tests for the delivery pipeline

use beacon_telemetry::{
    load_telemetry_config, FlushOutcome, LifecycleEvent, OfflineStore, TelemetryClient,
    TelemetryConfig, TelemetryError,
};
use serde_json::{json, Map, Value};
use serial_test::serial;
use std::env;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(endpoint: String, storage: Option<&TempDir>) -> TelemetryConfig {
    TelemetryConfig {
        endpoint,
        api_key: "itest-key".to_string(),
        // Keep the timer and threshold out of the way unless a test
        // exercises them explicitly.
        auto_flush_threshold: 1000,
        flush_interval_secs: 3600,
        max_retries: 0,
        initial_backoff_ms: 1,
        backoff_cap_ms: 10,
        offline_storage: storage.is_some(),
        storage_dir: storage.map(|d| d.path().join("outbox")),
        anonymous_id: false,
        ..TelemetryConfig::default()
    }
}

fn props(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

async fn wait_until_sent(client: &TelemetryClient, n: u64) {
    for _ in 0..200 {
        if client.health().await.events_sent >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {n} events to be sent");
}

#[tokio::test]
async fn test_tracked_events_arrive_as_one_ordered_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/events"))
        .and(header("X-Api-Key", "itest-key"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = TelemetryClient::new(config_for(format!("{}/v1/events", server.uri()), None))
        .await
        .unwrap();

    client.track("alpha", props(&[("step", json!(1))]), None);
    client.track("beta", Map::new(), Some("user-9".to_string()));
    client.track("gamma", Map::new(), None);

    let outcome = client.flush().await.unwrap();
    assert_eq!(outcome.sent, 3);
    assert_eq!(outcome.failed, 0);
    assert_eq!(client.health().await.queue_size, 0);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: Vec<Value> = requests[0].body_json().unwrap();
    assert_eq!(body.len(), 3);

    // Batch preserves insertion order.
    assert_eq!(body[0]["EventName"], json!("alpha"));
    assert_eq!(body[0]["step"], json!(1));
    assert_eq!(body[1]["EventName"], json!("beta"));
    assert_eq!(body[2]["EventName"], json!("gamma"));

    // UserId appears exactly when the event carries one.
    assert!(body[0].get("UserId").is_none());
    assert_eq!(body[1]["UserId"], json!("user-9"));
    assert!(body[2].get("UserId").is_none());
}

#[tokio::test]
async fn test_non_retryable_rejection_keeps_events_queued() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let client = TelemetryClient::new(config_for(server.uri(), None))
        .await
        .unwrap();
    client.track("a", Map::new(), None);
    client.track("b", Map::new(), None);

    let outcome = client.flush().await.unwrap();
    assert_eq!(
        outcome,
        FlushOutcome {
            sent: 0,
            failed: 2,
            gave_up: 0
        }
    );

    let health = client.health().await;
    assert_eq!(health.queue_size, 2);
    assert_eq!(health.events_failed, 2);
    assert_eq!(health.events_sent, 0);
}

#[tokio::test]
async fn test_retryable_failure_requeues_with_bumped_counts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = TelemetryClient::new(config_for(server.uri(), None))
        .await
        .unwrap();
    client.track("stubborn", Map::new(), None);

    // Two cycles, one attempt each (max_retries = 0): the event stays
    // queued and accumulates retry counts across cycles.
    client.flush().await.unwrap();
    let outcome = client.flush().await.unwrap();
    assert_eq!(outcome.failed, 1);
    assert_eq!(client.health().await.queue_size, 1);
    assert_eq!(client.health().await.events_failed, 2);
}

#[tokio::test]
async fn test_restart_recovers_persisted_events_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let storage = TempDir::new().unwrap();

    // First run: offline the whole time, so everything stays persisted.
    {
        let client = TelemetryClient::new(config_for(server.uri(), Some(&storage)))
            .await
            .unwrap();
        client.connectivity().set_online(false);
        client.track("t0", Map::new(), None);
        client.track("t1", Map::new(), None);
        client.track("t2", Map::new(), None);
        client.dispose().await.unwrap();
    }

    // Second run: the queue reseeds from the offline store.
    let client = TelemetryClient::new(config_for(server.uri(), Some(&storage)))
        .await
        .unwrap();
    let health = client.health().await;
    assert_eq!(health.queue_size, 3);
    assert_eq!(health.store_pending, Some(3));

    let outcome = client.flush().await.unwrap();
    assert_eq!(outcome.sent, 3);
    assert_eq!(client.health().await.store_pending, Some(0));

    // Recovered events flow out in their original timestamp order.
    let requests = server.received_requests().await.unwrap();
    let body: Vec<Value> = requests[0].body_json().unwrap();
    let names: Vec<&str> = body
        .iter()
        .map(|e| e["EventName"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["t0", "t1", "t2"]);
}

#[tokio::test]
async fn test_dispose_leaves_no_queue_or_log_mutation_behind() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let storage = TempDir::new().unwrap();

    let client = TelemetryClient::new(config_for(server.uri(), Some(&storage)))
        .await
        .unwrap();
    client.dispose().await.unwrap();

    client.track("late", Map::new(), None);
    assert!(matches!(
        client.flush().await,
        Err(TelemetryError::Disposed)
    ));
    assert_eq!(client.health().await.queue_size, 0);

    // Nothing was written to the offline log after disposal.
    let rows = fs::read_dir(storage.path().join("outbox")).unwrap().count();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn test_backgrounded_lifecycle_flushes_now() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = TelemetryClient::new(config_for(server.uri(), None))
        .await
        .unwrap();
    client.track("about_to_background", Map::new(), None);
    client.notify_lifecycle(LifecycleEvent::Backgrounded);

    wait_until_sent(&client, 1).await;
    assert_eq!(client.health().await.queue_size, 0);
}

#[tokio::test]
async fn test_foregrounded_lifecycle_reloads_pending() {
    let storage = TempDir::new().unwrap();
    let client = TelemetryClient::new(config_for(
        "http://127.0.0.1:9/ingest".to_string(),
        Some(&storage),
    ))
    .await
    .unwrap();
    client.connectivity().set_online(false);
    assert_eq!(client.health().await.queue_size, 0);

    // Another writer (e.g. a previous process) leaves a row behind.
    let mut side_store = OfflineStore::new(storage.path().join("outbox"));
    side_store.init().unwrap();
    side_store
        .save(&beacon_telemetry::Event::new(
            "left_behind".to_string(),
            Map::new(),
            None,
        ))
        .unwrap();
    side_store.close();

    client.notify_lifecycle(LifecycleEvent::Foregrounded);
    for _ in 0..200 {
        if client.health().await.queue_size == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(client.health().await.queue_size, 1);
}

#[tokio::test]
async fn test_reconnect_edge_triggers_flush() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = TelemetryClient::new(config_for(server.uri(), None))
        .await
        .unwrap();
    client.connectivity().set_online(false);
    client.track("offline_a", Map::new(), None);
    client.track("offline_b", Map::new(), None);

    // Explicit flush while offline is a no-op.
    let outcome = client.flush().await.unwrap();
    assert_eq!(outcome, FlushOutcome::default());
    assert_eq!(client.health().await.queue_size, 2);

    // The offline -> online edge drains the queue without any explicit call.
    client.connectivity().set_online(true);
    wait_until_sent(&client, 2).await;
    assert_eq!(client.health().await.queue_size, 0);
}

#[tokio::test]
async fn test_queue_threshold_triggers_flush() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = config_for(server.uri(), None);
    config.auto_flush_threshold = 3;
    let client = TelemetryClient::new(config).await.unwrap();

    client.track("one", Map::new(), None);
    client.track("two", Map::new(), None);
    client.track("three", Map::new(), None);

    wait_until_sent(&client, 3).await;
    assert_eq!(client.health().await.queue_size, 0);
}

#[tokio::test]
#[serial]
async fn test_env_opt_out_produces_inert_client() {
    let original = env::var("BEACON_TELEMETRY_DISABLED").ok();
    env::set_var("BEACON_TELEMETRY_DISABLED", "1");

    let config = load_telemetry_config().unwrap();
    assert!(!config.enabled);

    let client = TelemetryClient::new(config).await.unwrap();
    assert!(!client.is_enabled());
    client.track("ignored", Map::new(), None);
    assert_eq!(client.health().await.queue_size, 0);

    env::remove_var("BEACON_TELEMETRY_DISABLED");
    if let Some(val) = original {
        env::set_var("BEACON_TELEMETRY_DISABLED", val);
    }
}

#[tokio::test]
#[serial]
async fn test_do_not_track_is_honored() {
    let original = env::var("DO_NOT_TRACK").ok();
    env::set_var("DO_NOT_TRACK", "1");

    let config = load_telemetry_config().unwrap();
    assert!(!config.enabled);

    env::remove_var("DO_NOT_TRACK");
    if let Some(val) = original {
        env::set_var("DO_NOT_TRACK", val);
    }
}
