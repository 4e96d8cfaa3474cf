#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use listen_guard::connection::{ProbeConfig, ProbeStage, ReconnectConfig};
use listen_guard::store::{DocumentStore, StoreError, codes};
use listen_guard::{Client, Config};
use tokio::time::Instant;

use crate::common::{MockStore, PROBE_TIMEOUT, Sentinel, client};

fn client_with_reconnect(store: &Arc<MockStore>, reconnect: ReconnectConfig) -> Client {
    let config = Config::builder()
        .probe(
            ProbeConfig::builder()
                .subscribe_timeout(PROBE_TIMEOUT)
                .reconnect(reconnect)
                .build(),
        )
        .build();
    Client::new(Arc::clone(store) as Arc<dyn DocumentStore>, config)
}

#[tokio::test]
async fn healthy_store_should_pass_every_stage() {
    let store = MockStore::new();
    let client = client(&store);

    let result = client.probe().await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.failure_stage, None);
    assert_eq!(result.error, None);
    assert_eq!(store.probe_subscriptions(), 1);
    assert_eq!(store.open_subscriptions(), 0, "probe must close its own subscription");

    let status = client.connection_status();
    assert!(status.is_connected);
    assert_eq!(status.attempt_count, 0);
    assert!(status.last_checked.is_some());
}

#[tokio::test]
async fn uninitialized_store_should_fail_at_init_without_network_calls() {
    let store = MockStore::new();
    store.set_ready(false);
    let client = client(&store);

    let result = client.probe().await;

    assert!(!result.success);
    assert_eq!(result.failure_stage, Some(ProbeStage::Init));
    assert_eq!(result.store_error, None);
    assert_eq!(store.probe_subscriptions(), 0);
}

#[tokio::test]
async fn missing_sentinel_document_should_count_as_success() {
    let store = MockStore::new();
    store.fail_reads(Some(StoreError::new(codes::NOT_FOUND, "no such document")));
    let client = client(&store);

    assert!(client.test_connection().await);
}

#[tokio::test]
async fn denied_read_should_fail_read_stage_and_keep_store_error() {
    let store = MockStore::new();
    let denied = StoreError::new(codes::PERMISSION_DENIED, "missing or insufficient permissions");
    store.fail_reads(Some(denied.clone()));
    let client = client(&store);

    let result = client.probe().await;

    assert_eq!(result.failure_stage, Some(ProbeStage::Read));
    assert_eq!(result.store_error, Some(denied));
    assert_eq!(
        result.error.as_deref(),
        Some("permission-denied: missing or insufficient permissions")
    );
    assert_eq!(store.probe_subscriptions(), 0, "later stages are skipped");
}

#[tokio::test]
async fn failing_query_should_fail_query_stage() {
    let store = MockStore::new();
    store.fail_queries(Some(StoreError::new(codes::UNAVAILABLE, "backend offline")));
    let client = client(&store);

    let result = client.probe().await;

    assert_eq!(result.failure_stage, Some(ProbeStage::Query));
    assert!(!result.timed_out);
}

#[tokio::test(start_paused = true)]
async fn silent_subscription_should_time_out_and_be_closed() {
    let store = MockStore::new();
    store.set_sentinel(Sentinel::Silent);
    let client = client(&store);

    let started = Instant::now();
    let result = client.probe().await;

    assert!(!result.success);
    assert!(result.timed_out);
    assert_eq!(result.failure_stage, Some(ProbeStage::Subscribe));
    assert!(result.error.unwrap().contains("subscription timeout"));
    assert!(started.elapsed() >= PROBE_TIMEOUT);
    assert_eq!(store.probe_subscriptions(), 1);
    assert_eq!(store.open_subscriptions(), 0, "timed out probe must unsubscribe");
}

#[tokio::test]
async fn rejected_subscription_should_fail_subscribe_stage() {
    let store = MockStore::new();
    store.set_sentinel(Sentinel::Reject(StoreError::new(
        codes::RESOURCE_EXHAUSTED,
        "too many listeners",
    )));
    let client = client(&store);

    let result = client.probe().await;

    assert_eq!(result.failure_stage, Some(ProbeStage::Subscribe));
    assert!(!result.timed_out);
    assert_eq!(store.open_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn tracker_should_count_consecutive_failures_until_success() {
    let store = MockStore::new();
    store.set_sentinel(Sentinel::Silent);
    let client = client(&store);
    let mut status_rx = client.connection_status_receiver();

    assert!(!client.test_connection().await);
    assert!(!client.test_connection().await);
    assert!(status_rx.has_changed().unwrap());

    let status = status_rx.borrow_and_update().clone();
    assert!(!status.is_connected);
    assert_eq!(status.attempt_count, 2);
    assert!(status.last_error.unwrap().contains("subscription timeout"));

    store.set_sentinel(Sentinel::Respond);
    assert!(client.test_connection().await);

    let status = client.connection_status();
    assert!(status.is_connected);
    assert_eq!(status.attempt_count, 0);
    assert_eq!(status.last_error, None);
}

#[tokio::test]
async fn reset_should_clear_history() {
    let store = MockStore::new();
    store.set_ready(false);
    let client = client(&store);

    client.probe().await;
    assert_eq!(client.connection_status().attempt_count, 1);

    client.reset_connection();
    assert_eq!(client.connection_status(), Default::default());
}

#[tokio::test(start_paused = true)]
async fn attempt_reconnection_should_wait_exponential_backoff() {
    let store = MockStore::new();
    store.set_ready(false);
    let client = client_with_reconnect(
        &store,
        ReconnectConfig::new(Some(3), Duration::from_millis(100)),
    );

    client.probe().await;
    assert_eq!(client.connection_status().attempt_count, 1);

    store.set_ready(true);
    let started = Instant::now();
    assert!(client.attempt_reconnection().await);

    // One failure so far: base * 2^1
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(client.connection_status().attempt_count, 0);
}

#[tokio::test(start_paused = true)]
async fn attempt_reconnection_should_give_up_at_max_attempts() {
    let store = MockStore::new();
    store.set_ready(false);
    let client = client_with_reconnect(
        &store,
        ReconnectConfig::new(Some(2), Duration::from_millis(10)),
    );

    client.probe().await;
    assert!(!client.attempt_reconnection().await);
    assert_eq!(client.connection_status().attempt_count, 2);

    let started = Instant::now();
    assert!(!client.attempt_reconnection().await, "limit reached");
    assert_eq!(started.elapsed(), Duration::ZERO, "no delay once exhausted");
    assert_eq!(client.connection_status().attempt_count, 2, "no probe once exhausted");

    client.reset_connection();
    store.set_ready(true);
    assert!(client.attempt_reconnection().await);
}
