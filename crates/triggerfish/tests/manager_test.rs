//! Tests for the connection manager: subscriptions, reconnection, teardown

mod common;

use common::{payload, wait_until, Harness};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use triggerfish::error::{Error, ErrorCategory};
use triggerfish::manager::{ConnectionEvent, RawHandler};
use triggerfish::transport::RawNotification;

fn counting(counter: &Arc<AtomicUsize>) -> RawHandler {
    let counter = counter.clone();
    Arc::new(move |_raw: RawNotification| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

fn noop() -> RawHandler {
    Arc::new(|_raw: RawNotification| {})
}

async fn next_event(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    matches: impl Fn(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event channel open");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event within 2s")
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test]
async fn test_listener_connects_lazily() {
    let harness = Harness::new();
    let mut events = harness.manager.events();
    assert_eq!(harness.broker.connect_count(), 0);
    assert!(!harness.manager.is_connected().await);

    harness.manager.subscribe("orders", noop()).await.unwrap();
    assert_eq!(harness.broker.connect_count(), 1);
    assert!(harness.manager.is_connected().await);
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected);

    harness.manager.subscribe("users", noop()).await.unwrap();
    assert_eq!(harness.broker.connect_count(), 1);
    assert_eq!(harness.manager.channels(), vec!["orders", "users"]);
}

#[tokio::test]
async fn test_resubscribe_replaces_handler_without_round_trip() {
    let harness = Harness::new();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    harness.manager.subscribe("orders", counting(&first)).await.unwrap();
    harness.manager.subscribe("orders", counting(&second)).await.unwrap();
    assert_eq!(harness.broker.listen_count(), 1);

    harness.broker.publish("orders", "{}");
    wait_until(|| second.load(Ordering::SeqCst) == 1).await;
    assert_eq!(first.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_channel_rejected_before_connecting() {
    let harness = Harness::new();
    let err = harness
        .manager
        .subscribe("orders; DROP TABLE orders", noop())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert_eq!(harness.broker.connect_count(), 0);
}

#[tokio::test]
async fn test_unsubscribe_issues_unlisten() {
    let harness = Harness::new();
    harness.manager.subscribe("orders", noop()).await.unwrap();
    harness.manager.subscribe("users", noop()).await.unwrap();

    harness.manager.unsubscribe("orders").await.unwrap();
    harness.manager.unsubscribe("never_subscribed").await.unwrap();
    assert_eq!(harness.broker.listening_channels(), vec!["users"]);
    assert_eq!(harness.manager.channels(), vec!["users"]);
}

#[tokio::test]
async fn test_connect_failure_is_retriable() {
    let harness = Harness::new();
    harness.broker.fail_next_connects(1);

    let err = harness.manager.subscribe("orders", noop()).await.unwrap_err();
    assert!(err.is_retriable());
    assert!(harness.manager.channels().is_empty());

    harness.manager.subscribe("orders", noop()).await.unwrap();
    assert_eq!(harness.broker.listening_channels(), vec!["orders"]);
}

// ============================================================================
// Reconnection
// ============================================================================

#[tokio::test]
async fn test_reconnect_restores_every_channel() {
    let harness = Harness::new();
    let mut events = harness.manager.events();
    let counter = Arc::new(AtomicUsize::new(0));

    harness.manager.subscribe("orders", counting(&counter)).await.unwrap();
    harness.manager.subscribe("users", noop()).await.unwrap();

    harness.broker.disconnect_all("server closed the connection");
    let disconnected = next_event(&mut events, |e| {
        matches!(e, ConnectionEvent::Disconnected { .. })
    })
    .await;
    assert_eq!(
        disconnected,
        ConnectionEvent::Disconnected {
            reason: "server closed the connection".into()
        }
    );

    let reconnected = next_event(&mut events, |e| {
        matches!(e, ConnectionEvent::Reconnected { .. })
    })
    .await;
    assert_eq!(
        reconnected,
        ConnectionEvent::Reconnected {
            attempts: 1,
            channels: 2
        }
    );
    assert_eq!(harness.broker.connect_count(), 2);
    assert_eq!(harness.broker.listening_channels(), vec!["orders", "users"]);

    harness
        .broker
        .publish("orders", &payload("INSERT", "orders", json!({"id": 1})));
    wait_until(|| counter.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_reconnect_retries_with_backoff() {
    let harness = Harness::new();
    let mut events = harness.manager.events();
    harness.manager.subscribe("orders", noop()).await.unwrap();

    harness.broker.fail_next_connects(2);
    harness.broker.disconnect_all("network unreachable");

    let reconnected = next_event(&mut events, |e| {
        matches!(e, ConnectionEvent::Reconnected { .. })
    })
    .await;
    assert_eq!(
        reconnected,
        ConnectionEvent::Reconnected {
            attempts: 3,
            channels: 1
        }
    );
}

#[tokio::test]
async fn test_exhausted_reconnect_recovers_on_next_subscribe() {
    let harness = Harness::new();
    let mut events = harness.manager.events();
    harness.manager.subscribe("orders", noop()).await.unwrap();

    harness.broker.fail_next_connects(100);
    harness.broker.disconnect_all("server shut down");
    let failed = next_event(&mut events, |e| {
        matches!(e, ConnectionEvent::ReconnectFailed { .. })
    })
    .await;
    assert_eq!(failed, ConnectionEvent::ReconnectFailed { attempts: 5 });
    assert!(!harness.manager.is_connected().await);
    assert_eq!(harness.manager.channels(), vec!["orders"]);

    harness.broker.fail_next_connects(0);
    harness.manager.subscribe("users", noop()).await.unwrap();
    assert_eq!(harness.broker.listening_channels(), vec!["orders", "users"]);
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn test_run_in_transaction_commits() {
    let harness = Harness::new();
    let value = harness
        .manager
        .run_in_transaction(|tx| {
            Box::pin(async move {
                tx.batch_execute("CREATE TABLE audit (id INT)").await?;
                Ok(42)
            })
        })
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(
        harness.factory.statements(),
        vec!["BEGIN", "CREATE TABLE audit (id INT)", "COMMIT"]
    );
}

#[tokio::test]
async fn test_run_in_transaction_rolls_back_on_error() {
    let harness = Harness::new();
    harness.factory.fail_statements_containing("DROP");

    let err = harness
        .manager
        .execute("DROP TABLE audit")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Query { .. }));
    assert_eq!(
        harness.factory.statements(),
        vec!["BEGIN", "DROP TABLE audit", "ROLLBACK"]
    );
    assert_eq!(harness.manager.pool().stats().idle, 1);
}

// ============================================================================
// Disposal
// ============================================================================

#[tokio::test]
async fn test_dispose_collects_every_failure() {
    let harness = Harness::new();
    let mut events = harness.manager.events();
    for channel in ["orders", "users", "invoices"] {
        harness.manager.subscribe(channel, noop()).await.unwrap();
    }
    harness.broker.fail_unlisten("users");

    let report = harness.manager.dispose().await;
    // three UNLISTENs and the listener close
    assert_eq!(report.attempted, 4);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].target, "users");
    assert_eq!(harness.broker.open_connections(), 0);
    assert!(harness.manager.channels().is_empty());

    next_event(&mut events, |e| *e == ConnectionEvent::Disposed).await;
}

#[tokio::test]
async fn test_disposed_manager_rejects_operations() {
    let harness = Harness::new();
    harness.manager.subscribe("orders", noop()).await.unwrap();
    assert!(harness.manager.dispose().await.is_clean());

    assert!(harness.manager.is_disposed());
    assert!(harness
        .manager
        .subscribe("orders", noop())
        .await
        .unwrap_err()
        .is_disposed());
    assert!(harness
        .manager
        .unsubscribe("orders")
        .await
        .unwrap_err()
        .is_disposed());
    assert!(harness
        .manager
        .execute("SELECT 1")
        .await
        .unwrap_err()
        .is_disposed());

    let again = harness.manager.dispose().await;
    assert_eq!(again.attempted, 0);
}

#[tokio::test]
async fn test_dispose_without_connection_closes_pool() {
    let harness = Harness::new();
    harness.manager.execute("SELECT 1").await.unwrap();
    assert_eq!(harness.manager.pool().stats().idle, 1);

    let report = harness.manager.dispose().await;
    assert!(report.is_clean());
    assert!(harness.manager.pool().is_closed());
    assert_eq!(harness.manager.pool().stats().size, 0);
}
