//! End-to-end tests against a real PostgreSQL server.
//!
//! **Requires Docker**. Run with:
//!
//! ```bash
//! cargo test -p triggerfish --test postgres_integration -- --ignored
//! ```

#![cfg(feature = "postgres")]

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;
use tracing::info;
use triggerfish::prelude::*;

struct PostgresContainer {
    #[allow(dead_code)]
    container: ContainerAsync<Postgres>,
    url: String,
}

impl PostgresContainer {
    async fn start() -> Result<Self> {
        let container = Postgres::default()
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;
        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(5432).await?;
        let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);
        info!("PostgreSQL container started on {}:{}", host, port);
        Ok(Self { container, url })
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("triggerfish=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

async fn registry(pg: &PostgresContainer) -> Result<Registry> {
    let registry = Registry::connect(&TriggerfishConfig::new(&pg.url))?;
    registry
        .manager()
        .execute(
            "CREATE TABLE IF NOT EXISTS orders (\
             id INT PRIMARY KEY, status TEXT NOT NULL, note TEXT)",
        )
        .await?;
    Ok(registry)
}

async fn recv_within<T>(rx: &mut tokio::sync::mpsc::UnboundedReceiver<T>, ms: u64) -> Option<T> {
    tokio::time::timeout(Duration::from_millis(ms), rx.recv())
        .await
        .ok()
        .flatten()
}

#[derive(Debug, Deserialize)]
struct Order {
    id: i32,
    status: String,
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_watched_column_notifications() -> Result<()> {
    init_tracing();
    let pg = PostgresContainer::start().await?;
    let registry = registry(&pg).await?;

    let trigger = registry.define(
        TriggerBuilder::new()
            .model("orders")
            .name("order_status")
            .after()
            .on_update()
            .watch_columns(["status"])
            .notify(),
    )?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    trigger
        .subscribe(Subscription::typed(move |order: Order, _n| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((order.id, order.status));
                Ok(())
            }
        }))
        .await?;

    registry.setup_all().await?;
    registry.listen_all().await?;

    registry
        .manager()
        .execute("INSERT INTO orders (id, status) VALUES (1, 'new')")
        .await?;
    registry
        .manager()
        .execute("UPDATE orders SET status = 'paid' WHERE id = 1")
        .await?;
    assert_eq!(recv_within(&mut rx, 5000).await, Some((1, "paid".to_string())));

    // an update that does not touch the watched column does not fire
    registry
        .manager()
        .execute("UPDATE orders SET note = 'gift wrap' WHERE id = 1")
        .await?;
    assert_eq!(recv_within(&mut rx, 500).await, None);

    trigger.drop_trigger().await?;
    assert_eq!(trigger.state(), TriggerState::Dropped);
    registry
        .manager()
        .execute("UPDATE orders SET status = 'shipped' WHERE id = 1")
        .await?;
    assert_eq!(recv_within(&mut rx, 500).await, None);

    assert!(registry.dispose().await.is_clean());
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_client_evaluation_agrees_with_database() -> Result<()> {
    init_tracing();
    let pg = PostgresContainer::start().await?;
    let registry = registry(&pg).await?;

    let condition = changed("status").and(new_field("status").eq("paid"));
    let trigger = registry.define(
        TriggerBuilder::new()
            .model("orders")
            .name("order_paid")
            .after()
            .on_update()
            .when(condition.clone())
            .notify(),
    )?;

    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = fired.clone();
    trigger
        .subscribe(Subscription::from_fn(move |n: &Notification| {
            sink.lock().push(n.data().get("id").cloned().unwrap_or(Value::Null));
            Ok(())
        }))
        .await?;
    registry.setup_all().await?;
    registry.listen_all().await?;

    let cases = [
        (10, "new", "paid"),
        (11, "paid", "paid"),
        (12, "new", "cancelled"),
        (13, "paid", "refunded"),
    ];
    let mut expected = Vec::new();
    for (id, before, after) in cases {
        registry
            .manager()
            .execute(&format!(
                "INSERT INTO orders (id, status) VALUES ({}, '{}')",
                id, before
            ))
            .await?;
        registry
            .manager()
            .execute(&format!(
                "UPDATE orders SET status = '{}' WHERE id = {}",
                after, id
            ))
            .await?;

        let row = |status: &str| -> Map<String, Value> {
            let mut row = Map::new();
            row.insert("id".into(), json!(id));
            row.insert("status".into(), json!(status));
            row
        };
        if condition.matches(Some(&row(after)), Some(&row(before))) {
            expected.push(json!(id));
        }
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(expected, vec![json!(10)]);
    assert_eq!(*fired.lock(), expected);

    registry.drop_all().await;
    registry.dispose().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_multiplexer_shares_one_listen() -> Result<()> {
    init_tracing();
    let pg = PostgresContainer::start().await?;
    let registry = registry(&pg).await?;
    let mux = registry.multiplexer();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for name in ["first", "second"] {
        let tx = tx.clone();
        mux.subscribe(
            "inventory",
            Subscription::from_fn(move |n: &Notification| {
                let _ = tx.send((name, n.operation()));
                Ok(())
            }),
        )
        .await?;
    }
    assert_eq!(registry.manager().channels(), vec!["inventory"]);

    let payload = json!({
        "operation": "INSERT",
        "timestamp": "2024-05-01T10:00:00Z",
        "schema": "public",
        "table": "inventory",
        "data": {"sku": "A-1"},
    });
    registry
        .manager()
        .execute(&format!("SELECT pg_notify('inventory', '{}')", payload))
        .await?;

    let mut seen = vec![
        recv_within(&mut rx, 5000).await.context("first delivery")?,
        recv_within(&mut rx, 5000).await.context("second delivery")?,
    ];
    seen.sort_by_key(|(name, _)| *name);
    assert_eq!(
        seen,
        vec![
            ("first", TriggerOperation::Insert),
            ("second", TriggerOperation::Insert)
        ]
    );

    registry.dispose().await;
    Ok(())
}
