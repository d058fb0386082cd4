//! Connection pool cache keyed by engine and database

use std::sync::{Arc, Mutex};

use postgres_provisioner::resources::{ConnectionParams, EngineRegistry};

use crate::common::*;

fn params(database: &str) -> ConnectionParams {
    ConnectionParams {
        host: "db.internal".to_string(),
        port: 5432,
        user: "postgres".to_string(),
        password: "admin-secret".to_string(),
        database: database.to_string(),
        uri_args: "sslmode=disable".to_string(),
    }
}

fn registry() -> (EngineRegistry, Arc<FakeConnector>) {
    let server: SharedServer = Arc::new(Mutex::new(FakeServer::default()));
    let connector = Arc::new(FakeConnector::new(server));
    (EngineRegistry::new(connector.clone()), connector)
}

#[tokio::test]
async fn test_acquire_caches_per_database() {
    let (registry, connector) = registry();

    let first = registry.acquire("shop/pg", &params("orders")).await.unwrap();
    let again = registry.acquire("shop/pg", &params("orders")).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(connector.connects(), 1);

    registry.acquire("shop/pg", &params("billing")).await.unwrap();
    registry.acquire("other/pg", &params("orders")).await.unwrap();
    assert_eq!(connector.connects(), 3);
    assert_eq!(registry.len().await, 3);
}

#[tokio::test]
async fn test_close_all_evicts_one_engine() {
    let (registry, connector) = registry();
    registry.acquire("shop/pg", &params("orders")).await.unwrap();
    registry.acquire("shop/pg", &params("billing")).await.unwrap();
    registry.acquire("other/pg", &params("orders")).await.unwrap();

    registry.close_all("shop/pg").await;

    assert_eq!(registry.len().await, 1);
    let handles = connector.handles();
    assert!(handles[0].1.is_closed());
    assert!(handles[1].1.is_closed());
    assert!(!handles[2].1.is_closed());

    // The next acquire opens a fresh pool
    registry.acquire("shop/pg", &params("orders")).await.unwrap();
    assert_eq!(connector.connects(), 4);
}

#[tokio::test]
async fn test_close_database_leaves_siblings() {
    let (registry, connector) = registry();
    registry.acquire("shop/pg", &params("orders")).await.unwrap();
    registry.acquire("shop/pg", &params("postgres")).await.unwrap();

    registry.close_database("shop/pg", "orders").await;

    assert_eq!(registry.len().await, 1);
    let handles = connector.handles();
    assert!(handles[0].1.is_closed());
    assert!(!handles[1].1.is_closed());
}

#[tokio::test]
async fn test_closing_unknown_pools_is_harmless() {
    let (registry, connector) = registry();
    registry.close_all("missing/pg").await;
    registry.close_database("missing/pg", "orders").await;

    assert!(registry.is_empty().await);
    assert_eq!(connector.connects(), 0);
}

#[tokio::test]
async fn test_changed_credentials_reopen_pool() {
    let (registry, connector) = registry();
    let first = registry.acquire("shop/pg", &params("orders")).await.unwrap();

    let rotated = ConnectionParams {
        password: "new-admin-secret".to_string(),
        ..params("orders")
    };
    let second = registry.acquire("shop/pg", &rotated).await.unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(connector.connects(), 2);
    assert_eq!(registry.len().await, 1);
    let handles = connector.handles();
    assert!(handles[0].1.is_closed());
    assert!(!handles[1].1.is_closed());

    // Same parameters again: the new pool is kept
    let third = registry.acquire("shop/pg", &rotated).await.unwrap();
    assert!(Arc::ptr_eq(&second, &third));
    assert_eq!(connector.connects(), 2);
}
