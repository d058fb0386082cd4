//! PostgresDatabase provisioning: roles, database, schemas and extensions

use std::sync::Arc;

use kube::runtime::controller::Action;

use postgres_provisioner::controller::error::Error;
use postgres_provisioner::controller::error_policy;
use postgres_provisioner::crd::{DatabasePhase, DatabaseRoles};
use postgres_provisioner::resources::sql::{ObjectKind, SchemaObject};

use crate::common::*;

#[tokio::test]
async fn test_default_roles() {
    let h = Harness::new();
    h.ready_database("shop", "orders").await;

    let status = h.databases.fetch("shop", "orders").unwrap().status.unwrap();
    assert_eq!(status.phase, DatabasePhase::Created);
    assert_eq!(status.database, "orders");
    assert_eq!(
        status.roles,
        DatabaseRoles {
            owner: "orders-owner".to_string(),
            reader: "orders-reader".to_string(),
            writer: "orders-writer".to_string(),
        }
    );

    let server = h.server.lock().unwrap();
    let db = &server.databases["orders"];
    assert_eq!(db.owner, "orders-owner");
    assert!(db.connect.contains("orders-reader"));
    assert!(db.connect.contains("orders-writer"));
    let operator = &server.roles["postgres"];
    for role in ["orders-owner", "orders-reader", "orders-writer"] {
        assert!(operator.member_of.contains(role), "operator not in {}", role);
        assert!(!server.roles[role].login);
    }
}

#[tokio::test]
async fn test_master_role_overrides_owner() {
    let h = Harness::new();
    h.ready_engine("shop").await;
    let mut db = database("shop", "orders", "orders");
    db.spec.master_role = Some("orders_admin".to_string());
    h.databases.insert(db);

    h.settle(&h.databases, "shop", "orders").await.unwrap();

    let status = h.databases.fetch("shop", "orders").unwrap().status.unwrap();
    assert_eq!(status.roles.owner, "orders_admin");
    assert_eq!(status.roles.reader, "orders-reader");
    assert_eq!(h.server.lock().unwrap().databases["orders"].owner, "orders_admin");
}

#[tokio::test]
async fn test_second_pass_is_idempotent() {
    let h = Harness::new();
    h.ready_engine("shop").await;
    let mut db = database("shop", "orders", "orders");
    db.spec.schemas.list = vec!["sales".to_string()];
    db.spec.extensions.list = vec!["pgcrypto".to_string()];
    h.databases.insert(db);
    h.settle(&h.databases, "shop", "orders").await.unwrap();
    let first = h.databases.fetch("shop", "orders").unwrap().status.unwrap();
    assert_eq!(first.schemas, vec!["sales".to_string()]);
    assert_eq!(first.extensions, vec!["pgcrypto".to_string()]);

    h.clear_calls();
    h.reconcile(&h.databases, "shop", "orders").await.unwrap();

    let calls = h.calls();
    assert!(!calls.is_empty());
    assert!(
        calls.iter().all(|c| c.starts_with("GRANT ")),
        "unexpected statements: {:?}",
        calls
    );
    let second = h.databases.fetch("shop", "orders").unwrap().status.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_identifier_guard_runs_before_any_statement() {
    let h = Harness::new();
    h.ready_engine("shop").await;
    let name = "d".repeat(58);
    h.databases.insert(database("shop", "long", &name));
    let connects = h.connector.connects();
    h.clear_calls();

    let err = h.settle(&h.databases, "shop", "long").await.unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert!(err.to_string().contains(&format!("{}-owner", name)));
    assert!(h.calls().is_empty());
    assert_eq!(h.connector.connects(), connects);
    let status = h.databases.fetch("shop", "long").unwrap().status.unwrap();
    assert_eq!(status.phase, DatabasePhase::Failed);
    assert!(status.database.is_empty());
}

#[tokio::test]
async fn test_rename_keeps_roles_and_data() {
    let h = Harness::new();
    h.ready_database("shop", "orders").await;
    h.databases.edit("shop", "orders", |db| {
        db.spec.database = "orders_v2".to_string();
    });
    h.clear_calls();

    h.reconcile(&h.databases, "shop", "orders").await.unwrap();

    let calls = h.calls();
    assert!(calls.contains(&"RENAME DATABASE orders TO orders_v2".to_string()));
    assert!(calls.contains(&"RENAME ROLE orders-owner TO orders_v2-owner".to_string()));
    assert!(!calls.iter().any(|c| c.starts_with("CREATE DATABASE")));

    let status = h.databases.fetch("shop", "orders").unwrap().status.unwrap();
    assert_eq!(status.database, "orders_v2");
    assert_eq!(status.roles.owner, "orders_v2-owner");
    let server = h.server.lock().unwrap();
    assert!(!server.databases.contains_key("orders"));
    assert_eq!(server.databases["orders_v2"].owner, "orders_v2-owner");
}

#[tokio::test]
async fn test_removed_schema_dropped_only_with_drop_on_remove() {
    let h = Harness::new();
    h.ready_engine("shop").await;
    let mut db = database("shop", "orders", "orders");
    db.spec.schemas.list = vec!["sales".to_string(), "audit".to_string(), "staging".to_string()];
    h.databases.insert(db);
    h.settle(&h.databases, "shop", "orders").await.unwrap();

    // Without dropOnRemove the schema is only forgotten
    h.databases.edit("shop", "orders", |db| {
        db.spec.schemas.list = vec!["sales".to_string(), "audit".to_string()];
    });
    h.reconcile(&h.databases, "shop", "orders").await.unwrap();
    assert!(h.server.lock().unwrap().databases["orders"].schemas.contains_key("staging"));

    h.databases.edit("shop", "orders", |db| {
        db.spec.schemas.list = vec!["sales".to_string()];
        db.spec.schemas.drop_on_remove = true;
        db.spec.schemas.delete_with_cascade = true;
    });
    h.clear_calls();
    h.reconcile(&h.databases, "shop", "orders").await.unwrap();

    assert!(h.calls().contains(&"DROP SCHEMA audit CASCADE".to_string()));
    let status = h.databases.fetch("shop", "orders").unwrap().status.unwrap();
    assert_eq!(status.schemas, vec!["sales".to_string()]);
    assert!(!h.server.lock().unwrap().databases["orders"].schemas.contains_key("audit"));
}

#[tokio::test]
async fn test_foreign_owned_objects_are_reowned() {
    let h = Harness::new();
    h.ready_engine("shop").await;
    let mut db = database("shop", "orders", "orders");
    db.spec.schemas.list = vec!["sales".to_string()];
    h.databases.insert(db);
    h.settle(&h.databases, "shop", "orders").await.unwrap();

    let events = SchemaObject {
        kind: ObjectKind::Table,
        schema: "sales".to_string(),
        name: "events".to_string(),
    };
    h.server
        .lock()
        .unwrap()
        .databases
        .get_mut("orders")
        .unwrap()
        .objects
        .push((events.clone(), "postgres".to_string()));

    h.reconcile(&h.databases, "shop", "orders").await.unwrap();

    assert!(
        h.calls()
            .contains(&"ALTER Table sales.events OWNER TO orders-owner".to_string())
    );
    let server = h.server.lock().unwrap();
    assert_eq!(server.databases["orders"].objects[0].1, "orders-owner");
}

#[tokio::test]
async fn test_missing_engine_requeues_after_not_ready_delay() {
    let h = Harness::new();
    h.databases.insert(database("shop", "orders", "orders"));

    let err = h.settle(&h.databases, "shop", "orders").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(err.to_string(), "PostgresEngine shop/pg not found");

    let db = h.databases.fetch("shop", "orders").unwrap();
    let action = error_policy(Arc::new(db), &err, h.ctx.clone());
    assert_eq!(action, Action::requeue(h.ctx.config.not_ready_requeue));
}

#[tokio::test]
async fn test_drop_on_delete_removes_database_and_roles() {
    let h = Harness::new();
    h.ready_database("shop", "orders").await;
    h.databases.edit("shop", "orders", |db| {
        db.spec.drop_on_delete = true;
    });
    h.databases.delete("shop", "orders");

    h.reconcile(&h.databases, "shop", "orders").await.unwrap();

    assert!(h.databases.fetch("shop", "orders").is_none());
    let server = h.server.lock().unwrap();
    assert!(!server.databases.contains_key("orders"));
    for role in ["orders-owner", "orders-reader", "orders-writer"] {
        assert!(!server.roles.contains_key(role), "{} still exists", role);
    }
}

#[tokio::test]
async fn test_delete_without_drop_keeps_database() {
    let h = Harness::new();
    h.ready_database("shop", "orders").await;
    h.databases.delete("shop", "orders");

    h.reconcile(&h.databases, "shop", "orders").await.unwrap();

    assert!(h.databases.fetch("shop", "orders").is_none());
    assert!(h.server.lock().unwrap().databases.contains_key("orders"));
}
