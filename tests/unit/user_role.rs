//! PostgresUserRole logins, rotation, draining and connection secrets

use chrono::Utc;

use postgres_provisioner::controller::error::Error;
use postgres_provisioner::controller::status::format_time;
use postgres_provisioner::crd::{AppliedMembership, RoleAttributes, UserRolePhase};

use crate::common::*;

/// Pretend the live password was set two hours ago
fn age_password(h: &Harness, name: &str) {
    h.user_roles.edit("shop", name, |r| {
        let status = r.status.as_mut().unwrap();
        status.last_password_changed_time =
            Some(format_time(Utc::now() - chrono::Duration::hours(2)));
    });
}

async fn ready_app(h: &Harness, rotation: Option<&str>) {
    h.ready_database("shop", "orders").await;
    h.user_roles
        .insert(managed_user_role("shop", "app", "app", rotation, &["orders"]));
    h.settle_user_role("shop", "app").await.unwrap();
}

#[tokio::test]
async fn test_managed_login_and_secrets() {
    let h = Harness::new();
    ready_app(&h, None).await;

    let status = h.user_roles.fetch("shop", "app").unwrap().status.unwrap();
    assert_eq!(status.phase, UserRolePhase::Created);
    assert_eq!(status.postgres_role, "app-A");
    assert_eq!(status.role_prefix, "app");
    assert!(status.old_postgres_roles.is_empty());
    assert!(status.last_password_changed_time.is_some());
    assert_eq!(
        status.postgres_group_roles,
        vec![AppliedMembership {
            database: "orders".to_string(),
            group_role: "orders-writer".to_string(),
        }]
    );

    {
        let server = h.server.lock().unwrap();
        let login = &server.roles["app-A"];
        assert!(login.login);
        assert!(login.member_of.contains("orders-writer"));
        assert_eq!(login.settings["orders"], "orders-writer");
    }

    let work = h.secrets.data("shop", "app-work").unwrap();
    let password = work["PASSWORD"].clone();
    assert_eq!(work["LOGIN"], "app-A");
    assert_eq!(password.len(), 32);
    assert_eq!(
        h.server.lock().unwrap().roles["app-A"].password.as_deref(),
        Some(password.as_str())
    );

    let conn = h.secrets.data("shop", "app-orders").unwrap();
    assert_eq!(conn["LOGIN"], "app-A");
    assert_eq!(conn["PASSWORD"], password);
    assert_eq!(conn["DATABASE"], "orders");
    assert_eq!(conn["HOST"], "db.internal");
    assert_eq!(conn["PORT"], "5432");
    assert_eq!(conn["ARGS"], "sslmode=disable");
    assert_eq!(
        conn["POSTGRES_URL"],
        format!("postgres://app-A:{}@db.internal:5432/orders", password)
    );
    assert_eq!(
        conn["POSTGRES_URL_ARGS"],
        format!(
            "postgres://app-A:{}@db.internal:5432/orders?sslmode=disable",
            password
        )
    );
}

#[tokio::test]
async fn test_waits_for_database_to_be_created() {
    let h = Harness::new();
    h.ready_engine("shop").await;
    h.user_roles
        .insert(managed_user_role("shop", "app", "app", None, &["orders"]));

    let err = h.settle_user_role("shop", "app").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(err.to_string(), "PostgresDatabase shop/orders not found");
    assert!(!h.role_exists("app-A"));
}

#[tokio::test]
async fn test_rotation_keeps_old_login_until_drained() {
    let h = Harness::new();
    ready_app(&h, Some("1h")).await;
    let first_password = h.secrets.data("shop", "app-work").unwrap()["PASSWORD"].clone();

    age_password(&h, "app");
    h.set_connections("app-A", 1);
    h.reconcile(&h.user_roles, "shop", "app").await.unwrap();

    let status = h.user_roles.fetch("shop", "app").unwrap().status.unwrap();
    assert_eq!(status.postgres_role, "app-B");
    assert_eq!(status.old_postgres_roles, vec!["app-A".to_string()]);
    assert!(h.role_exists("app-A"));
    {
        let server = h.server.lock().unwrap();
        let login = &server.roles["app-B"];
        assert!(login.member_of.contains("orders-writer"));
        assert_eq!(login.settings["orders"], "orders-writer");
    }

    let conn = h.secrets.data("shop", "app-orders").unwrap();
    assert_eq!(conn["LOGIN"], "app-B");
    assert_ne!(conn["PASSWORD"], first_password);
    assert_eq!(
        h.health.metrics.draining_logins("shop", "app"),
        1
    );

    h.set_connections("app-A", 0);
    h.reconcile(&h.user_roles, "shop", "app").await.unwrap();

    let status = h.user_roles.fetch("shop", "app").unwrap().status.unwrap();
    assert_eq!(status.postgres_role, "app-B");
    assert!(status.old_postgres_roles.is_empty());
    assert!(!h.role_exists("app-A"));
    assert!(h.calls().contains(&"DROP ROLE app-A".to_string()));
}

#[tokio::test]
async fn test_rotation_blocked_while_old_login_connected() {
    let h = Harness::new();
    ready_app(&h, Some("1h")).await;
    age_password(&h, "app");
    h.set_connections("app-A", 1);
    h.reconcile(&h.user_roles, "shop", "app").await.unwrap();

    age_password(&h, "app");
    let err = h.reconcile(&h.user_roles, "shop", "app").await.unwrap_err();

    assert!(matches!(err, Error::RotationBlocked(_)));
    assert_eq!(
        err.to_string(),
        "cannot rotate login app-B while old logins are still connected: app-A"
    );
    let status = h.user_roles.fetch("shop", "app").unwrap().status.unwrap();
    assert_eq!(status.phase, UserRolePhase::Failed);
    assert_eq!(status.postgres_role, "app-B");
    assert!(h.role_exists("app-A"));
    assert!(h.role_exists("app-B"));
}

#[tokio::test]
async fn test_prefix_change_rotates_to_new_prefix() {
    let h = Harness::new();
    ready_app(&h, None).await;

    h.user_roles.edit("shop", "app", |r| {
        r.spec.role_prefix = Some("svc".to_string());
    });
    h.reconcile(&h.user_roles, "shop", "app").await.unwrap();

    let status = h.user_roles.fetch("shop", "app").unwrap().status.unwrap();
    assert_eq!(status.postgres_role, "svc-B");
    assert_eq!(status.role_prefix, "svc");
    assert_eq!(status.old_postgres_roles, vec!["app-A".to_string()]);
    assert_eq!(h.secrets.data("shop", "app-orders").unwrap()["LOGIN"], "svc-B");

    h.reconcile(&h.user_roles, "shop", "app").await.unwrap();
    assert!(!h.role_exists("app-A"));
    assert!(h.role_exists("svc-B"));
}

#[tokio::test]
async fn test_deleted_secret_is_restored_unchanged() {
    let h = Harness::new();
    ready_app(&h, None).await;
    let before = h.secrets.data("shop", "app-orders").unwrap();

    h.secrets.remove("shop", "app-orders");
    h.reconcile(&h.user_roles, "shop", "app").await.unwrap();
    assert_eq!(h.secrets.data("shop", "app-orders").unwrap(), before);

    let writes = h.secrets.writes();
    h.reconcile(&h.user_roles, "shop", "app").await.unwrap();
    assert_eq!(h.secrets.writes(), writes);
}

#[tokio::test]
async fn test_deleted_work_secret_is_restored_unchanged() {
    let h = Harness::new();
    ready_app(&h, None).await;
    let work = h.secrets.data("shop", "app-work").unwrap();
    let conn = h.secrets.data("shop", "app-orders").unwrap();

    h.secrets.remove("shop", "app-work");
    h.clear_calls();
    h.reconcile(&h.user_roles, "shop", "app").await.unwrap();

    assert_eq!(h.secrets.data("shop", "app-work").unwrap(), work);
    assert_eq!(h.secrets.data("shop", "app-orders").unwrap(), conn);
    assert!(h.calls().is_empty());
    assert_eq!(
        h.server.lock().unwrap().roles["app-A"].password.as_deref(),
        Some(work["PASSWORD"].as_str())
    );
}

#[tokio::test]
async fn test_lost_password_is_regenerated_everywhere() {
    let h = Harness::new();
    ready_app(&h, None).await;
    let old_password = h.secrets.data("shop", "app-work").unwrap()["PASSWORD"].clone();

    h.secrets.remove("shop", "app-work");
    h.secrets.remove("shop", "app-orders");
    h.clear_calls();
    h.reconcile(&h.user_roles, "shop", "app").await.unwrap();

    let work = h.secrets.data("shop", "app-work").unwrap();
    assert_eq!(work["LOGIN"], "app-A");
    assert_ne!(work["PASSWORD"], old_password);
    assert_eq!(h.secrets.data("shop", "app-orders").unwrap()["PASSWORD"], work["PASSWORD"]);
    assert_eq!(h.calls(), vec!["ALTER LOGIN app-A".to_string()]);
    assert_eq!(
        h.server.lock().unwrap().roles["app-A"].password.as_deref(),
        Some(work["PASSWORD"].as_str())
    );
}

#[tokio::test]
async fn test_second_pass_is_idempotent() {
    let h = Harness::new();
    ready_app(&h, Some("720h")).await;
    let status = h.user_roles.fetch("shop", "app").unwrap().status.unwrap();
    let writes = h.secrets.writes();

    h.clear_calls();
    h.reconcile(&h.user_roles, "shop", "app").await.unwrap();

    assert!(h.calls().is_empty());
    assert_eq!(h.secrets.writes(), writes);
    assert_eq!(h.user_roles.fetch("shop", "app").unwrap().status.unwrap(), status);
}

#[tokio::test]
async fn test_changed_attributes_alter_login_once() {
    let h = Harness::new();
    ready_app(&h, None).await;
    let password = h.secrets.data("shop", "app-work").unwrap()["PASSWORD"].clone();

    h.user_roles.edit("shop", "app", |r| {
        r.spec.role_attributes = Some(RoleAttributes {
            connection_limit: Some(5),
            ..Default::default()
        });
    });
    h.clear_calls();
    h.reconcile(&h.user_roles, "shop", "app").await.unwrap();

    assert_eq!(h.calls(), vec!["ALTER LOGIN app-A".to_string()]);
    {
        let server = h.server.lock().unwrap();
        let login = &server.roles["app-A"];
        assert_eq!(login.attributes.connection_limit, Some(5));
        assert_eq!(login.password.as_deref(), Some(password.as_str()));
    }

    h.clear_calls();
    h.reconcile(&h.user_roles, "shop", "app").await.unwrap();
    assert!(h.calls().is_empty());
}

#[tokio::test]
async fn test_duplicate_database_rejected() {
    let h = Harness::new();
    h.ready_database("shop", "orders").await;
    h.user_roles.insert(managed_user_role(
        "shop",
        "app",
        "app",
        None,
        &["orders", "orders"],
    ));

    let err = h.settle_user_role("shop", "app").await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(
        err.to_string(),
        "database shop/orders is listed in more than one privilege"
    );
    assert!(!h.role_exists("app-A"));
}

#[tokio::test]
async fn test_provided_login_follows_import_secret() {
    let h = Harness::new();
    h.ready_database("shop", "orders").await;
    h.secrets.insert(
        "shop",
        "imported",
        &[("USERNAME", "legacy"), ("PASSWORD", "pw-one")],
    );
    h.user_roles
        .insert(provided_user_role("shop", "app", "imported", "orders"));
    h.settle_user_role("shop", "app").await.unwrap();

    let status = h.user_roles.fetch("shop", "app").unwrap().status.unwrap();
    assert_eq!(status.postgres_role, "legacy");
    assert!(status.role_prefix.is_empty());
    let conn = h.secrets.data("shop", "app-orders").unwrap();
    assert_eq!(conn["LOGIN"], "legacy");
    assert_eq!(conn["PASSWORD"], "pw-one");
    assert!(
        h.server.lock().unwrap().roles["legacy"]
            .member_of
            .contains("orders-reader")
    );

    h.secrets.insert(
        "shop",
        "imported",
        &[("USERNAME", "legacy2"), ("PASSWORD", "pw-two")],
    );
    h.set_connections("legacy", 2);
    h.reconcile(&h.user_roles, "shop", "app").await.unwrap();

    let status = h.user_roles.fetch("shop", "app").unwrap().status.unwrap();
    assert_eq!(status.postgres_role, "legacy2");
    assert_eq!(status.old_postgres_roles, vec!["legacy".to_string()]);
    assert_eq!(h.secrets.data("shop", "app-orders").unwrap()["LOGIN"], "legacy2");
    assert!(h.role_exists("legacy"));

    h.set_connections("legacy", 0);
    h.reconcile(&h.user_roles, "shop", "app").await.unwrap();
    assert!(!h.role_exists("legacy"));

    let import = h.secrets.data("shop", "imported").unwrap();
    assert_eq!(import["USERNAME"], "legacy2");
    assert_eq!(import["PASSWORD"], "pw-two");
    assert_eq!(import.len(), 2);
}

#[tokio::test]
async fn test_database_deletion_waits_for_user_roles() {
    let h = Harness::new();
    ready_app(&h, None).await;
    h.databases.edit("shop", "orders", |db| {
        db.spec.wait_linked_resources_deletion = true;
        db.spec.drop_on_delete = true;
    });
    h.databases.delete("shop", "orders");

    let err = h
        .reconcile(&h.databases, "shop", "orders")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LinkedResource(_)));
    assert_eq!(
        err.to_string(),
        "PostgresDatabase shop/orders is still referenced by PostgresUserRole shop/app"
    );
    assert!(h.server.lock().unwrap().databases.contains_key("orders"));

    h.user_roles.delete("shop", "app");
    h.reconcile(&h.user_roles, "shop", "app").await.unwrap();
    assert!(h.user_roles.fetch("shop", "app").is_none());
    assert!(!h.role_exists("app-A"));

    h.reconcile(&h.databases, "shop", "orders").await.unwrap();
    assert!(h.databases.fetch("shop", "orders").is_none());
    assert!(!h.server.lock().unwrap().databases.contains_key("orders"));
}

#[tokio::test]
async fn test_deletion_waits_for_draining_logins() {
    let h = Harness::new();
    ready_app(&h, Some("1h")).await;
    age_password(&h, "app");
    h.set_connections("app-A", 1);
    h.reconcile(&h.user_roles, "shop", "app").await.unwrap();

    h.user_roles.delete("shop", "app");
    let err = h.reconcile(&h.user_roles, "shop", "app").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "waiting for connections of old logins to close: app-A"
    );
    assert!(h.user_roles.fetch("shop", "app").is_some());

    h.set_connections("app-A", 0);
    h.reconcile(&h.user_roles, "shop", "app").await.unwrap();
    assert!(h.user_roles.fetch("shop", "app").is_none());
    assert!(!h.role_exists("app-A"));
    assert!(!h.role_exists("app-B"));
}
