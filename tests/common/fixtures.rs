//! Record builders and a test harness wiring the fakes into a `Context`
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let h = Harness::new();
//! h.ready_database("shop", "orders").await;
//! h.user_roles.insert(managed_user_role("shop", "app", "app", Some("1h"), &["orders"]));
//! h.settle_user_role("shop", "app").await.unwrap();
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::Resource;
use kube::runtime::controller::Action;
use serde_json::json;

use postgres_provisioner::config::OperatorConfig;
use postgres_provisioner::controller::error::Result;
use postgres_provisioner::controller::{Context, ManagedResource, reconcile};
use postgres_provisioner::crd::{
    DatabasePhase, EnginePhase, PostgresDatabase, PostgresEngine, PostgresPublication,
    PostgresUserRole,
};
use postgres_provisioner::health::HealthState;

use super::fakes::{
    FakeConnector, FakeServer, MemorySecrets, MemoryStore, RecordingEvents, SharedServer,
};

pub const ENGINE_NAME: &str = "pg";
pub const ENGINE_SECRET: &str = "pg-admin";

// =============================================================================
// Records
// =============================================================================

pub fn engine(namespace: &str, name: &str) -> PostgresEngine {
    serde_json::from_value(json!({
        "apiVersion": "postgres-operator.smoketurner.com/v1alpha1",
        "kind": "PostgresEngine",
        "metadata": {"name": name, "namespace": namespace, "uid": format!("uid-{}", name)},
        "spec": {
            "host": "db.internal",
            "secretName": ENGINE_SECRET,
            "userConnections": {
                "bouncerConnection": {"host": "bouncer.internal", "port": 6432, "uriArgs": "sslmode=disable"}
            }
        }
    }))
    .unwrap()
}

pub fn database(namespace: &str, name: &str, database: &str) -> PostgresDatabase {
    serde_json::from_value(json!({
        "apiVersion": "postgres-operator.smoketurner.com/v1alpha1",
        "kind": "PostgresDatabase",
        "metadata": {"name": name, "namespace": namespace, "uid": format!("uid-{}", name)},
        "spec": {
            "database": database,
            "engineConfiguration": {"name": ENGINE_NAME}
        }
    }))
    .unwrap()
}

/// A MANAGED user role with a WRITER privilege on each listed database record
pub fn managed_user_role(
    namespace: &str,
    name: &str,
    prefix: &str,
    rotation: Option<&str>,
    databases: &[&str],
) -> PostgresUserRole {
    let privileges: Vec<serde_json::Value> = databases
        .iter()
        .map(|db| {
            json!({
                "database": {"name": db},
                "privilege": "WRITER",
                "generatedSecretName": format!("{}-{}", name, db)
            })
        })
        .collect();
    let mut spec = json!({
        "mode": "MANAGED",
        "rolePrefix": prefix,
        "workGeneratedSecretName": format!("{}-work", name),
        "privileges": privileges
    });
    if let Some(rotation) = rotation {
        spec["userPasswordRotationDuration"] = json!(rotation);
    }
    serde_json::from_value(json!({
        "apiVersion": "postgres-operator.smoketurner.com/v1alpha1",
        "kind": "PostgresUserRole",
        "metadata": {"name": name, "namespace": namespace, "uid": format!("uid-{}", name)},
        "spec": spec
    }))
    .unwrap()
}

/// A PROVIDED user role reading its login from `import_secret`
pub fn provided_user_role(
    namespace: &str,
    name: &str,
    import_secret: &str,
    database: &str,
) -> PostgresUserRole {
    serde_json::from_value(json!({
        "apiVersion": "postgres-operator.smoketurner.com/v1alpha1",
        "kind": "PostgresUserRole",
        "metadata": {"name": name, "namespace": namespace, "uid": format!("uid-{}", name)},
        "spec": {
            "mode": "PROVIDED",
            "importSecretName": import_secret,
            "workGeneratedSecretName": format!("{}-work", name),
            "privileges": [{
                "database": {"name": database},
                "privilege": "READER",
                "generatedSecretName": format!("{}-{}", name, database)
            }]
        }
    }))
    .unwrap()
}

/// An all-tables publication in `database`
pub fn publication(namespace: &str, name: &str, publication: &str, database: &str) -> PostgresPublication {
    serde_json::from_value(json!({
        "apiVersion": "postgres-operator.smoketurner.com/v1alpha1",
        "kind": "PostgresPublication",
        "metadata": {"name": name, "namespace": namespace, "uid": format!("uid-{}", name)},
        "spec": {
            "name": publication,
            "database": {"name": database},
            "allTables": true
        }
    }))
    .unwrap()
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub engines: Arc<MemoryStore<PostgresEngine>>,
    pub databases: Arc<MemoryStore<PostgresDatabase>>,
    pub user_roles: Arc<MemoryStore<PostgresUserRole>>,
    pub publications: Arc<MemoryStore<PostgresPublication>>,
    pub secrets: Arc<MemorySecrets>,
    pub server: SharedServer,
    pub connector: Arc<FakeConnector>,
    pub events: Arc<RecordingEvents>,
    pub health: Arc<HealthState>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OperatorConfig::default())
    }

    pub fn with_config(config: OperatorConfig) -> Self {
        let engines = Arc::new(MemoryStore::new());
        let databases = Arc::new(MemoryStore::new());
        let user_roles = Arc::new(MemoryStore::new());
        let publications = Arc::new(MemoryStore::new());
        let secrets = Arc::new(MemorySecrets::new());
        let server: SharedServer = Arc::new(Mutex::new(FakeServer::default()));
        let connector = Arc::new(FakeConnector::new(server.clone()));
        let events = Arc::new(RecordingEvents::default());
        let health = Arc::new(HealthState::new());

        let ctx = Arc::new(Context::from_parts(
            engines.clone(),
            databases.clone(),
            user_roles.clone(),
            publications.clone(),
            secrets.clone(),
            connector.clone(),
            events.clone(),
            Some(health.clone()),
            config,
        ));

        Self {
            engines,
            databases,
            user_roles,
            publications,
            secrets,
            server,
            connector,
            events,
            health,
            ctx,
        }
    }

    /// One reconcile pass over the stored revision of a record
    pub async fn reconcile<K: ManagedResource>(
        &self,
        store: &MemoryStore<K>,
        namespace: &str,
        name: &str,
    ) -> Result<Action> {
        let obj = store.fetch(namespace, name).expect("record exists");
        reconcile(Arc::new(obj), self.ctx.clone()).await
    }

    /// Reconcile until defaults and finalizer are persisted, then once more
    pub async fn settle<K: ManagedResource>(
        &self,
        store: &MemoryStore<K>,
        namespace: &str,
        name: &str,
    ) -> Result<Action> {
        let needs_metadata = store
            .fetch(namespace, name)
            .map(|obj| !obj.meta().finalizers.iter().flatten().any(|f| f == K::FINALIZER))
            .unwrap_or(false);
        if needs_metadata {
            self.reconcile(store, namespace, name).await?;
        }
        self.reconcile(store, namespace, name).await
    }

    pub async fn settle_user_role(&self, namespace: &str, name: &str) -> Result<Action> {
        self.settle(&self.user_roles, namespace, name).await
    }

    /// Insert the engine record and its secret, and validate it
    pub async fn ready_engine(&self, namespace: &str) {
        self.secrets.insert(
            namespace,
            ENGINE_SECRET,
            &[("user", "postgres"), ("password", "admin-secret")],
        );
        self.engines.insert(engine(namespace, ENGINE_NAME));
        self.settle(&self.engines, namespace, ENGINE_NAME)
            .await
            .unwrap();
        let phase = self
            .engines
            .fetch(namespace, ENGINE_NAME)
            .and_then(|e| e.status)
            .map(|s| s.phase);
        assert_eq!(phase, Some(EnginePhase::Validated));
    }

    /// Validate the engine and create the database record `name` (physical name = `name`)
    pub async fn ready_database(&self, namespace: &str, name: &str) {
        if self.engines.fetch(namespace, ENGINE_NAME).is_none() {
            self.ready_engine(namespace).await;
        }
        self.databases.insert(database(namespace, name, name));
        self.settle(&self.databases, namespace, name).await.unwrap();
        let phase = self
            .databases
            .fetch(namespace, name)
            .and_then(|d| d.status)
            .map(|s| s.phase);
        assert_eq!(phase, Some(DatabasePhase::Created));
    }

    /// Mutating calls recorded by the fake server so far
    pub fn calls(&self) -> Vec<String> {
        self.server.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.server.lock().unwrap().calls.clear();
    }

    pub fn set_connections(&self, role: &str, count: i64) {
        self.server
            .lock()
            .unwrap()
            .connections
            .insert(role.to_string(), count);
    }

    pub fn role_exists(&self, role: &str) -> bool {
        self.server.lock().unwrap().roles.contains_key(role)
    }
}

/// Operator configuration with a short publication timeout
pub fn short_timeout_config(timeout: Duration) -> OperatorConfig {
    OperatorConfig {
        publication_timeout: timeout,
        ..OperatorConfig::default()
    }
}
