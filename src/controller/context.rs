use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use kube::Client;

use crate::config::OperatorConfig;
use crate::controller::events::{EventPublisher, KubeEventPublisher};
use crate::controller::store::{KubeSecretStore, KubeStore, ResourceStore, SecretStore};
use crate::crd::{PostgresDatabase, PostgresEngine, PostgresPublication, PostgresUserRole};
use crate::health::HealthState;
use crate::resources::{Connector, EngineRegistry, PoolConnector};

/// Shared context for every controller
pub struct Context {
    pub engines: Arc<dyn ResourceStore<PostgresEngine>>,
    pub databases: Arc<dyn ResourceStore<PostgresDatabase>>,
    pub user_roles: Arc<dyn ResourceStore<PostgresUserRole>>,
    pub publications: Arc<dyn ResourceStore<PostgresPublication>>,
    pub secrets: Arc<dyn SecretStore>,
    /// Pooled engine connections
    pub registry: Arc<EngineRegistry>,
    pub events: Arc<dyn EventPublisher>,
    /// Health state for metrics (optional)
    pub health_state: Option<Arc<HealthState>>,
    pub config: OperatorConfig,
    /// Records with a detached publication mutation still running
    pub in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Context {
    pub fn new(
        client: Client,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        let scope = config.watch_namespace.clone();
        let events = Arc::new(KubeEventPublisher::new(
            client.clone(),
            Some(config.pod_name.clone()),
        ));
        let connector: Arc<dyn Connector> = Arc::new(PoolConnector);

        Self {
            engines: Arc::new(KubeStore::new(client.clone(), scope.clone())),
            databases: Arc::new(KubeStore::new(client.clone(), scope.clone())),
            user_roles: Arc::new(KubeStore::new(client.clone(), scope.clone())),
            publications: Arc::new(KubeStore::new(client.clone(), scope)),
            secrets: Arc::new(KubeSecretStore::new(client)),
            registry: Arc::new(EngineRegistry::new(connector)),
            events,
            health_state,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Assemble a context from explicit parts (used by tests)
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        engines: Arc<dyn ResourceStore<PostgresEngine>>,
        databases: Arc<dyn ResourceStore<PostgresDatabase>>,
        user_roles: Arc<dyn ResourceStore<PostgresUserRole>>,
        publications: Arc<dyn ResourceStore<PostgresPublication>>,
        secrets: Arc<dyn SecretStore>,
        connector: Arc<dyn Connector>,
        events: Arc<dyn EventPublisher>,
        health_state: Option<Arc<HealthState>>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            engines,
            databases,
            user_roles,
            publications,
            secrets,
            registry: Arc::new(EngineRegistry::new(connector)),
            events,
            health_state,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}
