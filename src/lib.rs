pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use config::OperatorConfig;
pub use controller::{
    BackoffConfig, Context, DATABASE_FINALIZER, ENGINE_FINALIZER, Error, ManagedResource,
    PUBLICATION_FINALIZER, Result, USER_ROLE_FINALIZER, error_policy, reconcile,
};
pub use crd::{PostgresDatabase, PostgresEngine, PostgresPublication, PostgresUserRole};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::Controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Drive a controller stream to completion, logging each result
async fn drive<K: ManagedResource>(controller: Controller<K>, ctx: Arc<Context>) {
    controller
        .run(reconcile::<K>, error_policy::<K>, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled {}: {}", K::KIND, obj.name);
                }
                Err(e) => {
                    // Watch events for a record that was just deleted are expected
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ObjectNotFound(_)
                    );
                    if is_not_found {
                        tracing::debug!("{} no longer exists: {:?}", K::KIND, e);
                    } else {
                        tracing::warn!("{} reconciliation error: {:?}", K::KIND, e);
                    }
                }
            }
        })
        .await;

    tracing::error!("{} controller stream ended unexpectedly", K::KIND);
}

/// Run the PostgresEngine controller with optional namespace scoping.
pub async fn run_engine_controller_scoped(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
) {
    tracing::info!(
        "Starting controller for PostgresEngine resources (scope: {})",
        namespace.unwrap_or("cluster-wide")
    );
    let engines: Api<PostgresEngine> = scoped_api(client, namespace);
    let watcher_config = WatcherConfig::default().any_semantic();

    drive(Controller::new(engines, watcher_config), ctx).await;
}

/// Run the PostgresDatabase controller with optional namespace scoping.
pub async fn run_database_controller_scoped(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
) {
    tracing::info!(
        "Starting controller for PostgresDatabase resources (scope: {})",
        namespace.unwrap_or("cluster-wide")
    );
    let databases: Api<PostgresDatabase> = scoped_api(client, namespace);
    let watcher_config = WatcherConfig::default().any_semantic();

    drive(Controller::new(databases, watcher_config), ctx).await;
}

/// Run the PostgresUserRole controller with optional namespace scoping.
///
/// Generated secrets are owned by their user role, so editing or deleting one
/// triggers a reconcile that restores it.
pub async fn run_user_role_controller_scoped(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
) {
    tracing::info!(
        "Starting controller for PostgresUserRole resources (scope: {})",
        namespace.unwrap_or("cluster-wide")
    );
    let user_roles: Api<PostgresUserRole> = scoped_api(client.clone(), namespace);
    let secrets: Api<Secret> = scoped_api(client, namespace);
    let watcher_config = WatcherConfig::default().any_semantic();

    let controller =
        Controller::new(user_roles, watcher_config.clone()).owns(secrets, watcher_config);
    drive(controller, ctx).await;
}

/// Run the PostgresPublication controller with optional namespace scoping.
pub async fn run_publication_controller_scoped(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
) {
    tracing::info!(
        "Starting controller for PostgresPublication resources (scope: {})",
        namespace.unwrap_or("cluster-wide")
    );
    let publications: Api<PostgresPublication> = scoped_api(client, namespace);
    let watcher_config = WatcherConfig::default().any_semantic();

    drive(Controller::new(publications, watcher_config), ctx).await;
}

/// Run all four controllers against one shared context until any of them ends.
pub async fn run_controllers(client: Client, ctx: Arc<Context>) {
    let namespace = ctx.config.watch_namespace.clone();
    let namespace = namespace.as_deref();

    tokio::select! {
        _ = run_engine_controller_scoped(client.clone(), ctx.clone(), namespace) => {}
        _ = run_database_controller_scoped(client.clone(), ctx.clone(), namespace) => {}
        _ = run_user_role_controller_scoped(client.clone(), ctx.clone(), namespace) => {}
        _ = run_publication_controller_scoped(client, ctx, namespace) => {}
    }
}
