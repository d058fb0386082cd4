//! Resolution of the records a reconcile depends on

use std::sync::Arc;

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::crd::{DatabasePhase, EnginePhase, ObjectKey, PostgresDatabase, PostgresEngine};
use crate::resources::secret::{ENGINE_PASSWORD_KEY, ENGINE_USER_KEY, secret_value};
use crate::resources::{ConnectionParams, PgEngine};

/// Registry key of an engine
pub fn engine_key(key: &ObjectKey) -> String {
    key.to_string()
}

/// Fetch a PostgresEngine, `None` when it does not exist
pub async fn find_engine(ctx: &Context, key: &ObjectKey) -> Result<Option<PostgresEngine>> {
    ctx.engines.get(&key.namespace, &key.name).await
}

/// Fetch a PostgresEngine that has been validated
pub async fn resolve_engine(ctx: &Context, key: &ObjectKey) -> Result<PostgresEngine> {
    let engine = find_engine(ctx, key)
        .await?
        .ok_or_else(|| Error::NotFound(format!("PostgresEngine {} not found", key)))?;

    let phase = engine.status.as_ref().map(|s| s.phase).unwrap_or_default();
    if phase != EnginePhase::Validated {
        return Err(Error::NotFound(format!(
            "PostgresEngine {} is not validated (phase {})",
            key, phase
        )));
    }
    Ok(engine)
}

pub async fn find_database(ctx: &Context, key: &ObjectKey) -> Result<Option<PostgresDatabase>> {
    ctx.databases.get(&key.namespace, &key.name).await
}

/// Fetch a PostgresDatabase that has been created
pub async fn resolve_database(ctx: &Context, key: &ObjectKey) -> Result<PostgresDatabase> {
    let database = find_database(ctx, key)
        .await?
        .ok_or_else(|| Error::NotFound(format!("PostgresDatabase {} not found", key)))?;

    let status = database.status.clone().unwrap_or_default();
    if status.phase != DatabasePhase::Created || status.database.is_empty() {
        return Err(Error::NotFound(format!(
            "PostgresDatabase {} is not created yet (phase {})",
            key, status.phase
        )));
    }
    Ok(database)
}

/// Connection parameters for one database of an engine, using the engine's secret
pub async fn connection_params(
    ctx: &Context,
    engine: &PostgresEngine,
    database: &str,
) -> Result<ConnectionParams> {
    let namespace = engine
        .metadata
        .namespace
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let secret_name = &engine.spec.secret_name;

    let secret = ctx
        .secrets
        .get(namespace, secret_name)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!("secret {}/{} not found", namespace, secret_name))
        })?;

    let missing_key =
        |key: &str| Error::NotFound(format!("secret {}/{} has no key {}", namespace, secret_name, key));
    let user = secret_value(&secret, ENGINE_USER_KEY).ok_or_else(|| missing_key(ENGINE_USER_KEY))?;
    let password =
        secret_value(&secret, ENGINE_PASSWORD_KEY).ok_or_else(|| missing_key(ENGINE_PASSWORD_KEY))?;

    Ok(ConnectionParams {
        host: engine.spec.host.clone(),
        port: engine.spec.port(),
        user,
        password,
        database: database.to_string(),
        uri_args: engine.spec.uri_args().to_string(),
    })
}

/// Pooled handle to `database` on `engine`
pub async fn connect(
    ctx: &Context,
    engine_ref: &ObjectKey,
    engine: &PostgresEngine,
    database: &str,
) -> Result<Arc<dyn PgEngine>> {
    let params = connection_params(ctx, engine, database).await?;
    Ok(ctx.registry.acquire(&engine_key(engine_ref), &params).await?)
}
