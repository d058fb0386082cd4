//! Back-reference checks run before a referenced record may be deleted

use kube::{Resource, ResourceExt};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::crd::ObjectKey;

fn own_key<K: Resource>(obj: &K) -> ObjectKey {
    ObjectKey::new(obj.namespace().unwrap_or_default(), obj.name_any())
}

/// PostgresUserRoles with a privilege on `database`
pub async fn user_roles_referencing(ctx: &Context, database: &ObjectKey) -> Result<Vec<ObjectKey>> {
    let mut refs: Vec<ObjectKey> = ctx
        .user_roles
        .list()
        .await?
        .iter()
        .filter(|role| {
            let ns = role.namespace().unwrap_or_default();
            role.spec
                .privileges
                .iter()
                .any(|p| p.database.resolve(&ns) == *database)
        })
        .map(own_key)
        .collect();
    refs.sort();
    Ok(refs)
}

/// PostgresPublications living in `database`
pub async fn publications_referencing(
    ctx: &Context,
    database: &ObjectKey,
) -> Result<Vec<ObjectKey>> {
    let mut refs: Vec<ObjectKey> = ctx
        .publications
        .list()
        .await?
        .iter()
        .filter(|publication| {
            let ns = publication.namespace().unwrap_or_default();
            publication.spec.database.resolve(&ns) == *database
        })
        .map(own_key)
        .collect();
    refs.sort();
    Ok(refs)
}

/// PostgresDatabases hosted by `engine`
pub async fn databases_referencing(ctx: &Context, engine: &ObjectKey) -> Result<Vec<ObjectKey>> {
    let mut refs: Vec<ObjectKey> = ctx
        .databases
        .list()
        .await?
        .iter()
        .filter(|database| {
            let ns = database.namespace().unwrap_or_default();
            database.spec.engine_configuration.resolve(&ns) == *engine
        })
        .map(own_key)
        .collect();
    refs.sort();
    Ok(refs)
}

fn blocked(kind: &str, target: &ObjectKey, referrer_kind: &str, referrer: &ObjectKey) -> Error {
    Error::LinkedResource(format!(
        "{} {} is still referenced by {} {}",
        kind, target, referrer_kind, referrer
    ))
}

/// Fail when any user role or publication still references the database
pub async fn ensure_database_unreferenced(ctx: &Context, database: &ObjectKey) -> Result<()> {
    if let Some(role) = user_roles_referencing(ctx, database).await?.first() {
        return Err(blocked("PostgresDatabase", database, "PostgresUserRole", role));
    }
    if let Some(publication) = publications_referencing(ctx, database).await?.first() {
        return Err(blocked(
            "PostgresDatabase",
            database,
            "PostgresPublication",
            publication,
        ));
    }
    Ok(())
}

/// Fail when any database still references the engine
pub async fn ensure_engine_unreferenced(ctx: &Context, engine: &ObjectKey) -> Result<()> {
    if let Some(database) = databases_referencing(ctx, engine).await?.first() {
        return Err(blocked("PostgresEngine", engine, "PostgresDatabase", database));
    }
    Ok(())
}
