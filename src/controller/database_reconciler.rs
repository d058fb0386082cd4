//! Reconciler for PostgresDatabase resources
//!
//! This reconciler provisions a database, its owner/reader/writer roles, and
//! the listed schemas and extensions inside a PostgresEngine.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, info, warn};

use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::link_guard::ensure_database_unreferenced;
use crate::controller::reconciler::{ManagedResource, RESYNC_INTERVAL};
use crate::controller::resolve::{connect, engine_key, find_engine, resolve_engine};
use crate::controller::roles::{check_identifiers, ensure_role};
use crate::controller::schemas::{sync_extensions, sync_schemas};
use crate::controller::store::ResourceStore;
use crate::crd::{DatabasePhase, DatabaseRoles, ObjectKey, PostgresDatabase};
use crate::resources::PgEngine;

/// Finalizer for PostgresDatabase resources
pub const DATABASE_FINALIZER: &str =
    "postgresdatabase.postgres-operator.smoketurner.com/finalizer";

fn object_key(db: &PostgresDatabase) -> ObjectKey {
    ObjectKey::new(db.namespace().unwrap_or_default(), db.name_any())
}

fn engine_ref(db: &PostgresDatabase) -> ObjectKey {
    db.spec
        .engine_configuration
        .resolve(&db.namespace().unwrap_or_default())
}

#[async_trait]
impl ManagedResource for PostgresDatabase {
    type Phase = DatabasePhase;

    const KIND: &'static str = "PostgresDatabase";
    const FINALIZER: &'static str = DATABASE_FINALIZER;

    fn store(ctx: &Context) -> &Arc<dyn ResourceStore<Self>> {
        &ctx.databases
    }

    fn phase(&self) -> DatabasePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    fn set_phase(&mut self, phase: DatabasePhase, message: Option<String>) {
        let status = self.status.get_or_insert_with(Default::default);
        status.phase = phase;
        status.message = message;
    }

    async fn apply(&mut self, ctx: &Arc<Context>) -> Result<Action> {
        provision_database(self, ctx).await?;
        Ok(Action::requeue(RESYNC_INTERVAL))
    }

    async fn cleanup(&mut self, ctx: &Arc<Context>) -> Result<()> {
        handle_deletion(self, ctx).await
    }
}

/// Provision the roles, the database, schemas and extensions
async fn provision_database(db: &mut PostgresDatabase, ctx: &Context) -> Result<()> {
    let desired = DatabaseRoles {
        owner: db.spec.owner_role(),
        reader: db.spec.reader_role(),
        writer: db.spec.writer_role(),
    };
    let database = db.spec.database.clone();

    // Reject names the server would truncate before touching anything
    let mut identifiers: Vec<(&'static str, &str)> = vec![
        ("database", database.as_str()),
        ("role", desired.owner.as_str()),
        ("role", desired.reader.as_str()),
        ("role", desired.writer.as_str()),
    ];
    identifiers.extend(db.spec.schemas.list.iter().map(|s| ("schema", s.as_str())));
    check_identifiers(&identifiers)?;

    let engine_ref = engine_ref(db);
    let engine = resolve_engine(ctx, &engine_ref).await?;
    let admin = connect(ctx, &engine_ref, &engine, engine.spec.default_database()).await?;

    let mut status = db.status.clone().unwrap_or_default();
    info!(database = %database, engine = %engine_ref, "Provisioning database");

    let operating_role = admin.operating_role().await?;
    let memberships = admin.role_memberships(&operating_role).await?;
    let with_admin = engine.spec.allow_grant_admin_option;

    status.roles = DatabaseRoles {
        owner: ensure_role(
            admin.as_ref(),
            &desired.owner,
            Some(status.roles.owner.as_str()),
            &operating_role,
            &memberships,
            with_admin,
        )
        .await?,
        reader: ensure_role(
            admin.as_ref(),
            &desired.reader,
            Some(status.roles.reader.as_str()),
            &operating_role,
            &memberships,
            with_admin,
        )
        .await?,
        writer: ensure_role(
            admin.as_ref(),
            &desired.writer,
            Some(status.roles.writer.as_str()),
            &operating_role,
            &memberships,
            with_admin,
        )
        .await?,
    };
    // Persist role progress even if the database step fails below
    db.status = Some(status.clone());

    ensure_database(ctx, &engine_ref, admin.as_ref(), &status.database, &database, &status.roles)
        .await?;
    status.database = database.clone();
    db.status = Some(status.clone());

    let handle = connect(ctx, &engine_ref, &engine, &database).await?;
    status.schemas = sync_schemas(
        handle.as_ref(),
        &db.spec.schemas,
        &status.schemas,
        &status.roles,
    )
    .await?;
    db.status = Some(status.clone());

    status.extensions =
        sync_extensions(handle.as_ref(), &db.spec.extensions, &status.extensions).await?;
    db.status = Some(status);

    Ok(())
}

/// Create, rename or re-own the physical database
async fn ensure_database(
    ctx: &Context,
    engine_ref: &ObjectKey,
    admin: &dyn PgEngine,
    applied: &str,
    desired: &str,
    roles: &DatabaseRoles,
) -> Result<()> {
    let key = engine_key(engine_ref);
    let mut owner = admin.database_owner(desired).await?;

    if owner.is_none()
        && !applied.is_empty()
        && applied != desired
        && admin.database_owner(applied).await?.is_some()
    {
        info!(from = %applied, to = %desired, "Renaming database");
        // A database cannot be renamed while pooled connections are open on it
        ctx.registry.close_database(&key, applied).await;
        admin.rename_database(applied, desired).await?;
        ctx.registry.close_database(&key, applied).await;
        owner = admin.database_owner(desired).await?;
    }

    match owner {
        None => {
            info!(database = %desired, owner = %roles.owner, "Creating database");
            admin.create_database(desired, &roles.owner).await?;
        }
        Some(current) if current != roles.owner => {
            info!(database = %desired, from = %current, to = %roles.owner, "Changing database owner");
            admin.alter_database_owner(desired, &roles.owner).await?;
        }
        Some(_) => debug!(database = %desired, "Database exists"),
    }

    admin.grant_database_connect(desired, &roles.reader).await?;
    admin.grant_database_connect(desired, &roles.writer).await?;
    Ok(())
}

/// Handle deletion of a PostgresDatabase resource
async fn handle_deletion(db: &mut PostgresDatabase, ctx: &Context) -> Result<()> {
    let key = object_key(db);

    if db.spec.wait_linked_resources_deletion {
        ensure_database_unreferenced(ctx, &key).await?;
    }

    let status = db.status.clone().unwrap_or_default();
    let engine_ref = engine_ref(db);
    let Some(engine) = find_engine(ctx, &engine_ref).await? else {
        warn!(database = %key, engine = %engine_ref, "Referenced engine not found, skipping database cleanup");
        return Ok(());
    };

    if status.database.is_empty() {
        debug!(database = %key, "Database was never created");
        return Ok(());
    }
    ctx.registry
        .close_database(&engine_key(&engine_ref), &status.database)
        .await;

    if !db.spec.drop_on_delete {
        return Ok(());
    }

    let admin = connect(ctx, &engine_ref, &engine, engine.spec.default_database()).await?;
    info!(database = %status.database, "Dropping database");
    admin.drop_database(&status.database).await?;

    for role in [&status.roles.reader, &status.roles.writer, &status.roles.owner] {
        if !role.is_empty() {
            admin.drop_role(role).await?;
        }
    }
    Ok(())
}
