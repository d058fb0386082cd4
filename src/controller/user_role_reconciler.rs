//! Reconciler for PostgresUserRole resources
//!
//! Resolves the login (generated and rotated, or imported), joins it to the
//! group roles of every referenced database, publishes connection secrets and
//! drops old logins once they have drained.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, info, warn};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::reconciler::{ManagedResource, RESYNC_INTERVAL};
use crate::controller::resolve::{connect, find_database, find_engine, resolve_database, resolve_engine};
use crate::controller::rotation::{
    Credentials, drain_old_logins, managed_login, next_rotation_in, provided_login,
};
use crate::controller::store::ResourceStore;
use crate::crd::{
    AppliedMembership, ConnectionType, ObjectKey, PostgresDatabase, PostgresEngine,
    PostgresUserRole, PostgresUserRoleSpec, PrivilegeLevel, UserRoleMode, UserRolePhase,
    UserRolePrivilege,
};
use crate::resources::PgEngine;
use crate::resources::secret::{
    connection_secret_data, generate_secret, secret_matches, work_secret_data,
};

/// Finalizer for PostgresUserRole resources
pub const USER_ROLE_FINALIZER: &str =
    "postgresuserrole.postgres-operator.smoketurner.com/finalizer";

/// A privilege together with the database record it points at
struct ResolvedPrivilege<'a> {
    privilege: &'a UserRolePrivilege,
    database: PostgresDatabase,
}

impl ResolvedPrivilege<'_> {
    /// Physical database name
    fn database_name(&self) -> String {
        self.database
            .status
            .as_ref()
            .map(|s| s.database.clone())
            .unwrap_or_default()
    }

    fn group_role(&self) -> String {
        let roles = self
            .database
            .status
            .as_ref()
            .map(|s| s.roles.clone())
            .unwrap_or_default();
        match self.privilege.privilege {
            PrivilegeLevel::Owner => roles.owner,
            PrivilegeLevel::Reader => roles.reader,
            PrivilegeLevel::Writer => roles.writer,
        }
    }
}

/// Reject privileges naming the same database twice
pub fn check_duplicate_databases(namespace: &str, privileges: &[UserRolePrivilege]) -> Result<()> {
    let mut seen = HashSet::new();
    for privilege in privileges {
        let key = privilege.database.resolve(namespace);
        if !seen.insert(key.clone()) {
            return Err(Error::Validation(format!(
                "database {} is listed in more than one privilege",
                key
            )));
        }
    }
    Ok(())
}

fn engine_ref_of(database: &PostgresDatabase) -> ObjectKey {
    database
        .spec
        .engine_configuration
        .resolve(&database.namespace().unwrap_or_default())
}

#[async_trait]
impl ManagedResource for PostgresUserRole {
    type Phase = UserRolePhase;

    const KIND: &'static str = "PostgresUserRole";
    const FINALIZER: &'static str = USER_ROLE_FINALIZER;

    fn store(ctx: &Context) -> &Arc<dyn ResourceStore<Self>> {
        &ctx.user_roles
    }

    fn phase(&self) -> UserRolePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    fn set_phase(&mut self, phase: UserRolePhase, message: Option<String>) {
        let status = self.status.get_or_insert_with(Default::default);
        status.phase = phase;
        status.message = message;
    }

    async fn apply(&mut self, ctx: &Arc<Context>) -> Result<Action> {
        reconcile_user_role(self, ctx).await
    }

    async fn cleanup(&mut self, ctx: &Arc<Context>) -> Result<()> {
        handle_deletion(self, ctx).await
    }
}

async fn reconcile_user_role(role: &mut PostgresUserRole, ctx: &Context) -> Result<Action> {
    let namespace = role
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = role.name_any();
    let spec = role.spec.clone();

    if spec.privileges.is_empty() {
        return Err(Error::Validation(
            "at least one privilege is required".to_string(),
        ));
    }
    check_duplicate_databases(&namespace, &spec.privileges)?;

    // Every privilege must resolve to a created database on one engine
    let mut resolved = Vec::with_capacity(spec.privileges.len());
    for privilege in &spec.privileges {
        let key = privilege.database.resolve(&namespace);
        let database = resolve_database(ctx, &key).await?;
        resolved.push(ResolvedPrivilege {
            privilege,
            database,
        });
    }
    let mut engine_refs = resolved.iter().map(|r| engine_ref_of(&r.database));
    let engine_ref = engine_refs
        .next()
        .ok_or_else(|| Error::Validation("at least one privilege is required".to_string()))?;
    if let Some(other) = engine_refs.find(|e| *e != engine_ref) {
        return Err(Error::Validation(format!(
            "privileges reference databases on different engines ({} and {})",
            engine_ref, other
        )));
    }
    let engine = resolve_engine(ctx, &engine_ref).await?;
    let admin = connect(ctx, &engine_ref, &engine, engine.spec.default_database()).await?;

    let mut status = role.status.clone().unwrap_or_default();
    let now = Utc::now();

    drain_old_logins(admin.as_ref(), &mut status).await?;
    role.status = Some(status.clone());

    let credentials = match spec.mode {
        UserRoleMode::Managed => {
            let stored = published_secrets(ctx, &namespace, &spec).await?;
            managed_login(admin.as_ref(), &spec, &mut status, &stored, now).await
        }
        UserRoleMode::Provided => {
            let secret_name = spec
                .import_secret_name
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    Error::Validation("importSecretName is required in PROVIDED mode".to_string())
                })?;
            let import = ctx
                .secrets
                .get(&namespace, secret_name)
                .await?
                .ok_or_else(|| {
                    Error::NotFound(format!("import secret {}/{} not found", namespace, secret_name))
                })?;
            provided_login(admin.as_ref(), &spec, &mut status, &import, now).await
        }
    };
    let credentials = match credentials {
        Ok(credentials) => credentials,
        Err(e) => {
            role.status = Some(status);
            return Err(e);
        }
    };
    publish_work_secret(ctx, role, &credentials).await?;
    role.status = Some(status.clone());

    if credentials.rotated
        && let Some(ref state) = ctx.health_state
    {
        state.metrics.record_rotation(&namespace, &name);
    }

    status.postgres_group_roles =
        apply_memberships(admin.as_ref(), &credentials.login, &resolved, &status.postgres_group_roles)
            .await?;
    role.status = Some(status.clone());

    for privilege in &resolved {
        publish_connection_secret(ctx, role, &engine, privilege, &credentials).await?;
    }

    if let Some(ref state) = ctx.health_state {
        state
            .metrics
            .set_draining_logins(&namespace, &name, status.old_postgres_roles.len() as i64);
    }

    let requeue = if !status.old_postgres_roles.is_empty() {
        ctx.config.drain_recheck
    } else {
        next_rotation_in(&spec, &status, Utc::now())
            .map(|d| d.clamp(Duration::from_secs(1), RESYNC_INTERVAL))
            .unwrap_or(RESYNC_INTERVAL)
    };
    role.status = Some(status);
    Ok(Action::requeue(requeue))
}

/// Live secrets that may hold the generated password, work secret first
async fn published_secrets(
    ctx: &Context,
    namespace: &str,
    spec: &PostgresUserRoleSpec,
) -> Result<Vec<Secret>> {
    let names = std::iter::once(&spec.work_generated_secret_name)
        .chain(spec.privileges.iter().map(|p| &p.generated_secret_name));
    let mut secrets = Vec::new();
    for name in names {
        if let Some(secret) = ctx.secrets.get(namespace, name).await? {
            secrets.push(secret);
        }
    }
    Ok(secrets)
}

/// Join `login` to the desired group roles and revoke memberships that were removed
async fn apply_memberships(
    engine: &dyn PgEngine,
    login: &str,
    privileges: &[ResolvedPrivilege<'_>],
    applied: &[AppliedMembership],
) -> Result<Vec<AppliedMembership>> {
    let mut desired: Vec<AppliedMembership> = privileges
        .iter()
        .map(|p| AppliedMembership {
            database: p.database_name(),
            group_role: p.group_role(),
        })
        .collect();
    desired.sort();

    let held = engine.role_memberships(login).await?;
    let settings = engine.role_database_settings(login).await?;

    for membership in applied.iter().filter(|m| !desired.contains(m)) {
        info!(login = %login, group = %membership.group_role, database = %membership.database, "Revoking membership");
        if held.contains(&membership.group_role) {
            engine.revoke_role(&membership.group_role, login).await?;
        }
        if settings.iter().any(|s| s.database == membership.database) {
            engine
                .reset_role_on_database(login, &membership.database)
                .await?;
        }
    }

    for membership in &desired {
        if !held.contains(&membership.group_role) {
            debug!(login = %login, group = %membership.group_role, "Granting membership");
            engine.grant_role(&membership.group_role, login, false).await?;
        }
        let current = settings
            .iter()
            .find(|s| s.database == membership.database)
            .map(|s| s.role.as_str());
        if current != Some(membership.group_role.as_str()) {
            engine
                .set_role_on_database(login, &membership.database, &membership.group_role)
                .await?;
        }
    }

    Ok(desired)
}

async fn publish_work_secret(
    ctx: &Context,
    role: &PostgresUserRole,
    credentials: &Credentials,
) -> Result<()> {
    let namespace = role.namespace().unwrap_or_default();
    let name = &role.spec.work_generated_secret_name;
    let data = work_secret_data(&credentials.login, &credentials.password);

    let live = ctx.secrets.get(&namespace, name).await?;
    if !secret_matches(live.as_ref(), &data) {
        info!(secret = %name, "Writing work secret");
        ctx.secrets.apply(&generate_secret(role, name, &data)).await?;
    }
    Ok(())
}

async fn publish_connection_secret(
    ctx: &Context,
    role: &PostgresUserRole,
    engine: &PostgresEngine,
    privilege: &ResolvedPrivilege<'_>,
    credentials: &Credentials,
) -> Result<()> {
    let namespace = role.namespace().unwrap_or_default();
    let spec = privilege.privilege;
    let connection = match spec.connection_type {
        ConnectionType::Primary => engine.spec.primary_connection(),
        ConnectionType::Bouncer => engine.spec.bouncer_connection().cloned().ok_or_else(|| {
            Error::Validation(format!(
                "engine {} has no bouncer connection",
                engine.name_any()
            ))
        })?,
    };

    let data = connection_secret_data(
        &credentials.login,
        &credentials.password,
        &privilege.database_name(),
        &connection,
        &spec.extra_connection_url_parameters,
    );
    let live = ctx
        .secrets
        .get(&namespace, &spec.generated_secret_name)
        .await?;
    if !secret_matches(live.as_ref(), &data) {
        info!(secret = %spec.generated_secret_name, "Writing connection secret");
        ctx.secrets
            .apply(&generate_secret(role, &spec.generated_secret_name, &data))
            .await?;
    }
    Ok(())
}

/// Handle deletion of a PostgresUserRole resource
///
/// Waits while a drained login still has connections, then drops every login.
async fn handle_deletion(role: &mut PostgresUserRole, ctx: &Context) -> Result<()> {
    let namespace = role.namespace().unwrap_or_default();
    let mut status = role.status.clone().unwrap_or_default();
    if status.postgres_role.is_empty() && status.old_postgres_roles.is_empty() {
        return Ok(());
    }

    // The engine is found through any database that still exists
    let mut engine_ref = None;
    for privilege in &role.spec.privileges {
        let key = privilege.database.resolve(&namespace);
        if let Some(database) = find_database(ctx, &key).await? {
            engine_ref = Some(engine_ref_of(&database));
            break;
        }
    }
    let Some(engine_ref) = engine_ref else {
        warn!(role = %role.name_any(), "No referenced database left, skipping login cleanup");
        return Ok(());
    };
    let Some(engine) = find_engine(ctx, &engine_ref).await? else {
        warn!(role = %role.name_any(), engine = %engine_ref, "Referenced engine not found, skipping login cleanup");
        return Ok(());
    };
    let admin = connect(ctx, &engine_ref, &engine, engine.spec.default_database()).await?;

    let waiting = drain_old_logins(admin.as_ref(), &mut status).await?;
    role.status = Some(status.clone());
    if !waiting.is_empty() {
        return Err(Error::RotationBlocked(format!(
            "waiting for connections of old logins to close: {}",
            waiting.join(", ")
        )));
    }

    // PROVIDED logins belong to whoever maintains the import secret
    if role.spec.mode == UserRoleMode::Managed && !status.postgres_role.is_empty() {
        info!(login = %status.postgres_role, "Dropping login");
        admin.drop_role(&status.postgres_role).await?;
    } else if !status.postgres_role.is_empty() {
        for membership in &status.postgres_group_roles {
            admin
                .revoke_role(&membership.group_role, &status.postgres_role)
                .await?;
            admin
                .reset_role_on_database(&status.postgres_role, &membership.database)
                .await?;
        }
    }

    Ok(())
}
