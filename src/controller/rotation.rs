//! Credential rotation for PostgresUserRoles
//!
//! MANAGED logins alternate between `<prefix>-A` and `<prefix>-B`. A rotation
//! creates the other login with a fresh password and the same memberships,
//! republishes the secrets, and parks the previous login in
//! `status.oldPostgresRoles` until its last connection closes. A new rotation
//! is refused while anything is still draining, so at most two logins exist.
//!
//! PROVIDED logins are read from an import secret on every pass.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use tracing::{debug, info, warn};

use crate::controller::error::{Error, Result};
use crate::controller::status::{format_time, parse_time};
use crate::crd::{PostgresUserRoleSpec, PostgresUserRoleStatus, RoleAttributes};
use crate::resources::PgEngine;
use crate::resources::secret::{
    IMPORT_PASSWORD_KEY, IMPORT_USERNAME_KEY, LOGIN_KEY, PASSWORD_KEY, secret_value,
};
use crate::resources::sql::{generate_password, validate_identifier};

pub const SUFFIX_A: &str = "A";
pub const SUFFIX_B: &str = "B";

/// Login name for `prefix` and `suffix`
pub fn login_name(prefix: &str, suffix: &str) -> String {
    format!("{}-{}", prefix, suffix)
}

/// The login a rotation switches to
pub fn next_login(prefix: &str, current: &str) -> String {
    if current.ends_with(&format!("-{}", SUFFIX_A)) {
        login_name(prefix, SUFFIX_B)
    } else {
        login_name(prefix, SUFFIX_A)
    }
}

/// Why the managed login has to change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationTrigger {
    /// Nothing to do
    None,
    /// No login has been created yet
    Initial,
    /// The rotation interval elapsed
    Due,
    /// `rolePrefix` changed
    PrefixChanged,
}

pub fn rotation_trigger(
    spec: &PostgresUserRoleSpec,
    status: &PostgresUserRoleStatus,
    now: DateTime<Utc>,
) -> RotationTrigger {
    if status.postgres_role.is_empty() {
        return RotationTrigger::Initial;
    }
    if !status.role_prefix.is_empty() && status.role_prefix != spec.role_prefix() {
        return RotationTrigger::PrefixChanged;
    }
    match next_rotation_in(spec, status, now) {
        Some(remaining) if remaining.is_zero() => RotationTrigger::Due,
        _ => RotationTrigger::None,
    }
}

/// Time left until the next scheduled rotation, `None` without a rotation interval
pub fn next_rotation_in(
    spec: &PostgresUserRoleSpec,
    status: &PostgresUserRoleStatus,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let interval = spec.rotation_interval()?;
    let Some(changed) = parse_time(status.last_password_changed_time.as_deref()) else {
        return Some(Duration::ZERO);
    };
    let elapsed = (now - changed).to_std().unwrap_or(Duration::ZERO);
    Some(interval.saturating_sub(elapsed))
}

/// Live login and password of a user role
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
    /// A new login was switched to during this pass
    pub rotated: bool,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("rotated", &self.rotated)
            .finish()
    }
}

/// Create the login or re-apply password and attributes
async fn ensure_login(
    engine: &dyn PgEngine,
    login: &str,
    password: &str,
    attributes: &RoleAttributes,
) -> Result<()> {
    if engine.role_exists(login).await? {
        engine.update_login_role(login, password, attributes).await?;
    } else {
        info!(login = %login, "Creating login");
        engine.create_login_role(login, password, attributes).await?;
    }
    Ok(())
}

/// Give `next` the group memberships and per-database role settings of `current`
async fn copy_memberships(engine: &dyn PgEngine, current: &str, next: &str) -> Result<()> {
    if !engine.role_exists(current).await? {
        return Ok(());
    }

    let held = engine.role_memberships(next).await?;
    for group in engine.role_memberships(current).await? {
        if !held.contains(&group) {
            engine.grant_role(&group, next, false).await?;
        }
    }
    for setting in engine.role_database_settings(current).await? {
        engine
            .set_role_on_database(next, &setting.database, &setting.role)
            .await?;
    }
    Ok(())
}

/// Password published for `login` in any of the `stored` secrets
///
/// The work secret is listed first; generated connection secrets carry the
/// same password and keep it alive when the work secret is deleted.
fn stored_password(stored: &[Secret], login: &str) -> Option<String> {
    stored.iter().find_map(|secret| {
        if secret_value(secret, LOGIN_KEY).as_deref() != Some(login) {
            return None;
        }
        secret_value(secret, PASSWORD_KEY).filter(|p| !p.is_empty())
    })
}

/// Resolve (and rotate when due) the MANAGED login, updating `status`
///
/// `stored` holds the secrets the current password may be published in,
/// work secret first.
pub async fn managed_login(
    engine: &dyn PgEngine,
    spec: &PostgresUserRoleSpec,
    status: &mut PostgresUserRoleStatus,
    stored: &[Secret],
    now: DateTime<Utc>,
) -> Result<Credentials> {
    let prefix = spec.role_prefix();
    if prefix.is_empty() {
        return Err(Error::Validation(
            "rolePrefix is required in MANAGED mode".to_string(),
        ));
    }
    let attributes = spec.role_attributes.clone().unwrap_or_default();
    let trigger = rotation_trigger(spec, status, now);

    let credentials = match trigger {
        RotationTrigger::Initial => {
            let login = login_name(prefix, SUFFIX_A);
            validate_identifier("role", &login)?;
            let password = stored_password(stored, &login).unwrap_or_else(generate_password);
            ensure_login(engine, &login, &password, &attributes).await?;
            status.last_password_changed_time = Some(format_time(now));
            Credentials {
                login,
                password,
                rotated: false,
            }
        }
        RotationTrigger::None => {
            let login = status.postgres_role.clone();
            match stored_password(stored, &login) {
                Some(password) if engine.role_exists(&login).await? => {
                    if status.role_attributes.as_ref() != Some(&attributes) {
                        info!(login = %login, "Updating login attributes");
                        engine.update_login_role(&login, &password, &attributes).await?;
                    }
                    Credentials {
                        login,
                        password,
                        rotated: false,
                    }
                }
                Some(password) => {
                    ensure_login(engine, &login, &password, &attributes).await?;
                    Credentials {
                        login,
                        password,
                        rotated: false,
                    }
                }
                None => {
                    warn!(login = %login, "No published password left, generating a new one");
                    let password = generate_password();
                    ensure_login(engine, &login, &password, &attributes).await?;
                    Credentials {
                        login,
                        password,
                        rotated: false,
                    }
                }
            }
        }
        RotationTrigger::Due | RotationTrigger::PrefixChanged => {
            let current = status.postgres_role.clone();
            if !status.old_postgres_roles.is_empty() {
                return Err(Error::RotationBlocked(format!(
                    "cannot rotate login {} while old logins are still connected: {}",
                    current,
                    status.old_postgres_roles.join(", ")
                )));
            }

            let login = next_login(prefix, &current);
            validate_identifier("role", &login)?;
            let password = generate_password();
            info!(from = %current, to = %login, trigger = ?trigger, "Rotating login");

            ensure_login(engine, &login, &password, &attributes).await?;
            copy_memberships(engine, &current, &login).await?;

            if current != login {
                status.old_postgres_roles.push(current);
            }
            status.last_password_changed_time = Some(format_time(now));
            Credentials {
                login,
                password,
                rotated: true,
            }
        }
    };

    status.postgres_role = credentials.login.clone();
    status.role_prefix = prefix.to_string();
    status.role_attributes = Some(attributes);
    Ok(credentials)
}

/// Read the PROVIDED login from the import secret and apply it, updating `status`
pub async fn provided_login(
    engine: &dyn PgEngine,
    spec: &PostgresUserRoleSpec,
    status: &mut PostgresUserRoleStatus,
    import_secret: &Secret,
    now: DateTime<Utc>,
) -> Result<Credentials> {
    let secret_name = spec.import_secret_name.clone().unwrap_or_default();
    let missing = |key: &str| Error::NotFound(format!("import secret {} has no key {}", secret_name, key));

    let login = secret_value(import_secret, IMPORT_USERNAME_KEY)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| missing(IMPORT_USERNAME_KEY))?;
    let password = secret_value(import_secret, IMPORT_PASSWORD_KEY)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| missing(IMPORT_PASSWORD_KEY))?;
    validate_identifier("role", &login)?;

    let attributes = spec.role_attributes.clone().unwrap_or_default();
    ensure_login(engine, &login, &password, &attributes).await?;

    let previous = std::mem::take(&mut status.postgres_role);
    let rotated = !previous.is_empty() && previous != login;
    if rotated {
        info!(from = %previous, to = %login, "Imported login changed");
        copy_memberships(engine, &previous, &login).await?;
        if !status.old_postgres_roles.contains(&previous) {
            status.old_postgres_roles.push(previous);
        }
    }
    if rotated || status.last_password_changed_time.is_none() {
        status.last_password_changed_time = Some(format_time(now));
    }

    status.postgres_role = login.clone();
    status.role_prefix = String::new();
    status.role_attributes = Some(attributes);
    Ok(Credentials {
        login,
        password,
        rotated,
    })
}

/// Drop drained logins that no longer have connections
///
/// Returns the logins still waiting.
pub async fn drain_old_logins(
    engine: &dyn PgEngine,
    status: &mut PostgresUserRoleStatus,
) -> Result<Vec<String>> {
    let mut waiting = Vec::new();

    for login in std::mem::take(&mut status.old_postgres_roles) {
        if login == status.postgres_role {
            continue;
        }
        let connections = engine.active_connections(&login).await?;
        if connections == 0 {
            info!(login = %login, "Dropping drained login");
            engine.drop_role(&login).await?;
        } else {
            debug!(login = %login, connections, "Login still in use");
            waiting.push(login);
        }
    }

    status.old_postgres_roles = waiting.clone();
    Ok(waiting)
}
