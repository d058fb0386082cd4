//! Group roles of a database
//!
//! Every PostgresDatabase owns three NOLOGIN roles (owner, reader, writer).
//! They are created idempotently, renamed in place when their desired name
//! changes, and granted to the operator's own login so that it can create
//! objects on their behalf.

use tracing::{debug, info};

use crate::controller::error::Result;
use crate::resources::PgEngine;
use crate::resources::sql::validate_identifier;

/// Check every generated identifier before any statement is issued
pub fn check_identifiers(identifiers: &[(&'static str, &str)]) -> Result<()> {
    for (kind, name) in identifiers {
        validate_identifier(kind, name)?;
    }
    Ok(())
}

/// Ensure the group role `desired` exists and is granted to the operating role
///
/// `applied` is the name recorded by the previous pass; when it differs from
/// `desired` and still exists, the role is renamed instead of recreated so that
/// its memberships and grants survive. Returns the final role name.
pub async fn ensure_role(
    engine: &dyn PgEngine,
    desired: &str,
    applied: Option<&str>,
    operating_role: &str,
    memberships: &[String],
    with_admin: bool,
) -> Result<String> {
    let desired_exists = engine.role_exists(desired).await?;

    if let Some(applied) = applied.filter(|a| !a.is_empty() && *a != desired)
        && !desired_exists
        && engine.role_exists(applied).await?
    {
        info!(from = %applied, to = %desired, "Renaming role");
        engine.rename_role(applied, desired).await?;
    } else if !desired_exists {
        info!(role = %desired, "Creating role");
        engine.create_group_role(desired).await?;
    }

    if !memberships.iter().any(|m| m == desired) {
        debug!(role = %desired, member = %operating_role, "Granting role to operator");
        engine.grant_role(desired, operating_role, with_admin).await?;
    }

    Ok(desired.to_string())
}
