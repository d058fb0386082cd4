//! PostgresUserRole CRD definition
//!
//! A PostgresUserRole is a login for applications. It is made a member of the
//! owner, reader or writer role of one or more PostgresDatabases and its
//! credentials are published into generated secrets.
//!
//! Two modes exist:
//! - `MANAGED`: the operator generates the login (`<rolePrefix>-A` or
//!   `<rolePrefix>-B`) and rotates it on a schedule
//! - `PROVIDED`: login and password are read from an import secret maintained
//!   outside of the operator

use std::collections::BTreeMap;
use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{ResourceRef, parse_duration};

/// PostgresUserRole is the Schema for the postgresuserroles API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "postgres-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "PostgresUserRole",
    plural = "postgresuserroles",
    shortname = "pgur",
    namespaced,
    status = "PostgresUserRoleStatus",
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Login", "type":"string", "jsonPath":".status.postgresRole"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresUserRoleSpec {
    /// How the login is obtained
    pub mode: UserRoleMode,

    /// Prefix of generated logins (MANAGED only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_prefix: Option<String>,

    /// Rotation interval for generated logins, e.g. "720h" (MANAGED only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_password_rotation_duration: Option<String>,

    /// Secret with `USERNAME` and `PASSWORD` keys (PROVIDED only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_secret_name: Option<String>,

    /// Secret the operator keeps the live login and password in
    pub work_generated_secret_name: String,

    /// Database memberships
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub privileges: Vec<UserRolePrivilege>,

    /// Role attributes applied to the login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_attributes: Option<RoleAttributes>,
}

/// How the login of a user role is obtained
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRoleMode {
    /// Login and password come from an import secret
    Provided,
    /// Login and password are generated and rotated by the operator
    Managed,
}

/// Membership of the login in one database's group role
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserRolePrivilege {
    /// The PostgresDatabase granting access
    pub database: ResourceRef,

    /// Which of the database's roles the login joins
    pub privilege: PrivilegeLevel,

    /// Connection variant written into the generated secret
    #[serde(default)]
    pub connection_type: ConnectionType,

    /// Secret receiving the connection details for this database
    pub generated_secret_name: String,

    /// Extra URI arguments appended to the engine's arguments
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_connection_url_parameters: BTreeMap<String, String>,
}

/// Group role a login joins
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrivilegeLevel {
    Owner,
    Reader,
    Writer,
}

impl std::fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrivilegeLevel::Owner => write!(f, "OWNER"),
            PrivilegeLevel::Reader => write!(f, "READER"),
            PrivilegeLevel::Writer => write!(f, "WRITER"),
        }
    }
}

/// Connection variant selector
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionType {
    /// Direct connection to the primary
    #[default]
    Primary,
    /// Connection through the engine's pooling proxy
    Bouncer,
}

/// Role attributes applied to the login
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct RoleAttributes {
    /// Maximum concurrent connections (-1 for unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_limit: Option<i32>,

    /// REPLICATION attribute
    #[serde(default)]
    pub replication: bool,

    /// BYPASSRLS attribute
    #[serde(default, rename = "bypassRLS")]
    pub bypass_rls: bool,
}

impl PostgresUserRoleSpec {
    /// Parsed rotation interval; `None` disables rotation
    pub fn rotation_interval(&self) -> Option<Duration> {
        self.user_password_rotation_duration
            .as_deref()
            .and_then(parse_duration)
            .filter(|d| !d.is_zero())
    }

    pub fn role_prefix(&self) -> &str {
        self.role_prefix.as_deref().unwrap_or_default()
    }
}

/// Status of the PostgresUserRole resource
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresUserRoleStatus {
    #[serde(default)]
    pub phase: UserRolePhase,

    /// Failure reason when phase is Failed
    #[serde(default)]
    pub message: Option<String>,

    /// Live login
    #[serde(default)]
    pub postgres_role: String,

    /// Prefix the live login was generated from (MANAGED only)
    #[serde(default)]
    pub role_prefix: String,

    /// Previous logins waiting for their last connection to close
    #[serde(default)]
    pub old_postgres_roles: Vec<String>,

    /// Time the live login was created (RFC 3339)
    #[serde(default)]
    pub last_password_changed_time: Option<String>,

    /// Group role memberships currently applied to the login
    #[serde(default)]
    pub postgres_group_roles: Vec<AppliedMembership>,

    /// Role attributes last applied to the live login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_attributes: Option<RoleAttributes>,
}

/// A group role membership together with the database it applies to
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct AppliedMembership {
    pub database: String,
    pub group_role: String,
}

/// Phase of a PostgresUserRole
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum UserRolePhase {
    #[default]
    Pending,
    Created,
    Failed,
}

impl std::fmt::Display for UserRolePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserRolePhase::Pending => write!(f, "Pending"),
            UserRolePhase::Created => write!(f, "Created"),
            UserRolePhase::Failed => write!(f, "Failed"),
        }
    }
}
