//! PostgresDatabase CRD definition
//!
//! This CRD enables declarative database provisioning inside a PostgresEngine.
//! Creating a PostgresDatabase resource will:
//! - Create owner, reader and writer group roles
//! - Create the database owned by the owner role
//! - Create the listed schemas and extensions and keep them under the owner role

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::ResourceRef;

/// Suffix appended to the database name for the derived owner role
pub const OWNER_SUFFIX: &str = "-owner";
/// Suffix appended to the database name for the reader role
pub const READER_SUFFIX: &str = "-reader";
/// Suffix appended to the database name for the writer role
pub const WRITER_SUFFIX: &str = "-writer";

/// PostgresDatabase is the Schema for the postgresdatabases API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "postgres-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "PostgresDatabase",
    plural = "postgresdatabases",
    shortname = "pgdb",
    namespaced,
    status = "PostgresDatabaseStatus",
    printcolumn = r#"{"name":"Database", "type":"string", "jsonPath":".status.database"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresDatabaseSpec {
    /// Name of the physical database
    pub database: String,

    /// Explicit owner role name (default: `<database>-owner`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_role: Option<String>,

    /// Schemas to create inside the database
    #[serde(default)]
    pub schemas: DatabaseModulesList,

    /// Extensions to enable inside the database
    #[serde(default)]
    pub extensions: DatabaseModulesList,

    /// Engine hosting the database
    pub engine_configuration: ResourceRef,

    /// Drop the physical database and its roles when the resource is deleted
    #[serde(default)]
    pub drop_on_delete: bool,

    /// Refuse deletion while user roles or publications still reference this database
    #[serde(default)]
    pub wait_linked_resources_deletion: bool,
}

/// A tracked list of schemas or extensions
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseModulesList {
    /// Desired items
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list: Vec<String>,

    /// Drop items that disappear from the list (otherwise they are only forgotten)
    #[serde(default)]
    pub drop_on_remove: bool,

    /// Drop with CASCADE
    #[serde(default)]
    pub delete_with_cascade: bool,
}

impl PostgresDatabaseSpec {
    /// Owner role name: the explicit master role or `<database>-owner`
    pub fn owner_role(&self) -> String {
        match self.master_role.as_deref() {
            Some(role) if !role.is_empty() => role.to_string(),
            _ => format!("{}{}", self.database, OWNER_SUFFIX),
        }
    }

    pub fn reader_role(&self) -> String {
        format!("{}{}", self.database, READER_SUFFIX)
    }

    pub fn writer_role(&self) -> String {
        format!("{}{}", self.database, WRITER_SUFFIX)
    }
}

/// Status of the PostgresDatabase resource
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresDatabaseStatus {
    /// Current phase of the database provisioning
    #[serde(default)]
    pub phase: DatabasePhase,

    /// Failure reason when phase is Failed
    #[serde(default)]
    pub message: Option<String>,

    /// Name of the database as it exists physically
    #[serde(default)]
    pub database: String,

    /// Applied group roles
    #[serde(default)]
    pub roles: DatabaseRoles,

    /// Schemas created and tracked by the operator
    #[serde(default)]
    pub schemas: Vec<String>,

    /// Extensions created and tracked by the operator
    #[serde(default)]
    pub extensions: Vec<String>,
}

/// Owner, reader and writer roles of a database
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRoles {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reader: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub writer: String,
}

/// Phase of database provisioning
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum DatabasePhase {
    /// Initial state, not yet processed
    #[default]
    Pending,
    /// Database, roles, schemas and extensions are in place
    Created,
    /// Failed to provision - see message for details
    Failed,
}

impl std::fmt::Display for DatabasePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabasePhase::Pending => write!(f, "Pending"),
            DatabasePhase::Created => write!(f, "Created"),
            DatabasePhase::Failed => write!(f, "Failed"),
        }
    }
}
