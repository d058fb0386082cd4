//! PostgresEngine CRD definition
//!
//! A PostgresEngine describes how the operator reaches one physical PostgreSQL
//! server: where it listens, which credentials to use, and which connection
//! variants (direct primary or a pooling proxy) applications should be given.
//! Every other resource of this operator points at a PostgresEngine.

use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::parse_duration;

/// Default PostgreSQL port
pub const DEFAULT_PORT: u16 = 5432;

/// Default database the operator connects to for cluster-wide statements
pub const DEFAULT_DATABASE: &str = "postgres";

/// Default connection URI arguments
pub const DEFAULT_URI_ARGS: &str = "sslmode=disable";

/// Default re-validation interval
pub const DEFAULT_CHECK_INTERVAL: &str = "30s";

/// PostgresEngine is the Schema for the postgresengines API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "postgres-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "PostgresEngine",
    plural = "postgresengines",
    shortname = "pge",
    namespaced,
    status = "PostgresEngineStatus",
    printcolumn = r#"{"name":"Host", "type":"string", "jsonPath":".spec.host"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Last Validated", "type":"string", "jsonPath":".status.lastValidatedTime"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresEngineSpec {
    /// Hostname the operator uses to reach the server
    pub host: String,

    /// Port the operator uses to reach the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Database used for cluster-wide statements (roles, databases)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_database: Option<String>,

    /// Secret holding the operator's login in keys `user` and `password`
    pub secret_name: String,

    /// Extra URI arguments, e.g. `sslmode=require`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri_args: Option<String>,

    /// How often the connection is re-validated (e.g. "30s", "5m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_interval: Option<String>,

    /// Grant managed roles to the operator's login WITH ADMIN OPTION
    #[serde(default)]
    pub allow_grant_admin_option: bool,

    /// Refuse deletion while PostgresDatabases still reference this engine
    #[serde(default)]
    pub wait_linked_resources_deletion: bool,

    /// Connection variants handed to applications in generated secrets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_connections: Option<UserConnections>,
}

/// Connection variants exposed to applications
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserConnections {
    /// Direct connection to the primary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_connection: Option<GenericConnection>,

    /// Connection through a pooling proxy such as PgBouncer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bouncer_connection: Option<GenericConnection>,
}

/// Host, port and URI arguments of one connection variant
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenericConnection {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub uri_args: String,
}

impl PostgresEngineSpec {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn default_database(&self) -> &str {
        self.default_database
            .as_deref()
            .filter(|db| !db.is_empty())
            .unwrap_or(DEFAULT_DATABASE)
    }

    pub fn uri_args(&self) -> &str {
        self.uri_args.as_deref().unwrap_or(DEFAULT_URI_ARGS)
    }

    /// Re-validation interval, falling back to the default on unparsable input
    pub fn check_interval(&self) -> Duration {
        self.check_interval
            .as_deref()
            .and_then(parse_duration)
            .or_else(|| parse_duration(DEFAULT_CHECK_INTERVAL))
            .unwrap_or(Duration::from_secs(30))
    }

    /// The primary connection variant, defaulting to the operator's own endpoint
    pub fn primary_connection(&self) -> GenericConnection {
        self.user_connections
            .as_ref()
            .and_then(|c| c.primary_connection.clone())
            .unwrap_or_else(|| GenericConnection {
                host: self.host.clone(),
                port: self.port(),
                uri_args: self.uri_args().to_string(),
            })
    }

    /// The pooling-proxy connection variant, if configured
    pub fn bouncer_connection(&self) -> Option<&GenericConnection> {
        self.user_connections
            .as_ref()
            .and_then(|c| c.bouncer_connection.as_ref())
    }
}

/// Status of the PostgresEngine resource
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresEngineStatus {
    /// Current validation phase
    #[serde(default)]
    pub phase: EnginePhase,

    /// Failure reason when phase is Failed
    #[serde(default)]
    pub message: Option<String>,

    /// Time of the last successful validation (RFC 3339)
    #[serde(default)]
    pub last_validated_time: Option<String>,

    /// Hash of the last successfully validated configuration
    #[serde(default)]
    pub hash: Option<String>,
}

/// Phase of a PostgresEngine
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum EnginePhase {
    /// Not validated yet
    #[default]
    Unvalidated,
    /// The operator connected successfully with the current configuration
    Validated,
    /// The last validation failed - see message
    Failed,
}

impl std::fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnginePhase::Unvalidated => write!(f, "Unvalidated"),
            EnginePhase::Validated => write!(f, "Validated"),
            EnginePhase::Failed => write!(f, "Failed"),
        }
    }
}
