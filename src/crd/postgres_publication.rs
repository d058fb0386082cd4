//! PostgresPublication CRD definition
//!
//! A PostgresPublication declares a logical-replication publication inside a
//! PostgresDatabase together with the replication slot consumers read from.
//! Table selection is one of: every table, every table of some schemas, or an
//! explicit table list with optional column lists and row filters.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::ResourceRef;

/// Default logical decoding plugin for the paired replication slot
pub const DEFAULT_SLOT_PLUGIN: &str = "pgoutput";

/// PostgresPublication is the Schema for the postgrespublications API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "postgres-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "PostgresPublication",
    plural = "postgrespublications",
    shortname = "pgpub",
    namespaced,
    status = "PostgresPublicationStatus",
    printcolumn = r#"{"name":"Publication", "type":"string", "jsonPath":".status.name"}"#,
    printcolumn = r#"{"name":"Slot", "type":"string", "jsonPath":".status.replicationSlotName"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresPublicationSpec {
    /// Name of the publication inside the database
    pub name: String,

    /// The PostgresDatabase holding the publication
    pub database: ResourceRef,

    /// Drop publication and replication slot when the resource is deleted
    #[serde(default)]
    pub drop_on_delete: bool,

    /// Publish every table of the database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_tables: Option<bool>,

    /// Publish every table of these schemas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables_in_schema: Option<Vec<String>>,

    /// Publish these tables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<PublicationTable>>,

    /// Publication parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_parameters: Option<PublicationParameters>,

    /// Replication slot name (default: the publication name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_slot_name: Option<String>,

    /// Logical decoding plugin of the slot (default: pgoutput)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_slot_plugin: Option<String>,
}

/// One published table
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct PublicationTable {
    /// Table name, optionally schema-qualified (`schema.table`)
    pub table_name: String,

    /// Published column subset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,

    /// Row filter expression (the body of a WHERE clause)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_where: Option<String>,
}

/// `WITH (...)` parameters of a publication
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct PublicationParameters {
    /// Comma-separated DML operations to publish, e.g. "insert, update"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<String>,

    /// Publish changes of partitions through their root table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_via_partition_root: Option<bool>,
}

impl PostgresPublicationSpec {
    /// Replication slot name, defaulting to the publication name
    pub fn slot_name(&self) -> &str {
        self.replication_slot_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.name)
    }

    /// Replication slot plugin, defaulting to pgoutput
    pub fn slot_plugin(&self) -> &str {
        self.replication_slot_plugin
            .as_deref()
            .filter(|plugin| !plugin.is_empty())
            .unwrap_or(DEFAULT_SLOT_PLUGIN)
    }
}

/// Status of the PostgresPublication resource
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresPublicationStatus {
    #[serde(default)]
    pub phase: PublicationPhase,

    /// Failure reason when phase is Failed
    #[serde(default)]
    pub message: Option<String>,

    /// Applied publication name
    #[serde(default)]
    pub name: String,

    /// Whether the applied publication covers all tables
    #[serde(default)]
    pub all_tables: bool,

    /// Hash of the last applied spec
    #[serde(default)]
    pub hash: String,

    /// Applied replication slot name
    #[serde(default)]
    pub replication_slot_name: String,

    /// Applied replication slot plugin
    #[serde(default)]
    pub replication_slot_plugin: String,
}

/// Phase of a PostgresPublication
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum PublicationPhase {
    #[default]
    Pending,
    Created,
    Failed,
}

impl std::fmt::Display for PublicationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublicationPhase::Pending => write!(f, "Pending"),
            PublicationPhase::Created => write!(f, "Created"),
            PublicationPhase::Failed => write!(f, "Failed"),
        }
    }
}
