//! Typed access to a physical PostgreSQL engine
//!
//! Reconcilers never issue SQL directly. They call the typed existence /
//! create / alter / drop operations of [`PgEngine`], which is implemented on
//! top of a connection pool by [`crate::resources::postgres_client::PooledEngine`].
//! An engine handle is bound to one database of one server.

use async_trait::async_trait;
use thiserror::Error;

use crate::crd::RoleAttributes;
use crate::resources::publication::PublicationStatement;
use crate::resources::sql::{SchemaAccess, SchemaObject};

/// Errors raised by the engine layer
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(String),
}

impl From<tokio_postgres::Error> for EngineError {
    fn from(e: tokio_postgres::Error) -> Self {
        // `Display` for server errors only says "db error"; the source carries the detail
        match e.as_db_error() {
            Some(db) => EngineError::Query(db.message().to_string()),
            None => EngineError::Query(e.to_string()),
        }
    }
}

impl From<deadpool_postgres::PoolError> for EngineError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        EngineError::Pool(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Existing publication as seen in `pg_publication`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicationInfo {
    pub name: String,
    pub all_tables: bool,
}

/// Existing replication slot as seen in `pg_replication_slots`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationSlotInfo {
    pub name: String,
    pub database: Option<String>,
    pub plugin: Option<String>,
}

/// Per-database `role` setting of a login (`ALTER ROLE .. IN DATABASE .. SET role`)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RoleDatabaseSetting {
    pub database: String,
    pub role: String,
}

#[async_trait]
pub trait PgEngine: Send + Sync {
    /// Round-trip a trivial query
    async fn ping(&self) -> EngineResult<()>;

    /// The role the operator is connected as
    async fn operating_role(&self) -> EngineResult<String>;

    // Roles

    async fn role_exists(&self, role: &str) -> EngineResult<bool>;
    async fn create_group_role(&self, role: &str) -> EngineResult<()>;
    async fn create_login_role(
        &self,
        role: &str,
        password: &str,
        attributes: &RoleAttributes,
    ) -> EngineResult<()>;
    async fn update_login_role(
        &self,
        role: &str,
        password: &str,
        attributes: &RoleAttributes,
    ) -> EngineResult<()>;
    async fn rename_role(&self, from: &str, to: &str) -> EngineResult<()>;
    async fn grant_role(&self, group: &str, member: &str, with_admin: bool) -> EngineResult<()>;
    async fn revoke_role(&self, group: &str, member: &str) -> EngineResult<()>;
    /// Group roles `role` is a direct member of
    async fn role_memberships(&self, role: &str) -> EngineResult<Vec<String>>;
    async fn set_role_on_database(&self, role: &str, database: &str, group: &str)
    -> EngineResult<()>;
    async fn reset_role_on_database(&self, role: &str, database: &str) -> EngineResult<()>;
    async fn role_database_settings(&self, role: &str) -> EngineResult<Vec<RoleDatabaseSetting>>;
    /// Number of backends connected as `role`
    async fn active_connections(&self, role: &str) -> EngineResult<i64>;
    async fn drop_role(&self, role: &str) -> EngineResult<()>;

    // Databases

    /// Owner of `database`, `None` when it does not exist
    async fn database_owner(&self, database: &str) -> EngineResult<Option<String>>;
    async fn create_database(&self, database: &str, owner: &str) -> EngineResult<()>;
    async fn rename_database(&self, from: &str, to: &str) -> EngineResult<()>;
    async fn alter_database_owner(&self, database: &str, owner: &str) -> EngineResult<()>;
    async fn grant_database_connect(&self, database: &str, role: &str) -> EngineResult<()>;
    async fn drop_database(&self, database: &str) -> EngineResult<()>;

    // Schemas and extensions, in the database the handle is bound to

    async fn schema_exists(&self, schema: &str) -> EngineResult<bool>;
    async fn create_schema(&self, schema: &str, owner: &str) -> EngineResult<()>;
    async fn drop_schema(&self, schema: &str, cascade: bool) -> EngineResult<()>;
    async fn grant_schema_privileges(
        &self,
        schema: &str,
        owner: &str,
        role: &str,
        access: SchemaAccess,
    ) -> EngineResult<()>;
    /// Tables and user-defined types in `schema` not owned by `owner`
    async fn foreign_owned_objects(&self, schema: &str, owner: &str)
    -> EngineResult<Vec<SchemaObject>>;
    async fn alter_object_owner(&self, object: &SchemaObject, owner: &str) -> EngineResult<()>;
    async fn extension_exists(&self, extension: &str) -> EngineResult<bool>;
    async fn create_extension(&self, extension: &str) -> EngineResult<()>;
    async fn drop_extension(&self, extension: &str, cascade: bool) -> EngineResult<()>;

    // Logical replication

    async fn publication(&self, name: &str) -> EngineResult<Option<PublicationInfo>>;
    async fn execute_publication(&self, statement: &PublicationStatement) -> EngineResult<()>;
    async fn drop_publication(&self, name: &str) -> EngineResult<()>;
    async fn replication_slot(&self, name: &str) -> EngineResult<Option<ReplicationSlotInfo>>;
    /// Create a logical slot in the database the handle is bound to
    async fn create_replication_slot(&self, name: &str, plugin: &str) -> EngineResult<()>;
    async fn drop_replication_slot(&self, name: &str) -> EngineResult<()>;

    /// Close the underlying pool; later calls fail
    async fn close(&self);
}
