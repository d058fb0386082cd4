//! Pooled PostgreSQL engine
//!
//! Implements [`PgEngine`] on a `deadpool-postgres` pool of `tokio-postgres`
//! connections. One [`PooledEngine`] is bound to a single database of a single
//! server; [`PoolConnector`] is what the registry uses to open them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::NoTls;
use tokio_postgres::config::SslMode;
use tracing::{debug, trace};

use crate::crd::RoleAttributes;
use crate::resources::engine::{
    EngineError, EngineResult, PgEngine, PublicationInfo, ReplicationSlotInfo,
    RoleDatabaseSetting,
};
use crate::resources::publication::PublicationStatement;
use crate::resources::registry::{ConnectionParams, Connector};
use crate::resources::sql::{self, ObjectKind, SchemaAccess, SchemaObject};

/// Connections per pool
pub const POOL_MAX_SIZE: usize = 4;

/// Default connect timeout when the URI arguments do not set one
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Application name reported in `pg_stat_activity`
pub const APPLICATION_NAME: &str = "postgres-provisioner";

/// The on-connect `role` of one `pg_db_role_setting` row, if it sets one
fn role_setting(database: String, config: &[String]) -> Option<RoleDatabaseSetting> {
    let group = config.iter().find_map(|c| c.strip_prefix("role="))?;
    Some(RoleDatabaseSetting {
        database,
        role: group.trim_matches('"').to_string(),
    })
}

/// Build a `tokio-postgres` config from connection parameters
///
/// Supported URI arguments are `sslmode`, `connect_timeout` and
/// `application_name`; anything else is ignored.
pub fn pg_config(params: &ConnectionParams) -> EngineResult<tokio_postgres::Config> {
    let mut config = tokio_postgres::Config::new();
    config
        .host(&params.host)
        .port(params.port)
        .user(&params.user)
        .password(&params.password)
        .dbname(&params.database)
        .application_name(APPLICATION_NAME)
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT);

    for pair in params.uri_args.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "sslmode" => {
                let mode = match value {
                    "disable" => SslMode::Disable,
                    "prefer" | "allow" => SslMode::Prefer,
                    other => {
                        return Err(EngineError::Connection(format!(
                            "sslmode={} is not supported without TLS",
                            other
                        )));
                    }
                };
                config.ssl_mode(mode);
            }
            "connect_timeout" => {
                if let Ok(secs) = value.parse::<u64>() {
                    config.connect_timeout(Duration::from_secs(secs));
                }
            }
            "application_name" => {
                config.application_name(value);
            }
            other => trace!(argument = %other, "Ignoring connection argument"),
        }
    }

    Ok(config)
}

/// Opens [`PooledEngine`]s
#[derive(Clone, Debug, Default)]
pub struct PoolConnector;

#[async_trait]
impl Connector for PoolConnector {
    async fn connect(&self, params: &ConnectionParams) -> EngineResult<Arc<dyn PgEngine>> {
        let engine = PooledEngine::new(params)?;
        Ok(Arc::new(engine))
    }
}

/// A connection pool to one database
pub struct PooledEngine {
    pool: Pool,
    database: String,
}

impl PooledEngine {
    pub fn new(params: &ConnectionParams) -> EngineResult<Self> {
        let manager = Manager::from_config(
            pg_config(params)?,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(POOL_MAX_SIZE)
            .build()
            .map_err(|e| EngineError::Pool(e.to_string()))?;

        debug!(host = %params.host, database = %params.database, "Created connection pool");

        Ok(Self {
            pool,
            database: params.database.clone(),
        })
    }

    async fn client(&self) -> EngineResult<Object> {
        Ok(self.pool.get().await?)
    }

    async fn batch(&self, sql: &str) -> EngineResult<()> {
        trace!(database = %self.database, sql = %sql, "Executing statement");
        self.client().await?.batch_execute(sql).await?;
        Ok(())
    }

    async fn exists(&self, query: &str, name: &str) -> EngineResult<bool> {
        let row = self.client().await?.query_opt(query, &[&name]).await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl PgEngine for PooledEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.client().await?.query_one("SELECT 1", &[]).await?;
        Ok(())
    }

    async fn operating_role(&self) -> EngineResult<String> {
        let row = self
            .client()
            .await?
            .query_one("SELECT current_user::text", &[])
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn role_exists(&self, role: &str) -> EngineResult<bool> {
        self.exists("SELECT 1 FROM pg_roles WHERE rolname = $1", role)
            .await
    }

    async fn create_group_role(&self, role: &str) -> EngineResult<()> {
        self.batch(&sql::create_group_role(role)).await
    }

    async fn create_login_role(
        &self,
        role: &str,
        password: &str,
        attributes: &RoleAttributes,
    ) -> EngineResult<()> {
        self.batch(&sql::create_login_role(role, password, attributes))
            .await
    }

    async fn update_login_role(
        &self,
        role: &str,
        password: &str,
        attributes: &RoleAttributes,
    ) -> EngineResult<()> {
        self.batch(&sql::alter_login_role(role, password, attributes))
            .await
    }

    async fn rename_role(&self, from: &str, to: &str) -> EngineResult<()> {
        self.batch(&sql::rename_role(from, to)).await
    }

    async fn grant_role(&self, group: &str, member: &str, with_admin: bool) -> EngineResult<()> {
        self.batch(&sql::grant_role(group, member, with_admin)).await
    }

    async fn revoke_role(&self, group: &str, member: &str) -> EngineResult<()> {
        self.batch(&sql::revoke_role(group, member)).await
    }

    async fn role_memberships(&self, role: &str) -> EngineResult<Vec<String>> {
        let rows = self
            .client()
            .await?
            .query(
                "SELECT g.rolname::text FROM pg_auth_members m \
                 JOIN pg_roles g ON g.oid = m.roleid \
                 JOIN pg_roles u ON u.oid = m.member \
                 WHERE u.rolname = $1 ORDER BY 1",
                &[&role],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| r.try_get::<_, String>(0))
            .collect::<Result<_, _>>()?)
    }

    async fn set_role_on_database(
        &self,
        role: &str,
        database: &str,
        group: &str,
    ) -> EngineResult<()> {
        self.batch(&sql::set_role_in_database(role, database, group))
            .await
    }

    async fn reset_role_on_database(&self, role: &str, database: &str) -> EngineResult<()> {
        self.batch(&sql::reset_role_in_database(role, database))
            .await
    }

    async fn role_database_settings(&self, role: &str) -> EngineResult<Vec<RoleDatabaseSetting>> {
        let rows = self
            .client()
            .await?
            .query(
                "SELECT d.datname::text, s.setconfig FROM pg_db_role_setting s \
                 JOIN pg_roles r ON r.oid = s.setrole \
                 JOIN pg_database d ON d.oid = s.setdatabase \
                 WHERE r.rolname = $1",
                &[&role],
            )
            .await?;

        let mut settings = Vec::new();
        for row in rows {
            let database: String = row.try_get(0)?;
            let config: Option<Vec<String>> = row.try_get(1)?;
            settings.extend(role_setting(database, config.as_deref().unwrap_or_default()));
        }
        settings.sort();
        Ok(settings)
    }

    async fn active_connections(&self, role: &str) -> EngineResult<i64> {
        let row = self
            .client()
            .await?
            .query_one(
                "SELECT count(*) FROM pg_stat_activity WHERE usename = $1",
                &[&role],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn drop_role(&self, role: &str) -> EngineResult<()> {
        self.batch(&sql::drop_role(role)).await
    }

    async fn database_owner(&self, database: &str) -> EngineResult<Option<String>> {
        let row = self
            .client()
            .await?
            .query_opt(
                "SELECT pg_get_userbyid(datdba)::text FROM pg_database WHERE datname = $1",
                &[&database],
            )
            .await?;
        Ok(row.map(|r| r.try_get::<_, String>(0)).transpose()?)
    }

    async fn create_database(&self, database: &str, owner: &str) -> EngineResult<()> {
        self.batch(&sql::create_database(database, owner)).await
    }

    async fn rename_database(&self, from: &str, to: &str) -> EngineResult<()> {
        self.batch(&sql::rename_database(from, to)).await
    }

    async fn alter_database_owner(&self, database: &str, owner: &str) -> EngineResult<()> {
        self.batch(&sql::alter_database_owner(database, owner))
            .await
    }

    async fn grant_database_connect(&self, database: &str, role: &str) -> EngineResult<()> {
        self.batch(&sql::grant_database_connect(database, role))
            .await
    }

    async fn drop_database(&self, database: &str) -> EngineResult<()> {
        self.batch(&sql::drop_database(database)).await
    }

    async fn schema_exists(&self, schema: &str) -> EngineResult<bool> {
        self.exists("SELECT 1 FROM pg_namespace WHERE nspname = $1", schema)
            .await
    }

    async fn create_schema(&self, schema: &str, owner: &str) -> EngineResult<()> {
        self.batch(&sql::create_schema(schema, owner)).await
    }

    async fn drop_schema(&self, schema: &str, cascade: bool) -> EngineResult<()> {
        self.batch(&sql::drop_schema(schema, cascade)).await
    }

    async fn grant_schema_privileges(
        &self,
        schema: &str,
        owner: &str,
        role: &str,
        access: SchemaAccess,
    ) -> EngineResult<()> {
        let statements = sql::grant_schema_privileges(schema, owner, role, access);
        self.batch(&statements.join(";\n")).await
    }

    async fn foreign_owned_objects(
        &self,
        schema: &str,
        owner: &str,
    ) -> EngineResult<Vec<SchemaObject>> {
        let rows = self
            .client()
            .await?
            .query(
                "SELECT c.relname::text, 'table' FROM pg_class c \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relkind IN ('r', 'p') \
                 AND pg_get_userbyid(c.relowner) <> $2 \
                 UNION ALL \
                 SELECT t.typname::text, 'type' FROM pg_type t \
                 JOIN pg_namespace n ON n.oid = t.typnamespace \
                 LEFT JOIN pg_class c ON c.oid = t.typrelid \
                 WHERE n.nspname = $1 AND t.typtype IN ('c', 'e', 'd', 'r') \
                 AND (t.typrelid = 0 OR c.relkind = 'c') \
                 AND pg_get_userbyid(t.typowner) <> $2",
                &[&schema, &owner],
            )
            .await?;

        let mut objects = Vec::with_capacity(rows.len());
        for row in &rows {
            let kind: &str = row.try_get(1)?;
            objects.push(SchemaObject {
                kind: if kind == "table" {
                    ObjectKind::Table
                } else {
                    ObjectKind::Type
                },
                schema: schema.to_string(),
                name: row.try_get(0)?,
            });
        }
        Ok(objects)
    }

    async fn alter_object_owner(&self, object: &SchemaObject, owner: &str) -> EngineResult<()> {
        self.batch(&sql::alter_object_owner(object, owner)).await
    }

    async fn extension_exists(&self, extension: &str) -> EngineResult<bool> {
        self.exists("SELECT 1 FROM pg_extension WHERE extname = $1", extension)
            .await
    }

    async fn create_extension(&self, extension: &str) -> EngineResult<()> {
        self.batch(&sql::create_extension(extension)).await
    }

    async fn drop_extension(&self, extension: &str, cascade: bool) -> EngineResult<()> {
        self.batch(&sql::drop_extension(extension, cascade)).await
    }

    async fn publication(&self, name: &str) -> EngineResult<Option<PublicationInfo>> {
        let row = self
            .client()
            .await?
            .query_opt(
                "SELECT pubname::text, puballtables FROM pg_publication WHERE pubname = $1",
                &[&name],
            )
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(PublicationInfo {
            name: row.try_get(0)?,
            all_tables: row.try_get(1)?,
        }))
    }

    async fn execute_publication(&self, statement: &PublicationStatement) -> EngineResult<()> {
        self.batch(statement.sql()).await
    }

    async fn drop_publication(&self, name: &str) -> EngineResult<()> {
        self.batch(&sql::drop_publication(name)).await
    }

    async fn replication_slot(&self, name: &str) -> EngineResult<Option<ReplicationSlotInfo>> {
        let row = self
            .client()
            .await?
            .query_opt(
                "SELECT slot_name::text, database::text, plugin::text \
                 FROM pg_replication_slots WHERE slot_name = $1",
                &[&name],
            )
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ReplicationSlotInfo {
            name: row.try_get(0)?,
            database: row.try_get(1)?,
            plugin: row.try_get(2)?,
        }))
    }

    async fn create_replication_slot(&self, name: &str, plugin: &str) -> EngineResult<()> {
        self.client()
            .await?
            .query_one(
                "SELECT pg_create_logical_replication_slot($1, $2)::text",
                &[&name, &plugin],
            )
            .await?;
        Ok(())
    }

    async fn drop_replication_slot(&self, name: &str) -> EngineResult<()> {
        self.client()
            .await?
            .query_one("SELECT pg_drop_replication_slot($1)::text", &[&name])
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
    }
}
