//! Engine connection registry
//!
//! Caches one pooled [`PgEngine`] per (engine identity, database). Pools are
//! created lazily on first use and evicted when the engine's connection
//! parameters change, when the engine is deleted, or around a database rename.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::resources::engine::{EngineResult, PgEngine};

/// Everything needed to open a pool to one database of one server
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub uri_args: String,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("uri_args", &self.uri_args)
            .finish()
    }
}

/// Opens engine handles
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> EngineResult<Arc<dyn PgEngine>>;
}

type PoolKey = (String, String);

/// A cached handle and the parameters it was opened with
struct CachedPool {
    params: ConnectionParams,
    engine: Arc<dyn PgEngine>,
}

/// Shared cache of engine handles
pub struct EngineRegistry {
    connector: Arc<dyn Connector>,
    pools: RwLock<HashMap<PoolKey, CachedPool>>,
}

impl EngineRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached handle for (`engine_key`, `params.database`), opening one if needed
    ///
    /// A cached handle opened with different parameters (rotated admin
    /// credentials, a moved host) is closed and replaced.
    pub async fn acquire(
        &self,
        engine_key: &str,
        params: &ConnectionParams,
    ) -> EngineResult<Arc<dyn PgEngine>> {
        let key = (engine_key.to_string(), params.database.clone());

        if let Some(cached) = self.pools.read().await.get(&key)
            && cached.params == *params
        {
            return Ok(Arc::clone(&cached.engine));
        }

        let mut pools = self.pools.write().await;
        // Another reconcile may have opened it while we waited for the lock
        if let Some(cached) = pools.get(&key)
            && cached.params == *params
        {
            return Ok(Arc::clone(&cached.engine));
        }

        if let Some(stale) = pools.remove(&key) {
            info!(engine = %engine_key, database = %params.database, "Connection parameters changed, reopening pool");
            stale.engine.close().await;
        }

        debug!(engine = %engine_key, database = %params.database, "Opening connection pool");
        let engine = self.connector.connect(params).await?;
        pools.insert(
            key,
            CachedPool {
                params: params.clone(),
                engine: Arc::clone(&engine),
            },
        );
        Ok(engine)
    }

    /// Close and forget every pool of `engine_key`
    pub async fn close_all(&self, engine_key: &str) {
        let evicted: Vec<CachedPool> = {
            let mut pools = self.pools.write().await;
            let keys: Vec<PoolKey> = pools
                .keys()
                .filter(|(engine, _)| engine == engine_key)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| pools.remove(k)).collect()
        };

        if !evicted.is_empty() {
            info!(engine = %engine_key, pools = evicted.len(), "Closing connection pools");
        }
        for cached in evicted {
            cached.engine.close().await;
        }
    }

    /// Close and forget the pool of one database of `engine_key`
    pub async fn close_database(&self, engine_key: &str, database: &str) {
        let evicted = self
            .pools
            .write()
            .await
            .remove(&(engine_key.to_string(), database.to_string()));

        if let Some(cached) = evicted {
            debug!(engine = %engine_key, database = %database, "Closing connection pool");
            cached.engine.close().await;
        }
    }

    /// Number of cached pools
    pub async fn len(&self) -> usize {
        self.pools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pools.read().await.is_empty()
    }
}
