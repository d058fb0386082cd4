//! Reconciler for PostgresEngine resources
//!
//! Validates that the operator can log into the server with the configured
//! credentials and re-validates every `checkInterval`. A configuration change
//! closes every cached pool of the engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::info;

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::link_guard::ensure_engine_unreferenced;
use crate::controller::reconciler::ManagedResource;
use crate::controller::resolve::{connect, engine_key};
use crate::controller::status::{content_hash, format_time, hash_changed, parse_time};
use crate::controller::store::ResourceStore;
use crate::crd::{
    DEFAULT_CHECK_INTERVAL, EnginePhase, GenericConnection, ObjectKey, PostgresEngine,
    UserConnections,
};

/// Finalizer for PostgresEngine resources
pub const ENGINE_FINALIZER: &str = "postgresengine.postgres-operator.smoketurner.com/finalizer";

fn object_key(engine: &PostgresEngine) -> ObjectKey {
    ObjectKey::new(engine.namespace().unwrap_or_default(), engine.name_any())
}

#[async_trait]
impl ManagedResource for PostgresEngine {
    type Phase = EnginePhase;

    const KIND: &'static str = "PostgresEngine";
    const FINALIZER: &'static str = ENGINE_FINALIZER;

    fn store(ctx: &Context) -> &Arc<dyn ResourceStore<Self>> {
        &ctx.engines
    }

    fn phase(&self) -> EnginePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    fn set_phase(&mut self, phase: EnginePhase, message: Option<String>) {
        let status = self.status.get_or_insert_with(Default::default);
        status.phase = phase;
        status.message = message;
    }

    fn apply_defaults(&mut self) -> bool {
        let before = self.spec.clone();
        let spec = &mut self.spec;

        spec.port = Some(spec.port());
        spec.default_database = Some(spec.default_database().to_string());
        spec.uri_args = Some(spec.uri_args().to_string());
        if spec.check_interval.as_deref().is_none_or(str::is_empty) {
            spec.check_interval = Some(DEFAULT_CHECK_INTERVAL.to_string());
        }
        let primary: GenericConnection = spec.primary_connection();
        let connections = spec.user_connections.get_or_insert_with(UserConnections::default);
        if connections.primary_connection.is_none() {
            connections.primary_connection = Some(primary);
        }

        self.spec != before
    }

    fn content_hash(&self) -> Result<Option<String>> {
        content_hash(&self.spec).map(Some)
    }

    fn applied_hash(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.hash.as_deref())
    }

    fn fresh_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        let validated = parse_time(self.status.as_ref()?.last_validated_time.as_deref())?;
        let elapsed = (now - validated).to_std().unwrap_or(Duration::ZERO);
        let remaining = self.spec.check_interval().checked_sub(elapsed)?;
        (!remaining.is_zero()).then_some(remaining)
    }

    async fn apply(&mut self, ctx: &Arc<Context>) -> Result<Action> {
        let key = object_key(self);
        let hash = content_hash(&self.spec)?;

        if hash_changed(self.applied_hash(), &hash) {
            // Pools opened with the previous parameters must not be reused
            ctx.registry.close_all(&engine_key(&key)).await;
        }

        let database = self.spec.default_database().to_string();
        let handle = match connect(ctx, &key, self, &database).await {
            Ok(handle) => handle,
            Err(e) => {
                ctx.registry.close_all(&engine_key(&key)).await;
                return Err(e);
            }
        };
        if let Err(e) = handle.ping().await {
            ctx.registry.close_all(&engine_key(&key)).await;
            return Err(Error::Engine(e));
        }

        let status = self.status.get_or_insert_with(Default::default);
        status.hash = Some(hash);
        status.last_validated_time = Some(format_time(Utc::now()));

        info!(engine = %key, "Engine validated");
        Ok(Action::requeue(self.spec.check_interval()))
    }

    async fn cleanup(&mut self, ctx: &Arc<Context>) -> Result<()> {
        let key = object_key(self);
        if self.spec.wait_linked_resources_deletion {
            ensure_engine_unreferenced(ctx, &key).await?;
        }
        ctx.registry.close_all(&engine_key(&key)).await;
        Ok(())
    }
}
