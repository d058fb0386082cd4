//! Reconciler for PostgresPublication resources
//!
//! The mutation (publication DDL plus the paired replication slot) runs on a
//! spawned task raced against `publicationTimeout`. When the timeout wins the
//! reconcile reports a failure right away, and the task keeps running and
//! records its own outcome once it finishes. Until then further passes for the
//! same record are refused.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::reconciler::{
    ManagedResource, RESYNC_INTERVAL, persist_detached_outcome, record_key,
};
use crate::controller::resolve::{
    connect, find_database, find_engine, resolve_database, resolve_engine,
};
use crate::controller::status::{content_hash, hash_changed};
use crate::controller::store::ResourceStore;
use crate::crd::{
    ObjectKey, PostgresDatabase, PostgresPublication, PostgresPublicationStatus, PublicationPhase,
};
use crate::resources::PgEngine;
use crate::resources::publication::{PublicationDefinition, build_alter, build_create};

/// Finalizer for PostgresPublication resources
pub const PUBLICATION_FINALIZER: &str =
    "postgrespublication.postgres-operator.smoketurner.com/finalizer";

pub const ALL_TABLES_CHANGED: &str = "cannot change all tables flag on an upgrade";
pub const SLOT_IN_OTHER_DATABASE: &str =
    "replication slot with the same name already exists for another database";
pub const SLOT_WITH_OTHER_PLUGIN: &str =
    "replication slot with the same name already exists with another plugin";

/// What a successful mutation applied
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedPublication {
    pub name: String,
    pub all_tables: bool,
    pub hash: String,
    pub replication_slot_name: String,
    pub replication_slot_plugin: String,
}

impl AppliedPublication {
    fn write_to(&self, publication: &mut PostgresPublication) {
        let status = publication.status.get_or_insert_with(Default::default);
        status.name = self.name.clone();
        status.all_tables = self.all_tables;
        status.hash = self.hash.clone();
        status.replication_slot_name = self.replication_slot_name.clone();
        status.replication_slot_plugin = self.replication_slot_plugin.clone();
    }
}

/// Marks a record as having a mutation in flight until dropped
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, key: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
        inserted.then(|| Self {
            set: Arc::clone(set),
            key: key.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

fn is_in_flight(set: &Mutex<HashSet<String>>, key: &str) -> bool {
    set.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(key)
}

fn database_ref(publication: &PostgresPublication) -> ObjectKey {
    publication
        .spec
        .database
        .resolve(&publication.namespace().unwrap_or_default())
}

fn engine_ref_of(database: &PostgresDatabase) -> ObjectKey {
    database
        .spec
        .engine_configuration
        .resolve(&database.namespace().unwrap_or_default())
}

/// Everything the detached task needs
struct Mutation {
    engine: Arc<dyn PgEngine>,
    definition: PublicationDefinition,
    hash: String,
    previous: PostgresPublicationStatus,
    database: String,
    slot_name: String,
    slot_plugin: String,
}

impl Mutation {
    async fn run(self) -> Result<AppliedPublication> {
        let engine = self.engine.as_ref();
        let definition = &self.definition;
        let previous = &self.previous;

        let mut existing = engine.publication(&definition.name).await?;
        if existing.is_none() && !previous.name.is_empty() && previous.name != definition.name {
            existing = engine.publication(&previous.name).await?;
        }

        match existing {
            None => {
                info!(publication = %definition.name, "Creating publication");
                engine.execute_publication(&build_create(definition)).await?;
            }
            Some(current) if hash_changed(Some(&previous.hash), &self.hash) => {
                if current.all_tables != definition.selection.is_all_tables() {
                    return Err(Error::Conflict(ALL_TABLES_CHANGED.to_string()));
                }
                info!(publication = %current.name, "Updating publication");
                for statement in build_alter(&current.name, definition) {
                    engine.execute_publication(&statement).await?;
                }
            }
            Some(_) => debug!(publication = %definition.name, "Publication up to date"),
        }

        match engine.replication_slot(&self.slot_name).await? {
            None => {
                info!(slot = %self.slot_name, plugin = %self.slot_plugin, "Creating replication slot");
                engine
                    .create_replication_slot(&self.slot_name, &self.slot_plugin)
                    .await?;
            }
            Some(slot) => {
                if slot.database.as_deref() != Some(self.database.as_str()) {
                    return Err(Error::Conflict(SLOT_IN_OTHER_DATABASE.to_string()));
                }
                if slot.plugin.as_deref() != Some(self.slot_plugin.as_str()) {
                    return Err(Error::Conflict(SLOT_WITH_OTHER_PLUGIN.to_string()));
                }
            }
        }

        let old_slot = &previous.replication_slot_name;
        if !old_slot.is_empty()
            && *old_slot != self.slot_name
            && engine.replication_slot(old_slot).await?.is_some()
        {
            info!(slot = %old_slot, "Dropping renamed replication slot");
            engine.drop_replication_slot(old_slot).await?;
        }

        Ok(AppliedPublication {
            name: definition.name.clone(),
            all_tables: definition.selection.is_all_tables(),
            hash: self.hash,
            replication_slot_name: self.slot_name,
            replication_slot_plugin: self.slot_plugin,
        })
    }
}

#[async_trait]
impl ManagedResource for PostgresPublication {
    type Phase = PublicationPhase;

    const KIND: &'static str = "PostgresPublication";
    const FINALIZER: &'static str = PUBLICATION_FINALIZER;

    fn store(ctx: &Context) -> &Arc<dyn ResourceStore<Self>> {
        &ctx.publications
    }

    fn phase(&self) -> PublicationPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    fn set_phase(&mut self, phase: PublicationPhase, message: Option<String>) {
        let status = self.status.get_or_insert_with(Default::default);
        status.phase = phase;
        status.message = message;
    }

    async fn apply(&mut self, ctx: &Arc<Context>) -> Result<Action> {
        let key = record_key(self);
        let definition = PublicationDefinition::try_from(&self.spec)?;

        let guard = InFlightGuard::acquire(&ctx.in_flight, &key).ok_or_else(|| {
            Error::MutationInFlight(format!(
                "a previous change of publication {} is still running",
                key
            ))
        })?;

        let database = resolve_database(ctx, &database_ref(self)).await?;
        let engine_ref = engine_ref_of(&database);
        let engine = resolve_engine(ctx, &engine_ref).await?;
        let database_name = database
            .status
            .as_ref()
            .map(|s| s.database.clone())
            .unwrap_or_default();
        let handle = connect(ctx, &engine_ref, &engine, &database_name).await?;

        let mutation = Mutation {
            engine: handle,
            definition,
            hash: content_hash(&self.spec)?,
            previous: self.status.clone().unwrap_or_default(),
            database: database_name,
            slot_name: self.spec.slot_name().to_string(),
            slot_plugin: self.spec.slot_plugin().to_string(),
        };

        let (tx, rx) = oneshot::channel();
        let task_ctx = Arc::clone(ctx);
        let namespace = self.namespace().unwrap_or_default();
        let name = self.name_any();
        tokio::spawn(async move {
            let outcome = mutation.run().await;
            if let Err((outcome, guard)) = tx.send((outcome, guard)) {
                // Nobody is waiting any more: record the outcome ourselves
                let update = outcome.map(|applied| {
                    move |publication: &mut PostgresPublication| applied.write_to(publication)
                });
                if let Err(e) = persist_detached_outcome::<PostgresPublication, _>(
                    &task_ctx, &namespace, &name, update,
                )
                .await
                {
                    warn!(namespace = %namespace, name = %name, error = %e, "Failed to persist detached publication change");
                }
                drop(guard);
            }
        });

        let timeout = ctx.config.publication_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok((outcome, _guard))) => {
                outcome?.write_to(self);
                Ok(Action::requeue(RESYNC_INTERVAL))
            }
            Ok(Err(_)) => Err(Error::Timeout(format!(
                "change of publication {} ended without a result",
                key
            ))),
            Err(_) => Err(Error::Timeout(format!(
                "change of publication {} did not finish within {:?}, it continues in the background",
                key, timeout
            ))),
        }
    }

    async fn cleanup(&mut self, ctx: &Arc<Context>) -> Result<()> {
        let key = record_key(self);
        if is_in_flight(&ctx.in_flight, &key) {
            return Err(Error::MutationInFlight(format!(
                "a previous change of publication {} is still running",
                key
            )));
        }
        if !self.spec.drop_on_delete {
            return Ok(());
        }

        let Some(database) = find_database(ctx, &database_ref(self)).await? else {
            warn!(publication = %key, "Referenced database not found, skipping publication cleanup");
            return Ok(());
        };
        let database_name = database
            .status
            .as_ref()
            .map(|s| s.database.clone())
            .unwrap_or_default();
        if database_name.is_empty() {
            return Ok(());
        }
        let engine_ref = engine_ref_of(&database);
        let Some(engine) = find_engine(ctx, &engine_ref).await? else {
            warn!(publication = %key, engine = %engine_ref, "Referenced engine not found, skipping publication cleanup");
            return Ok(());
        };
        let handle = connect(ctx, &engine_ref, &engine, &database_name).await?;

        let status = self.status.clone().unwrap_or_default();
        let name = if status.name.is_empty() {
            self.spec.name.clone()
        } else {
            status.name
        };
        if handle.publication(&name).await?.is_some() {
            info!(publication = %name, "Dropping publication");
            handle.drop_publication(&name).await?;
        }

        let slot = if status.replication_slot_name.is_empty() {
            self.spec.slot_name().to_string()
        } else {
            status.replication_slot_name
        };
        if handle.replication_slot(&slot).await?.is_some() {
            info!(slot = %slot, "Dropping replication slot");
            handle.drop_replication_slot(&slot).await?;
        }
        Ok(())
    }
}
