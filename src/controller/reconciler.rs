//! Generic reconciliation loop shared by every resource kind
//!
//! Each kind implements [`ManagedResource`]: how to read and write its phase,
//! which defaults to fill in, how to apply itself against the engine and how to
//! clean up on deletion. [`reconcile`] composes these steps the same way for
//! all kinds and is the only place that turns errors into status, events and
//! metrics.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::events::actions;
use crate::controller::state_machine::{LifecycleEvent, LifecyclePhase, Stage, next_phase};
use crate::controller::status::hash_changed;
use crate::controller::store::ResourceStore;

/// Requeue after the record itself was updated (defaults, finalizer)
pub const METADATA_REQUEUE: Duration = Duration::from_secs(1);

/// Periodic resync for kinds without their own schedule
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Attempts to persist the outcome of a detached mutation
const DETACHED_PERSIST_ATTEMPTS: u32 = 3;

/// A record kind driven by [`reconcile`]
#[async_trait]
pub trait ManagedResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    type Phase: LifecyclePhase;

    const KIND: &'static str;
    const FINALIZER: &'static str;

    fn store(ctx: &Context) -> &Arc<dyn ResourceStore<Self>>;

    fn phase(&self) -> Self::Phase;
    fn set_phase(&mut self, phase: Self::Phase, message: Option<String>);

    /// Fill in spec defaults; returns true when the record changed
    fn apply_defaults(&mut self) -> bool {
        false
    }

    /// Hash over the fields that matter, `None` when the kind has no hash gate
    fn content_hash(&self) -> Result<Option<String>> {
        Ok(None)
    }

    /// Hash recorded by the last successful pass
    fn applied_hash(&self) -> Option<&str> {
        None
    }

    /// How long an unchanged record stays fresh, `None` when it must be reapplied now
    fn fresh_for(&self, _now: DateTime<Utc>) -> Option<Duration> {
        None
    }

    /// Bring the engine in line with the record and update the status fields
    async fn apply(&mut self, ctx: &Arc<Context>) -> Result<Action>;

    /// Deletion-path work; the finalizer is released only when this succeeds
    async fn cleanup(&mut self, ctx: &Arc<Context>) -> Result<()>;
}

/// `namespace/name` of a record
pub fn record_key<K: Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

fn has_finalizer<K: ManagedResource>(obj: &K) -> bool {
    obj.finalizers().iter().any(|f| f == K::FINALIZER)
}

/// Main reconciliation function
#[instrument(skip(obj, ctx), fields(kind = K::KIND, name = %obj.name_any(), namespace = obj.namespace().unwrap_or_default()))]
pub async fn reconcile<K: ManagedResource>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let namespace = obj
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = obj.name_any();

    // The watch event may be stale; work on the current revision
    let Some(mut current) = K::store(&ctx).get(&namespace, &name).await? else {
        debug!("Record no longer exists");
        return Ok(Action::await_change());
    };

    if current.meta().deletion_timestamp.is_some() {
        return handle_deletion(current, &ctx).await;
    }

    let mut changed = current.apply_defaults();
    if !has_finalizer(&current) {
        current.finalizers_mut().push(K::FINALIZER.to_string());
        changed = true;
    }
    if changed {
        debug!("Persisting defaults and finalizer");
        K::store(&ctx).update(&current).await?;
        return Ok(Action::requeue(METADATA_REQUEUE));
    }

    if let Some(hash) = current.content_hash()?
        && !hash_changed(current.applied_hash(), &hash)
        && current.phase().stage() == Stage::Ready
        && let Some(remaining) = current.fresh_for(Utc::now())
    {
        debug!(requeue_in = ?remaining, "Unchanged and fresh, skipping");
        return Ok(Action::requeue(remaining));
    }

    match current.apply(&ctx).await {
        Ok(action) => {
            let phase = next_phase(current.phase(), LifecycleEvent::ReconcileSucceeded)?;
            current.set_phase(phase, None);
            K::store(&ctx).patch_status(&current).await?;

            if let Some(ref state) = ctx.health_state {
                state.metrics.record_reconcile(
                    K::KIND,
                    &namespace,
                    &name,
                    started.elapsed().as_secs_f64(),
                );
                state.touch();
            }
            info!(phase = %phase, "Reconciliation completed successfully");
            Ok(action)
        }
        Err(e) => Err(record_failure(current, &ctx, e).await),
    }
}

/// Deletion branch: cleanup, then release the finalizer
async fn handle_deletion<K: ManagedResource>(mut obj: K, ctx: &Arc<Context>) -> Result<Action> {
    if !has_finalizer(&obj) {
        return Ok(Action::await_change());
    }

    info!("Handling deletion");
    if let Err(e) = obj.cleanup(ctx).await {
        return Err(record_failure(obj, ctx, e).await);
    }

    obj.finalizers_mut().retain(|f| f != K::FINALIZER);
    K::store(ctx).update(&obj).await?;
    info!("Finalizer removed");
    Ok(Action::await_change())
}

/// Write a failure into status, publish a Warning event and bump the error counter
///
/// Returns the error so the caller can hand it to the dispatcher's backoff.
async fn record_failure<K: ManagedResource>(mut obj: K, ctx: &Context, e: Error) -> Error {
    if !e.is_user_visible() {
        debug!(error = %e, "Transient conflict, retrying");
        return e;
    }

    error!(reason = e.reason(), error = %e, "Reconciliation failed");

    match next_phase(obj.phase(), LifecycleEvent::ReconcileFailed) {
        Ok(phase) => {
            obj.set_phase(phase, Some(e.to_string()));
            if let Err(patch_err) = K::store(ctx).patch_status(&obj).await {
                warn!(error = %patch_err, "Failed to record failure in status");
            }
        }
        Err(transition_err) => warn!(error = %transition_err, "Status left unchanged"),
    }

    let action = if obj.meta().deletion_timestamp.is_some() {
        actions::DELETE
    } else {
        actions::RECONCILE
    };
    ctx.events
        .publish(
            &obj.object_ref(&()),
            EventType::Warning,
            e.reason(),
            action,
            Some(e.to_string()),
        )
        .await;

    if let Some(ref state) = ctx.health_state {
        state.metrics.record_error(
            K::KIND,
            &obj.namespace().unwrap_or_default(),
            &obj.name_any(),
        );
    }
    e
}

/// Persist the result of a mutation that outlived its reconcile
///
/// `update` writes the status fields of a successful outcome; it is re-run
/// against a fresh revision if the status write loses a race.
pub async fn persist_detached_outcome<K, F>(
    ctx: &Context,
    namespace: &str,
    name: &str,
    outcome: Result<F>,
) -> Result<()>
where
    K: ManagedResource,
    F: Fn(&mut K) + Send + Sync,
{
    match outcome {
        Ok(update) => {
            for attempt in 1..=DETACHED_PERSIST_ATTEMPTS {
                let Some(mut obj) = K::store(ctx).get(namespace, name).await? else {
                    return Ok(());
                };
                update(&mut obj);
                let phase = next_phase(obj.phase(), LifecycleEvent::ReconcileSucceeded)?;
                obj.set_phase(phase, None);
                match K::store(ctx).patch_status(&obj).await {
                    Ok(_) => {
                        info!(kind = K::KIND, namespace, name, "Detached mutation completed");
                        return Ok(());
                    }
                    Err(Error::PatchConflict(_)) if attempt < DETACHED_PERSIST_ATTEMPTS => {
                        debug!(kind = K::KIND, namespace, name, attempt, "Retrying status write");
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
        Err(e) => {
            let Some(obj) = K::store(ctx).get(namespace, name).await? else {
                return Ok(());
            };
            record_failure(obj, ctx, e).await;
            Ok(())
        }
    }
}

/// Error policy for every controller
pub fn error_policy<K: ManagedResource>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    let delay = match error {
        Error::NotFound(_) => ctx.config.not_ready_requeue,
        _ => BackoffConfig::default().delay_for_error(error, 0),
    };

    if error.is_retryable() {
        warn!(
            kind = K::KIND,
            name = %obj.name_any(),
            error = %error,
            "Retryable error, requeuing in {:?}",
            delay
        );
    } else {
        error!(
            kind = K::KIND,
            name = %obj.name_any(),
            error = %error,
            "Non-retryable error, requeuing in {:?} for manual intervention",
            delay
        );
    }

    Action::requeue(delay)
}
