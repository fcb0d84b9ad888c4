//! RegistryConfig controller
//!
//! Watches registry-cache.extensions.io/v1alpha1 RegistryConfig resources and
//! converges cache workloads and the node agent towards their spec.
//!
//! ## Deletion Handling
//!
//! A finalizer keeps the resource until both bundles are gone. The agent bundle
//! is removed before the caches so that nodes stop pointing at caches first.
//!
//! ## Single Owner
//!
//! Cache workloads and the node agent have fixed names, so only the oldest
//! RegistryConfig in the cluster manages them. Any other one is reported as
//! conflicting, rechecked every resync interval, and never deletes the shared
//! objects when it is removed.
//!
//! ## Status Writes
//!
//! The status is only written when it changes apart from timestamps, and the
//! `Ready` condition keeps its transition time until its status flips.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event as FinalizerEvent};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::Client as KubeClient;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::{Condition, RegistryConfig, RegistryConfigStatus, FINALIZER};
use crate::reconciler::{ReconcileError, ReconcileOutcome};

use super::retry::{compute_backoff, ErrorKind};
use super::ControllerContext;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<FinalizerError<ReconcileError>>),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Update the status subresource of a RegistryConfig
async fn update_status(
    api: &Api<RegistryConfig>,
    name: &str,
    status: RegistryConfigStatus,
) -> Result<(), kube::Error> {
    let patch = serde_json::json!({
        "status": status
    });

    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    Ok(())
}

fn name_and_namespace(config: &RegistryConfig) -> Result<(&str, &str), ReconcileError> {
    let name = config
        .metadata
        .name
        .as_deref()
        .ok_or(ReconcileError::MissingField("metadata.name"))?;
    let namespace = config
        .metadata
        .namespace
        .as_deref()
        .ok_or(ReconcileError::MissingField("metadata.namespace"))?;
    Ok((name, namespace))
}

/// Status after a successful pass
fn ready_status(generation: Option<i64>, outcome: ReconcileOutcome) -> RegistryConfigStatus {
    RegistryConfigStatus {
        observed_generation: generation,
        ready: true,
        caches: outcome.caches,
        artifact_digest: Some(outcome.artifact_digest),
        last_reconcile_time: Some(chrono::Utc::now().to_rfc3339()),
        error: None,
        conditions: vec![Condition::ready(
            true,
            "Reconciled",
            "Mirror configuration published",
        )],
    }
}

/// Status after a failed pass.
///
/// What nodes currently apply is still described by the previous status, so
/// its caches and digest are kept.
fn failed_status(
    generation: Option<i64>,
    previous: Option<&RegistryConfigStatus>,
    error: &ReconcileError,
) -> RegistryConfigStatus {
    let previous = previous.cloned().unwrap_or_default();
    let message = error.to_string();
    RegistryConfigStatus {
        observed_generation: generation,
        ready: false,
        caches: previous.caches,
        artifact_digest: previous.artifact_digest,
        last_reconcile_time: Some(chrono::Utc::now().to_rfc3339()),
        conditions: vec![Condition::ready(false, error.reason(), &message)],
        error: Some(message),
    }
}

/// The status to write, or `None` when only timestamps would change.
///
/// Every status write is a watch event, so an unchanged status must not be
/// written again.
fn status_update(
    previous: Option<&RegistryConfigStatus>,
    mut next: RegistryConfigStatus,
) -> Option<RegistryConfigStatus> {
    let Some(previous) = previous else {
        return Some(next);
    };

    next.conditions = next
        .conditions
        .into_iter()
        .map(|c| c.since(&previous.conditions))
        .collect();

    let unchanged = RegistryConfigStatus {
        last_reconcile_time: previous.last_reconcile_time.clone(),
        ..next.clone()
    } == *previous;
    (!unchanged).then_some(next)
}

/// The RegistryConfig managing the shared cache objects: the oldest one,
/// ties broken by namespace and name
fn owner_of(configs: &[RegistryConfig]) -> Option<&RegistryConfig> {
    configs.iter().min_by_key(|c| {
        let created = c.metadata.creation_timestamp.as_ref().map(|t| t.0);
        (
            created.is_none(),
            created,
            c.metadata.namespace.clone(),
            c.metadata.name.clone(),
        )
    })
}

/// Name of another RegistryConfig that manages the shared objects, if any
async fn other_owner(
    ctx: &ControllerContext,
    config: &RegistryConfig,
) -> Result<Option<String>, kube::Error> {
    let all: Api<RegistryConfig> = Api::all(ctx.kube_client.clone());
    let configs = all.list(&ListParams::default()).await?.items;

    Ok(owner_of(&configs)
        .filter(|owner| owner.metadata.uid != config.metadata.uid)
        .map(|owner| {
            format!(
                "{}/{}",
                owner.metadata.namespace.as_deref().unwrap_or_default(),
                owner.metadata.name.as_deref().unwrap_or_default()
            )
        }))
}

async fn apply(
    config: Arc<RegistryConfig>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileError> {
    let (name, namespace) = name_and_namespace(&config)?;
    let api: Api<RegistryConfig> = Api::namespaced(ctx.kube_client.clone(), namespace);
    let generation = config.metadata.generation;

    info!(caches = config.spec.caches.len(), "Reconciling RegistryConfig");

    let result = match other_owner(&ctx, &config).await {
        Ok(Some(owner)) => Err(ReconcileError::Conflict { owner }),
        Ok(None) => {
            ctx.reconciler
                .reconcile(namespace, &config.spec.caches)
                .await
        }
        Err(e) => Err(e.into()),
    };

    let (status, result) = match result {
        Ok(outcome) => {
            info!(
                digest = %outcome.artifact_digest,
                caches = outcome.caches.len(),
                "Mirror configuration published"
            );
            (ready_status(generation, outcome), Ok(()))
        }
        Err(e) => (failed_status(generation, config.status.as_ref(), &e), Err(e)),
    };

    match status_update(config.status.as_ref(), status) {
        Some(status) => update_status(&api, name, status).await?,
        None => debug!("Status unchanged"),
    }

    result?;
    if let Some(uid) = config.metadata.uid.as_deref() {
        ctx.retry_tracker.reset(uid);
    }
    Ok(Action::requeue(ctx.settings.resync_interval))
}

async fn cleanup(
    config: Arc<RegistryConfig>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileError> {
    let (_, namespace) = name_and_namespace(&config)?;

    if let Some(owner) = other_owner(&ctx, &config).await? {
        info!(owner = %owner, "Not the managing RegistryConfig, leaving shared objects in place");
        return Ok(Action::await_change());
    }

    info!("Removing registry caches");
    ctx.reconciler.delete(namespace).await?;

    if let Some(uid) = config.metadata.uid.as_deref() {
        ctx.retry_tracker.reset(uid);
    }
    Ok(Action::await_change())
}

/// Reconcile a single RegistryConfig resource
#[instrument(
    skip(ctx, config),
    fields(
        name = %config.metadata.name.as_deref().unwrap_or("unknown"),
        namespace = %config.metadata.namespace.as_deref().unwrap_or("default")
    )
)]
async fn reconcile(
    config: Arc<RegistryConfig>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ControllerError> {
    let namespace = config
        .metadata
        .namespace
        .clone()
        .ok_or(ControllerError::MissingField("metadata.namespace"))?;
    let api: Api<RegistryConfig> = Api::namespaced(ctx.kube_client.clone(), &namespace);

    finalizer(&api, FINALIZER, config, |event| async move {
        match event {
            FinalizerEvent::Apply(config) => apply(config, ctx).await,
            FinalizerEvent::Cleanup(config) => cleanup(config, ctx).await,
        }
    })
    .await
    .map_err(|e| ControllerError::Finalizer(Box::new(e)))
}

/// Retry class of a controller error, looking through the finalizer wrapper
fn classify_error(error: &ControllerError) -> ErrorKind {
    match error {
        ControllerError::Finalizer(inner) => match inner.as_ref() {
            FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => e.kind(),
            FinalizerError::UnnamedObject => ErrorKind::Permanent,
            _ => ErrorKind::Transient,
        },
        ControllerError::MissingField(_) => ErrorKind::Permanent,
    }
}

fn is_conflict(error: &ControllerError) -> bool {
    matches!(
        error,
        ControllerError::Finalizer(inner)
            if matches!(inner.as_ref(), FinalizerError::ApplyFailed(ReconcileError::Conflict { .. }))
    )
}

/// Count the failure and pick the requeue delay
fn error_policy(
    config: Arc<RegistryConfig>,
    error: &ControllerError,
    ctx: Arc<ControllerContext>,
) -> Action {
    if is_conflict(error) {
        // A standby configuration takes over once the managing one is gone
        debug!(error = %error, "RegistryConfig is on standby");
        return Action::requeue(ctx.settings.resync_interval);
    }

    let uid = config.metadata.uid.as_deref().unwrap_or("unknown");
    let kind = classify_error(error);
    let attempt = ctx.retry_tracker.increment(uid);

    warn!(
        name = %config.metadata.name.as_deref().unwrap_or("unknown"),
        error = %error,
        attempt = attempt,
        error_kind = ?kind,
        "RegistryConfig reconciliation failed"
    );

    compute_backoff(attempt, kind)
}

/// Start the RegistryConfig controller
pub async fn run(client: KubeClient, ctx: Arc<ControllerContext>) {
    let configs: Api<RegistryConfig> = Api::all(client);

    info!("Starting RegistryConfig controller");

    Controller::new(configs, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(
                        name = %obj.name,
                        "RegistryConfig reconciled successfully"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "RegistryConfig controller error");
                }
            }
        })
        .await;
}
