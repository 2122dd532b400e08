//! Watch loop wiring the reconciler into the kube runtime.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::api::Workflow;
use crate::client::{KubeUnitClient, KubeWorkflowStore};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::pod::WORKFLOW_LABEL;
use crate::reconciler::{ReconcileOutcome, Reconciler};

/// Shared state handed to every reconcile call.
pub struct Context {
    reconciler: Reconciler,
    error_backoff: Duration,
}

async fn reconcile(workflow: Arc<Workflow>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    match ctx.reconciler.reconcile(workflow.as_ref().clone()).await? {
        ReconcileOutcome::Requeue(delay) => Ok(Action::requeue(delay)),
        ReconcileOutcome::Done => Ok(Action::await_change()),
    }
}

fn error_policy(workflow: Arc<Workflow>, err: &ControllerError, ctx: Arc<Context>) -> Action {
    warn!(
        workflow = %workflow.name_any(),
        error = %err,
        backoff_secs = ctx.error_backoff.as_secs(),
        "Reconcile failed, retrying"
    );
    Action::requeue(ctx.error_backoff)
}

/// Watch workflows and their pods until a shutdown signal arrives.
///
/// Pod events map back to the owning workflow, so a phase change of any
/// step pod triggers a pass without waiting for the requeue timer.
pub async fn run(client: Client, config: ControllerConfig) {
    let (workflows, pods) = match config.namespace.as_deref() {
        Some(namespace) => (
            Api::<Workflow>::namespaced(client.clone(), namespace),
            Api::<Pod>::namespaced(client.clone(), namespace),
        ),
        None => (Api::<Workflow>::all(client.clone()), Api::<Pod>::all(client.clone())),
    };

    let reconciler = Reconciler::new(
        Arc::new(KubeUnitClient::new(client.clone())),
        Arc::new(KubeWorkflowStore::new(client)),
        &config,
    );
    let context = Arc::new(Context {
        reconciler,
        error_backoff: config.error_backoff(),
    });

    info!(
        namespace = config.namespace.as_deref().unwrap_or("*"),
        policy = ?config.dependency_policy,
        "Starting workflow controller"
    );

    Controller::new(workflows, watcher::Config::default())
        .owns(pods, watcher::Config::default().labels(WORKFLOW_LABEL))
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((workflow, _)) => debug!(workflow = %workflow.name, "Reconciled"),
                Err(err) => warn!(error = %err, "Controller stream error"),
            }
        })
        .await;

    info!("Workflow controller stopped");
}
