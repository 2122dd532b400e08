//! Workflow reconciliation.
//!
//! A pass re-derives everything from the stored workflow and the live pods:
//! task phases, the aggregate phase, and which tasks may start next. Nothing
//! is carried between passes, so a pass can run any number of times for the
//! same state. Passes for one workflow must not overlap; the controller
//! runtime guarantees that.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStateTerminated, Pod};
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::api::{Output, Task, TaskPhase, TaskStatus, Workflow, WorkflowPhase};
use crate::client::{UnitClient, WorkflowStore};
use crate::config::ControllerConfig;
use crate::dag::{find_completed_tasks, find_schedulable_nodes, find_schedulable_tasks, Dag, DependencyPolicy};
use crate::error::{ControllerError, ControllerResult, ResultExt};
use crate::pod::{generate_unit_name, PodBuilder, TASK_LABEL, TERMINATION_MESSAGE_LIMIT, WORKFLOW_LABEL};

/// Finalizers the controller puts on a workflow, one per created pod.
pub const FINALIZER_PREFIX: &str = "skyflow.io/";

/// What the caller should do after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Run another pass after the delay.
    Requeue(Duration),
    /// Nothing left to do until the object changes.
    Done,
}

pub struct Reconciler {
    units: Arc<dyn UnitClient>,
    store: Arc<dyn WorkflowStore>,
    pods: PodBuilder,
    policy: DependencyPolicy,
    requeue_interval: Duration,
}

impl Reconciler {
    pub fn new(
        units: Arc<dyn UnitClient>,
        store: Arc<dyn WorkflowStore>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            units,
            store,
            pods: PodBuilder::new(config),
            policy: config.dependency_policy,
            requeue_interval: config.requeue_interval(),
        }
    }

    /// Run one pass over `workflow`.
    pub async fn reconcile(&self, mut workflow: Workflow) -> ControllerResult<ReconcileOutcome> {
        let name = workflow.name_any();
        let namespace = workflow
            .namespace()
            .ok_or(ControllerError::MissingField("metadata.namespace"))?;

        stamp_start_time(&mut workflow);

        if workflow.metadata.deletion_timestamp.is_some() {
            info!(workflow = %name, "Workflow is being deleted");
            self.clear_finalizers(&workflow).await?;
            return Ok(ReconcileOutcome::Done);
        }

        let phase = workflow.phase();
        if phase.is_terminal() {
            debug!(workflow = %name, phase = %phase, "Workflow settled");
            return Ok(ReconcileOutcome::Done);
        }

        let duplicates = workflow.duplicate_task_names();
        if !duplicates.is_empty() {
            warn!(workflow = %name, duplicates = ?duplicates, "Workflow has duplicate task names");
            let message = format!("workflow has duplicate task names: {}", duplicates.join(", "));
            self.fail(&mut workflow, message).await?;
            return Ok(ReconcileOutcome::Done);
        }

        if phase.is_halted() {
            debug!(workflow = %name, phase = %phase, "Workflow halted");
            return Ok(ReconcileOutcome::Done);
        }

        let observed = self.observe_tasks(&workflow, &namespace).await?;
        workflow.status_mut().task_status = observed;
        settle(&mut workflow);
        workflow = self
            .store
            .update_status(&workflow)
            .await
            .log("updating observed task status")?;

        if workflow.phase().is_terminal() {
            info!(workflow = %name, phase = %workflow.phase(), "Workflow finished");
            return Ok(ReconcileOutcome::Done);
        }

        let dag = match Dag::build(&workflow.spec.tasks) {
            Ok(dag) if dag.validate() => dag,
            Ok(dag) => {
                warn!(
                    workflow = %name,
                    tasks = dag.len(),
                    root = ?dag.root().map(|node| node.name.as_str()),
                    "Workflow has invalid dependencies"
                );
                let message = "workflow has invalid dependencies: tasks must form an acyclic graph with exactly one root";
                self.fail(&mut workflow, message).await?;
                return Ok(ReconcileOutcome::Done);
            }
            Err(err) => {
                warn!(workflow = %name, error = %err, "Workflow has invalid dependencies");
                self.fail(&mut workflow, format!("workflow has invalid dependencies: {err}"))
                    .await?;
                return Ok(ReconcileOutcome::Done);
            }
        };

        let task_status = workflow.task_status().cloned().unwrap_or_default();
        let nodes = find_schedulable_nodes(&dag, &task_status, self.policy);
        let tasks = find_schedulable_tasks(&nodes, &workflow.spec.tasks);
        if tasks.is_empty() {
            debug!(workflow = %name, tracked = task_status.len(), "No task ready to start");
            return Ok(ReconcileOutcome::Requeue(self.requeue_interval));
        }
        for node in &nodes {
            debug!(
                workflow = %name,
                task = %node.name,
                after = ?dag.dependencies_of(node).collect::<Vec<_>>(),
                "Task ready"
            );
        }

        let mut finalizers = workflow.finalizers().to_vec();
        for task in &tasks {
            let pod = match self.existing_unit(task, &workflow, &namespace).await? {
                Some(pod) => {
                    info!(workflow = %name, task = %task.name, pod = %pod.name_any(), "Adopting existing task pod");
                    pod
                }
                None => match self.create_unit(task, &workflow).await {
                    Ok(pod) => pod,
                    Err(err) => {
                        error!(workflow = %name, task = %task.name, error = %err, "Failed to create task pod");
                        if let Err(update_err) = self.fail(&mut workflow, err.to_string()).await {
                            warn!(workflow = %name, error = %update_err, "Failed to record workflow failure");
                        }
                        return Err(err);
                    }
                },
            };

            let pod_name = pod.name_any();
            let phase = TaskPhase::from_pod_phase(pod.status.as_ref().and_then(|s| s.phase.as_deref()));
            info!(workflow = %name, task = %task.name, pod = %pod_name, "Task scheduled");
            workflow
                .status_mut()
                .task_status
                .insert(task.name.clone(), TaskStatus::new(&task.name, &pod_name, phase));

            let finalizer = format!("{FINALIZER_PREFIX}{pod_name}");
            if !finalizers.contains(&finalizer) {
                finalizers.push(finalizer);
            }
        }

        if finalizers.as_slice() != workflow.finalizers() {
            let status = workflow.status.clone();
            workflow = self
                .store
                .set_finalizers(&workflow, finalizers)
                .await
                .log("recording task pod finalizers")?;
            workflow.status = status;
        }

        let status = workflow.status_mut();
        status.status = status.status.start();
        self.store
            .update_status(&workflow)
            .await
            .log("updating scheduled task status")?;

        Ok(ReconcileOutcome::Requeue(self.requeue_interval))
    }

    /// Refresh every tracked task from its pod. Finished tasks are kept as
    /// recorded.
    async fn observe_tasks(
        &self,
        workflow: &Workflow,
        namespace: &str,
    ) -> ControllerResult<BTreeMap<String, TaskStatus>> {
        let mut observed = BTreeMap::new();

        for (task, recorded) in workflow.task_status().into_iter().flatten() {
            if recorded.status.is_terminal() {
                observed.insert(task.clone(), recorded.clone());
                continue;
            }

            let status = match self
                .units
                .get(&recorded.pod_name, namespace)
                .await
                .log("fetching task pod")?
            {
                Some(pod) => observe_unit(task, &pod),
                None => {
                    warn!(task = %task, pod = %recorded.pod_name, "Task pod not found");
                    TaskStatus {
                        message: Some("execution unit not found".to_string()),
                        ..TaskStatus::new(task, &recorded.pod_name, TaskPhase::Failed)
                    }
                }
            };
            if status.status != recorded.status {
                debug!(task = %task, from = %recorded.status, to = %status.status, "Task phase changed");
            }
            observed.insert(task.clone(), status);
        }

        Ok(observed)
    }

    /// A pod from an earlier pass that never made it into the status.
    async fn existing_unit(
        &self,
        task: &Task,
        workflow: &Workflow,
        namespace: &str,
    ) -> ControllerResult<Option<Pod>> {
        let selector = format!(
            "{WORKFLOW_LABEL}={},{TASK_LABEL}={}",
            workflow.name_any(),
            task.name
        );
        let uid = workflow.uid();
        let pods = self
            .units
            .list(&selector, namespace)
            .await
            .log("listing task pods")?;

        Ok(pods.into_iter().find(|pod| {
            pod.owner_references()
                .iter()
                .any(|owner| owner.controller == Some(true) && Some(&owner.uid) == uid.as_ref())
        }))
    }

    async fn create_unit(&self, task: &Task, workflow: &Workflow) -> ControllerResult<Pod> {
        let pod_name = generate_unit_name(&workflow.name_any(), &task.name);
        let pod = self.pods.build(task, workflow, &pod_name)?;
        self.units
            .create(&pod)
            .await
            .map_err(|err| ControllerError::UnitCreation {
                task: task.name.clone(),
                reason: err.to_string(),
            })
    }

    async fn fail(&self, workflow: &mut Workflow, message: impl Into<String>) -> ControllerResult<()> {
        let status = workflow.status_mut();
        status.status = WorkflowPhase::Failed;
        status.message = Some(message.into());
        status.completion_time = Some(Utc::now());
        *workflow = self
            .store
            .update_status(workflow)
            .await
            .log("recording workflow failure")?;
        Ok(())
    }

    async fn clear_finalizers(&self, workflow: &Workflow) -> ControllerResult<()> {
        let remaining: Vec<String> = workflow
            .finalizers()
            .iter()
            .filter(|finalizer| !finalizer.starts_with(FINALIZER_PREFIX))
            .cloned()
            .collect();
        if remaining.len() == workflow.finalizers().len() {
            return Ok(());
        }
        self.store
            .set_finalizers(workflow, remaining)
            .await
            .log("clearing finalizers")?;
        Ok(())
    }
}

fn stamp_start_time(workflow: &mut Workflow) {
    let created = workflow.metadata.creation_timestamp.as_ref().map(|t| t.0);
    let status = workflow.status_mut();
    if status.start_time.is_none() {
        status.start_time = Some(created.unwrap_or_else(Utc::now));
    }
}

/// Derive the aggregate phase once every tracked task has finished.
///
/// A failure ends the workflow. Success needs every task of the spec to be
/// tracked, otherwise more tasks are about to be scheduled.
fn settle(workflow: &mut Workflow) {
    let total = workflow.spec.tasks.len();
    let completed = find_completed_tasks(workflow);
    let Some(status) = workflow.status.as_mut() else {
        return;
    };

    let tracked = status.task_status.len();
    if tracked == 0 || completed.len() != tracked {
        return;
    }

    let failed: Vec<String> = status
        .task_status
        .values()
        .filter(|task| task.status == TaskPhase::Failed)
        .map(|task| task.name.clone())
        .collect();
    if failed.is_empty() && tracked < total {
        return;
    }

    if !failed.is_empty() {
        status.message = Some(format!("task(s) failed: {}", failed.join(", ")));
    }
    status.status = status.status.finish(!failed.is_empty());
    status.completion_time = status
        .task_status
        .values()
        .filter_map(|task| task.completion_time)
        .max()
        .or_else(|| Some(Utc::now()));
}

/// Translate a pod into the status of the task it runs.
pub fn observe_unit(task: &str, pod: &Pod) -> TaskStatus {
    let pod_status = pod.status.as_ref();
    let phase = TaskPhase::from_pod_phase(pod_status.and_then(|s| s.phase.as_deref()));
    let mut status = TaskStatus::new(task, &pod.name_any(), phase);

    if phase.is_terminal() {
        status.message = pod_status.and_then(|s| s.message.clone());
        status.completion_time = last_step_finished_at(pod);
        status.results = collect_outputs(task, pod);
    }

    status
}

/// Terminated state of each step container, in step order.
fn terminated_steps(pod: &Pod) -> Vec<(&str, &ContainerStateTerminated)> {
    let (Some(spec), Some(statuses)) = (
        pod.spec.as_ref(),
        pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()),
    ) else {
        return Vec::new();
    };

    spec.containers
        .iter()
        .filter_map(|container| {
            let state = statuses.iter().find(|s| s.name == container.name)?.state.as_ref()?;
            state.terminated.as_ref().map(|t| (container.name.as_str(), t))
        })
        .collect()
}

fn last_step_finished_at(pod: &Pod) -> Option<DateTime<Utc>> {
    let last = pod.spec.as_ref()?.containers.last()?;
    terminated_steps(pod)
        .into_iter()
        .find(|(name, _)| *name == last.name)
        .and_then(|(_, terminated)| terminated.finished_at.as_ref())
        .map(|time| time.0)
}

/// Outputs reported by the step containers; later steps win on name clashes.
fn collect_outputs(task: &str, pod: &Pod) -> Vec<Output> {
    let mut outputs: Vec<Output> = Vec::new();

    for (container, terminated) in terminated_steps(pod) {
        let Some(message) = terminated.message.as_deref().filter(|m| !m.trim().is_empty()) else {
            continue;
        };
        match parse_termination_message(message) {
            Ok(entries) => {
                for entry in entries {
                    match outputs.iter_mut().find(|o| o.name == entry.name) {
                        Some(existing) => existing.value = entry.value,
                        None => outputs.push(entry),
                    }
                }
            }
            Err(err) => {
                warn!(task = %task, container = %container, error = %err, "Ignoring unreadable termination message");
            }
        }
    }

    outputs
}

/// Parse a step's termination message, a JSON array of name/value records.
pub fn parse_termination_message(message: &str) -> ControllerResult<Vec<Output>> {
    if message.len() > TERMINATION_MESSAGE_LIMIT {
        return Err(ControllerError::TerminationMessageTooLarge(message.len()));
    }
    Ok(serde_json::from_str(message)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Input, Step, TaskResult, WorkflowSpec};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStatus, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct FakeUnits {
        pods: Mutex<Vec<Pod>>,
        reject_creates: bool,
    }

    impl FakeUnits {
        fn rejecting() -> Self {
            Self {
                reject_creates: true,
                ..Default::default()
            }
        }

        fn count(&self) -> usize {
            self.pods.lock().unwrap().len()
        }

        fn pod_for(&self, task: &str) -> Pod {
            self.pods
                .lock()
                .unwrap()
                .iter()
                .find(|pod| pod.labels()[TASK_LABEL] == task)
                .cloned()
                .unwrap()
        }

        fn insert(&self, pod: Pod) {
            self.pods.lock().unwrap().push(pod);
        }

        /// Finish every step container of the task's pod.
        fn finish(&self, task: &str, phase: &str, messages: &[&str]) {
            let mut pods = self.pods.lock().unwrap();
            let pod = pods
                .iter_mut()
                .find(|pod| pod.labels()[TASK_LABEL] == task)
                .unwrap();
            let containers = &pod.spec.as_ref().unwrap().containers;
            let statuses = containers
                .iter()
                .enumerate()
                .map(|(index, container)| ContainerStatus {
                    name: container.name.clone(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code: if phase == "Succeeded" { 0 } else { 1 },
                            message: messages.get(index).map(|m| m.to_string()),
                            finished_at: Some(Time(finished_at(index as i64))),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect();
            pod.status = Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(statuses),
                ..Default::default()
            });
        }
    }

    #[async_trait::async_trait]
    impl UnitClient for FakeUnits {
        async fn create(&self, pod: &Pod) -> ControllerResult<Pod> {
            if self.reject_creates {
                return Err(ControllerError::Kube(kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "pods is forbidden: exceeded quota".to_string(),
                    reason: "Forbidden".to_string(),
                    code: 403,
                })));
            }
            self.insert(pod.clone());
            Ok(pod.clone())
        }

        async fn get(&self, name: &str, _namespace: &str) -> ControllerResult<Option<Pod>> {
            Ok(self.pods.lock().unwrap().iter().find(|p| p.name_any() == name).cloned())
        }

        async fn list(&self, label_selector: &str, _namespace: &str) -> ControllerResult<Vec<Pod>> {
            let wanted: Vec<(&str, &str)> = label_selector
                .split(',')
                .filter_map(|pair| pair.split_once('='))
                .collect();
            Ok(self
                .pods
                .lock()
                .unwrap()
                .iter()
                .filter(|pod| {
                    wanted
                        .iter()
                        .all(|(k, v)| pod.labels().get(*k).map(String::as_str) == Some(*v))
                })
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct FakeStore {
        latest: Mutex<Option<Workflow>>,
        writes: Mutex<usize>,
    }

    impl FakeStore {
        fn save(&self, mut workflow: Workflow) -> Workflow {
            let version: u64 = workflow
                .metadata
                .resource_version
                .as_deref()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            workflow.metadata.resource_version = Some((version + 1).to_string());
            *self.writes.lock().unwrap() += 1;
            *self.latest.lock().unwrap() = Some(workflow.clone());
            workflow
        }

        fn latest(&self) -> Workflow {
            self.latest.lock().unwrap().clone().unwrap()
        }

        fn writes(&self) -> usize {
            *self.writes.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl WorkflowStore for FakeStore {
        async fn update_status(&self, workflow: &Workflow) -> ControllerResult<Workflow> {
            Ok(self.save(workflow.clone()))
        }

        async fn set_finalizers(
            &self,
            workflow: &Workflow,
            finalizers: Vec<String>,
        ) -> ControllerResult<Workflow> {
            let mut updated = workflow.clone();
            updated.metadata.finalizers = Some(finalizers);
            Ok(self.save(updated))
        }
    }

    fn finished_at(offset: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + offset, 0).unwrap()
    }

    fn task(name: &str, deps: &[&str]) -> Task {
        Task {
            name: name.to_string(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            steps: vec![Step {
                name: "main".to_string(),
                image: "alpine:3.20".to_string(),
                script: format!("echo {name}"),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn workflow(tasks: Vec<Task>) -> Workflow {
        let mut wf = Workflow::new("wf", WorkflowSpec { inputs: vec![], tasks });
        wf.metadata.namespace = Some("default".to_string());
        wf.metadata.uid = Some("6a1d2c1e-0000-4000-8000-000000000001".to_string());
        wf.metadata.creation_timestamp = Some(Time(finished_at(-60)));
        wf
    }

    struct Harness {
        units: Arc<FakeUnits>,
        store: Arc<FakeStore>,
        reconciler: Reconciler,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_units(FakeUnits::default())
        }

        fn with_units(units: FakeUnits) -> Self {
            let units = Arc::new(units);
            let store = Arc::new(FakeStore::default());
            let reconciler = Reconciler::new(units.clone(), store.clone(), &ControllerConfig::default());
            Self {
                units,
                store,
                reconciler,
            }
        }

        /// Run a pass and return the workflow as stored afterwards.
        async fn pass(&self, workflow: Workflow) -> (ReconcileOutcome, Workflow) {
            let outcome = assert_ok!(self.reconciler.reconcile(workflow.clone()).await);
            let stored = self.store.latest.lock().unwrap().clone().unwrap_or(workflow);
            (outcome, stored)
        }
    }

    fn task_phase(workflow: &Workflow, task: &str) -> TaskPhase {
        workflow.task_status().unwrap()[task].status
    }

    #[tokio::test]
    async fn test_first_pass_schedules_root() {
        let h = Harness::new();
        let (outcome, wf) = h.pass(workflow(vec![task("a", &[]), task("b", &["a"])])).await;

        assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(5)));
        assert_eq!(h.units.count(), 1);
        assert_eq!(wf.phase(), WorkflowPhase::Running);
        assert_eq!(task_phase(&wf, "a"), TaskPhase::Pending);
        assert!(!wf.task_status().unwrap().contains_key("b"));

        let status = wf.status.as_ref().unwrap();
        assert_eq!(status.start_time, Some(finished_at(-60)));
        let pod_name = &status.task_status["a"].pod_name;
        assert!(pod_name.starts_with("wf-a-"));
        assert_eq!(wf.finalizers(), &[format!("{FINALIZER_PREFIX}{pod_name}")]);
    }

    #[tokio::test]
    async fn test_duplicate_names_fail_without_units() {
        let h = Harness::new();
        let (outcome, wf) = h.pass(workflow(vec![task("x", &[]), task("x", &[])])).await;

        assert_eq!(outcome, ReconcileOutcome::Done);
        assert_eq!(h.units.count(), 0);
        assert_eq!(wf.phase(), WorkflowPhase::Failed);
        let message = wf.status.unwrap().message.unwrap();
        assert!(message.contains("duplicate task names"));
        assert!(message.contains('x'));
    }

    #[tokio::test]
    async fn test_repeated_pass_is_idempotent() {
        let h = Harness::new();
        let (_, first) = h.pass(workflow(vec![task("a", &[]), task("b", &["a"])])).await;
        let (outcome, second) = h.pass(first.clone()).await;

        assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(5)));
        assert_eq!(h.units.count(), 1);
        assert_eq!(first.status, second.status);
        assert_eq!(first.finalizers(), second.finalizers());
    }

    #[tokio::test]
    async fn test_dependent_scheduled_after_success() {
        let h = Harness::new();
        let (_, wf) = h.pass(workflow(vec![task("a", &[]), task("b", &["a"])])).await;

        h.units.finish("a", "Succeeded", &[]);
        let (_, wf) = h.pass(wf).await;

        assert_eq!(h.units.count(), 2);
        assert_eq!(task_phase(&wf, "a"), TaskPhase::Succeeded);
        assert_eq!(task_phase(&wf, "b"), TaskPhase::Pending);
        assert_eq!(wf.phase(), WorkflowPhase::Running);
        assert_eq!(wf.finalizers().len(), 2);
        assert_eq!(
            wf.task_status().unwrap()["a"].completion_time,
            Some(finished_at(0))
        );
    }

    #[tokio::test]
    async fn test_outputs_flow_into_downstream_steps() {
        let h = Harness::new();
        let mut producer = task("t", &[]);
        producer.results = vec![TaskResult {
            name: "out".to_string(),
            description: None,
        }];
        let mut consumer = task("u", &["t"]);
        consumer.steps[0].script = "echo {{tasks.t.outputs.out}} {{inputs.who}}".to_string();
        let mut wf = workflow(vec![producer, consumer]);
        wf.spec.inputs.push(Input {
            name: "who".to_string(),
            value: "ops".to_string(),
        });

        let (_, wf) = h.pass(wf).await;
        h.units.finish("t", "Succeeded", &[r#"[{"name":"out","value":"42"}]"#]);
        let (_, wf) = h.pass(wf).await;

        let results = &wf.task_status().unwrap()["t"].results;
        assert_eq!(results, &vec![Output { name: "out".to_string(), value: "42".to_string() }]);

        let pod = h.units.pod_for("u");
        let init_containers = pod.spec.unwrap().init_containers.unwrap();
        let init = &init_containers[0];
        let encoded = STANDARD.encode("#!/bin/sh\necho 42 ops");
        assert!(init.args.as_ref().unwrap()[1].contains(&encoded));
    }

    #[tokio::test]
    async fn test_success_is_terminal() {
        let h = Harness::new();
        let (_, wf) = h.pass(workflow(vec![task("a", &[]), task("b", &["a"])])).await;
        h.units.finish("a", "Succeeded", &[]);
        let (_, wf) = h.pass(wf).await;
        h.units.finish("b", "Succeeded", &[]);
        let (outcome, wf) = h.pass(wf).await;

        assert_eq!(outcome, ReconcileOutcome::Done);
        assert_eq!(wf.phase(), WorkflowPhase::Success);
        assert_eq!(wf.status.as_ref().unwrap().completion_time, Some(finished_at(0)));

        let writes = h.store.writes();
        let (outcome, again) = h.pass(wf.clone()).await;
        assert_eq!(outcome, ReconcileOutcome::Done);
        assert_eq!(h.store.writes(), writes);
        assert_eq!(again.status, wf.status);
        assert_eq!(h.units.count(), 2);
    }

    #[tokio::test]
    async fn test_failed_task_fails_workflow() {
        let h = Harness::new();
        let (_, wf) = h.pass(workflow(vec![task("a", &[]), task("b", &["a"])])).await;
        h.units.finish("a", "Failed", &[]);
        let (outcome, wf) = h.pass(wf).await;

        assert_eq!(outcome, ReconcileOutcome::Done);
        assert_eq!(wf.phase(), WorkflowPhase::Failed);
        assert_eq!(wf.status.as_ref().unwrap().message.as_deref(), Some("task(s) failed: a"));
        assert_eq!(h.units.count(), 1);
    }

    #[tokio::test]
    async fn test_failed_pod_without_deadline_fails_workflow() {
        let h = Harness::new();
        let mut a = task("a", &[]);
        a.steps.push(Step {
            name: "verify".to_string(),
            image: "alpine:3.20".to_string(),
            script: "echo verify".to_string(),
            ..Default::default()
        });
        let (_, wf) = h.pass(workflow(vec![a, task("b", &["a"])])).await;

        let pod = h.units.pod_for("a");
        assert_eq!(pod.spec.as_ref().unwrap().active_deadline_seconds, None);
        assert_eq!(pod.spec.as_ref().unwrap().containers.len(), 2);

        h.units.finish("a", "Failed", &[]);
        let (outcome, wf) = h.pass(wf).await;
        assert_eq!(outcome, ReconcileOutcome::Done);
        assert_eq!(task_phase(&wf, "a"), TaskPhase::Failed);
        assert_eq!(wf.phase(), WorkflowPhase::Failed);
        assert_eq!(h.units.count(), 1);
    }

    #[tokio::test]
    async fn test_running_sibling_delays_failure() {
        let h = Harness::new();
        let (_, wf) = h.pass(workflow(vec![task("a", &[]), task("b", &["a"]), task("c", &["a"])])).await;
        h.units.finish("a", "Succeeded", &[]);
        let (_, wf) = h.pass(wf).await;
        h.units.finish("b", "Failed", &[]);
        let (_, wf) = h.pass(wf).await;

        assert_eq!(wf.phase(), WorkflowPhase::Running);
        assert_eq!(task_phase(&wf, "b"), TaskPhase::Failed);
        assert_eq!(task_phase(&wf, "c"), TaskPhase::Pending);

        h.units.finish("c", "Succeeded", &[]);
        let (_, wf) = h.pass(wf).await;
        assert_eq!(wf.phase(), WorkflowPhase::Failed);
    }

    #[tokio::test]
    async fn test_two_roots_fail_as_invalid() {
        let h = Harness::new();
        let (outcome, wf) = h
            .pass(workflow(vec![task("a", &[]), task("b", &[]), task("c", &["a", "b"])]))
            .await;

        assert_eq!(outcome, ReconcileOutcome::Done);
        assert_eq!(h.units.count(), 0);
        assert_eq!(wf.phase(), WorkflowPhase::Failed);
        assert!(wf.status.unwrap().message.unwrap().contains("invalid dependencies"));
    }

    #[tokio::test]
    async fn test_unknown_dependency_fails() {
        let h = Harness::new();
        let (_, wf) = h.pass(workflow(vec![task("a", &[]), task("b", &["ghost"])])).await;

        assert_eq!(wf.phase(), WorkflowPhase::Failed);
        let message = wf.status.unwrap().message.unwrap();
        assert!(message.contains("invalid dependencies"));
        assert!(message.contains("ghost"));
    }

    #[tokio::test]
    async fn test_creation_failure_fails_workflow() {
        let h = Harness::with_units(FakeUnits::rejecting());
        let err = assert_err!(h.reconciler.reconcile(workflow(vec![task("a", &[])])).await);

        assert!(matches!(err, ControllerError::UnitCreation { ref task, .. } if task == "a"));
        let wf = h.store.latest();
        assert_eq!(wf.phase(), WorkflowPhase::Failed);
        assert!(wf.status.unwrap().message.unwrap().contains("exceeded quota"));
    }

    #[tokio::test]
    async fn test_invalid_timeout_fails_workflow() {
        let h = Harness::new();
        let mut a = task("a", &[]);
        a.timeout = Some("eventually".to_string());
        let result = h.reconciler.reconcile(workflow(vec![a])).await;

        assert!(result.is_err());
        assert_eq!(h.store.latest().phase(), WorkflowPhase::Failed);
        assert_eq!(h.units.count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_termination_message_is_ignored() {
        let h = Harness::new();
        let (_, wf) = h.pass(workflow(vec![task("a", &[])])).await;
        h.units.finish("a", "Succeeded", &["not json"]);
        let (_, wf) = h.pass(wf).await;

        assert_eq!(task_phase(&wf, "a"), TaskPhase::Succeeded);
        assert!(wf.task_status().unwrap()["a"].results.is_empty());
        assert_eq!(wf.phase(), WorkflowPhase::Success);
    }

    #[tokio::test]
    async fn test_existing_pod_is_adopted() {
        let h = Harness::new();
        let wf = workflow(vec![task("a", &[])]);
        let orphan = PodBuilder::new(&ControllerConfig::default())
            .build(&wf.spec.tasks[0], &wf, "wf-a-orphn")
            .unwrap();
        h.units.insert(orphan);

        let (_, wf) = h.pass(wf).await;
        assert_eq!(h.units.count(), 1);
        assert_eq!(wf.task_status().unwrap()["a"].pod_name, "wf-a-orphn");
    }

    #[tokio::test]
    async fn test_missing_pod_fails_task() {
        let h = Harness::new();
        let (_, wf) = h.pass(workflow(vec![task("a", &[])])).await;
        h.units.pods.lock().unwrap().clear();
        let (_, wf) = h.pass(wf).await;

        assert_eq!(task_phase(&wf, "a"), TaskPhase::Failed);
        assert_eq!(wf.phase(), WorkflowPhase::Failed);
    }

    #[tokio::test]
    async fn test_deletion_clears_own_finalizers() {
        let h = Harness::new();
        let mut wf = workflow(vec![task("a", &[])]);
        wf.metadata.deletion_timestamp = Some(Time(finished_at(10)));
        wf.metadata.finalizers = Some(vec![
            format!("{FINALIZER_PREFIX}wf-a-abcde"),
            "example.com/keep".to_string(),
        ]);

        let (outcome, stored) = h.pass(wf).await;
        assert_eq!(outcome, ReconcileOutcome::Done);
        assert_eq!(stored.finalizers(), &["example.com/keep".to_string()]);
        assert_eq!(h.units.count(), 0);
    }

    #[tokio::test]
    async fn test_paused_workflow_is_left_alone() {
        let h = Harness::new();
        let mut wf = workflow(vec![task("a", &[])]);
        wf.status_mut().status = WorkflowPhase::Pause;

        let (outcome, _) = h.pass(wf).await;
        assert_eq!(outcome, ReconcileOutcome::Done);
        assert_eq!(h.units.count(), 0);
        assert_eq!(h.store.writes(), 0);
    }

    #[tokio::test]
    async fn test_paused_workflow_with_duplicates_fails() {
        let h = Harness::new();
        let mut wf = workflow(vec![task("x", &[]), task("x", &[])]);
        wf.status_mut().status = WorkflowPhase::Pause;

        let (outcome, wf) = h.pass(wf).await;
        assert_eq!(outcome, ReconcileOutcome::Done);
        assert_eq!(wf.phase(), WorkflowPhase::Failed);
        assert!(wf.status.unwrap().message.unwrap().contains("duplicate task names"));
        assert_eq!(h.units.count(), 0);
    }

    #[tokio::test]
    async fn test_failed_duplicates_are_not_rewritten() {
        let h = Harness::new();
        let (_, wf) = h.pass(workflow(vec![task("x", &[]), task("x", &[])])).await;
        let writes = h.store.writes();

        let (outcome, _) = h.pass(wf).await;
        assert_eq!(outcome, ReconcileOutcome::Done);
        assert_eq!(h.store.writes(), writes);
    }

    #[test]
    fn test_parse_termination_message() {
        let outputs = parse_termination_message(r#"[{"name":"a","value":"1"},{"name":"b","value":"2"}]"#).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[1].value, "2");

        let oversize = format!(r#"[{{"name":"a","value":"{}"}}]"#, "x".repeat(TERMINATION_MESSAGE_LIMIT));
        assert!(matches!(
            parse_termination_message(&oversize),
            Err(ControllerError::TerminationMessageTooLarge(_))
        ));
        assert!(parse_termination_message("{").is_err());
    }
}
