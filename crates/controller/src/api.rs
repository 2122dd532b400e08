//! Workflow custom resource and the per-task records kept in its status.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, ControllerResult};

/// Desired state of a Workflow: inputs plus an ordered task list.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "skyflow.io",
    version = "v1alpha1",
    kind = "Workflow",
    namespaced,
    status = "WorkflowStatus",
    shortname = "wf",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Input>,

    pub tasks: Vec<Task>,
}

/// Workflow-level input value, referenced as `{{inputs.NAME}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub name: String,
    pub value: String,
}

/// Value captured from a finished task, referenced as `{{tasks.TASK.outputs.NAME}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// A named unit of work made of sequential steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Names of tasks that must precede this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    /// Result names the task promises to produce.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<TaskResult>,

    /// Maximum run time, e.g. `90s` or `1h30m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One containerized command within a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub image: String,

    pub script: String,

    /// Arguments passed to the script, separated by whitespace or commas.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub args: String,
}

/// Aggregate workflow phase.
///
/// `Cancel` and `Pause` are accepted when written by someone else but the
/// controller never produces them. Either one halts scheduling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowPhase {
    #[default]
    #[serde(alias = "")]
    Waiting,
    Running,
    Success,
    Failed,
    Cancel,
    Pause,
}

impl WorkflowPhase {
    /// Success and Failed never change once reached.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowPhase::Success | WorkflowPhase::Failed)
    }

    pub fn is_halted(self) -> bool {
        matches!(self, WorkflowPhase::Cancel | WorkflowPhase::Pause)
    }

    /// Transition taken once the first execution unit exists.
    pub fn start(self) -> Self {
        match self {
            WorkflowPhase::Waiting => WorkflowPhase::Running,
            other => other,
        }
    }

    /// Transition taken once every task has finished.
    pub fn finish(self, failed: bool) -> Self {
        if self.is_terminal() || self.is_halted() {
            self
        } else if failed {
            WorkflowPhase::Failed
        } else {
            WorkflowPhase::Success
        }
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "Waiting"),
            Self::Running => write!(f, "Running"),
            Self::Success => write!(f, "Success"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancel => write!(f, "Cancel"),
            Self::Pause => write!(f, "Pause"),
        }
    }
}

/// Task phase, spelled like the Kubernetes pod phase it is derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl TaskPhase {
    /// Translate a pod phase; a pod without status yet is Pending.
    pub fn from_pod_phase(phase: Option<&str>) -> Self {
        match phase {
            None | Some("Pending") => TaskPhase::Pending,
            Some("Running") => TaskPhase::Running,
            Some("Succeeded") => TaskPhase::Succeeded,
            Some("Failed") => TaskPhase::Failed,
            Some(_) => TaskPhase::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskPhase::Succeeded | TaskPhase::Failed)
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Runtime record for one scheduled task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub name: String,

    pub pod_name: String,

    pub status: TaskPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<Output>,
}

impl TaskStatus {
    pub fn new(name: &str, pod_name: &str, status: TaskPhase) -> Self {
        Self {
            name: name.to_string(),
            pod_name: pod_name.to_string(),
            status,
            ..Default::default()
        }
    }
}

/// Observed state of a Workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    #[serde(default)]
    pub status: WorkflowPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub task_status: BTreeMap<String, TaskStatus>,
}

impl Workflow {
    pub fn phase(&self) -> WorkflowPhase {
        self.status.as_ref().map(|s| s.status).unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut WorkflowStatus {
        self.status.get_or_insert_with(WorkflowStatus::default)
    }

    pub fn task_status(&self) -> Option<&BTreeMap<String, TaskStatus>> {
        self.status.as_ref().map(|s| &s.task_status)
    }

    /// Task names declared more than once, sorted.
    pub fn duplicate_task_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let duplicates: BTreeSet<&str> = self
            .spec
            .tasks
            .iter()
            .filter(|task| !seen.insert(task.name.as_str()))
            .map(|task| task.name.as_str())
            .collect();
        duplicates.into_iter().map(str::to_string).collect()
    }
}

impl Task {
    /// Parsed `timeout`, the pod's active deadline.
    pub fn active_deadline(&self) -> ControllerResult<Option<Duration>> {
        self.timeout
            .as_deref()
            .map(|raw| {
                parse_duration(raw).ok_or_else(|| ControllerError::InvalidTimeout {
                    task: self.name.clone(),
                    value: raw.to_string(),
                })
            })
            .transpose()
    }

    pub fn result_names(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.name.as_str()).collect()
    }
}

static DURATION_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9]+(?:\.[0-9]*)?|\.[0-9]+)(ns|us|µs|μs|ms|s|m|h)").expect("valid duration pattern")
});

/// Parse a duration in Go notation (`300ms`, `1.5h`, `2h45m`).
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw == "0" {
        return Some(Duration::ZERO);
    }

    let mut end = 0;
    let mut nanos = 0f64;
    for caps in DURATION_PART.captures_iter(raw) {
        let whole = caps.get(0)?;
        if whole.start() != end {
            return None;
        }
        end = whole.end();

        let value: f64 = caps[1].parse().ok()?;
        let scale = match &caps[2] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        nanos += value * scale;
    }

    if end == 0 || end != raw.len() || nanos >= u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos.round() as u64))
}
