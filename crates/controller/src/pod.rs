//! Execution unit generation.
//!
//! A task becomes one pod. An init container stages the entrypoint binary and
//! the base64 step scripts into shared volumes; each step then runs in its own
//! container under the entrypoint, which waits for the previous step's marker
//! file before starting and writes its own when done.

use std::borrow::Cow;
use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use k8s_openapi::api::core::v1::{
    Container, DownwardAPIVolumeFile, DownwardAPIVolumeSource, EmptyDirVolumeSource,
    ObjectFieldSelector, Pod, PodSpec, Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::api::{Step, Task, Workflow};
use crate::config::ControllerConfig;
use crate::error::{ControllerError, ControllerResult};
use crate::template::Substitutions;

pub const WORKFLOW_LABEL: &str = "skyflow.io/workflow";
pub const TASK_LABEL: &str = "skyflow.io/task";
pub const READY_ANNOTATION: &str = "skyflow.io/ready";
const READY_VALUE: &str = "true";

const BIN_VOLUME: &str = "skyflow-bin";
const SCRIPTS_VOLUME: &str = "skyflow-scripts";
const OUTPUTS_VOLUME: &str = "skyflow-outputs";
const RUN_VOLUME: &str = "skyflow-run";
const DOWNWARD_VOLUME: &str = "skyflow-downward";

const BIN_DIR: &str = "/skyflow/bin";
const SCRIPTS_DIR: &str = "/skyflow/scripts";
pub const OUTPUTS_DIR: &str = "/skyflow/outputs";
const RUN_DIR: &str = "/skyflow/run";
const DOWNWARD_DIR: &str = "/skyflow/downward";

/// Location of the entrypoint binary inside the entrypoint image.
const IMAGE_ENTRYPOINT: &str = "/usr/local/bin/skyflow-entrypoint";
const ENTRYPOINT: &str = "/skyflow/bin/entrypoint";

pub const TERMINATION_MESSAGE_PATH: &str = "/tmp/termination-log";
/// Upper bound on a termination message, in bytes.
pub const TERMINATION_MESSAGE_LIMIT: usize = 4096;

const INIT_CONTAINER: &str = "init-step";
const DEFAULT_SHEBANG: &str = "#!/bin/sh";

const MAX_NAME_LENGTH: usize = 63;
const RANDOM_SUFFIX_LENGTH: usize = 5;

/// Generate a unique pod name `<workflow>-<task>-<suffix>`.
pub fn generate_unit_name(workflow: &str, task: &str) -> String {
    let base: String = format!("{workflow}-{task}-")
        .chars()
        .take(MAX_NAME_LENGTH - RANDOM_SUFFIX_LENGTH)
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{base}{}", &suffix[..RANDOM_SUFFIX_LENGTH])
}

/// Builds pod specifications for tasks.
#[derive(Debug, Clone)]
pub struct PodBuilder {
    entrypoint_image: String,
    image_pull_policy: String,
}

impl PodBuilder {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            entrypoint_image: config.entrypoint_image.clone(),
            image_pull_policy: config.image_pull_policy.clone(),
        }
    }

    /// Build the pod for `task`, substituting inputs and recorded outputs
    /// into every step first.
    pub fn build(&self, task: &Task, workflow: &Workflow, pod_name: &str) -> ControllerResult<Pod> {
        let namespace = workflow
            .namespace()
            .ok_or(ControllerError::MissingField("metadata.namespace"))?;
        let owner = workflow
            .controller_owner_ref(&())
            .ok_or(ControllerError::MissingField("metadata.uid"))?;

        let substitutions = Substitutions::from_workflow(workflow);
        let steps: Vec<Step> = task
            .steps
            .iter()
            .map(|step| Step {
                script: substitutions.apply(&step.script).into_owned(),
                args: substitutions.apply(&step.args).into_owned(),
                ..step.clone()
            })
            .collect();

        // A zero timeout means no deadline.
        let active_deadline_seconds = task
            .active_deadline()?
            .filter(|deadline| !deadline.is_zero())
            .map(|deadline| deadline.as_secs_f64().ceil().max(1.0) as i64);

        let results = task.result_names().join(",");

        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(pod_name.to_string()),
                namespace: Some(namespace),
                labels: Some(BTreeMap::from([
                    (WORKFLOW_LABEL.to_string(), workflow.name_any()),
                    (TASK_LABEL.to_string(), task.name.clone()),
                ])),
                annotations: Some(BTreeMap::from([(
                    READY_ANNOTATION.to_string(),
                    READY_VALUE.to_string(),
                )])),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                active_deadline_seconds,
                init_containers: Some(vec![self.init_container(&steps)]),
                containers: steps
                    .iter()
                    .enumerate()
                    .map(|(index, step)| self.step_container(index, step, &results))
                    .collect(),
                volumes: Some(volumes()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn init_container(&self, steps: &[Step]) -> Container {
        let mut script = format!("set -e\ncp {IMAGE_ENTRYPOINT} {ENTRYPOINT}\n");
        for (index, step) in steps.iter().enumerate() {
            script.push_str(&format!(
                "printf '%s' '{}' > {}\n",
                STANDARD.encode(with_shebang(&step.script).as_bytes()),
                script_path(index, step)
            ));
        }

        Container {
            name: INIT_CONTAINER.to_string(),
            image: Some(self.entrypoint_image.clone()),
            image_pull_policy: Some(self.image_pull_policy.clone()),
            command: Some(vec!["sh".to_string()]),
            args: Some(vec!["-c".to_string(), script]),
            volume_mounts: Some(volume_mounts()),
            ..Default::default()
        }
    }

    fn step_container(&self, index: usize, step: &Step, results: &str) -> Container {
        let (wait_file, wait_content) = match index {
            0 => (
                format!("{DOWNWARD_DIR}/ready"),
                READY_VALUE.to_string(),
            ),
            n => (format!("{RUN_DIR}/{}", n - 1), (n - 1).to_string()),
        };
        let script = script_path(index, step);

        let args = vec![
            "--encode_script".to_string(),
            script.clone(),
            "--wait_file".to_string(),
            wait_file,
            "--wait_content".to_string(),
            wait_content,
            "--post_file".to_string(),
            format!("{RUN_DIR}/{index}"),
            "--post_content".to_string(),
            index.to_string(),
            "--command".to_string(),
            script,
            "--outputs".to_string(),
            results.to_string(),
            "--results_dir".to_string(),
            OUTPUTS_DIR.to_string(),
            "--termination_message_path".to_string(),
            TERMINATION_MESSAGE_PATH.to_string(),
            "--params".to_string(),
            params(&step.args),
        ];

        Container {
            name: step.name.clone(),
            image: Some(step.image.clone()),
            image_pull_policy: Some(self.image_pull_policy.clone()),
            command: Some(vec![ENTRYPOINT.to_string()]),
            args: Some(args),
            termination_message_path: Some(TERMINATION_MESSAGE_PATH.to_string()),
            termination_message_policy: Some("File".to_string()),
            volume_mounts: Some(volume_mounts()),
            ..Default::default()
        }
    }
}

fn script_path(index: usize, step: &Step) -> String {
    format!("{SCRIPTS_DIR}/{}-{index}", step.name)
}

fn with_shebang(script: &str) -> Cow<'_, str> {
    if script.starts_with("#!") {
        Cow::Borrowed(script)
    } else {
        Cow::Owned(format!("{DEFAULT_SHEBANG}\n{script}"))
    }
}

/// Normalize a step argument string into the entrypoint's comma list.
fn params(args: &str) -> String {
    args.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|arg| !arg.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

fn volume_mounts() -> Vec<VolumeMount> {
    [
        (BIN_VOLUME, BIN_DIR),
        (SCRIPTS_VOLUME, SCRIPTS_DIR),
        (OUTPUTS_VOLUME, OUTPUTS_DIR),
        (RUN_VOLUME, RUN_DIR),
        (DOWNWARD_VOLUME, DOWNWARD_DIR),
    ]
    .into_iter()
    .map(|(name, mount_path)| VolumeMount {
        name: name.to_string(),
        mount_path: mount_path.to_string(),
        ..Default::default()
    })
    .collect()
}

fn volumes() -> Vec<Volume> {
    let mut volumes: Vec<Volume> = [BIN_VOLUME, SCRIPTS_VOLUME, OUTPUTS_VOLUME, RUN_VOLUME]
        .into_iter()
        .map(|name| Volume {
            name: name.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        })
        .collect();

    volumes.push(Volume {
        name: DOWNWARD_VOLUME.to_string(),
        downward_api: Some(DownwardAPIVolumeSource {
            items: Some(vec![DownwardAPIVolumeFile {
                path: "ready".to_string(),
                field_ref: Some(ObjectFieldSelector {
                    field_path: format!("metadata.annotations['{READY_ANNOTATION}']"),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    });

    volumes
}
