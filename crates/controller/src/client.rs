//! Platform access used by the reconciler.
//!
//! The reconciler only needs to create, get and list pods and to write back
//! workflow status and finalizers. Both seams are traits so passes can run
//! against in-memory fakes.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;

use crate::api::Workflow;
use crate::error::{ControllerError, ControllerResult};

/// Execution unit lifecycle.
#[async_trait]
pub trait UnitClient: Send + Sync {
    async fn create(&self, pod: &Pod) -> ControllerResult<Pod>;

    /// `None` when the pod does not exist.
    async fn get(&self, name: &str, namespace: &str) -> ControllerResult<Option<Pod>>;

    async fn list(&self, label_selector: &str, namespace: &str) -> ControllerResult<Vec<Pod>>;
}

/// Workflow persistence.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Write `status`, failing on a resourceVersion conflict. Returns the
    /// stored object.
    async fn update_status(&self, workflow: &Workflow) -> ControllerResult<Workflow>;

    async fn set_finalizers(
        &self,
        workflow: &Workflow,
        finalizers: Vec<String>,
    ) -> ControllerResult<Workflow>;
}

/// Pods through the Kubernetes API.
#[derive(Clone)]
pub struct KubeUnitClient {
    client: Client,
}

impl KubeUnitClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl UnitClient for KubeUnitClient {
    async fn create(&self, pod: &Pod) -> ControllerResult<Pod> {
        let namespace = pod
            .metadata
            .namespace
            .as_deref()
            .ok_or(ControllerError::MissingField("metadata.namespace"))?;
        Ok(self.pods(namespace).create(&PostParams::default(), pod).await?)
    }

    async fn get(&self, name: &str, namespace: &str) -> ControllerResult<Option<Pod>> {
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    async fn list(&self, label_selector: &str, namespace: &str) -> ControllerResult<Vec<Pod>> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.pods(namespace).list(&params).await?.items)
    }
}

/// Workflows through the Kubernetes API.
#[derive(Clone)]
pub struct KubeWorkflowStore {
    client: Client,
}

impl KubeWorkflowStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn workflows(&self, workflow: &Workflow) -> ControllerResult<Api<Workflow>> {
        let namespace = workflow
            .namespace()
            .ok_or(ControllerError::MissingField("metadata.namespace"))?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }
}

#[async_trait]
impl WorkflowStore for KubeWorkflowStore {
    async fn update_status(&self, workflow: &Workflow) -> ControllerResult<Workflow> {
        // resourceVersion in a merge patch acts as a precondition.
        let patch = json!({
            "metadata": { "resourceVersion": workflow.resource_version() },
            "status": workflow.status,
        });
        Ok(self
            .workflows(workflow)?
            .patch_status(&workflow.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn set_finalizers(
        &self,
        workflow: &Workflow,
        finalizers: Vec<String>,
    ) -> ControllerResult<Workflow> {
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        Ok(self
            .workflows(workflow)?
            .patch(&workflow.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }
}
