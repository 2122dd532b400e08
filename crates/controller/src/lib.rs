//! SkyFlow Controller Library
//!
//! Reconciles `Workflow` custom resources into Kubernetes pods. Every task of
//! a workflow runs as one pod; the steps of a task run as sequential
//! containers in that pod, chained by marker files through the
//! `skyflow-entrypoint` binary.
//!
//! ## Modules
//!
//! - [`api`]: The `Workflow` resource and its status records
//! - [`dag`]: Task dependency graph and scheduling queries
//! - [`template`]: `{{inputs.*}}` and `{{tasks.*.outputs.*}}` substitution
//! - [`pod`]: Pod construction for one task
//! - [`client`]: Platform seams used by the reconciler
//! - [`reconciler`]: One reconcile pass
//! - [`controller`]: Watch loop on top of `kube::runtime`
//! - [`config`]: Configuration loading from environment variables
//! - [`error`]: Error types

pub mod api;
pub mod client;
pub mod config;
pub mod controller;
pub mod dag;
pub mod error;
pub mod pod;
pub mod reconciler;
pub mod template;

pub use api::{Task, TaskPhase, TaskStatus, Workflow, WorkflowPhase, WorkflowSpec, WorkflowStatus};
pub use config::ControllerConfig;
pub use error::{ControllerError, ControllerResult};
pub use reconciler::{ReconcileOutcome, Reconciler};
