//! Controller configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::dag::DependencyPolicy;
use crate::error::ControllerResult;

/// Controller configuration loaded from environment variables.
///
/// Environment variables are prefixed with `SKYFLOW_`:
/// - `SKYFLOW_NAMESPACE`: Namespace to watch (default: all namespaces)
/// - `SKYFLOW_REQUEUE_SECONDS`: Delay before the next pass of a running workflow (default: 5)
/// - `SKYFLOW_ERROR_BACKOFF_SECONDS`: Delay after a failed pass (default: 30)
/// - `SKYFLOW_ENTRYPOINT_IMAGE`: Image carrying the step entrypoint binary
/// - `SKYFLOW_IMAGE_PULL_POLICY`: Pull policy for generated containers (default: "IfNotPresent")
/// - `SKYFLOW_DEPENDENCY_POLICY`: `all` or `any` (default: "all")
/// - `SKYFLOW_LOG_JSON`: Emit JSON logs (default: false)
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Namespace to watch, all namespaces when unset
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default = "default_requeue_seconds")]
    pub requeue_seconds: u64,

    #[serde(default = "default_error_backoff_seconds")]
    pub error_backoff_seconds: u64,

    /// Image used by the init container to stage the entrypoint binary
    #[serde(default = "default_entrypoint_image")]
    pub entrypoint_image: String,

    #[serde(default = "default_pull_policy")]
    pub image_pull_policy: String,

    /// How many succeeded dependencies a task needs before it is scheduled
    #[serde(default)]
    pub dependency_policy: DependencyPolicy,

    #[serde(default)]
    pub log_json: bool,
}

fn default_requeue_seconds() -> u64 {
    5
}

fn default_error_backoff_seconds() -> u64 {
    30
}

fn default_entrypoint_image() -> String {
    "ghcr.io/skyflow/entrypoint:v0.1.0".to_string()
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

impl ControllerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `SKYFLOW_`.
    pub fn from_env() -> ControllerResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Load configuration from `SKYFLOW_`-prefixed key/value pairs.
    pub fn from_vars<I>(vars: I) -> ControllerResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::prefixed("SKYFLOW_").from_iter::<_, ControllerConfig>(vars)?)
    }

    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_seconds)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_seconds)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            requeue_seconds: default_requeue_seconds(),
            error_backoff_seconds: default_error_backoff_seconds(),
            entrypoint_image: default_entrypoint_image(),
            image_pull_policy: default_pull_policy(),
            dependency_policy: DependencyPolicy::default(),
            log_json: false,
        }
    }
}
