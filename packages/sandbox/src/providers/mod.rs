// ABOUTME: Provider trait and shared types for container runtime backends
// ABOUTME: Defines the capability interface the supervisor, executor and tracker depend on

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use thiserror::Error;

pub mod docker;
pub mod local;

pub use docker::DockerProvider;
pub use local::LocalProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The named container or image does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Exec error: {0}")]
    ExecError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Image build request: a context directory and the ordered stages to build from it
#[derive(Debug, Clone)]
pub struct ImageBuildSpec {
    pub context_dir: PathBuf,
    pub stages: Vec<crate::settings::BuildStage>,
}

/// Container configuration for the sandbox
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub image: String,
    pub name: String,
    pub env_vars: HashMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub cpu_cores: f32,
    pub memory_mb: u64,
    pub command: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

/// The subset of container state used for liveness and diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    pub status: String,
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
    pub oom_killed: bool,
    pub dead: bool,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// Inspect result: the typed state plus the runtime's full metadata document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub raw: serde_json::Value,
}

/// Execution result from running a command in a container
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecResult {
    /// stdout followed by stderr, decoded lossily
    pub fn combined_output(&self) -> String {
        let mut output = String::from_utf8_lossy(&self.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&self.stderr));
        output
    }
}

/// Which daemon events to fetch
#[derive(Debug, Clone)]
pub struct EventQuery {
    /// Container names or ids; events matching any of them are returned
    pub containers: Vec<String>,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub limit: usize,
}

/// One daemon lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerEvent {
    pub status: Option<String>,
    pub id: Option<String>,
    pub time: Option<i64>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub action: Option<String>,
    pub actor_id: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

/// Event attributes worth keeping in diagnostics
pub const EVENT_ATTRIBUTE_KEYS: &[&str] = &["exitCode", "image", "name", "oom-kill", "signal"];

/// Capability interface for the container runtime
#[async_trait]
pub trait Provider: Send + Sync {
    /// Check if the runtime is reachable
    async fn is_available(&self) -> Result<bool>;

    /// Build every stage of the image, in order
    async fn build_image(&self, spec: &ImageBuildSpec) -> Result<()>;

    /// Create and start a container, returning its id
    async fn run_container(&self, config: &ContainerConfig) -> Result<String>;

    /// Stop a container. Stopping an already stopped container succeeds.
    async fn stop_container(&self, container: &str, timeout_secs: u64) -> Result<()>;

    async fn remove_container(&self, container: &str, force: bool) -> Result<()>;

    /// Inspect by id or name. A missing container is `ProviderError::NotFound`.
    async fn inspect_container(&self, container: &str) -> Result<ContainerInspect>;

    /// Inspect by name, mapping absence to `None`
    async fn get_by_name(&self, name: &str) -> Result<Option<ContainerInspect>> {
        match self.inspect_container(name).await {
            Ok(inspect) => Ok(Some(inspect)),
            Err(ProviderError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Execute a command in a running container and wait for it
    async fn exec_command(
        &self,
        container: &str,
        command: Vec<String>,
        user: Option<String>,
    ) -> Result<ExecResult>;

    /// The last `tail` lines of container output, with timestamps
    async fn container_logs(&self, container: &str, tail: usize) -> Result<String>;

    /// Daemon events for the queried containers, oldest first, at most `query.limit`
    async fn container_events(&self, query: &EventQuery) -> Result<Vec<ContainerEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output_orders_stdout_first() {
        let result = ExecResult {
            exit_code: 1,
            stdout: b"out\n".to_vec(),
            stderr: b"err\n".to_vec(),
        };
        assert_eq!(result.combined_output(), "out\nerr\n");
    }

    #[test]
    fn test_combined_output_is_lossy() {
        let result = ExecResult {
            exit_code: 0,
            stdout: vec![0x66, 0xff, 0x6f],
            stderr: Vec::new(),
        };
        assert_eq!(result.combined_output(), "f\u{fffd}o");
    }

    #[test]
    fn test_event_serializes_type_field() {
        let event = ContainerEvent {
            status: Some("die".to_string()),
            id: Some("abc".to_string()),
            time: Some(1_700_000_000),
            event_type: Some("container".to_string()),
            action: Some("die".to_string()),
            actor_id: Some("abc".to_string()),
            attributes: BTreeMap::from([("exitCode".to_string(), "137".to_string())]),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "container");
        assert_eq!(json["attributes"]["exitCode"], "137");
    }
}
