// ABOUTME: Error types for sandbox supervision and execution
// ABOUTME: Separates per-call rejections (traversal, not running) from provider and I/O failures

use crate::providers::ProviderError;
use crate::settings::SettingsError;
use potato_config::EnvFileError;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Workspace path is absolute or resolves outside the workspace root
    #[error("Path traversal rejected: '{0}' resolves outside the workspace")]
    PathTraversal(String),

    /// Empty or otherwise unusable workspace path
    #[error("Invalid workspace path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// No live container to dispatch to
    #[error("Container is not running")]
    ContainerNotRunning,

    /// Task id cannot be embedded in a file name
    #[error("Invalid task id '{0}'")]
    InvalidTaskId(String),

    /// Extra environment name that cannot be exported from a shell script
    #[error("Invalid environment variable name '{0}'")]
    InvalidEnvName(String),

    /// Detached launch did not produce a marker file
    #[error("Task {task_id} failed to launch: {detail}")]
    TaskLaunchFailed { task_id: String, detail: String },

    /// Fresh container never reported running
    #[error("Container failed to start: {0}")]
    ContainerStartFailed(String),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    EnvFile(#[from] EnvFileError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("YAML error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Pipeline steps that cannot be run as given
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;
