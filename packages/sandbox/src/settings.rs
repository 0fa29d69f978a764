// ABOUTME: Sandbox settings loaded from POTATO_* environment variables
// ABOUTME: Workspace layout, image/container identity, resource limits and supervision timing

use potato_config::constants::*;
use potato_config::env::{
    env_optional_string, env_string_or_default, parse_env_or_default,
    parse_env_or_default_with_validation,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_IMAGE_NAME: &str = "effective-potato-ubuntu";
pub const DEFAULT_CONTAINER_NAME: &str = "effective-potato-sandbox";
pub const DEFAULT_CONTAINER_WORKSPACE: &str = "/workspace";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("CPU cores must be positive, got {0}")]
    InvalidCpuCores(f32),
    #[error("Memory limit must be positive")]
    InvalidMemoryLimit,
    #[error("Container workspace must be an absolute path, got '{0}'")]
    RelativeContainerWorkspace(String),
    #[error("{0} must not be empty")]
    EmptyValue(&'static str),
}

/// One `docker build` invocation: Dockerfile relative to the build context plus the tag it produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStage {
    pub dockerfile: String,
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    // Workspace
    pub workspace_dir: PathBuf,
    pub container_workspace: String,
    pub env_file: PathBuf,

    // Image & container identity
    pub image_name: String,
    pub container_name: String,
    pub build_context: PathBuf,
    pub build_stages: Vec<BuildStage>,
    pub exec_user: Option<String>,

    // Resource limits
    pub memory_mb: u64,
    pub cpu_cores: f32,
    pub stop_timeout_secs: u64,

    // Supervision
    pub watchdog_interval: Duration,
    pub start_poll_attempts: u32,
    pub start_poll_interval: Duration,

    // Diagnostics
    pub log_tail_lines: usize,
    pub events_window_minutes: i64,
    pub events_limit: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("workspace"),
            container_workspace: DEFAULT_CONTAINER_WORKSPACE.to_string(),
            env_file: PathBuf::from("local/.env"),
            image_name: DEFAULT_IMAGE_NAME.to_string(),
            container_name: DEFAULT_CONTAINER_NAME.to_string(),
            build_context: PathBuf::from("."),
            build_stages: default_build_stages(DEFAULT_IMAGE_NAME),
            exec_user: Some("ubuntu".to_string()),
            memory_mb: 4096,
            cpu_cores: 2.0,
            stop_timeout_secs: 10,
            watchdog_interval: Duration::from_secs(5),
            start_poll_attempts: 20,
            start_poll_interval: Duration::from_millis(250),
            log_tail_lines: 2000,
            events_window_minutes: 10,
            events_limit: 500,
        }
    }
}

/// Base image first, then the runtime image layered on top of it
pub fn default_build_stages(image_name: &str) -> Vec<BuildStage> {
    vec![
        BuildStage {
            dockerfile: "Dockerfile.base".to_string(),
            tag: format!("{}-base", image_name),
        },
        BuildStage {
            dockerfile: "Dockerfile".to_string(),
            tag: image_name.to_string(),
        },
    ]
}

impl SandboxSettings {
    pub fn from_env() -> Result<Self, SettingsError> {
        let defaults = Self::default();

        let image_name = env_string_or_default(POTATO_IMAGE_NAME, &defaults.image_name);
        let watchdog_secs = parse_env_or_default_with_validation(
            POTATO_WATCHDOG_INTERVAL_SECS,
            defaults.watchdog_interval.as_secs(),
            |v| (1..=3600).contains(&v),
        );

        let settings = Self {
            workspace_dir: PathBuf::from(env_string_or_default(
                POTATO_WORKSPACE_DIR,
                &defaults.workspace_dir.to_string_lossy(),
            )),
            container_workspace: env_string_or_default(
                POTATO_CONTAINER_WORKSPACE,
                &defaults.container_workspace,
            ),
            env_file: PathBuf::from(env_string_or_default(
                POTATO_ENV_FILE,
                &defaults.env_file.to_string_lossy(),
            )),
            build_stages: default_build_stages(&image_name),
            image_name,
            container_name: env_string_or_default(POTATO_CONTAINER_NAME, &defaults.container_name),
            build_context: PathBuf::from(env_string_or_default(
                POTATO_BUILD_CONTEXT,
                &defaults.build_context.to_string_lossy(),
            )),
            exec_user: env_optional_string(POTATO_EXEC_USER, defaults.exec_user.as_deref()),
            memory_mb: parse_env_or_default_with_validation(
                POTATO_MEMORY_LIMIT_MB,
                defaults.memory_mb,
                |v| v > 0,
            ),
            cpu_cores: parse_env_or_default(POTATO_CPU_CORES, defaults.cpu_cores),
            stop_timeout_secs: parse_env_or_default(
                POTATO_STOP_TIMEOUT_SECS,
                defaults.stop_timeout_secs,
            ),
            watchdog_interval: Duration::from_secs(watchdog_secs),
            log_tail_lines: parse_env_or_default_with_validation(
                POTATO_LOG_TAIL_LINES,
                defaults.log_tail_lines,
                |v| v > 0,
            ),
            events_window_minutes: parse_env_or_default_with_validation(
                POTATO_EVENTS_WINDOW_MINUTES,
                defaults.events_window_minutes,
                |v| v > 0,
            ),
            ..defaults
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Defaults rooted at `workspace_dir`, for tests and embedding
    pub fn for_workspace(workspace_dir: impl AsRef<Path>) -> Self {
        Self {
            workspace_dir: workspace_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.cpu_cores.is_nan() || self.cpu_cores <= 0.0 {
            return Err(SettingsError::InvalidCpuCores(self.cpu_cores));
        }
        if self.memory_mb == 0 {
            return Err(SettingsError::InvalidMemoryLimit);
        }
        if !self.container_workspace.starts_with('/') {
            return Err(SettingsError::RelativeContainerWorkspace(
                self.container_workspace.clone(),
            ));
        }
        if self.container_name.trim().is_empty() {
            return Err(SettingsError::EmptyValue("Container name"));
        }
        if self.image_name.trim().is_empty() {
            return Err(SettingsError::EmptyValue("Image name"));
        }
        Ok(())
    }

    /// The in-container path of a workspace-relative path
    pub fn container_path(&self, relative: &str) -> String {
        format!(
            "{}/{}",
            self.container_workspace.trim_end_matches('/'),
            relative.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            POTATO_WORKSPACE_DIR,
            POTATO_CONTAINER_WORKSPACE,
            POTATO_ENV_FILE,
            POTATO_IMAGE_NAME,
            POTATO_CONTAINER_NAME,
            POTATO_BUILD_CONTEXT,
            POTATO_EXEC_USER,
            POTATO_MEMORY_LIMIT_MB,
            POTATO_CPU_CORES,
            POTATO_STOP_TIMEOUT_SECS,
            POTATO_WATCHDOG_INTERVAL_SECS,
            POTATO_LOG_TAIL_LINES,
            POTATO_EVENTS_WINDOW_MINUTES,
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_from_empty_env() {
        clear_env();
        let settings = SandboxSettings::from_env().unwrap();
        assert_eq!(settings.container_name, DEFAULT_CONTAINER_NAME);
        assert_eq!(settings.container_workspace, "/workspace");
        assert_eq!(settings.exec_user.as_deref(), Some("ubuntu"));
        assert_eq!(settings.watchdog_interval, Duration::from_secs(5));
        assert_eq!(settings.log_tail_lines, 2000);
        assert_eq!(settings.build_stages.len(), 2);
        assert_eq!(settings.build_stages[0].tag, "effective-potato-ubuntu-base");
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var(POTATO_IMAGE_NAME, "custom-image");
        std::env::set_var(POTATO_CONTAINER_NAME, "custom-sandbox");
        std::env::set_var(POTATO_WATCHDOG_INTERVAL_SECS, "30");
        std::env::set_var(POTATO_EXEC_USER, "");

        let settings = SandboxSettings::from_env().unwrap();
        assert_eq!(settings.image_name, "custom-image");
        assert_eq!(settings.build_stages[1].tag, "custom-image");
        assert_eq!(settings.container_name, "custom-sandbox");
        assert_eq!(settings.watchdog_interval, Duration::from_secs(30));
        assert_eq!(settings.exec_user, None);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_out_of_range_interval_falls_back() {
        clear_env();
        std::env::set_var(POTATO_WATCHDOG_INTERVAL_SECS, "0");
        let settings = SandboxSettings::from_env().unwrap();
        assert_eq!(settings.watchdog_interval, Duration::from_secs(5));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_non_positive_cpu_is_rejected() {
        clear_env();
        std::env::set_var(POTATO_CPU_CORES, "-1");
        let err = SandboxSettings::from_env().unwrap_err();
        assert!(matches!(err, SettingsError::InvalidCpuCores(_)));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_relative_container_workspace_is_rejected() {
        clear_env();
        std::env::set_var(POTATO_CONTAINER_WORKSPACE, "workspace");
        let err = SandboxSettings::from_env().unwrap_err();
        assert!(matches!(err, SettingsError::RelativeContainerWorkspace(_)));
        clear_env();
    }

    #[test]
    fn test_container_path_joins_cleanly() {
        let mut settings = SandboxSettings::default();
        assert_eq!(
            settings.container_path("tmp_scripts/task_1.sh"),
            "/workspace/tmp_scripts/task_1.sh"
        );
        settings.container_workspace = "/srv/ws/".to_string();
        assert_eq!(settings.container_path("/tasks"), "/srv/ws/tasks");
    }
}
