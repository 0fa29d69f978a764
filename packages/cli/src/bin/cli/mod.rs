// ABOUTME: Shared CLI plumbing: runtime selection, supervisor construction and logging setup
// ABOUTME: One-shot commands adopt the running container; serve owns its lifecycle

pub mod container;
pub mod exec;
pub mod pipeline;
pub mod task;

use anyhow::{bail, Context, Result};
use potato_sandbox::{ContainerSupervisor, DockerProvider, LocalProvider, Provider, SandboxSettings};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Runtime {
    /// Docker daemon via its API socket
    Docker,
    /// In-process simulation; commands run on the host inside the workspace
    Local,
}

/// Where commands are sent
pub struct Target {
    pub runtime: Runtime,
    pub workspace: Option<PathBuf>,
}

impl Target {
    pub fn settings(&self) -> Result<SandboxSettings> {
        let mut settings = SandboxSettings::from_env().context("Invalid sandbox settings")?;
        if let Some(workspace) = &self.workspace {
            settings.workspace_dir = workspace.clone();
        }

        if self.runtime == Runtime::Local {
            // Host execution: the in-container workspace is the host directory
            std::fs::create_dir_all(&settings.workspace_dir).with_context(|| {
                format!("Failed to create {}", settings.workspace_dir.display())
            })?;
            settings.container_workspace = settings
                .workspace_dir
                .canonicalize()?
                .to_string_lossy()
                .into_owned();
            settings.exec_user = None;
        }
        Ok(settings)
    }

    pub fn provider(&self) -> Result<Arc<dyn Provider>> {
        let provider: Arc<dyn Provider> = match self.runtime {
            Runtime::Docker => {
                Arc::new(DockerProvider::new().context("Failed to connect to Docker")?)
            }
            Runtime::Local => Arc::new(LocalProvider::new()),
        };
        Ok(provider)
    }

    pub fn supervisor(&self) -> Result<Arc<ContainerSupervisor>> {
        let supervisor = ContainerSupervisor::new(self.provider()?, self.settings()?)?;
        Ok(Arc::new(supervisor))
    }

    /// A supervisor bound to the live container. The local runtime has no
    /// container outside this process, so it starts one.
    pub async fn attached(&self) -> Result<Arc<ContainerSupervisor>> {
        let supervisor = self.supervisor()?;
        if supervisor.attach().await?.is_some() {
            return Ok(supervisor);
        }

        match self.runtime {
            Runtime::Local => {
                supervisor.start().await?;
                Ok(supervisor)
            }
            Runtime::Docker => bail!(
                "Sandbox container '{}' is not running. Start it with `potato serve`",
                supervisor.settings().container_name
            ),
        }
    }
}

/// Log to stderr so command output on stdout stays clean
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Parse a `KEY=VALUE` flag value
pub fn parse_env_pair(raw: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if !potato_config::is_valid_name(name) {
        return Err(format!("invalid variable name '{}'", name));
    }
    Ok((name.to_string(), value.to_string()))
}

/// A task id from the current time, for commands started without one
pub fn generated_task_id() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%S%3f").to_string()
}

pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("A=1", "A", "1")]
    #[case("PATH_EXTRA=/a=b", "PATH_EXTRA", "/a=b")]
    #[case("EMPTY=", "EMPTY", "")]
    fn test_parse_env_pair(#[case] raw: &str, #[case] name: &str, #[case] value: &str) {
        assert_eq!(
            parse_env_pair(raw).unwrap(),
            (name.to_string(), value.to_string())
        );
    }

    #[rstest]
    #[case("NOEQUALS")]
    #[case("1BAD=x")]
    #[case("BAD-NAME=x")]
    fn test_parse_env_pair_rejects(#[case] raw: &str) {
        assert!(parse_env_pair(raw).is_err());
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }
}
