// ABOUTME: Test fixtures wiring a supervisor to the local provider in a temporary workspace
// ABOUTME: The in-container workspace path equals the host path so host-side execs find scripts

use crate::providers::LocalProvider;
use crate::settings::SandboxSettings;
use crate::supervisor::ContainerSupervisor;
use potato_config::EnvVarSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub(crate) async fn local_supervisor(
    env: &[(&str, &str)],
) -> (TempDir, Arc<LocalProvider>, Arc<ContainerSupervisor>) {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("workspace");
    std::fs::create_dir_all(&root).unwrap();
    let root = root.canonicalize().unwrap();

    let mut settings = SandboxSettings::for_workspace(&root);
    settings.container_workspace = root.to_string_lossy().into_owned();
    settings.exec_user = None;
    settings.start_poll_attempts = 5;
    settings.start_poll_interval = Duration::from_millis(10);

    let env: EnvVarSet = env
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    let provider = Arc::new(LocalProvider::new());
    let supervisor = ContainerSupervisor::with_env(provider.clone(), settings, env).unwrap();
    (dir, provider, Arc::new(supervisor))
}
