// ABOUTME: Command executor that runs a command in the sandbox through a temporary script
// ABOUTME: Script lives under tmp_scripts/ for exactly one exec and is removed on every exit path

use crate::error::Result;
use crate::script::{render_script, validate_task_id};
use crate::supervisor::ContainerSupervisor;
use crate::workspace::{WorkspaceStore, WriteOptions, TMP_SCRIPTS_DIR};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Exit status and combined output (stdout then stderr) of one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub output: String,
}

/// Workspace-relative path of the ephemeral script for `task_id`
pub fn script_path(task_id: &str) -> String {
    format!("{}/task_{}.sh", TMP_SCRIPTS_DIR, task_id)
}

/// Removes the script when dropped, whether execution returned, failed or was cancelled
pub(crate) struct ScriptGuard<'a> {
    workspace: &'a WorkspaceStore,
    relative: String,
}

impl<'a> ScriptGuard<'a> {
    pub(crate) fn new(workspace: &'a WorkspaceStore, relative: impl Into<String>) -> Self {
        Self {
            workspace,
            relative: relative.into(),
        }
    }
}

impl Drop for ScriptGuard<'_> {
    fn drop(&mut self) {
        match self.workspace.remove_file(&self.relative) {
            Ok(_) => debug!("Cleaned up script: {}", self.relative),
            Err(e) => warn!("Failed to clean up script {}: {}", self.relative, e),
        }
    }
}

/// Command executor for the sandbox container
pub struct CommandExecutor {
    supervisor: Arc<ContainerSupervisor>,
}

impl CommandExecutor {
    pub fn new(supervisor: Arc<ContainerSupervisor>) -> Self {
        Self { supervisor }
    }

    /// Run `command` to completion inside the container.
    ///
    /// Fails with `ContainerNotRunning` if there is no live container; the
    /// command's own exit status is returned verbatim otherwise.
    pub async fn execute(
        &self,
        command: &str,
        task_id: &str,
        extra_env: &HashMap<String, String>,
    ) -> Result<ExecOutcome> {
        validate_task_id(task_id)?;
        let handle = self.supervisor.running_handle().await?;

        let env = self.supervisor.env().merged_with(extra_env);
        let script = render_script(&env, command)?;

        let workspace = self.supervisor.workspace();
        let relative = script_path(task_id);
        let _guard = ScriptGuard::new(workspace, relative.clone());
        workspace.write_text(&relative, &script, WriteOptions::executable())?;

        let container_script = self.supervisor.settings().container_path(&relative);
        debug!("Executing task {} via {}", task_id, container_script);

        let result = self
            .supervisor
            .provider()
            .exec_command(
                &handle.id,
                vec!["bash".to_string(), "-l".to_string(), container_script],
                self.supervisor.settings().exec_user.clone(),
            )
            .await?;

        Ok(ExecOutcome {
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }

    /// Like `execute`, with a freshly generated task id
    pub async fn execute_generated(
        &self,
        command: &str,
        extra_env: &HashMap<String, String>,
    ) -> Result<ExecOutcome> {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.execute(command, &task_id, extra_env).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;
    use crate::testing::local_supervisor;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_execute_success_removes_script() {
        let (_dir, provider, supervisor) = local_supervisor(&[]).await;
        supervisor.start().await.unwrap();
        let executor = CommandExecutor::new(supervisor.clone());

        let outcome = executor
            .execute("echo hello", "ok1", &HashMap::new())
            .await
            .unwrap();

        assert_eq!(outcome, ExecOutcome { exit_code: 0, output: "hello\n".to_string() });
        assert!(!supervisor.workspace().exists(&script_path("ok1")).unwrap());
        assert_eq!(provider.run_count(), 1);
    }

    #[tokio::test]
    async fn test_execute_failure_passes_exit_code_and_removes_script() {
        let (_dir, _provider, supervisor) = local_supervisor(&[]).await;
        supervisor.start().await.unwrap();
        let executor = CommandExecutor::new(supervisor.clone());

        let outcome = executor
            .execute("echo out; echo err >&2; exit 7", "fail1", &HashMap::new())
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 7);
        assert_eq!(outcome.output, "out\nerr\n");
        assert!(!supervisor.workspace().exists(&script_path("fail1")).unwrap());
    }

    #[tokio::test]
    async fn test_exec_error_still_removes_script() {
        let (_dir, provider, supervisor) = local_supervisor(&[]).await;
        supervisor.start().await.unwrap();
        provider.fail_exec(true);
        let executor = CommandExecutor::new(supervisor.clone());

        let err = executor
            .execute("true", "boom", &HashMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::Provider(_)));
        assert!(!supervisor.workspace().exists(&script_path("boom")).unwrap());
    }

    #[tokio::test]
    async fn test_env_file_and_extra_env_are_exported() {
        let (_dir, _provider, supervisor) =
            local_supervisor(&[("GREETING", "hi there"), ("NAME", "file")]).await;
        supervisor.start().await.unwrap();
        let executor = CommandExecutor::new(supervisor);

        let extra = HashMap::from([("NAME".to_string(), "o'brien".to_string())]);
        let outcome = executor
            .execute("echo \"$GREETING $NAME\"", "env1", &extra)
            .await
            .unwrap();

        assert_eq!(outcome.output, "hi there o'brien\n");
    }

    #[tokio::test]
    async fn test_not_running_is_distinct_failure() {
        let (_dir, _provider, supervisor) = local_supervisor(&[]).await;
        let executor = CommandExecutor::new(supervisor.clone());

        let err = executor
            .execute("true", "t1", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ContainerNotRunning));
        assert!(!supervisor.workspace().exists(&script_path("t1")).unwrap());
    }

    #[tokio::test]
    async fn test_dead_container_fails_fast() {
        let (_dir, provider, supervisor) = local_supervisor(&[]).await;
        let handle = supervisor.start().await.unwrap();
        provider.simulate_exit(&handle.id, 1, false).unwrap();
        let executor = CommandExecutor::new(supervisor);

        let err = executor
            .execute("true", "t2", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ContainerNotRunning));
    }

    #[tokio::test]
    async fn test_invalid_task_id_rejected() {
        let (_dir, _provider, supervisor) = local_supervisor(&[]).await;
        supervisor.start().await.unwrap();
        let executor = CommandExecutor::new(supervisor);

        let err = executor
            .execute("true", "../escape", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidTaskId(_)));
    }
}
