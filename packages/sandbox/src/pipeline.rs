// ABOUTME: Multi-step pipelines of file writes, directory creation, commands and file reads
// ABOUTME: Command steps run together as one script; per-step exit codes and output are read back from the workspace

use crate::error::{Result, SandboxError};
use crate::executor::{CommandExecutor, ScriptGuard};
use crate::script::shell_quote;
use crate::supervisor::ContainerSupervisor;
use crate::workspace::WriteOptions;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Per-step output and exit code files, removed once the pipeline returns
pub const PIPELINE_DIR: &str = "tmp_scripts/pipeline";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineStep {
    WriteFile {
        path: String,
        #[serde(default)]
        content: String,
        #[serde(default)]
        executable: bool,
        #[serde(default)]
        append: bool,
    },
    Mkdir {
        path: String,
    },
    #[serde(alias = "run", alias = "command")]
    Exec {
        command: String,
        /// Workspace-relative directory, created if missing
        #[serde(default)]
        cwd: Option<String>,
    },
    ReadFile {
        path: String,
        #[serde(default)]
        binary: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepResult {
    WriteFile {
        index: usize,
        path: String,
    },
    Mkdir {
        index: usize,
        path: String,
    },
    /// `exit_code` is `None` for steps skipped after an earlier failure
    Exec {
        index: usize,
        exit_code: Option<i64>,
        output: String,
    },
    ReadFile {
        index: usize,
        path: String,
        content: Option<FileContent>,
        error: Option<String>,
    },
}

impl StepResult {
    pub fn index(&self) -> usize {
        match self {
            StepResult::WriteFile { index, .. }
            | StepResult::Mkdir { index, .. }
            | StepResult::Exec { index, .. }
            | StepResult::ReadFile { index, .. } => *index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    /// Exit status of the combined command script; 0 when there were no command steps
    pub exit_code: i64,
    /// Output of the combined script itself, outside any step
    pub exec_output: String,
    pub results: Vec<StepResult>,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Workspace-relative base directory for command steps
    pub working_dir: Option<String>,
    pub stop_on_error: bool,
    pub extra_env: HashMap<String, String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            working_dir: None,
            stop_on_error: true,
            extra_env: HashMap::new(),
        }
    }
}

struct StepFiles {
    output: String,
    code: String,
}

impl StepFiles {
    fn new(run_id: &str, index: usize) -> Self {
        let base = format!("{}/{}_{}", PIPELINE_DIR, run_id, index);
        Self {
            output: format!("{}.out", base),
            code: format!("{}.code", base),
        }
    }
}

/// Script lines for one command step: run it with output captured, record
/// its status, and stop the script on failure when asked to.
fn step_lines(run: &str, output: &str, code: &str, stop_on_error: bool) -> String {
    let mut lines = format!(
        "{} >{} 2>&1 && status=0 || status=$?\necho \"$status\" >{}\n",
        run,
        shell_quote(output),
        shell_quote(code)
    );
    if stop_on_error {
        lines.push_str("[ \"$status\" -eq 0 ] || exit \"$status\"\n");
    }
    lines
}

pub struct PipelineRunner {
    supervisor: Arc<ContainerSupervisor>,
}

impl PipelineRunner {
    pub fn new(supervisor: Arc<ContainerSupervisor>) -> Self {
        Self { supervisor }
    }

    /// Run `steps` against the workspace and container.
    ///
    /// File writes and directory creation happen on the host first, in step
    /// order. Command steps then run as one script inside the container, and
    /// file reads happen last so they observe what the commands produced.
    /// Every path is checked before anything is written.
    pub async fn run(
        &self,
        steps: &[PipelineStep],
        options: &PipelineOptions,
    ) -> Result<PipelineOutcome> {
        self.check(steps, options)?;
        let workspace = self.supervisor.workspace();
        let settings = self.supervisor.settings();

        for step in steps {
            match step {
                PipelineStep::WriteFile {
                    path,
                    content,
                    executable,
                    append,
                } => {
                    let write = WriteOptions {
                        append: *append,
                        executable: *executable,
                    };
                    workspace.write_text(path, content, write)?;
                }
                PipelineStep::Mkdir { path } => {
                    workspace.mkdir(path)?;
                }
                PipelineStep::Exec { .. } | PipelineStep::ReadFile { .. } => {}
            }
        }

        let run_id = format!("pipeline_{}", uuid::Uuid::new_v4());
        let base_dir = match &options.working_dir {
            Some(dir) => {
                workspace.mkdir(dir)?;
                settings.container_path(dir)
            }
            None => settings.container_workspace.clone(),
        };

        let mut script = format!("cd {}\nset -o pipefail\n", shell_quote(&base_dir));
        let mut guards = Vec::new();
        let mut exec_steps = 0;
        for (index, step) in steps.iter().enumerate() {
            let PipelineStep::Exec { command, cwd } = step else {
                continue;
            };
            let files = StepFiles::new(&run_id, index);
            guards.push(ScriptGuard::new(workspace, files.output.clone()));
            guards.push(ScriptGuard::new(workspace, files.code.clone()));

            let mut run = format!("bash -lc {}", shell_quote(command));
            if let Some(cwd) = cwd {
                workspace.mkdir(cwd)?;
                run = format!(
                    "( cd {} && {} )",
                    shell_quote(&settings.container_path(cwd)),
                    run
                );
            }
            script.push_str(&step_lines(
                &run,
                &settings.container_path(&files.output),
                &settings.container_path(&files.code),
                options.stop_on_error,
            ));
            exec_steps += 1;
        }

        let (exit_code, exec_output) = if exec_steps > 0 {
            workspace.mkdir(PIPELINE_DIR)?;
            debug!("Running {} command step(s) as {}", exec_steps, run_id);
            let outcome = CommandExecutor::new(self.supervisor.clone())
                .execute(&script, &run_id, &options.extra_env)
                .await?;
            (outcome.exit_code, outcome.output)
        } else {
            (0, String::new())
        };

        let results = steps
            .iter()
            .enumerate()
            .map(|(index, step)| self.step_result(index, step, &run_id))
            .collect();

        info!(
            "Pipeline {} finished: {} step(s), exit code {}",
            run_id,
            steps.len(),
            exit_code
        );
        Ok(PipelineOutcome {
            exit_code,
            exec_output,
            results,
        })
    }

    fn check(&self, steps: &[PipelineStep], options: &PipelineOptions) -> Result<()> {
        if steps.is_empty() {
            return Err(SandboxError::InvalidPipeline(
                "at least one step is required".to_string(),
            ));
        }

        let workspace = self.supervisor.workspace();
        if let Some(dir) = &options.working_dir {
            workspace.resolve(dir)?;
        }
        for (index, step) in steps.iter().enumerate() {
            match step {
                PipelineStep::WriteFile { path, .. }
                | PipelineStep::Mkdir { path }
                | PipelineStep::ReadFile { path, .. } => {
                    workspace.resolve(path)?;
                }
                PipelineStep::Exec { command, cwd } => {
                    if command.trim().is_empty() {
                        return Err(SandboxError::InvalidPipeline(format!(
                            "step {} has an empty command",
                            index
                        )));
                    }
                    if let Some(cwd) = cwd {
                        workspace.resolve(cwd)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn step_result(&self, index: usize, step: &PipelineStep, run_id: &str) -> StepResult {
        let workspace = self.supervisor.workspace();
        match step {
            PipelineStep::WriteFile { path, .. } => StepResult::WriteFile {
                index,
                path: path.clone(),
            },
            PipelineStep::Mkdir { path } => StepResult::Mkdir {
                index,
                path: path.clone(),
            },
            PipelineStep::Exec { .. } => {
                let files = StepFiles::new(run_id, index);
                let output = workspace
                    .read_bytes(&files.output)
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or_default();
                let exit_code = workspace
                    .read_text(&files.code)
                    .ok()
                    .and_then(|text| text.trim().parse().ok());
                StepResult::Exec {
                    index,
                    exit_code,
                    output,
                }
            }
            PipelineStep::ReadFile { path, binary } => {
                let content = if *binary {
                    workspace.read_bytes(path).map(FileContent::Binary)
                } else {
                    workspace.read_text(path).map(FileContent::Text)
                };
                match content {
                    Ok(content) => StepResult::ReadFile {
                        index,
                        path: path.clone(),
                        content: Some(content),
                        error: None,
                    },
                    Err(e) => StepResult::ReadFile {
                        index,
                        path: path.clone(),
                        content: None,
                        error: Some(e.to_string()),
                    },
                }
            }
        }
    }
}
