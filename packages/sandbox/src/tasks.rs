// ABOUTME: Background task tracking through pid marker files inside the sandbox workspace
// ABOUTME: Detached launch, status probes, signalling, listing and pruning without native job control

use crate::error::{Result, SandboxError};
use crate::providers::ExecResult;
use crate::script::{render_script, shell_quote, validate_task_id, KillResult, ProbeReport, TaskSignal};
use crate::supervisor::{ContainerHandle, ContainerSupervisor};
use crate::workspace::{WorkspaceStore, WriteOptions, TASKS_DIR};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Polls of 100ms while waiting for a marker or an exit status
const MARKER_POLLS: u32 = 50;

/// The three workspace-relative files owned by one task id.
///
/// The marker holds the pid on line 1. The detached waiter appends the
/// exit status as line 2 once the command finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFiles {
    pub script: String,
    pub marker: String,
    pub output: String,
}

impl TaskFiles {
    pub fn for_task(task_id: &str) -> Self {
        Self {
            script: format!("{}/task_{}.sh", TASKS_DIR, task_id),
            marker: format!("{}/task_{}.pid", TASKS_DIR, task_id),
            output: format!("{}/task_{}.out", TASKS_DIR, task_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: String,
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub running: bool,
    pub exit_code: Option<i32>,
    /// The output file exists and is non-empty; a task that has printed
    /// nothing yet reports false
    pub has_output: bool,
}

impl TaskStatus {
    fn unknown(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            running: false,
            exit_code: None,
            has_output: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillOutcome {
    pub task_id: String,
    pub signal: TaskSignal,
    pub result: Option<KillResult>,
    pub ok: bool,
}

/// Parsed marker contents as seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Marker {
    pid: Option<u32>,
    exit_code: Option<i32>,
}

impl Marker {
    fn parse(text: &str) -> Self {
        let mut lines = text.lines().map(str::trim);
        Self {
            pid: lines.next().and_then(|l| l.parse().ok()),
            exit_code: lines.next().and_then(|l| l.parse().ok()),
        }
    }
}

fn launch_script(script: &str, output: &str, marker: &str) -> String {
    format!(
        concat!(
            "script={script}; out={out}; marker={marker}\n",
            "nohup bash -c 'bash -l \"$1\" >\"$2\" 2>&1 & child=$!; ",
            "echo \"$child\" >\"$3.tmp\" && mv -f \"$3.tmp\" \"$3\"; ",
            "wait \"$child\"; echo \"$?\" >>\"$3\"' ",
            "potato-task \"$script\" \"$out\" \"$marker\" >/dev/null 2>&1 &\n",
            "i=0; while [ $i -lt {polls} ]; do [ -s \"$marker\" ] && exit 0; sleep 0.1; i=$((i+1)); done\n",
            "echo \"marker not written: $marker\" >&2; exit 1\n",
        ),
        script = shell_quote(script),
        out = shell_quote(output),
        marker = shell_quote(marker),
        polls = MARKER_POLLS,
    )
}

fn probe_script(marker: &str, output: &str) -> String {
    format!(
        concat!(
            "marker={marker}; out={out}; state=missing; ec=\n",
            "if [ -f \"$marker\" ]; then\n",
            "  pid=$(sed -n 1p \"$marker\" 2>/dev/null); ec=$(sed -n 2p \"$marker\" 2>/dev/null)\n",
            "  if [ -z \"$ec\" ] && [ -n \"$pid\" ] && kill -0 \"$pid\" 2>/dev/null; then state=running; else state=exited; fi\n",
            "fi\n",
            "echo \"STATE:$state\"; echo \"EXIT:$ec\"\n",
            "if [ -s \"$out\" ]; then echo OUT:1; else echo OUT:0; fi\n",
        ),
        marker = shell_quote(marker),
        out = shell_quote(output),
    )
}

fn kill_script(marker: &str, signal: TaskSignal) -> String {
    format!(
        concat!(
            "marker={marker}\n",
            "if [ ! -f \"$marker\" ]; then echo RESULT:missing; exit 0; fi\n",
            "pid=$(sed -n 1p \"$marker\" 2>/dev/null); ec=$(sed -n 2p \"$marker\" 2>/dev/null)\n",
            "if [ -n \"$ec\" ] || [ -z \"$pid\" ] || ! kill -0 \"$pid\" 2>/dev/null; then echo RESULT:exited; exit 0; fi\n",
            "if ! kill -s {signal} \"$pid\" 2>/dev/null; then echo RESULT:exited; exit 0; fi\n",
            "i=0; while [ $i -lt {polls} ]; do [ -n \"$(sed -n 2p \"$marker\" 2>/dev/null)\" ] && break; sleep 0.1; i=$((i+1)); done\n",
            "echo RESULT:signaled\n",
        ),
        marker = shell_quote(marker),
        signal = signal.name(),
        polls = MARKER_POLLS,
    )
}

/// Tracks detached commands inside the sandbox container
pub struct TaskTracker {
    supervisor: Arc<ContainerSupervisor>,
}

impl TaskTracker {
    pub fn new(supervisor: Arc<ContainerSupervisor>) -> Self {
        Self { supervisor }
    }

    async fn run_shell(&self, handle: &ContainerHandle, script: String) -> Result<ExecResult> {
        Ok(self
            .supervisor
            .provider()
            .exec_command(
                &handle.id,
                vec!["bash".to_string(), "-c".to_string(), script],
                self.supervisor.settings().exec_user.clone(),
            )
            .await?)
    }

    /// Launch `command` detached. Returns once the pid marker exists.
    pub async fn start(
        &self,
        command: &str,
        task_id: &str,
        extra_env: &HashMap<String, String>,
    ) -> Result<TaskHandle> {
        validate_task_id(task_id)?;
        let handle = self.supervisor.running_handle().await?;
        let workspace = self.supervisor.workspace();
        let settings = self.supervisor.settings();
        let files = TaskFiles::for_task(task_id);

        let env = self.supervisor.env().merged_with(extra_env);
        workspace.write_text(
            &files.script,
            &render_script(&env, command)?,
            WriteOptions::executable(),
        )?;
        workspace.remove_file(&files.marker)?;
        workspace.remove_file(&files.output)?;

        let launch = launch_script(
            &settings.container_path(&files.script),
            &settings.container_path(&files.output),
            &settings.container_path(&files.marker),
        );
        let result = self.run_shell(&handle, launch).await?;
        if result.exit_code != 0 {
            return Err(SandboxError::TaskLaunchFailed {
                task_id: task_id.to_string(),
                detail: result.combined_output().trim().to_string(),
            });
        }

        let marker = workspace.read_text(&files.marker).map_err(|e| {
            SandboxError::TaskLaunchFailed {
                task_id: task_id.to_string(),
                detail: format!("marker not visible in workspace: {}", e),
            }
        })?;
        let pid = Marker::parse(&marker)
            .pid
            .ok_or_else(|| SandboxError::TaskLaunchFailed {
                task_id: task_id.to_string(),
                detail: format!("marker does not contain a pid: {:?}", marker),
            })?;

        info!("Started background task {} (pid {})", task_id, pid);
        Ok(TaskHandle {
            task_id: task_id.to_string(),
            pid,
        })
    }

    /// Probe a task. Absent markers and failed probes read as not running.
    pub async fn status(&self, task_id: &str) -> Result<TaskStatus> {
        validate_task_id(task_id)?;
        let handle = self.supervisor.running_handle().await?;
        let settings = self.supervisor.settings();
        let files = TaskFiles::for_task(task_id);

        let probe = probe_script(
            &settings.container_path(&files.marker),
            &settings.container_path(&files.output),
        );
        let result = match self.run_shell(&handle, probe).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Status probe for task {} failed: {}", task_id, e);
                return Ok(TaskStatus::unknown(task_id));
            }
        };

        let text = String::from_utf8_lossy(&result.stdout);
        match ProbeReport::decode(&text) {
            Some(report) => Ok(TaskStatus {
                task_id: task_id.to_string(),
                running: report.is_running(),
                exit_code: report.exit_code,
                has_output: report.has_output,
            }),
            None => {
                warn!(
                    "Unrecognized status probe reply for task {}: {:?}",
                    task_id,
                    result.combined_output()
                );
                Ok(TaskStatus::unknown(task_id))
            }
        }
    }

    /// Signal a task and wait briefly for its exit status to be recorded
    pub async fn kill(&self, task_id: &str, signal: TaskSignal) -> Result<KillOutcome> {
        validate_task_id(task_id)?;
        let handle = self.supervisor.running_handle().await?;
        let marker = self
            .supervisor
            .settings()
            .container_path(&TaskFiles::for_task(task_id).marker);

        let result = self.run_shell(&handle, kill_script(&marker, signal)).await?;
        let decoded = KillResult::decode(&String::from_utf8_lossy(&result.stdout));
        debug!("Kill {} {} -> {:?}", signal, task_id, decoded);

        Ok(KillOutcome {
            task_id: task_id.to_string(),
            signal,
            result: decoded,
            ok: result.exit_code == 0 && decoded.is_some(),
        })
    }

    /// Task ids with a marker file, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        list_task_ids(self.supervisor.workspace())
    }

    /// Captured output, optionally only the last `tail` lines. Missing output is empty.
    pub fn output(&self, task_id: &str, tail: Option<usize>) -> Result<String> {
        validate_task_id(task_id)?;
        let files = TaskFiles::for_task(task_id);
        let text = match self.supervisor.workspace().read_text(&files.output) {
            Ok(text) => text,
            Err(SandboxError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(String::new())
            }
            Err(e) => return Err(e),
        };

        Ok(match tail {
            Some(n) => tail_lines(&text, n),
            None => text,
        })
    }

    /// Remove files of tasks whose exit status is recorded
    pub fn prune_finished(&self) -> usize {
        prune_finished(self.supervisor.workspace())
    }
}

pub(crate) fn list_task_ids(workspace: &WorkspaceStore) -> Result<Vec<String>> {
    Ok(workspace
        .list_dir(TASKS_DIR)?
        .into_iter()
        .filter_map(|name| {
            name.strip_prefix("task_")
                .and_then(|rest| rest.strip_suffix(".pid"))
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        })
        .collect())
}

pub(crate) fn prune_finished(workspace: &WorkspaceStore) -> usize {
    let ids = match list_task_ids(workspace) {
        Ok(ids) => ids,
        Err(e) => {
            warn!("Failed to list task markers: {}", e);
            return 0;
        }
    };

    let mut pruned = 0;
    for task_id in ids {
        let files = TaskFiles::for_task(&task_id);
        let finished = workspace
            .read_text(&files.marker)
            .map(|text| Marker::parse(&text).exit_code.is_some())
            .unwrap_or(false);
        if !finished {
            continue;
        }

        for relative in [&files.marker, &files.output, &files.script] {
            if let Err(e) = workspace.remove_file(relative) {
                warn!("Failed to remove {}: {}", relative, e);
            }
        }
        debug!("Pruned finished task {}", task_id);
        pruned += 1;
    }
    pruned
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    let mut tail = lines[start..].join("\n");
    if !tail.is_empty() && text.ends_with('\n') {
        tail.push('\n');
    }
    tail
}
