// ABOUTME: Shell script rendering and decoding of the in-container probe protocol
// ABOUTME: Builds task scripts with quoted exports and parses STATE/EXIT/OUT and RESULT replies

use crate::error::{Result, SandboxError};
use potato_config::{is_valid_name, EnvVarSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Quote `value` for a POSIX shell: wrapped in single quotes, `'` becomes `'\''`
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Render the script run for a command: shebang, one export per variable, then the command verbatim
pub fn render_script(env: &EnvVarSet, command: &str) -> Result<String> {
    let mut script = String::from("#!/bin/bash\n");
    for (name, value) in env.iter() {
        if !is_valid_name(name) {
            return Err(SandboxError::InvalidEnvName(name.to_string()));
        }
        script.push_str(&format!("export {}={}\n", name, shell_quote(value)));
    }
    script.push_str(command);
    if !command.ends_with('\n') {
        script.push('\n');
    }
    Ok(script)
}

/// Task ids become file names; anything that could change the directory is refused
pub fn validate_task_id(task_id: &str) -> Result<()> {
    let unusable = task_id.is_empty()
        || task_id == "."
        || task_id == ".."
        || task_id.contains(&['/', '\\', '\0'][..])
        || task_id.chars().any(char::is_control);
    if unusable {
        return Err(SandboxError::InvalidTaskId(task_id.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeState {
    Running,
    Exited,
    Missing,
}

/// Decoded reply of the task status probe.
///
/// The probe prints exactly three lines:
///
/// ```text
/// STATE:<running|exited|missing>
/// EXIT:<integer or empty>
/// OUT:<0|1>
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub state: ProbeState,
    pub exit_code: Option<i32>,
    pub has_output: bool,
}

impl ProbeReport {
    /// Strict decode. Returns `None` on any deviation from the grammar,
    /// which callers treat as "not running, exit unknown".
    pub fn decode(text: &str) -> Option<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

        let state = match lines.next()?.strip_prefix("STATE:")? {
            "running" => ProbeState::Running,
            "exited" => ProbeState::Exited,
            "missing" => ProbeState::Missing,
            _ => return None,
        };

        let exit_code = match lines.next()?.strip_prefix("EXIT:")? {
            "" => None,
            raw => Some(raw.parse::<i32>().ok()?),
        };

        let has_output = match lines.next()?.strip_prefix("OUT:")? {
            "1" => true,
            "0" => false,
            _ => return None,
        };

        if lines.next().is_some() {
            return None;
        }
        if state == ProbeState::Missing && exit_code.is_some() {
            return None;
        }

        Some(Self {
            state,
            exit_code,
            has_output,
        })
    }

    /// Running only while no exit status has been recorded
    pub fn is_running(&self) -> bool {
        self.state == ProbeState::Running && self.exit_code.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillResult {
    /// Signal delivered to a live process
    Signaled,
    /// Process had already exited; nothing was sent
    AlreadyExited,
    /// No marker file for the task id
    NotFound,
}

impl KillResult {
    /// Decode the single `RESULT:<signaled|exited|missing>` line of the kill script
    pub fn decode(text: &str) -> Option<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        let result = match lines.next()?.strip_prefix("RESULT:")? {
            "signaled" => KillResult::Signaled,
            "exited" => KillResult::AlreadyExited,
            "missing" => KillResult::NotFound,
            _ => return None,
        };
        if lines.next().is_some() {
            return None;
        }
        Some(result)
    }
}

/// Signals a background task may be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TaskSignal {
    #[default]
    Term,
    Kill,
    Int,
    Hup,
    Quit,
    Usr1,
    Usr2,
}

impl TaskSignal {
    pub fn name(&self) -> &'static str {
        match self {
            TaskSignal::Term => "TERM",
            TaskSignal::Kill => "KILL",
            TaskSignal::Int => "INT",
            TaskSignal::Hup => "HUP",
            TaskSignal::Quit => "QUIT",
            TaskSignal::Usr1 => "USR1",
            TaskSignal::Usr2 => "USR2",
        }
    }
}

impl fmt::Display for TaskSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TaskSignal {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        match upper.strip_prefix("SIG").unwrap_or(&upper) {
            "TERM" => Ok(TaskSignal::Term),
            "KILL" => Ok(TaskSignal::Kill),
            "INT" => Ok(TaskSignal::Int),
            "HUP" => Ok(TaskSignal::Hup),
            "QUIT" => Ok(TaskSignal::Quit),
            "USR1" => Ok(TaskSignal::Usr1),
            "USR2" => Ok(TaskSignal::Usr2),
            _ => Err(format!("Unsupported signal: {}", s)),
        }
    }
}
