// ABOUTME: CLI commands for detached background tasks in the sandbox
// ABOUTME: start, status, kill, list, output and prune over the pid marker protocol

use super::{generated_task_id, parse_env_pair, Target};
use anyhow::Result;
use clap::Subcommand;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use potato_sandbox::{KillResult, TaskSignal, TaskStatus, TaskTracker};
use std::collections::HashMap;

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Start a command in the background
    Start {
        /// Task id (default: derived from the current time)
        #[arg(long)]
        task_id: Option<String>,

        /// Extra environment variable, KEY=VALUE (repeatable)
        #[arg(short = 'e', long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Command to run; joined with spaces and interpreted by bash
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Show whether a task is running and its exit code
    Status {
        task_id: String,
        #[arg(long, help = "Print JSON instead of text")]
        json: bool,
    },
    /// Send a signal to a task
    Kill {
        task_id: String,
        /// Signal name, e.g. TERM, KILL, INT
        #[arg(short, long, default_value = "TERM")]
        signal: TaskSignal,
    },
    /// List known tasks
    List,
    /// Print captured output of a task
    Output {
        task_id: String,
        /// Only the last N lines
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Remove files of tasks that have finished
    Prune,
}

pub async fn handle_task_command(target: &Target, command: TaskCommands) -> Result<i32> {
    match command {
        TaskCommands::Start {
            task_id,
            env,
            command,
        } => start(target, task_id, env, command).await,
        TaskCommands::Status { task_id, json } => status(target, &task_id, json).await,
        TaskCommands::Kill { task_id, signal } => kill(target, &task_id, signal).await,
        TaskCommands::List => list(target).await,
        TaskCommands::Output { task_id, tail } => output(target, &task_id, tail),
        TaskCommands::Prune => prune(target),
    }
}

async fn start(
    target: &Target,
    task_id: Option<String>,
    env: Vec<(String, String)>,
    command: Vec<String>,
) -> Result<i32> {
    let tracker = TaskTracker::new(target.attached().await?);
    let task_id = task_id.unwrap_or_else(generated_task_id);
    let extra: HashMap<String, String> = env.into_iter().collect();

    let handle = tracker.start(&command.join(" "), &task_id, &extra).await?;
    println!(
        "{} Started task {} (pid {})",
        "✓".green(),
        handle.task_id.cyan(),
        handle.pid
    );
    Ok(0)
}

fn describe(status: &TaskStatus) -> String {
    match (status.running, status.exit_code) {
        (true, _) => "running".green().to_string(),
        (false, Some(0)) => "exited (0)".to_string(),
        (false, Some(code)) => format!("exited ({})", code).red().to_string(),
        (false, None) => "not running".yellow().to_string(),
    }
}

async fn status(target: &Target, task_id: &str, as_json: bool) -> Result<i32> {
    let tracker = TaskTracker::new(target.attached().await?);
    let status = tracker.status(task_id).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("{}: {}", status.task_id.cyan(), describe(&status));
        if status.has_output {
            println!(
                "{}",
                format!("Output available: potato task output {}", status.task_id).dimmed()
            );
        }
    }
    Ok(0)
}

async fn kill(target: &Target, task_id: &str, signal: TaskSignal) -> Result<i32> {
    let tracker = TaskTracker::new(target.attached().await?);
    let outcome = tracker.kill(task_id, signal).await?;

    match outcome.result {
        Some(KillResult::Signaled) => {
            println!("{} Sent SIG{} to {}", "✓".green(), signal, task_id.cyan())
        }
        Some(KillResult::AlreadyExited) => {
            println!("{}", format!("Task {} had already exited", task_id).yellow())
        }
        Some(KillResult::NotFound) => {
            println!("{}", format!("No task named {}", task_id).yellow())
        }
        None => println!("{}", format!("Kill of {} gave no result", task_id).red()),
    }
    Ok(if outcome.ok { 0 } else { 1 })
}

async fn list(target: &Target) -> Result<i32> {
    let supervisor = target.supervisor()?;
    let live = supervisor.attach().await?.is_some();
    let tracker = TaskTracker::new(supervisor);
    let ids = tracker.list()?;

    if ids.is_empty() {
        println!("{}", "No tasks found".yellow());
        return Ok(0);
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Task", "State", "Output"]);

    for task_id in &ids {
        let (state, has_output) = if live {
            let status = tracker.status(task_id).await?;
            (describe(&status), if status.has_output { "yes" } else { "no" })
        } else {
            ("unknown".dimmed().to_string(), "-")
        };
        table.add_row(vec![task_id.clone(), state, has_output.to_string()]);
    }

    println!("{}", table);
    println!("Total: {} tasks", ids.len().to_string().cyan());
    Ok(0)
}

fn output(target: &Target, task_id: &str, tail: Option<usize>) -> Result<i32> {
    let tracker = TaskTracker::new(target.supervisor()?);
    print!("{}", tracker.output(task_id, tail)?);
    Ok(0)
}

fn prune(target: &Target) -> Result<i32> {
    let tracker = TaskTracker::new(target.supervisor()?);
    let pruned = tracker.prune_finished();
    println!("{} Removed {} finished task(s)", "✓".green(), pruned);
    Ok(0)
}
