use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::process;

mod cli;

use cli::task::TaskCommands;
use cli::Runtime;

#[derive(Parser)]
#[command(name = "potato")]
#[command(about = "Potato - supervised sandbox container for running commands")]
#[command(version)]
struct Cli {
    /// Container runtime backend
    #[arg(long, value_enum, default_value = "docker", global = true)]
    runtime: Runtime,

    /// Host workspace directory (overrides POTATO_WORKSPACE_DIR)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the image, start the container and keep it alive until Ctrl+C
    Serve {
        #[arg(long, help = "Reuse the existing image instead of building it first")]
        skip_build: bool,
    },
    /// Build the sandbox image stages
    Build,
    /// Stop and remove the sandbox container, then clean up the workspace
    Stop,
    /// Show the sandbox container state
    Status {
        #[arg(long, help = "Print JSON instead of a table")]
        json: bool,
    },
    /// Run a command inside the container and wait for it
    Exec {
        /// Task id used to name the temporary script
        #[arg(long)]
        task_id: Option<String>,

        /// Extra environment variable, KEY=VALUE (repeatable)
        #[arg(short = 'e', long = "env", value_parser = cli::parse_env_pair)]
        env: Vec<(String, String)>,

        /// Command to run; joined with spaces and interpreted by bash
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Run a YAML or JSON file of write_file/mkdir/exec/read_file steps
    Pipeline {
        /// Steps file
        steps: PathBuf,

        /// Workspace-relative base directory for exec steps
        #[arg(long)]
        working_dir: Option<String>,

        #[arg(long, help = "Run every exec step even after one fails")]
        keep_going: bool,

        /// Extra environment variable, KEY=VALUE (repeatable)
        #[arg(short = 'e', long = "env", value_parser = cli::parse_env_pair)]
        env: Vec<(String, String)>,

        #[arg(long, help = "Print JSON instead of text")]
        json: bool,
    },
    /// Manage background tasks
    #[command(subcommand)]
    Task(TaskCommands),
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    cli::init_tracing();

    match handle_command(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}

/// Returns the process exit code
async fn handle_command(cli: Cli) -> anyhow::Result<i32> {
    let target = cli::Target {
        runtime: cli.runtime,
        workspace: cli.workspace,
    };

    match cli.command {
        Commands::Serve { skip_build } => cli::container::serve(&target, skip_build).await,
        Commands::Build => cli::container::build(&target).await,
        Commands::Stop => cli::container::stop(&target).await,
        Commands::Status { json } => cli::container::status(&target, json).await,
        Commands::Exec {
            task_id,
            env,
            command,
        } => cli::exec::exec(&target, task_id, env, command).await,
        Commands::Pipeline {
            steps,
            working_dir,
            keep_going,
            env,
            json,
        } => cli::pipeline::run(&target, &steps, working_dir, keep_going, env, json).await,
        Commands::Task(task_cmd) => cli::task::handle_task_command(&target, task_cmd).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_exec_keeps_trailing_hyphen_args() {
        let cli = Cli::try_parse_from([
            "potato", "exec", "-e", "A=1", "--", "ls", "-la", "/tmp",
        ])
        .unwrap();
        match cli.command {
            Commands::Exec { env, command, .. } => {
                assert_eq!(env, vec![("A".to_string(), "1".to_string())]);
                assert_eq!(command, vec!["ls", "-la", "/tmp"]);
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn test_runtime_is_global() {
        let cli = Cli::try_parse_from(["potato", "status", "--runtime", "local"]).unwrap();
        assert_eq!(cli.runtime, Runtime::Local);
    }

    #[test]
    fn test_exec_requires_command() {
        assert!(Cli::try_parse_from(["potato", "exec"]).is_err());
    }

    #[test]
    fn test_pipeline_flags() {
        let cli = Cli::try_parse_from([
            "potato",
            "pipeline",
            "steps.yaml",
            "--working-dir",
            "proj",
            "--keep-going",
        ])
        .unwrap();
        match cli.command {
            Commands::Pipeline {
                steps,
                working_dir,
                keep_going,
                json,
                ..
            } => {
                assert_eq!(steps, PathBuf::from("steps.yaml"));
                assert_eq!(working_dir.as_deref(), Some("proj"));
                assert!(keep_going);
                assert!(!json);
            }
            _ => panic!("expected pipeline"),
        }
    }

    #[test]
    fn test_task_kill_parses_signal() {
        let cli =
            Cli::try_parse_from(["potato", "task", "kill", "t1", "--signal", "SIGKILL"]).unwrap();
        match cli.command {
            Commands::Task(TaskCommands::Kill { task_id, signal }) => {
                assert_eq!(task_id, "t1");
                assert_eq!(signal, potato_sandbox::TaskSignal::Kill);
            }
            _ => panic!("expected task kill"),
        }
    }
}
