// ABOUTME: Runs a YAML or JSON file of pipeline steps against the sandbox
// ABOUTME: Prints each step's result and exits with the combined script's status

use super::Target;
use anyhow::{Context, Result};
use colored::*;
use potato_sandbox::{FileContent, PipelineOptions, PipelineRunner, PipelineStep, StepResult};
use std::collections::HashMap;
use std::path::Path;

/// Steps file contents; JSON parses as YAML too
pub fn parse_steps(text: &str) -> Result<Vec<PipelineStep>> {
    serde_yaml::from_str(text).context("Invalid pipeline steps")
}

pub async fn run(
    target: &Target,
    steps_file: &Path,
    working_dir: Option<String>,
    keep_going: bool,
    env: Vec<(String, String)>,
    as_json: bool,
) -> Result<i32> {
    let text = std::fs::read_to_string(steps_file)
        .with_context(|| format!("Failed to read {}", steps_file.display()))?;
    let steps = parse_steps(&text)?;

    let needs_container = steps
        .iter()
        .any(|step| matches!(step, PipelineStep::Exec { .. }));
    let supervisor = if needs_container {
        target.attached().await?
    } else {
        target.supervisor()?
    };

    let options = PipelineOptions {
        working_dir,
        stop_on_error: !keep_going,
        extra_env: env.into_iter().collect::<HashMap<_, _>>(),
    };
    let outcome = PipelineRunner::new(supervisor).run(&steps, &options).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        for result in &outcome.results {
            print_result(result);
        }
        if !outcome.exec_output.is_empty() {
            print!("{}", outcome.exec_output);
        }
    }

    Ok(i32::try_from(outcome.exit_code).unwrap_or(1))
}

fn print_result(result: &StepResult) {
    let label = format!("[{}]", result.index()).dimmed();
    match result {
        StepResult::WriteFile { path, .. } => println!("{} {} wrote {}", label, "✓".green(), path),
        StepResult::Mkdir { path, .. } => println!("{} {} created {}", label, "✓".green(), path),
        StepResult::Exec {
            exit_code, output, ..
        } => {
            let status = match exit_code {
                Some(0) => "exit 0".green().to_string(),
                Some(code) => format!("exit {}", code).red().to_string(),
                None => "skipped".yellow().to_string(),
            };
            println!("{} {}", label, status);
            print!("{}", output);
        }
        StepResult::ReadFile {
            path,
            content,
            error,
            ..
        } => match (content, error) {
            (Some(FileContent::Text(text)), _) => {
                println!("{} {}:", label, path.cyan());
                print!("{}", text);
            }
            (Some(FileContent::Binary(bytes)), _) => {
                println!("{} {}: {} bytes", label, path.cyan(), bytes.len())
            }
            (None, error) => println!(
                "{} {} {}",
                label,
                path.cyan(),
                error.as_deref().unwrap_or("unreadable").red()
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_steps_accepts_json() {
        let steps =
            parse_steps(r#"[{"type": "exec", "command": "ls -la"}, {"type": "mkdir", "path": "out"}]"#)
                .unwrap();
        assert_eq!(
            steps,
            vec![
                PipelineStep::Exec {
                    command: "ls -la".to_string(),
                    cwd: None,
                },
                PipelineStep::Mkdir {
                    path: "out".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_parse_steps_rejects_unknown_type() {
        assert!(parse_steps("- type: teleport\n  path: x\n").is_err());
    }
}
