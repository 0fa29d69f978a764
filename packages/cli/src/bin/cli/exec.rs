// ABOUTME: Foreground command execution inside the sandbox
// ABOUTME: Prints combined output and exits with the command's own status

use super::Target;
use anyhow::Result;
use potato_sandbox::CommandExecutor;
use std::collections::HashMap;
use std::io::Write;

pub async fn exec(
    target: &Target,
    task_id: Option<String>,
    env: Vec<(String, String)>,
    command: Vec<String>,
) -> Result<i32> {
    let supervisor = target.attached().await?;
    let executor = CommandExecutor::new(supervisor);
    let command = command.join(" ");
    let extra: HashMap<String, String> = env.into_iter().collect();

    let outcome = match task_id {
        Some(task_id) => executor.execute(&command, &task_id, &extra).await?,
        None => executor.execute_generated(&command, &extra).await?,
    };

    let mut stdout = std::io::stdout();
    stdout.write_all(outcome.output.as_bytes())?;
    stdout.flush()?;

    // Statuses outside i32 cannot be a process exit code
    Ok(i32::try_from(outcome.exit_code).unwrap_or(1))
}
