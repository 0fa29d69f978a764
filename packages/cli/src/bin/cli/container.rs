// ABOUTME: Container lifecycle commands: serve, build, stop and status
// ABOUTME: serve runs the watchdog until Ctrl+C and cleans up on the way out

use super::{short_id, Target};
use anyhow::{bail, Context, Result};
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use potato_sandbox::{TaskTracker, Watchdog};
use serde_json::json;

pub async fn serve(target: &Target, skip_build: bool) -> Result<i32> {
    let supervisor = target.supervisor()?;
    if !supervisor.provider().is_available().await.unwrap_or(false) {
        bail!("Container runtime is not available");
    }

    if !skip_build {
        println!("{}", "Building sandbox image...".blue().bold());
        supervisor
            .build_image()
            .await
            .context("Image build failed")?;
    }

    let handle = supervisor.start().await?;
    println!(
        "{} Container {} ({}) started",
        "✓".green(),
        handle.name.cyan(),
        short_id(&handle.id)
    );
    let ready = supervisor.write_ready_state().await?;
    println!("Ready state written to {}", ready.display().to_string().dimmed());

    let interval = supervisor.settings().watchdog_interval;
    let watchdog = Watchdog::new(supervisor.clone(), interval);
    watchdog.start().await;
    println!(
        "Watching container every {}s. Press {} to stop.",
        interval.as_secs(),
        "Ctrl+C".yellow()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    println!("\n{}", "Shutting down...".yellow());
    watchdog.stop().await;
    supervisor.cleanup().await;
    println!("{} Sandbox stopped", "✓".green());
    Ok(0)
}

pub async fn build(target: &Target) -> Result<i32> {
    let supervisor = target.supervisor()?;
    for stage in &supervisor.settings().build_stages {
        println!("  {} → {}", stage.dockerfile, stage.tag.cyan());
    }
    supervisor.build_image().await?;
    println!("{} Image built", "✓".green());
    Ok(0)
}

pub async fn stop(target: &Target) -> Result<i32> {
    let supervisor = target.supervisor()?;
    supervisor.cleanup().await;
    println!(
        "{} Container {} stopped",
        "✓".green(),
        supervisor.settings().container_name.cyan()
    );
    Ok(0)
}

pub async fn status(target: &Target, as_json: bool) -> Result<i32> {
    let supervisor = target.supervisor()?;
    let settings = supervisor.settings();
    let existing = supervisor
        .provider()
        .get_by_name(&settings.container_name)
        .await?;
    let tasks = TaskTracker::new(supervisor.clone()).list()?;

    if as_json {
        let value = json!({
            "name": settings.container_name,
            "image": settings.image_name,
            "workspace": supervisor.workspace().root(),
            "container": existing.as_ref().map(|c| json!({
                "id": c.id,
                "state": c.state,
            })),
            "tasks": tasks,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(0);
    }

    let Some(container) = existing else {
        println!(
            "{}",
            format!("No container named {}", settings.container_name).yellow()
        );
        println!("{}", "Use 'potato serve' to start the sandbox".dimmed());
        return Ok(0);
    };

    let state = &container.state;
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Field", "Value"]);

    let running = if state.running {
        "yes".green().to_string()
    } else {
        "no".red().to_string()
    };
    let rows = [
        ("Name", settings.container_name.clone()),
        ("ID", short_id(&container.id).to_string()),
        ("Image", settings.image_name.clone()),
        ("Status", state.status.clone()),
        ("Running", running),
        ("OOM killed", state.oom_killed.to_string()),
        (
            "Exit code",
            state.exit_code.map(|c| c.to_string()).unwrap_or_default(),
        ),
        ("Started", state.started_at.clone().unwrap_or_default()),
        ("Finished", state.finished_at.clone().unwrap_or_default()),
        (
            "Workspace",
            supervisor.workspace().root().display().to_string(),
        ),
        ("Tasks", tasks.len().to_string()),
    ];
    for (field, value) in rows {
        table.add_row(vec![field.to_string(), value]);
    }

    println!("{}", table);
    Ok(0)
}
