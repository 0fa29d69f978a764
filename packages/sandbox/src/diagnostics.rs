// ABOUTME: Best-effort post-mortem capture for a dead sandbox container
// ABOUTME: Writes inspect JSON, log tail, recent daemon events and a summary under one timestamp token

use crate::error::{Result, SandboxError};
use crate::providers::{ContainerInspect, EventQuery, Provider};
use crate::settings::SandboxSettings;
use crate::workspace::{WorkspaceStore, WriteOptions, DIAGNOSTICS_DIR};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, warn};

const ERROR_MARKERS: &[&str] = &["error", "out of memory", "oom", "fatal", "panic"];

/// Bounds on what a single bundle captures
#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsOptions {
    pub log_tail_lines: usize,
    pub events_window_minutes: i64,
    pub events_limit: usize,
}

impl From<&SandboxSettings> for DiagnosticsOptions {
    fn from(settings: &SandboxSettings) -> Self {
        Self {
            log_tail_lines: settings.log_tail_lines,
            events_window_minutes: settings.events_window_minutes,
            events_limit: settings.events_limit,
        }
    }
}

/// Workspace-relative paths of one bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsBundle {
    pub token: String,
    pub inspect: String,
    pub logs: String,
    pub events: String,
    pub summary: String,
}

impl DiagnosticsBundle {
    fn for_token(token: &str) -> Self {
        let path = |kind: &str| format!("{}/diag_{}_{}", DIAGNOSTICS_DIR, token, kind);
        Self {
            token: token.to_string(),
            inspect: path("inspect.json"),
            logs: path("logs.txt"),
            events: path("events.txt"),
            summary: path("summary.txt"),
        }
    }

    pub fn files(&self) -> [&str; 4] {
        [&self.inspect, &self.logs, &self.events, &self.summary]
    }
}

pub struct DiagnosticsCollector {
    provider: Arc<dyn Provider>,
    workspace: WorkspaceStore,
    options: DiagnosticsOptions,
}

impl DiagnosticsCollector {
    pub fn new(
        provider: Arc<dyn Provider>,
        workspace: WorkspaceStore,
        options: DiagnosticsOptions,
    ) -> Self {
        Self {
            provider,
            workspace,
            options,
        }
    }

    /// Capture a bundle for `container_id` (also matched by `container_name`
    /// when querying events). Source failures are written into the bundle.
    /// Each file is written independently; the first write error is returned
    /// after every file has been attempted.
    pub async fn collect(&self, container_id: &str, container_name: &str) -> Result<DiagnosticsBundle> {
        let token = Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string();
        self.collect_with_token(&token, container_id, container_name)
            .await
    }

    pub(crate) async fn collect_with_token(
        &self,
        token: &str,
        container_id: &str,
        container_name: &str,
    ) -> Result<DiagnosticsBundle> {
        let bundle = DiagnosticsBundle::for_token(token);
        self.workspace.mkdir(DIAGNOSTICS_DIR)?;
        let mut first_failure = None;

        let inspect = match self.provider.inspect_container(container_id).await {
            Ok(inspect) => Ok(inspect),
            Err(e) => {
                warn!("Diagnostics: inspect of {} failed: {}", container_id, e);
                Err(e.to_string())
            }
        };
        let inspect_json = match &inspect {
            Ok(inspect) => serde_json::to_string_pretty(&inspect.raw)
                .unwrap_or_else(|e| json!({ "error": e.to_string() }).to_string()),
            Err(message) => json!({ "error": message }).to_string(),
        };
        self.write_part(&bundle.inspect, &inspect_json, &mut first_failure);

        let logs = match self
            .provider
            .container_logs(container_id, self.options.log_tail_lines)
            .await
        {
            Ok(logs) => logs,
            Err(e) => {
                warn!("Diagnostics: logs of {} failed: {}", container_id, e);
                String::new()
            }
        };
        self.write_part(&bundle.logs, &logs, &mut first_failure);

        let events = self.events_text(container_id, container_name).await;
        self.write_part(&bundle.events, &events, &mut first_failure);

        let summary = render_summary(container_id, inspect.as_ref().ok(), &logs);
        self.write_part(&bundle.summary, &summary, &mut first_failure);

        if let Some(e) = first_failure {
            return Err(e);
        }
        info!(
            "Diagnostics for {} written to {}/diag_{}_*",
            container_id, DIAGNOSTICS_DIR, token
        );
        Ok(bundle)
    }

    fn write_part(&self, relative: &str, content: &str, first_failure: &mut Option<SandboxError>) {
        if let Err(e) = self
            .workspace
            .write_text(relative, content, WriteOptions::default())
        {
            warn!("Diagnostics: failed to write {}: {}", relative, e);
            first_failure.get_or_insert(e);
        }
    }

    async fn events_text(&self, container_id: &str, container_name: &str) -> String {
        let until = Utc::now();
        let query = EventQuery {
            containers: vec![container_id.to_string(), container_name.to_string()],
            since: until - Duration::minutes(self.options.events_window_minutes),
            until,
            limit: self.options.events_limit,
        };

        match self.provider.container_events(&query).await {
            Ok(events) => events
                .iter()
                .filter_map(|event| serde_json::to_string(event).ok())
                .fold(String::new(), |mut text, line| {
                    text.push_str(&line);
                    text.push('\n');
                    text
                }),
            Err(e) => {
                warn!("Diagnostics: events for {} failed: {}", container_id, e);
                String::new()
            }
        }
    }
}

/// First line that looks like a failure, state error taking precedence
fn first_error(inspect: Option<&ContainerInspect>, logs: &str) -> Option<String> {
    if let Some(error) = inspect
        .and_then(|i| i.state.error.as_deref())
        .map(str::trim)
        .filter(|e| !e.is_empty())
    {
        return Some(error.to_string());
    }

    logs.lines()
        .find(|line| {
            let lower = line.to_lowercase();
            ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
        })
        .map(|line| line.trim().to_string())
}

fn render_summary(container_id: &str, inspect: Option<&ContainerInspect>, logs: &str) -> String {
    let mut summary = String::new();
    let opt = |value: &Option<String>| value.clone().unwrap_or_default();

    match inspect {
        Some(inspect) => {
            let state = &inspect.state;
            let _ = writeln!(summary, "Status: {}", state.status);
            let _ = writeln!(summary, "Running: {}", state.running);
            let _ = writeln!(summary, "Paused: {}", state.paused);
            let _ = writeln!(summary, "Restarting: {}", state.restarting);
            let _ = writeln!(summary, "OOMKilled: {}", state.oom_killed);
            let _ = writeln!(summary, "Dead: {}", state.dead);
            let _ = writeln!(
                summary,
                "ExitCode: {}",
                state.exit_code.map(|c| c.to_string()).unwrap_or_default()
            );
            let _ = writeln!(summary, "Error: {}", opt(&state.error));
            let _ = writeln!(summary, "StartedAt: {}", opt(&state.started_at));
            let _ = writeln!(summary, "FinishedAt: {}", opt(&state.finished_at));
        }
        None => {
            let _ = writeln!(summary, "Status: unknown (inspect failed)");
        }
    }

    let _ = writeln!(summary, "ContainerId: {}", container_id);
    let _ = writeln!(
        summary,
        "FirstError: {}",
        first_error(inspect, logs).unwrap_or_else(|| "none".to_string())
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ContainerConfig, LocalProvider};
    use std::collections::HashMap;
    use tempfile::TempDir;

    async fn dead_container(provider: &LocalProvider) -> String {
        let id = provider
            .run_container(&ContainerConfig {
                image: "potato-test".to_string(),
                name: "diag-box".to_string(),
                env_vars: HashMap::new(),
                volumes: Vec::new(),
                cpu_cores: 1.0,
                memory_mb: 256,
                command: None,
                working_dir: None,
                labels: HashMap::new(),
            })
            .await
            .unwrap();
        provider.simulate_exit(&id, 137, true).unwrap();
        id
    }

    fn collector(provider: Arc<LocalProvider>) -> (TempDir, DiagnosticsCollector) {
        let dir = TempDir::new().unwrap();
        let workspace = WorkspaceStore::open(dir.path()).unwrap();
        let options = DiagnosticsOptions::from(&SandboxSettings::default());
        (dir, DiagnosticsCollector::new(provider, workspace, options))
    }

    #[tokio::test]
    async fn test_bundle_has_four_files_sharing_token() {
        let provider = Arc::new(LocalProvider::new());
        let id = dead_container(&provider).await;
        let (_dir, collector) = collector(provider.clone());

        let bundle = collector.collect(&id, "diag-box").await.unwrap();

        let names = collector.workspace.list_dir(DIAGNOSTICS_DIR).unwrap();
        assert_eq!(names.len(), 4);
        assert!(names
            .iter()
            .all(|n| n.starts_with(&format!("diag_{}_", bundle.token))));

        let inspect: serde_json::Value =
            collector.workspace.read_json(&bundle.inspect).unwrap();
        assert_eq!(inspect["State"]["OOMKilled"], true);

        let events = collector.workspace.read_text(&bundle.events).unwrap();
        assert!(events.lines().any(|l| l.contains("\"oom\"")));
        for line in events.lines() {
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }

        let summary = collector.workspace.read_text(&bundle.summary).unwrap();
        assert!(summary.contains("OOMKilled: true"));
        assert!(summary.contains("ExitCode: 137"));
        assert!(summary.contains(&format!("ContainerId: {}", id)));
        assert!(summary.contains("FirstError:"));
        assert!(summary.contains("out of memory"));
    }

    #[tokio::test]
    async fn test_failed_sources_still_write_files() {
        let provider = Arc::new(LocalProvider::new());
        let id = dead_container(&provider).await;
        provider.fail_logs(true);
        provider.fail_events(true);
        let (_dir, collector) = collector(provider.clone());

        let bundle = collector.collect(&id, "diag-box").await.unwrap();

        for file in bundle.files() {
            assert!(collector.workspace.exists(file).unwrap(), "{} missing", file);
        }
        assert_eq!(collector.workspace.read_text(&bundle.logs).unwrap(), "");
        assert_eq!(collector.workspace.read_text(&bundle.events).unwrap(), "");
    }

    #[tokio::test]
    async fn test_missing_container_records_inspect_error() {
        let provider = Arc::new(LocalProvider::new());
        let (_dir, collector) = collector(provider);

        let bundle = collector.collect("gone", "gone").await.unwrap();

        let inspect: serde_json::Value =
            collector.workspace.read_json(&bundle.inspect).unwrap();
        assert!(inspect["error"].as_str().unwrap().contains("gone"));
        let summary = collector.workspace.read_text(&bundle.summary).unwrap();
        assert!(summary.contains("inspect failed"));
        assert!(summary.contains("FirstError: none"));
    }

    #[tokio::test]
    async fn test_failed_write_does_not_skip_other_files() {
        let provider = Arc::new(LocalProvider::new());
        let id = dead_container(&provider).await;
        let (_dir, collector) = collector(provider.clone());
        let token = "20260101T000000000Z";
        let bundle = DiagnosticsBundle::for_token(token);
        // A directory where the inspect file should go makes that one write fail
        collector.workspace.mkdir(&bundle.inspect).unwrap();

        let result = collector.collect_with_token(token, &id, "diag-box").await;

        assert!(matches!(result, Err(SandboxError::Io(_))));
        for file in [&bundle.logs, &bundle.events, &bundle.summary] {
            assert!(collector.workspace.exists(file).unwrap(), "{} missing", file);
        }
        let summary = collector.workspace.read_text(&bundle.summary).unwrap();
        assert!(summary.contains("OOMKilled: true"));
    }

    #[test]
    fn test_first_error_prefers_state_error() {
        let mut inspect = ContainerInspect {
            id: "abc".to_string(),
            name: "box".to_string(),
            state: Default::default(),
            raw: json!({}),
        };
        let logs = "starting\nPANIC: boom\nlater error\n";
        assert_eq!(first_error(Some(&inspect), logs).as_deref(), Some("PANIC: boom"));

        inspect.state.error = Some("OCI runtime exec failed".to_string());
        assert_eq!(
            first_error(Some(&inspect), logs).as_deref(),
            Some("OCI runtime exec failed")
        );
        assert_eq!(first_error(None, "all good\n"), None);
    }
}
