// ABOUTME: In-process provider that simulates container lifecycle and runs execs on the host shell
// ABOUTME: Used by tests and by `--runtime local` to drive the supervisor without a Docker daemon

use super::{
    ContainerConfig, ContainerEvent, ContainerInspect, ContainerState, EventQuery, ExecResult,
    ImageBuildSpec, Provider, ProviderError, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct SimulatedContainer {
    id: String,
    name: String,
    image: String,
    running: bool,
    oom_killed: bool,
    exit_code: i64,
    error: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    logs: Vec<String>,
}

impl SimulatedContainer {
    fn state(&self) -> ContainerState {
        ContainerState {
            status: if self.running { "running" } else { "exited" }.to_string(),
            running: self.running,
            paused: false,
            restarting: false,
            oom_killed: self.oom_killed,
            dead: false,
            exit_code: Some(self.exit_code),
            error: Some(self.error.clone()),
            started_at: Some(rfc3339(self.started_at)),
            finished_at: Some(
                self.finished_at
                    .map(rfc3339)
                    .unwrap_or_else(|| "0001-01-01T00:00:00Z".to_string()),
            ),
        }
    }

    fn inspect(&self) -> ContainerInspect {
        let state = self.state();
        let raw = json!({
            "Id": self.id,
            "Name": format!("/{}", self.name),
            "Config": { "Image": self.image },
            "State": {
                "Status": state.status,
                "Running": state.running,
                "Paused": state.paused,
                "Restarting": state.restarting,
                "OOMKilled": state.oom_killed,
                "Dead": state.dead,
                "ExitCode": state.exit_code,
                "Error": state.error,
                "StartedAt": state.started_at,
                "FinishedAt": state.finished_at,
            },
        });
        ContainerInspect {
            id: self.id.clone(),
            name: self.name.clone(),
            state,
            raw,
        }
    }

    fn log(&mut self, line: &str) {
        self.logs.push(format!("{} {}", rfc3339(Utc::now()), line));
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Simulated runtime. Containers are records in memory; exec runs the
/// command on the host, so in-container paths must be host paths.
#[derive(Default)]
pub struct LocalProvider {
    containers: Mutex<HashMap<String, SimulatedContainer>>,
    events: Mutex<Vec<ContainerEvent>>,
    built_images: Mutex<Vec<String>>,
    run_count: AtomicUsize,
    unavailable: AtomicBool,
    fail_logs: AtomicBool,
    fail_events: AtomicBool,
    fail_exec: AtomicBool,
    fail_remove: AtomicBool,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn containers(&self) -> MutexGuard<'_, HashMap<String, SimulatedContainer>> {
        self.containers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn find<'a>(
        containers: &'a mut HashMap<String, SimulatedContainer>,
        key: &str,
    ) -> Result<&'a mut SimulatedContainer> {
        let name = containers
            .values()
            .find(|c| c.id == key || c.name == key)
            .map(|c| c.name.clone())
            .ok_or_else(|| ProviderError::NotFound(format!("No such container: {}", key)))?;
        containers
            .get_mut(&name)
            .ok_or_else(|| ProviderError::NotFound(format!("No such container: {}", key)))
    }

    fn record_event(&self, container: &SimulatedContainer, action: &str) {
        let mut attributes = BTreeMap::from([
            ("image".to_string(), container.image.clone()),
            ("name".to_string(), container.name.clone()),
        ]);
        if action == "die" {
            attributes.insert("exitCode".to_string(), container.exit_code.to_string());
        }
        if action == "oom" {
            attributes.insert("oom-kill".to_string(), "true".to_string());
        }

        let event = ContainerEvent {
            status: Some(action.to_string()),
            id: Some(container.id.clone()),
            time: Some(Utc::now().timestamp()),
            event_type: Some("container".to_string()),
            action: Some(action.to_string()),
            actor_id: Some(container.id.clone()),
            attributes,
        };
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    /// Mark a container as exited out of band, as if its main process died
    pub fn simulate_exit(&self, container: &str, exit_code: i64, oom_killed: bool) -> Result<()> {
        let snapshot = {
            let mut containers = self.containers();
            let entry = Self::find(&mut containers, container)?;
            entry.running = false;
            entry.exit_code = exit_code;
            entry.oom_killed = oom_killed;
            entry.finished_at = Some(Utc::now());
            if oom_killed {
                entry.log("fatal: out of memory");
            }
            entry.log(&format!("main process exited with code {}", exit_code));
            entry.clone()
        };
        if oom_killed {
            self.record_event(&snapshot, "oom");
        }
        self.record_event(&snapshot, "die");
        info!("Simulated exit of {} with code {}", snapshot.name, exit_code);
        Ok(())
    }

    /// Append a line to a container's log stream
    pub fn push_log(&self, container: &str, line: &str) -> Result<()> {
        let mut containers = self.containers();
        Self::find(&mut containers, container)?.log(line);
        Ok(())
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn fail_logs(&self, fail: bool) {
        self.fail_logs.store(fail, Ordering::SeqCst);
    }

    pub fn fail_events(&self, fail: bool) {
        self.fail_events.store(fail, Ordering::SeqCst);
    }

    pub fn fail_exec(&self, fail: bool) {
        self.fail_exec.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }

    /// How many containers have been created
    pub fn run_count(&self) -> usize {
        self.run_count.load(Ordering::SeqCst)
    }

    /// Tags built so far, in build order
    pub fn built_images(&self) -> Vec<String> {
        self.built_images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn is_available(&self) -> Result<bool> {
        Ok(!self.unavailable.load(Ordering::SeqCst))
    }

    async fn build_image(&self, spec: &ImageBuildSpec) -> Result<()> {
        let mut built = self.built_images.lock().unwrap_or_else(|e| e.into_inner());
        for stage in &spec.stages {
            debug!("Simulated build of {} from {}", stage.tag, stage.dockerfile);
            built.push(stage.tag.clone());
        }
        Ok(())
    }

    async fn run_container(&self, config: &ContainerConfig) -> Result<String> {
        let snapshot = {
            let mut containers = self.containers();
            if containers.contains_key(&config.name) {
                return Err(ProviderError::ContainerError(format!(
                    "Conflict. The container name \"/{}\" is already in use",
                    config.name
                )));
            }

            let mut container = SimulatedContainer {
                id: Uuid::new_v4().simple().to_string(),
                name: config.name.clone(),
                image: config.image.clone(),
                running: true,
                oom_killed: false,
                exit_code: 0,
                error: String::new(),
                started_at: Utc::now(),
                finished_at: None,
                logs: Vec::new(),
            };
            container.log("container started");
            containers.insert(config.name.clone(), container.clone());
            container
        };

        self.run_count.fetch_add(1, Ordering::SeqCst);
        self.record_event(&snapshot, "create");
        self.record_event(&snapshot, "start");
        Ok(snapshot.id)
    }

    async fn stop_container(&self, container: &str, _timeout_secs: u64) -> Result<()> {
        let snapshot = {
            let mut containers = self.containers();
            let entry = Self::find(&mut containers, container)?;
            if !entry.running {
                return Ok(());
            }
            entry.running = false;
            entry.exit_code = 143;
            entry.finished_at = Some(Utc::now());
            entry.clone()
        };
        self.record_event(&snapshot, "kill");
        self.record_event(&snapshot, "die");
        self.record_event(&snapshot, "stop");
        Ok(())
    }

    async fn remove_container(&self, container: &str, force: bool) -> Result<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(ProviderError::ContainerError("injected remove failure".to_string()));
        }
        let snapshot = {
            let mut containers = self.containers();
            let entry = Self::find(&mut containers, container)?;
            if entry.running && !force {
                return Err(ProviderError::ContainerError(format!(
                    "You cannot remove a running container {}",
                    entry.id
                )));
            }
            let name = entry.name.clone();
            containers.remove(&name)
        };
        if let Some(removed) = snapshot {
            self.record_event(&removed, "destroy");
        }
        Ok(())
    }

    async fn inspect_container(&self, container: &str) -> Result<ContainerInspect> {
        let mut containers = self.containers();
        Ok(Self::find(&mut containers, container)?.inspect())
    }

    async fn exec_command(
        &self,
        container: &str,
        command: Vec<String>,
        _user: Option<String>,
    ) -> Result<ExecResult> {
        {
            let mut containers = self.containers();
            let entry = Self::find(&mut containers, container)?;
            if !entry.running {
                return Err(ProviderError::ContainerError(format!(
                    "Container {} is not running",
                    entry.id
                )));
            }
        }
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(ProviderError::ExecError("injected exec failure".to_string()));
        }

        let (program, args) = command
            .split_first()
            .ok_or_else(|| ProviderError::ExecError("empty command".to_string()))?;

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;

        Ok(ExecResult {
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn container_logs(&self, container: &str, tail: usize) -> Result<String> {
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(ProviderError::ContainerError("injected logs failure".to_string()));
        }
        let mut containers = self.containers();
        let entry = Self::find(&mut containers, container)?;
        let skip = entry.logs.len().saturating_sub(tail);
        let mut text = entry.logs[skip..].join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        Ok(text)
    }

    async fn container_events(&self, query: &EventQuery) -> Result<Vec<ContainerEvent>> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(ProviderError::ContainerError("injected events failure".to_string()));
        }
        let since = query.since.timestamp();
        let until = query.until.timestamp();
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());

        Ok(events
            .iter()
            .filter(|e| e.time.is_some_and(|t| t >= since && t <= until))
            .filter(|e| {
                query.containers.iter().any(|c| {
                    e.actor_id.as_deref() == Some(c.as_str())
                        || e.attributes.get("name").map(String::as_str) == Some(c.as_str())
                })
            })
            .take(query.limit)
            .cloned()
            .collect())
    }
}
