// ABOUTME: Supervisor owning the single sandbox container and its current handle
// ABOUTME: Build, start, stop, liveness checks and diagnose-then-restart recovery

use crate::diagnostics::{DiagnosticsCollector, DiagnosticsOptions};
use crate::error::{Result, SandboxError};
use crate::providers::{ContainerConfig, ContainerInspect, ImageBuildSpec, Provider, VolumeMount};
use crate::settings::SandboxSettings;
use crate::tasks;
use crate::workspace::WorkspaceStore;
use chrono::{DateTime, Utc};
use potato_config::EnvVarSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

pub const READY_FILE: &str = "ready.json";

/// Immutable snapshot of the container the supervisor last started or adopted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyState {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub up: bool,
    pub container: ReadyContainer,
    pub server: ReadyServer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyContainer {
    pub name: String,
    pub id: Option<String>,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyServer {
    pub pid: u32,
}

pub struct ContainerSupervisor {
    provider: Arc<dyn Provider>,
    settings: SandboxSettings,
    workspace: WorkspaceStore,
    env: EnvVarSet,
    diagnostics: DiagnosticsCollector,
    handle: RwLock<Option<Arc<ContainerHandle>>>,
    /// `<id>@<finished_at>` of the last death that produced a bundle
    last_incident: Mutex<Option<String>>,
    /// Serializes start, stop and recovery
    lifecycle: Mutex<()>,
}

impl ContainerSupervisor {
    /// Create a supervisor, loading the environment file named in `settings`
    pub fn new(provider: Arc<dyn Provider>, settings: SandboxSettings) -> Result<Self> {
        let env = potato_config::load(&settings.env_file)?;
        Self::with_env(provider, settings, env)
    }

    pub fn with_env(
        provider: Arc<dyn Provider>,
        settings: SandboxSettings,
        env: EnvVarSet,
    ) -> Result<Self> {
        settings.validate()?;
        let workspace = WorkspaceStore::open(&settings.workspace_dir)?;
        let diagnostics = DiagnosticsCollector::new(
            provider.clone(),
            workspace.clone(),
            DiagnosticsOptions::from(&settings),
        );

        Ok(Self {
            provider,
            settings,
            workspace,
            env,
            diagnostics,
            handle: RwLock::new(None),
            last_incident: Mutex::new(None),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn workspace(&self) -> &WorkspaceStore {
        &self.workspace
    }

    pub fn env(&self) -> &EnvVarSet {
        &self.env
    }

    pub async fn current_handle(&self) -> Option<Arc<ContainerHandle>> {
        self.handle.read().await.clone()
    }

    /// The current handle, provided its container is running right now
    pub async fn running_handle(&self) -> Result<Arc<ContainerHandle>> {
        let handle = self
            .current_handle()
            .await
            .ok_or(SandboxError::ContainerNotRunning)?;

        match self.provider.inspect_container(&handle.id).await {
            Ok(inspect) if inspect.state.running => Ok(handle),
            Ok(_) => Err(SandboxError::ContainerNotRunning),
            Err(e) if e.is_not_found() => Err(SandboxError::ContainerNotRunning),
            Err(e) => Err(e.into()),
        }
    }

    pub fn container_config(&self) -> ContainerConfig {
        ContainerConfig {
            image: self.settings.image_name.clone(),
            name: self.settings.container_name.clone(),
            env_vars: HashMap::from([("DISPLAY".to_string(), ":0".to_string())]),
            volumes: vec![VolumeMount {
                host_path: self.workspace.root().to_string_lossy().into_owned(),
                container_path: self.settings.container_workspace.clone(),
                readonly: false,
            }],
            cpu_cores: self.settings.cpu_cores,
            memory_mb: self.settings.memory_mb,
            command: None,
            working_dir: Some(self.settings.container_workspace.clone()),
            labels: HashMap::new(),
        }
    }

    /// Build every configured image stage, in order
    pub async fn build_image(&self) -> Result<()> {
        let spec = ImageBuildSpec {
            context_dir: self.settings.build_context.clone(),
            stages: self.settings.build_stages.clone(),
        };
        info!(
            "Building {} image stage(s) from {}",
            spec.stages.len(),
            spec.context_dir.display()
        );
        self.provider.build_image(&spec).await?;
        Ok(())
    }

    /// Replace whatever holds the managed name with a fresh container
    pub async fn start(&self) -> Result<Arc<ContainerHandle>> {
        let _lifecycle = self.lifecycle.lock().await;
        self.start_locked().await
    }

    /// Stop and remove the managed container. Never fails; the handle is cleared.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked().await;
    }

    async fn start_locked(&self) -> Result<Arc<ContainerHandle>> {
        self.stop_locked().await;
        self.workspace.ensure_layout()?;

        let id = self.provider.run_container(&self.container_config()).await?;
        let handle = Arc::new(ContainerHandle {
            id,
            name: self.settings.container_name.clone(),
            started_at: Utc::now(),
        });
        *self.handle.write().await = Some(handle.clone());

        info!("Started container {} ({})", handle.name, handle.id);
        Ok(handle)
    }

    async fn stop_locked(&self) {
        let name = &self.settings.container_name;
        match self.provider.get_by_name(name).await {
            Ok(Some(existing)) => {
                if let Err(e) = self
                    .provider
                    .stop_container(&existing.id, self.settings.stop_timeout_secs)
                    .await
                {
                    if !e.is_not_found() {
                        warn!("Failed to stop container {}: {}", name, e);
                    }
                }
                match self.provider.remove_container(&existing.id, true).await {
                    Ok(()) => info!("Removed container {} ({})", name, existing.id),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!("Failed to remove container {}: {}", name, e),
                }
            }
            Ok(None) => debug!("No container named {} to stop", name),
            Err(e) => warn!("Failed to look up container {}: {}", name, e),
        }

        *self.handle.write().await = None;
    }

    /// Adopt a container already running under the managed name
    pub async fn attach(&self) -> Result<Option<Arc<ContainerHandle>>> {
        let existing = match self.provider.get_by_name(&self.settings.container_name).await? {
            Some(existing) if existing.state.running => existing,
            _ => return Ok(None),
        };

        let started_at = existing
            .state
            .started_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let handle = Arc::new(ContainerHandle {
            id: existing.id,
            name: self.settings.container_name.clone(),
            started_at,
        });
        *self.handle.write().await = Some(handle.clone());
        debug!("Attached to container {} ({})", handle.name, handle.id);
        Ok(Some(handle))
    }

    /// Whether the managed container is running. Without a handle, a running
    /// container under the managed name is adopted.
    pub async fn is_running(&self) -> bool {
        let Some(handle) = self.current_handle().await else {
            return match self.attach().await {
                Ok(adopted) => adopted.is_some(),
                Err(e) => {
                    debug!("Lookup of {} failed: {}", self.settings.container_name, e);
                    false
                }
            };
        };
        match self.provider.inspect_container(&handle.id).await {
            Ok(inspect) => inspect.state.running,
            Err(e) => {
                debug!("Inspect of {} failed: {}", handle.id, e);
                false
            }
        }
    }

    /// Recover from a dead container: diagnose once per incident, start a
    /// fresh container and wait for it to report running.
    pub async fn ensure_alive(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running().await {
            return true;
        }

        if let Some((container_id, incident)) = self.find_incident().await {
            self.diagnose(&container_id, incident).await;
        }

        let handle = match self.start_locked().await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to restart container: {}", e);
                return false;
            }
        };

        for attempt in 1..=self.settings.start_poll_attempts {
            match self.provider.inspect_container(&handle.id).await {
                Ok(inspect) if inspect.state.running => {
                    info!("Container {} is running again", handle.id);
                    return true;
                }
                Ok(_) => debug!("Container {} not running yet (attempt {})", handle.id, attempt),
                Err(e) => debug!("Inspect of {} failed (attempt {}): {}", handle.id, attempt, e),
            }
            tokio::time::sleep(self.settings.start_poll_interval).await;
        }

        error!(
            "Container {} did not report running after {} attempts",
            handle.id, self.settings.start_poll_attempts
        );
        false
    }

    /// The dead container to diagnose and its incident key, if any
    async fn find_incident(&self) -> Option<(String, String)> {
        let inspect: Option<ContainerInspect> = match self.current_handle().await {
            Some(handle) => match self.provider.inspect_container(&handle.id).await {
                Ok(inspect) => Some(inspect),
                Err(e) => {
                    warn!("Container {} vanished: {}", handle.id, e);
                    return Some((handle.id.clone(), format!("{}@gone", handle.id)));
                }
            },
            None => self
                .provider
                .get_by_name(&self.settings.container_name)
                .await
                .unwrap_or_else(|e| {
                    warn!("Failed to look up container: {}", e);
                    None
                }),
        };

        inspect.filter(|inspect| !inspect.state.running).map(|inspect| {
            let finished = inspect.state.finished_at.clone().unwrap_or_default();
            let key = format!("{}@{}", inspect.id, finished);
            (inspect.id, key)
        })
    }

    async fn diagnose(&self, container_id: &str, incident: String) {
        let mut last = self.last_incident.lock().await;
        if last.as_deref() == Some(incident.as_str()) {
            debug!("Incident {} already diagnosed", incident);
            return;
        }
        *last = Some(incident);

        match self
            .diagnostics
            .collect(container_id, &self.settings.container_name)
            .await
        {
            Ok(bundle) => warn!(
                "Container {} died; diagnostics written to {}",
                container_id, bundle.summary
            ),
            Err(e) => warn!("Failed to write diagnostics for {}: {}", container_id, e),
        }
    }

    /// Stop the container and clear leftovers from the workspace
    pub async fn cleanup(&self) {
        self.stop().await;
        let scripts = self.workspace.sweep_scripts();
        let pruned = tasks::prune_finished(&self.workspace);
        info!(
            "Cleanup complete: {} leftover script(s), {} finished task(s) removed",
            scripts, pruned
        );
    }

    /// Record readiness for external tooling at `<workspace>/ready.json`
    pub async fn write_ready_state(&self) -> Result<PathBuf> {
        let handle = self.current_handle().await;
        let running = self.is_running().await;
        let state = ReadyState {
            version: 1,
            timestamp: Utc::now(),
            up: true,
            container: ReadyContainer {
                name: self.settings.container_name.clone(),
                id: handle.map(|h| h.id.clone()),
                running,
            },
            server: ReadyServer {
                pid: std::process::id(),
            },
        };
        self.workspace.write_json(READY_FILE, &state)
    }
}
