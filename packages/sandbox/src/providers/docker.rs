// ABOUTME: Docker provider implementation for the sandbox container
// ABOUTME: Uses bollard to build images, run the container, exec scripts and read logs/events

use super::{
    ContainerConfig, ContainerEvent, ContainerInspect, ContainerState, EventQuery, ExecResult,
    ImageBuildSpec, Provider, ProviderError, Result, EVENT_ATTRIBUTE_KEYS,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::BuildImageOptions,
    system::EventsOptions,
    Docker,
};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

const LABEL_PREFIX: &str = "potato.sandbox";

pub struct DockerProvider {
    client: Docker,
}

impl DockerProvider {
    /// Connect using DOCKER_HOST or the platform default socket
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
        Ok(Self { client })
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }

    /// Convert our config to bollard config
    fn to_bollard_config(config: &ContainerConfig) -> Config<String> {
        let mut labels = config.labels.clone();
        labels.insert(format!("{}.managed", LABEL_PREFIX), "true".to_string());
        labels.insert(format!("{}.name", LABEL_PREFIX), config.name.clone());

        let binds: Vec<String> = config
            .volumes
            .iter()
            .map(|v| {
                format!(
                    "{}:{}:{}",
                    v.host_path,
                    v.container_path,
                    if v.readonly { "ro" } else { "rw" }
                )
            })
            .collect();

        let mut env: Vec<String> = config
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();

        let host_config = bollard::models::HostConfig {
            binds: Some(binds),
            memory: Some((config.memory_mb * 1024 * 1024) as i64),
            nano_cpus: Some((f64::from(config.cpu_cores) * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        Config {
            image: Some(config.image.clone()),
            cmd: config.command.clone(),
            env: Some(env),
            working_dir: config.working_dir.clone(),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    fn convert_state(state: Option<&bollard::models::ContainerState>) -> ContainerState {
        let Some(state) = state else {
            return ContainerState {
                status: "unknown".to_string(),
                ..Default::default()
            };
        };

        ContainerState {
            status: state
                .status
                .as_ref()
                .map(|s| s.as_ref().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            running: state.running.unwrap_or(false),
            paused: state.paused.unwrap_or(false),
            restarting: state.restarting.unwrap_or(false),
            oom_killed: state.oom_killed.unwrap_or(false),
            dead: state.dead.unwrap_or(false),
            exit_code: state.exit_code,
            error: state.error.clone(),
            started_at: state.started_at.clone(),
            finished_at: state.finished_at.clone(),
        }
    }

    fn convert_event(message: bollard::models::EventMessage) -> ContainerEvent {
        let actor = message.actor.unwrap_or_default();
        let attributes: BTreeMap<String, String> = actor
            .attributes
            .unwrap_or_default()
            .into_iter()
            .filter(|(k, _)| EVENT_ATTRIBUTE_KEYS.contains(&k.as_str()))
            .collect();

        ContainerEvent {
            status: message.action.clone(),
            id: actor.id.clone(),
            time: message.time,
            event_type: message.typ.map(|t| t.to_string()),
            action: message.action,
            actor_id: actor.id,
            attributes,
        }
    }
}

/// Map a bollard error, keeping 404 as the tagged not-found kind
fn map_error(context: &str, error: BollardError) -> ProviderError {
    match error {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => ProviderError::NotFound(format!("{}: {}", context, message)),
        other => ProviderError::ContainerError(format!("{}: {}", context, other)),
    }
}

#[async_trait]
impl Provider for DockerProvider {
    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn build_image(&self, spec: &ImageBuildSpec) -> Result<()> {
        let context = create_tar_archive(&spec.context_dir).map_err(|e| {
            ProviderError::ImageError(format!(
                "Failed to archive build context {}: {}",
                spec.context_dir.display(),
                e
            ))
        })?;

        for (index, stage) in spec.stages.iter().enumerate() {
            info!(
                "Building image {} from {} ({}/{})",
                stage.tag,
                stage.dockerfile,
                index + 1,
                spec.stages.len()
            );

            let options = BuildImageOptions::<String> {
                dockerfile: stage.dockerfile.clone(),
                t: stage.tag.clone(),
                rm: true,
                forcerm: true,
                ..Default::default()
            };

            let mut stream =
                Box::pin(self.client.build_image(options, None, Some(context.clone().into())));

            while let Some(result) = stream.next().await {
                let build_info = result.map_err(|e| {
                    ProviderError::ImageError(format!("Failed to build {}: {}", stage.tag, e))
                })?;
                if let Some(error) = build_info.error {
                    return Err(ProviderError::ImageError(format!(
                        "Failed to build {}: {}",
                        stage.tag, error
                    )));
                }
                if let Some(line) = build_info.stream {
                    let line = line.trim_end();
                    if !line.is_empty() {
                        debug!("{}", line);
                    }
                }
            }

            info!("Built image: {}", stage.tag);
        }

        Ok(())
    }

    async fn run_container(&self, config: &ContainerConfig) -> Result<String> {
        info!("Creating container: {}", config.name);

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), Self::to_bollard_config(config))
            .await
            .map_err(|e| map_error("create container", e))?;

        debug!("Created container: {}", container.id);

        self.client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_error("start container", e))?;

        info!(
            "Container started with ID: {}",
            &container.id[..container.id.len().min(12)]
        );
        Ok(container.id)
    }

    async fn stop_container(&self, container: &str, timeout_secs: u64) -> Result<()> {
        info!("Stopping container: {} (timeout: {}s)", container, timeout_secs);

        let options = StopContainerOptions {
            t: timeout_secs as i64,
        };

        match self.client.stop_container(container, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Container {} already stopped", container);
                Ok(())
            }
            Err(e) => Err(map_error("stop container", e)),
        }
    }

    async fn remove_container(&self, container: &str, force: bool) -> Result<()> {
        info!("Removing container: {} (force: {})", container, force);

        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };

        self.client
            .remove_container(container, Some(options))
            .await
            .map_err(|e| map_error("remove container", e))
    }

    async fn inspect_container(&self, container: &str) -> Result<ContainerInspect> {
        let inspect = self
            .client
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error("inspect container", e))?;

        let raw = serde_json::to_value(&inspect)
            .map_err(|e| ProviderError::InternalError(e.to_string()))?;

        Ok(ContainerInspect {
            id: inspect.id.clone().unwrap_or_else(|| container.to_string()),
            name: inspect
                .name
                .clone()
                .unwrap_or_else(|| container.to_string())
                .trim_start_matches('/')
                .to_string(),
            state: Self::convert_state(inspect.state.as_ref()),
            raw,
        })
    }

    async fn exec_command(
        &self,
        container: &str,
        command: Vec<String>,
        user: Option<String>,
    ) -> Result<ExecResult> {
        debug!("Executing in container {}: {:?}", container, command);

        let exec_config = CreateExecOptions {
            cmd: Some(command),
            user,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container, exec_config)
            .await
            .map_err(|e| map_error("create exec", e))?;

        let start_result = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(LogOutput::Console { message }) => stdout.extend_from_slice(&message),
                        Ok(_) => {}
                        Err(e) => return Err(ProviderError::ExecError(e.to_string())),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(ProviderError::ExecError(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let exec_inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;

        Ok(ExecResult {
            exit_code: exec_inspect.exit_code.unwrap_or(0),
            stdout,
            stderr,
        })
    }

    async fn container_logs(&self, container: &str, tail: usize) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = Box::pin(self.client.logs(container, Some(options)));
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|e| map_error("container logs", e))? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message }
                | LogOutput::StdIn { message } => bytes.extend_from_slice(&message),
            }
        }

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn container_events(&self, query: &EventQuery) -> Result<Vec<ContainerEvent>> {
        let mut filters = HashMap::new();
        filters.insert("container".to_string(), query.containers.clone());

        let options = EventsOptions::<String> {
            since: Some(query.since.timestamp().to_string()),
            until: Some(query.until.timestamp().to_string()),
            filters,
        };

        let mut stream = Box::pin(self.client.events(Some(options))).take(query.limit);
        let mut events = Vec::new();
        while let Some(message) = stream.next().await {
            let message = message.map_err(|e| map_error("container events", e))?;
            events.push(Self::convert_event(message));
        }

        Ok(events)
    }
}

/// Tar up a build context directory for the image build endpoint
fn create_tar_archive(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    archive.follow_symlinks(false);
    archive.append_dir_all(".", path)?;
    archive.into_inner()
}
