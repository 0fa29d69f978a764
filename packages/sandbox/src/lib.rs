// ABOUTME: Supervision of a single long-lived sandbox container over a shared workspace
// ABOUTME: Script execution, detached task tracking, post-mortem diagnostics and restart

pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod providers;
pub mod script;
pub mod settings;
pub mod supervisor;
pub mod tasks;
pub mod watchdog;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use diagnostics::{DiagnosticsBundle, DiagnosticsCollector, DiagnosticsOptions};
pub use error::{Result, SandboxError};
pub use executor::{CommandExecutor, ExecOutcome};
pub use pipeline::{
    FileContent, PipelineOptions, PipelineOutcome, PipelineRunner, PipelineStep, StepResult,
};
pub use providers::{DockerProvider, LocalProvider, Provider, ProviderError};
pub use script::{KillResult, TaskSignal};
pub use settings::{SandboxSettings, SettingsError};
pub use supervisor::{ContainerHandle, ContainerSupervisor, ReadyState};
pub use tasks::{KillOutcome, TaskHandle, TaskStatus, TaskTracker};
pub use watchdog::{Watchdog, WatchdogCheck};
pub use workspace::{WorkspaceStore, WriteOptions};
