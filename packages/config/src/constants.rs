// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names read by the potato sandbox

// Workspace Layout
pub const POTATO_WORKSPACE_DIR: &str = "POTATO_WORKSPACE_DIR";
pub const POTATO_CONTAINER_WORKSPACE: &str = "POTATO_CONTAINER_WORKSPACE";
pub const POTATO_ENV_FILE: &str = "POTATO_ENV_FILE";

// Image & Container Identity
pub const POTATO_IMAGE_NAME: &str = "POTATO_IMAGE_NAME";
pub const POTATO_CONTAINER_NAME: &str = "POTATO_CONTAINER_NAME";
pub const POTATO_BUILD_CONTEXT: &str = "POTATO_BUILD_CONTEXT";
pub const POTATO_EXEC_USER: &str = "POTATO_EXEC_USER";

// Resource Limits
pub const POTATO_MEMORY_LIMIT_MB: &str = "POTATO_MEMORY_LIMIT_MB";
pub const POTATO_CPU_CORES: &str = "POTATO_CPU_CORES";
pub const POTATO_STOP_TIMEOUT_SECS: &str = "POTATO_STOP_TIMEOUT_SECS";

// Supervision & Diagnostics
pub const POTATO_WATCHDOG_INTERVAL_SECS: &str = "POTATO_WATCHDOG_INTERVAL_SECS";
pub const POTATO_LOG_TAIL_LINES: &str = "POTATO_LOG_TAIL_LINES";
pub const POTATO_EVENTS_WINDOW_MINUTES: &str = "POTATO_EVENTS_WINDOW_MINUTES";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
