// ABOUTME: Configuration primitives shared by the potato sandbox crates
// ABOUTME: Exposes env var names, env parsing helpers and the .env file loader

pub mod constants;
pub mod env;
pub mod env_file;

pub use env_file::{is_valid_name, load, EnvFileError, EnvVarSet};
