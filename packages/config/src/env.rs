// ABOUTME: Environment variable parsing utilities
// ABOUTME: Typed lookups with defaults and validation for sandbox settings

use std::str::FromStr;

/// Parse an environment variable, falling back to `default` when unset or unparseable
pub fn parse_env_or_default<T>(var_name: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(var_name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Parse an environment variable and keep it only if `validator` accepts it.
///
/// A variable that is set but unparseable or rejected logs a warning and
/// yields `default`. An unset variable yields `default` silently.
pub fn parse_env_or_default_with_validation<T, F>(var_name: &str, default: T, validator: F) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    F: Fn(T) -> bool,
{
    let Ok(raw_value) = std::env::var(var_name) else {
        return default;
    };

    match raw_value.trim().parse::<T>() {
        Ok(parsed) if validator(parsed) => parsed,
        Ok(_) => {
            tracing::warn!(
                "Environment variable {} has invalid value '{}', using default: {}",
                var_name,
                raw_value,
                default
            );
            default
        }
        Err(_) => {
            tracing::warn!(
                "Environment variable {} has unparseable value '{}', using default: {}",
                var_name,
                raw_value,
                default
            );
            default
        }
    }
}

/// Read a string variable; unset or blank values yield `default`
pub fn env_string_or_default(var_name: &str, default: &str) -> String {
    match std::env::var(var_name) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

/// Read an optional string variable. Set-but-blank is treated as an explicit "none".
pub fn env_optional_string(var_name: &str, default: Option<&str>) -> Option<String> {
    match std::env::var(var_name) {
        Ok(value) if value.trim().is_empty() => None,
        Ok(value) => Some(value.trim().to_string()),
        Err(_) => default.map(str::to_string),
    }
}
