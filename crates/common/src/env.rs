//! Config file path and environment overlay resolution
//!
//! Precedence everywhere in the workspace: CLI arg > env var > file > default.

use std::path::PathBuf;

/// Resolve a config file path from a CLI value, then `env_var`, then `default`.
pub fn resolve_config_path(cli_path: Option<&str>, env_var: &str, default: &str) -> PathBuf {
    if let Some(p) = cli_path {
        return PathBuf::from(p);
    }
    if let Ok(p) = std::env::var(env_var)
        && !p.trim().is_empty()
    {
        return PathBuf::from(p);
    }
    PathBuf::from(default)
}

/// Return the trimmed value of `env_var` when it is set and non-empty.
pub fn env_override(env_var: &str) -> Option<String> {
    std::env::var(env_var)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}
