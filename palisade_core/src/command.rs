//! Subprocess command parsing and environment construction.
//!
//! Destination command lines are split with shell-style word rules but a
//! shell is never invoked. Subprocess environments are built from scratch:
//! a minimal allowlist inherited from the parent plus the per-destination
//! overlay from the secrets store, which wins on key collision.

use crate::config::DestinationTable;
use crate::error::{CoreError, Result};
use std::collections::HashMap;
use std::path::PathBuf;

/// Parent-process env keys passed through to subprocesses.
/// Intentionally minimal: secrets are supplied exclusively via the
/// per-destination overlay, never inherited from the parent environment.
pub const SAFE_ENV_KEYS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TMPDIR",
    "TEMP",
    "TMP",
    "TERM",
    "SHELL",
    "XDG_CACHE_HOME",
    "XDG_CONFIG_HOME",
    "XDG_DATA_HOME",
    "NPM_CONFIG_CACHE",
];

/// Split a destination command line into argv. The config layer has already
/// rejected shell metacharacters; this re-checks parseability.
pub fn split_command(name: &str, command: &str) -> Result<Vec<String>> {
    match shlex::split(command) {
        Some(argv) if !argv.is_empty() => Ok(argv),
        _ => Err(CoreError::Config(format!(
            "destination '{name}': command cannot be parsed"
        ))),
    }
}

/// Fail-fast check that every stdio destination's executable exists on PATH.
/// Non-stdio destinations are skipped. Fails on the first bad entry.
pub fn validate_stdio_commands(table: &DestinationTable) -> Result<()> {
    for dest in table.stdio_destinations() {
        let command = dest.command.as_deref().ok_or_else(|| {
            CoreError::Config(format!(
                "stdio destination '{}' has no command configured",
                dest.name
            ))
        })?;
        let argv = split_command(&dest.name, command)?;
        resolve_executable(&dest.name, &argv[0])?;
    }
    Ok(())
}

/// Resolve an executable on PATH (or as a direct path).
pub fn resolve_executable(name: &str, executable: &str) -> Result<PathBuf> {
    which::which(executable).map_err(|_| {
        CoreError::Config(format!(
            "stdio destination '{name}': command executable '{executable}' not found on PATH"
        ))
    })
}

/// Build a scrubbed subprocess environment: allowlisted parent keys overlaid
/// with `extra_env`. The overlay wins on collision.
pub fn subprocess_env(extra_env: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars()
        .filter(|(key, _)| SAFE_ENV_KEYS.contains(&key.as_str()))
        .collect();
    env.extend(extra_env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}
