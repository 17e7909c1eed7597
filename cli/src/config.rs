//! Environment configuration.
//!
//! All configuration comes from `KUBEXIT_*` environment variables; the
//! command line carries only the child command. [`from_env`] resolves
//! the variables into an [`engine::Config`].

use crate::error::{CliError, Result};
use kubexit_core::engine::Config;
use std::path::{Component, PathBuf};
use std::time::Duration;

/// Graveyard used when `KUBEXIT_GRAVEYARD` is unset.
pub const DEFAULT_GRAVEYARD: &str = "/graveyard";

const DEFAULT_BIRTH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Resolve the engine configuration from the process environment.
pub fn from_env() -> Result<Config> {
    from_vars(|key| std::env::var(key).ok())
}

/// Resolve the engine configuration from an arbitrary variable lookup.
pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let name = lookup(&get, "KUBEXIT_NAME").ok_or(CliError::MissingEnv("KUBEXIT_NAME"))?;

    let graveyard = match lookup(&get, "KUBEXIT_GRAVEYARD") {
        None => PathBuf::from(DEFAULT_GRAVEYARD),
        Some(raw) => normalize_graveyard(&raw),
    };

    let birth_deps = split_deps(lookup(&get, "KUBEXIT_BIRTH_DEPS"));
    let death_deps = split_deps(lookup(&get, "KUBEXIT_DEATH_DEPS"));
    if let Some(shared) = birth_deps.iter().find(|dep| death_deps.contains(dep)) {
        return Err(CliError::Invalid {
            key: "KUBEXIT_DEATH_DEPS",
            message: format!("{shared} is both a birth dep and a death dep"),
        });
    }

    let birth_timeout = parse_duration(&get, "KUBEXIT_BIRTH_TIMEOUT", DEFAULT_BIRTH_TIMEOUT)?;
    let grace_period = parse_duration(&get, "KUBEXIT_GRACE_PERIOD", DEFAULT_GRACE_PERIOD)?;

    let pod_name = lookup(&get, "KUBEXIT_POD_NAME");
    if pod_name.is_none() && !birth_deps.is_empty() {
        return Err(CliError::MissingEnv("KUBEXIT_POD_NAME"));
    }
    let namespace = lookup(&get, "KUBEXIT_NAMESPACE");
    if namespace.is_none() && !birth_deps.is_empty() {
        return Err(CliError::MissingEnv("KUBEXIT_NAMESPACE"));
    }

    let verbose_level = match lookup(&get, "KUBEXIT_VERBOSE_LEVEL") {
        None => 0,
        Some(raw) => raw.parse::<u32>().map_err(|err| CliError::Invalid {
            key: "KUBEXIT_VERBOSE_LEVEL",
            message: format!("{raw}: {err}"),
        })?,
    };

    let instant_logging = match lookup(&get, "KUBEXIT_INSTANT_LOGGING") {
        None => false,
        Some(raw) => parse_bool(&raw).ok_or_else(|| CliError::Invalid {
            key: "KUBEXIT_INSTANT_LOGGING",
            message: format!("not a boolean literal: {raw}"),
        })?,
    };

    Ok(Config {
        name,
        graveyard,
        birth_deps,
        death_deps,
        birth_timeout,
        grace_period,
        pod_name,
        namespace,
        verbose_level,
        instant_logging,
    })
}

/// An unset variable and an empty one are equivalent.
fn lookup(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    get(key).filter(|value| !value.is_empty())
}

fn split_deps(raw: Option<String>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .filter(|dep| !dep.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn parse_duration(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration> {
    match lookup(get, key) {
        None => Ok(default),
        Some(raw) => humantime::parse_duration(&raw).map_err(|err| CliError::Invalid {
            key,
            message: format!("{raw}: {err}"),
        }),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    }
}

/// Strip trailing slashes and lexically clean the path.
fn normalize_graveyard(raw: &str) -> PathBuf {
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() {
        return PathBuf::from("/");
    }
    PathBuf::from(trimmed)
        .components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect()
}
