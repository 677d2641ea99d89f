//! Configuration loading and merging.
//!
//! The embedded default table ships inside the binary; a user file at the
//! platform config directory (`~/.config/kportforward/config.yaml` on Unix,
//! `%APPDATA%\kportforward\config.yaml` on Windows) overrides or extends it
//! by service name. Scalar options override when non-zero/non-empty.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub port_forwards: HashMap<String, ServiceSpec>,

    /// Seconds between monitoring sweeps. Zero means "not set" in a user
    /// file and falls back to the embedded default.
    #[serde(default)]
    pub monitoring_interval: u64,

    #[serde(default)]
    pub ui_options: UiOptions,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServiceSpec {
    /// Cluster-side object reference, passed verbatim to kubectl
    /// (e.g. `service/user-api` or `deployment/worker`).
    pub target: String,
    pub target_port: u16,
    pub local_port: u16,
    pub namespace: String,
    #[serde(rename = "type")]
    pub kind: ServiceKind,

    // Consumed only by the Swagger UI handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swagger_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_path: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Web,
    Rest,
    Rpc,
    Other,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UiOptions {
    /// Milliseconds between dashboard redraws.
    #[serde(default)]
    pub refresh_rate: u64,
    #[serde(default)]
    pub theme: String,
}

impl Config {
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval.max(1))
    }

    pub fn refresh_rate(&self) -> Duration {
        Duration::from_millis(self.ui_options.refresh_rate.max(100))
    }

    /// Rejects entries the supervisor cannot act on. Schema errors are
    /// fatal at startup, never papered over at runtime.
    pub fn validate(&self) -> Result<()> {
        for (name, spec) in &self.port_forwards {
            if spec.target.is_empty() {
                anyhow::bail!("service '{}': target must not be empty", name);
            }
            if spec.namespace.is_empty() {
                anyhow::bail!("service '{}': namespace must not be empty", name);
            }
            if spec.local_port == 0 {
                anyhow::bail!("service '{}': localPort must be in 1..=65535", name);
            }
            if spec.target_port == 0 {
                anyhow::bail!("service '{}': targetPort must be in 1..=65535", name);
            }
        }
        Ok(())
    }
}

/// Loads the embedded defaults, then merges the user config on top if one
/// exists. A malformed user file is a hard error rather than a silent
/// fallback to defaults.
pub fn load() -> Result<Config> {
    load_from(user_config_path().as_deref())
}

fn load_from(user_path: Option<&std::path::Path>) -> Result<Config> {
    let defaults: Config =
        serde_yaml::from_str(DEFAULT_CONFIG_YAML).context("embedded default config is invalid")?;

    let merged = match user_path {
        Some(path) if path.is_file() => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let user: Config = serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            merge(defaults, user)
        }
        _ => defaults,
    };

    merged.validate()?;
    Ok(merged)
}

pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("kportforward").join("config.yaml"))
}

/// User services override or extend defaults by name; scalar options
/// override only when set to something other than their zero value.
fn merge(mut base: Config, user: Config) -> Config {
    for (name, spec) in user.port_forwards {
        base.port_forwards.insert(name, spec);
    }
    if user.monitoring_interval != 0 {
        base.monitoring_interval = user.monitoring_interval;
    }
    if user.ui_options.refresh_rate != 0 {
        base.ui_options.refresh_rate = user.ui_options.refresh_rate;
    }
    if !user.ui_options.theme.is_empty() {
        base.ui_options.theme = user.ui_options.theme;
    }
    base
}
