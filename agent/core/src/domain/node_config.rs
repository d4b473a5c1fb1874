// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Node Agent Configuration Types
//
// Defines the configuration schema for the AEGIS node agent, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Reconciliation engine tuning (scan interval, event buffering)
// - Discovery probe settings per resource kind
// - Logging settings

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "NodeAgentConfig";
pub const CONFIG_PATH_ENV: &str = "AEGIS_AGENT_CONFIG_PATH";

/// Top-level Kubernetes-style node agent configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigManifest {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "NodeAgentConfig")
    pub kind: String,

    /// Agent metadata (name, labels)
    pub metadata: ManifestMetadata,

    /// Agent configuration specification
    #[serde(default)]
    pub spec: AgentConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable node name
    pub name: String,

    /// Optional: Labels for categorization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Agent configuration specification (content under spec:)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfigSpec {
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// How often pending attachments are probed while any are awaiting discovery
    #[serde(default = "default_scan_interval", with = "humantime_serde")]
    pub scan_interval: Duration,

    /// Capacity of the outbound event bus
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            scan_interval: default_scan_interval(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub block_volume: BlockVolumeProbeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockVolumeProbeConfig {
    /// Host utility that prints "identity: <volume id>" for a device path
    #[serde(default = "default_probe_command")]
    pub command: String,

    /// Upper bound on a single utility invocation
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Directory relative device names are resolved against
    #[serde(default = "default_device_root")]
    pub device_root: PathBuf,
}

impl Default for BlockVolumeProbeConfig {
    fn default() -> Self {
        Self {
            command: default_probe_command(),
            timeout: default_probe_timeout(),
            device_root: default_device_root(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_scan_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_event_buffer() -> usize {
    1000
}

fn default_probe_command() -> String {
    "ebsnvme-id".to_string()
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_device_root() -> PathBuf {
    PathBuf::from("/dev")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for AgentConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "aegis-node".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                labels: None,
            },
            spec: AgentConfigSpec::default(),
        }
    }
}

impl AgentConfigManifest {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Candidate locations in precedence order, excluding an explicit CLI path
    ///
    /// `AEGIS_AGENT_CONFIG_PATH`, `./aegis-agent.yaml`, `~/.aegis/agent.yaml`,
    /// `/etc/aegis/agent.yaml`.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(4);
        if let Ok(env_path) = std::env::var(CONFIG_PATH_ENV) {
            paths.push(PathBuf::from(env_path));
        }
        paths.push(PathBuf::from("./aegis-agent.yaml"));
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".aegis").join("agent.yaml"));
        }
        paths.push(PathBuf::from("/etc/aegis/agent.yaml"));
        paths
    }

    /// First existing file among `search_paths()`
    pub fn discover_config() -> Option<PathBuf> {
        Self::search_paths().into_iter().find(|path| path.is_file())
    }

    /// Load from `cli_path` if given (a missing file is an error), otherwise
    /// from the first discovered file, otherwise defaults. Environment
    /// overrides are applied last in every case.
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = match cli_path.or_else(Self::discover_config) {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading node agent configuration");
                Self::from_yaml_file(&path)?
            }
            None => {
                tracing::warn!("No node agent configuration file found, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// `AEGIS_AGENT_SCAN_INTERVAL_MS` and `AEGIS_AGENT_PROBE_TIMEOUT_MS`, in milliseconds
    pub fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_millis("AEGIS_AGENT_SCAN_INTERVAL_MS") {
            tracing::info!(scan_interval_ms = ms, "Scan interval overridden from environment");
            self.spec.reconciler.scan_interval = Duration::from_millis(ms);
        }

        if let Some(ms) = env_millis("AEGIS_AGENT_PROBE_TIMEOUT_MS") {
            tracing::info!(probe_timeout_ms = ms, "Probe timeout overridden from environment");
            self.spec.discovery.block_volume.timeout = Duration::from_millis(ms);
        }
    }

    /// Reject manifests the agent cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.reconciler.scan_interval.is_zero() {
            anyhow::bail!("spec.reconciler.scan_interval must be greater than zero");
        }

        if self.spec.reconciler.event_buffer == 0 {
            anyhow::bail!("spec.reconciler.event_buffer must be greater than zero");
        }

        let block_volume = &self.spec.discovery.block_volume;
        if block_volume.command.trim().is_empty() {
            anyhow::bail!("spec.discovery.block_volume.command cannot be empty");
        }

        if block_volume.timeout.is_zero() {
            anyhow::bail!("spec.discovery.block_volume.timeout must be greater than zero");
        }

        Ok(())
    }
}

fn env_millis(var: &str) -> Option<u64> {
    let val = std::env::var(var).ok()?;
    match val.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(ms),
        _ => {
            tracing::warn!(var, value = %val, "Ignoring override, expected positive milliseconds");
            None
        }
    }
}
