/// Static startup configuration
use crate::admission::AdmissionConfig;
use crate::cgroup::BackendKind;
use crate::limits::{CommandProfile, ResourceLimitTable};
use crate::namespace::NSENTER_PATH;
use crate::types::{JailError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a ttyjail host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JailConfig {
    /// Maximum concurrent sessions, 0 for unlimited
    pub max_connections: u64,
    /// Maximum aggregate weight. Unset means the same value as
    /// `max_connections`, the unit both ceilings share.
    pub max_weight: Option<u64>,
    /// Serve a single session, then shut down
    pub once: bool,
    /// Seconds without activity before a session is cancelled, 0 to disable
    pub idle_timeout_secs: u64,
    pub cgroup: BackendKind,
    /// Mount point of the cgroup hierarchy, if not the default
    pub cgroup_root: Option<PathBuf>,
    /// Refuse to start without a usable cgroup hierarchy
    pub strict: bool,
    /// Spawn sessions into fresh namespaces
    pub isolation: bool,
    /// nsenter used by the loopback helper
    pub nsenter_path: String,
    /// Command run inside a fresh network namespace to bring loopback up
    pub loopback_command: Vec<String>,
    /// Profile for commands missing from the table
    pub default_profile: Option<CommandProfile>,
    /// Per-command overrides merged over the built-in table
    pub commands: BTreeMap<String, CommandProfile>,
}

impl Default for JailConfig {
    fn default() -> Self {
        Self {
            max_connections: 0,
            max_weight: None,
            once: false,
            idle_timeout_secs: 0,
            cgroup: BackendKind::Auto,
            cgroup_root: None,
            strict: false,
            isolation: true,
            nsenter_path: NSENTER_PATH.to_string(),
            loopback_command: ["ip", "link", "set", "lo", "up"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_profile: None,
            commands: BTreeMap::new(),
        }
    }
}

impl JailConfig {
    /// Load from a JSON file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            JailError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nsenter_path.trim().is_empty() {
            return Err(JailError::Config("nsenter_path must not be empty".to_string()));
        }
        if self.loopback_command.is_empty() {
            return Err(JailError::Config(
                "loopback_command must not be empty".to_string(),
            ));
        }
        if let Some(profile) = &self.default_profile {
            profile.validate("<default>")?;
        }
        for (command, profile) in &self.commands {
            profile.validate(command)?;
        }
        Ok(())
    }

    /// Built-in table with this configuration's overrides applied
    pub fn limits_table(&self) -> Result<ResourceLimitTable> {
        ResourceLimitTable::with_overrides(self.default_profile.clone(), &self.commands)
    }

    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            max_connections: self.max_connections,
            max_weight: self.max_weight.unwrap_or(self.max_connections),
            once: self.once,
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}
