/// Static per-command resource table: memory ceilings, admission weights and
/// the wrappers used to launch each command
use crate::types::{JailError, Result, MB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resource profile of one logical command
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandProfile {
    /// Per-process memory ceiling in MB (sub-scope base ceiling)
    pub memory_mb: u64,
    /// Aggregate ceiling in MB for every process of this command
    pub container_memory_mb: u64,
    /// Estimated cost charged against the admission weight ceiling
    pub weight: u64,
    /// Wrapper script prepended to plain invocations
    pub prefix: Option<String>,
    /// Script that compiles and then runs submitted source
    pub compilation_script: Option<String>,
}

impl Default for CommandProfile {
    fn default() -> Self {
        Self {
            memory_mb: 128,
            container_memory_mb: 1024,
            weight: 1,
            prefix: None,
            compilation_script: None,
        }
    }
}

impl CommandProfile {
    fn interpreter(memory_mb: u64, weight: u64) -> Self {
        Self {
            memory_mb,
            container_memory_mb: memory_mb * 8,
            weight,
            ..Default::default()
        }
    }

    fn compiler(memory_mb: u64, weight: u64, script: &str) -> Self {
        Self {
            memory_mb,
            container_memory_mb: memory_mb * 8,
            weight,
            prefix: None,
            compilation_script: Some(script.to_string()),
        }
    }

    pub fn validate(&self, command: &str) -> Result<()> {
        if self.memory_mb == 0 {
            return Err(JailError::Config(format!(
                "memory_mb for '{}' must be greater than 0",
                command
            )));
        }
        if self.container_memory_mb == 0 {
            return Err(JailError::Config(format!(
                "container_memory_mb for '{}' must be greater than 0",
                command
            )));
        }
        Ok(())
    }
}

/// Read-only mapping from command name to its resource profile.
///
/// Unknown commands resolve to the fallback profile, so a lookup never
/// yields a zero ceiling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimitTable {
    fallback: CommandProfile,
    commands: BTreeMap<String, CommandProfile>,
}

impl Default for ResourceLimitTable {
    fn default() -> Self {
        let mut commands = BTreeMap::new();
        commands.insert("bash".to_string(), CommandProfile::interpreter(100, 1));
        commands.insert("sh".to_string(), CommandProfile::interpreter(64, 1));
        commands.insert("python".to_string(), CommandProfile::interpreter(200, 2));
        commands.insert("python3".to_string(), CommandProfile::interpreter(200, 2));
        commands.insert("node".to_string(), CommandProfile::interpreter(300, 3));
        commands.insert("ruby".to_string(), CommandProfile::interpreter(200, 2));
        commands.insert(
            "gcc".to_string(),
            CommandProfile::compiler(256, 3, "/usr/local/lib/ttyjail/compile-c.sh"),
        );
        commands.insert(
            "g++".to_string(),
            CommandProfile::compiler(384, 4, "/usr/local/lib/ttyjail/compile-cpp.sh"),
        );
        commands.insert(
            "rustc".to_string(),
            CommandProfile::compiler(512, 5, "/usr/local/lib/ttyjail/compile-rust.sh"),
        );
        commands.insert(
            "java".to_string(),
            CommandProfile::compiler(512, 5, "/usr/local/lib/ttyjail/compile-java.sh"),
        );
        commands.insert(
            "go".to_string(),
            CommandProfile::compiler(384, 4, "/usr/local/lib/ttyjail/compile-go.sh"),
        );

        Self {
            fallback: CommandProfile::default(),
            commands,
        }
    }
}

impl ResourceLimitTable {
    /// Build a table from an explicit set of profiles
    pub fn new(fallback: CommandProfile, commands: BTreeMap<String, CommandProfile>) -> Self {
        Self { fallback, commands }
    }

    /// Built-in table with `overrides` merged over it
    pub fn with_overrides(
        fallback: Option<CommandProfile>,
        overrides: &BTreeMap<String, CommandProfile>,
    ) -> Result<Self> {
        let mut table = Self::default();
        if let Some(fallback) = fallback {
            fallback.validate("<default>")?;
            table.fallback = fallback;
        }
        for (command, profile) in overrides {
            profile.validate(command)?;
            table.commands.insert(command.clone(), profile.clone());
        }
        Ok(table)
    }

    pub fn profile(&self, command: &str) -> &CommandProfile {
        self.commands.get(command).unwrap_or(&self.fallback)
    }

    pub fn contains(&self, command: &str) -> bool {
        self.commands.contains_key(command)
    }

    /// Per-process ceiling in bytes
    pub fn memory_limit_bytes(&self, command: &str) -> u64 {
        self.profile(command).memory_mb.saturating_mul(MB)
    }

    /// Top-level ceiling in bytes for the command's container
    pub fn container_limit_bytes(&self, command: &str) -> u64 {
        self.profile(command).container_memory_mb.saturating_mul(MB)
    }

    pub fn weight(&self, command: &str) -> u64 {
        self.profile(command).weight
    }

    pub fn prefix(&self, command: &str) -> Option<&str> {
        self.profile(command).prefix.as_deref()
    }

    pub fn compilation_script(&self, command: &str) -> Option<&str> {
        self.profile(command).compilation_script.as_deref()
    }

    pub fn commands(&self) -> impl Iterator<Item = (&String, &CommandProfile)> {
        self.commands.iter()
    }

    pub fn fallback(&self) -> &CommandProfile {
        &self.fallback
    }
}
