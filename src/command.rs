/// Argument vectors for session processes: plain invocations, compile-and-run
/// invocations, and either of them wrapped in a namespace join
use crate::limits::ResourceLimitTable;
use crate::namespace::{join_prefix, join_prefix_len, join_target};
use crate::types::{JailError, Result};
use log::debug;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Interpreter that drives compile-and-run workloads
pub const BASH_PATH: &str = "/bin/bash";

/// What the builder needs to know about a session's workload
pub trait WorkloadParams {
    /// Whether the session compiles submitted source before running it
    fn is_compiled(&self) -> bool;

    /// Wrapper that must precede a plain invocation of `command`
    fn prefix(&self, command: &str) -> Option<&str>;

    /// Compile-then-run script for `command`
    fn compilation_script(&self, command: &str) -> Option<&str>;

    /// Submitted source text
    fn source_content(&self) -> &str;

    /// File the source was persisted to, when the compiler reads a file
    fn source_file_name(&self) -> Option<&str> {
        None
    }

    fn compiler_flags(&self) -> Option<&str> {
        None
    }
}

/// Parameters of one session request, backed by the resource table for the
/// per-command prefix and compilation script
#[derive(Clone, Debug)]
pub struct SessionParams {
    pub compiled: bool,
    pub source: String,
    pub source_file: Option<String>,
    pub compiler_flags: Option<String>,
    table: Arc<ResourceLimitTable>,
}

impl SessionParams {
    /// Plain, non-compiled parameters
    pub fn new(table: Arc<ResourceLimitTable>) -> Self {
        Self {
            compiled: false,
            source: String::new(),
            source_file: None,
            compiler_flags: None,
            table,
        }
    }

    /// Compile-and-run parameters for `source`
    pub fn compile(table: Arc<ResourceLimitTable>, source: impl Into<String>) -> Self {
        Self {
            compiled: true,
            source: source.into(),
            ..Self::new(table)
        }
    }

    pub fn with_source_file(mut self, name: impl Into<String>) -> Self {
        self.source_file = Some(name.into());
        self
    }

    pub fn with_compiler_flags(mut self, flags: impl Into<String>) -> Self {
        self.compiler_flags = Some(flags.into());
        self
    }

    /// Parse query-style parameters (`compiled`, `source`, `source_file`,
    /// `compiler_flags`). The last value of a repeated key wins.
    pub fn from_query(query: &HashMap<String, Vec<String>>, table: Arc<ResourceLimitTable>) -> Self {
        let value = |key: &str| {
            query
                .get(key)
                .and_then(|values| values.last())
                .map(|v| v.trim().to_string())
        };

        let compiled = matches!(
            value("compiled").as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("1" | "true" | "yes" | "on")
        );

        Self {
            compiled,
            source: query
                .get("source")
                .and_then(|values| values.last())
                .cloned()
                .unwrap_or_default(),
            source_file: value("source_file").filter(|v| !v.is_empty()),
            compiler_flags: value("compiler_flags").filter(|v| !v.is_empty()),
            table,
        }
    }

    pub fn table(&self) -> &ResourceLimitTable {
        &self.table
    }
}

impl WorkloadParams for SessionParams {
    fn is_compiled(&self) -> bool {
        self.compiled
    }

    fn prefix(&self, command: &str) -> Option<&str> {
        self.table.prefix(command)
    }

    fn compilation_script(&self, command: &str) -> Option<&str> {
        self.table.compilation_script(command)
    }

    fn source_content(&self) -> &str {
        &self.source
    }

    fn source_file_name(&self) -> Option<&str> {
        self.source_file.as_deref()
    }

    fn compiler_flags(&self) -> Option<&str> {
        self.compiler_flags.as_deref()
    }
}

/// Absolute path of `command` on the search path, or `command` itself when
/// it cannot be resolved (spawn reports the failure later).
pub fn resolve_executable(command: &str) -> String {
    match which::which(command) {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(_) => command.to_string(),
    }
}

/// Build the literal argument vector for a session process.
///
/// With `parent` set, the vector starts with an nsenter invocation that
/// joins the namespaces of that process, followed unchanged by the inner
/// vector. Only executable lookup touches the filesystem.
pub fn build_command_args<P: WorkloadParams + ?Sized>(
    command: &str,
    argv: &[String],
    parent: Option<Pid>,
    params: &P,
) -> Vec<String> {
    let mut inner = Vec::with_capacity(argv.len() + 4);

    if params.is_compiled() {
        inner.push(BASH_PATH.to_string());
        inner.extend(argv.iter().cloned());
        inner.push("-c".to_string());
        inner.push(params.compilation_script(command).unwrap_or_default().to_string());
        match params.source_file_name() {
            Some(file) => {
                inner.push(file.to_string());
                if let Some(flags) = params.compiler_flags().filter(|f| !f.is_empty()) {
                    inner.push(flags.to_string());
                }
            }
            None => inner.push(params.source_content().to_string()),
        }
    } else {
        if let Some(prefix) = params.prefix(command).filter(|p| !p.is_empty()) {
            inner.push(prefix.to_string());
        }
        inner.push(resolve_executable(command));
        inner.extend(argv.iter().cloned());
    }

    let args = match parent {
        None => inner,
        Some(pid) => {
            let mut args = join_prefix(pid);
            args.extend(inner);
            args
        }
    };
    debug!("command args: {:?}", args);
    args
}

/// The compile trailer recovered from a built argument vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileInvocation {
    pub join_target: Option<Pid>,
    pub script: String,
    pub source: String,
    pub compiler_flags: Option<String>,
}

impl CompileInvocation {
    /// Recover script and source from a vector produced by
    /// [`build_command_args`] for a compile workload
    pub fn parse(args: &[String]) -> Option<Self> {
        let join_target = join_target(args);
        let inner = match join_target {
            Some(_) => args.get(join_prefix_len()..)?,
            None => args,
        };

        if inner.first().map(String::as_str) != Some(BASH_PATH) {
            return None;
        }

        let len = inner.len();
        let trailer_at = |width: usize| {
            len.checked_sub(width)
                .filter(|&idx| idx >= 1 && inner[idx] == "-c")
        };

        if let Some(idx) = trailer_at(3) {
            return Some(Self {
                join_target,
                script: inner[idx + 1].clone(),
                source: inner[idx + 2].clone(),
                compiler_flags: None,
            });
        }
        trailer_at(4).map(|idx| Self {
            join_target,
            script: inner[idx + 1].clone(),
            source: inner[idx + 2].clone(),
            compiler_flags: Some(inner[idx + 3].clone()),
        })
    }
}

/// Write submitted source to `dir/file_name` atomically and return its path
pub fn persist_source(dir: &Path, file_name: &str, content: &str) -> Result<PathBuf> {
    let mut components = Path::new(file_name).components();
    let plain = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !plain {
        return Err(JailError::Config(format!(
            "source file name '{}' must be a plain file name",
            file_name
        )));
    }

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(content.as_bytes())?;
    file.flush()?;

    let target = dir.join(file_name);
    file.persist(&target).map_err(|e| JailError::Io(e.error))?;
    Ok(target)
}
