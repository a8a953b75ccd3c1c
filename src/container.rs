/// Per-command containers: one top-level control scope per logical command
/// and one memory-limited sub-scope per running process
use crate::cgroup::{CgroupBackend, ControlScope};
use crate::limits::ResourceLimitTable;
use crate::namespace::NamespaceTemplate;
use crate::types::{JailError, Result};
use log::{error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Leaf under the top-level scope for processes without a sub-scope
pub const SHARED_SCOPE: &str = "shared";

const KILL_ATTEMPTS: usize = 50;
const KILL_INTERVAL: Duration = Duration::from_millis(10);

/// Effective sub-scope ceiling. Compile workloads keep the compiler and the
/// artifact resident together, so they get twice the base.
pub fn effective_memory_limit(base: u64, is_compile_workload: bool) -> u64 {
    if is_compile_workload {
        base.saturating_mul(2)
    } else {
        base
    }
}

/// Hierarchy path of the top-level scope for `name`
pub fn container_path(name: &str) -> PathBuf {
    PathBuf::from(format!("{}_container", name))
}

struct ContainerState {
    control: Box<dyn ControlScope>,
    shared: Option<Box<dyn ControlScope>>,
    sub_scopes: HashMap<Pid, Box<dyn ControlScope>>,
}

/// Confinement for every process spawned for one logical command
pub struct Container {
    name: String,
    path: PathBuf,
    memory_limit: u64,
    sub_scope_limit: u64,
    namespace_template: NamespaceTemplate,
    backend: Arc<dyn CgroupBackend>,
    state: Mutex<ContainerState>,
}

impl Container {
    /// Create the container for `name` with a top-level ceiling of
    /// `memory_limit` bytes.
    ///
    /// A scope left at the same path by an earlier run is deleted first and
    /// never reused.
    pub fn new(
        name: &str,
        memory_limit: u64,
        backend: Arc<dyn CgroupBackend>,
        limits: &ResourceLimitTable,
    ) -> Result<Self> {
        Self::with_template(
            name,
            memory_limit,
            backend,
            limits,
            NamespaceTemplate::for_current_user(),
        )
    }

    pub fn with_template(
        name: &str,
        memory_limit: u64,
        backend: Arc<dyn CgroupBackend>,
        limits: &ResourceLimitTable,
        namespace_template: NamespaceTemplate,
    ) -> Result<Self> {
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(JailError::Config(format!(
                "invalid container name '{}'",
                name
            )));
        }
        let path = container_path(name);

        if let Ok(stale) = backend.load(&path) {
            info!("cgroup already exists, deleting: {}", path.display());
            if let Err(e) = stale.delete() {
                warn!("Failed to delete stale cgroup {}: {}", path.display(), e);
            }
        }

        let control = backend
            .create(&path, memory_limit)
            .map_err(|source| JailError::ContainerCreation {
                name: name.to_string(),
                source,
            })?;

        info!("New container created for: {}", name);
        Ok(Self {
            name: name.to_string(),
            path,
            memory_limit,
            sub_scope_limit: limits.memory_limit_bytes(name),
            namespace_template,
            backend,
            state: Mutex::new(ContainerState {
                control,
                shared: None,
                sub_scopes: HashMap::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn namespace_template(&self) -> &NamespaceTemplate {
        &self.namespace_template
    }

    /// Base per-process ceiling in bytes, before compile doubling
    pub fn sub_scope_limit(&self) -> u64 {
        self.sub_scope_limit
    }

    fn lock(&self) -> MutexGuard<'_, ContainerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach `pid` under the top-level ceiling without a sub-scope of its own.
    ///
    /// Backends that only accept processes in leaf scopes get a shared leaf
    /// carrying the container's ceiling; elsewhere the pid joins the
    /// top-level scope directly.
    pub fn add_process(&self, pid: Pid) {
        let mut state = self.lock();
        if self.backend.requires_leaf_attach() && state.shared.is_none() {
            let path = self.path.join(SHARED_SCOPE);
            match self.backend.create(&path, self.memory_limit) {
                Ok(scope) => state.shared = Some(scope),
                Err(e) => warn!(
                    "Unable to create shared cgroup {}: {}",
                    path.display(),
                    e
                ),
            }
        }

        let target = state.shared.as_ref().unwrap_or(&state.control);
        if let Err(e) = target.attach_process(pid) {
            error!(
                "Error while adding process {} to cgroup {}: {}",
                pid, self.name, e
            );
        }
    }

    /// Confine a freshly created `pid`: its own sub-scope when possible, the
    /// container ceiling otherwise. Returns whether a sub-scope is tracked.
    pub fn place_process(&self, pid: Pid, is_compile_workload: bool) -> bool {
        if self.add_process_to_new_sub_scope(pid, is_compile_workload) {
            return true;
        }
        self.add_process(pid);
        false
    }

    /// Place `pid` in its own memory-limited sub-scope.
    ///
    /// Returns whether the process ended up tracked. Failures are logged and
    /// leave the process under the top-level ceiling only; a scope created
    /// for a process that cannot be attached is removed again before
    /// returning.
    pub fn add_process_to_new_sub_scope(&self, pid: Pid, is_compile_workload: bool) -> bool {
        let mut state = self.lock();
        let limit = effective_memory_limit(self.sub_scope_limit, is_compile_workload);
        let path = self.path.join(pid.to_string());

        // phase one: create
        let scope = match self.backend.create(&path, limit) {
            Ok(scope) => scope,
            Err(e) => {
                warn!(
                    "Unable to create sub cgroup for {} pid {}: {}",
                    self.name, pid, e
                );
                return false;
            }
        };

        // phase two: attach, undoing the create on failure
        if let Err(e) = scope.attach_process(pid) {
            warn!(
                "Unable to add process to sub cgroup for {} pid {}: {}",
                self.name, pid, e
            );
            if let Err(e) = scope.delete() {
                error!(
                    "Unable to delete orphan sub cgroup {}: {}",
                    path.display(),
                    e
                );
            }
            return false;
        }

        info!(
            "Sub cgroup created for {} pid {} with memory limit {}",
            self.name, pid, limit
        );
        state.sub_scopes.insert(pid, scope);
        true
    }

    /// Remove the sub-scope of `pid`. Untracked pids are ignored, so exit
    /// paths racing with explicit cleanup are safe.
    pub fn delete_process_from_sub_scope(&self, pid: Pid) {
        let mut state = self.lock();
        if let Some(scope) = state.sub_scopes.remove(&pid) {
            if let Err(e) = scope.delete() {
                error!(
                    "Unable to delete cgroup for {} pid {}: {}",
                    self.name, pid, e
                );
            }
            info!("Sub cgroup deleted for {} pid {}", self.name, pid);
        }
    }

    /// SIGKILL everything left in the sub-scope of `pid` except `pid` itself,
    /// until the scope is empty or the attempts run out. Catches descendants
    /// that left the session's process group.
    pub fn kill_sub_scope_processes(&self, pid: Pid) {
        for _ in 0..KILL_ATTEMPTS {
            let members = match self.lock().sub_scopes.get(&pid).map(|s| s.processes()) {
                None => return,
                Some(Ok(members)) => members,
                Some(Err(e)) => {
                    warn!("Unable to list sub cgroup of {} pid {}: {}", self.name, pid, e);
                    return;
                }
            };

            let stragglers: Vec<Pid> = members.into_iter().filter(|m| *m != pid).collect();
            if stragglers.is_empty() {
                return;
            }
            for member in stragglers {
                match signal::kill(member, Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => warn!("Failed to kill {} in sub cgroup of {}: {}", member, pid, e),
                }
            }
            thread::sleep(KILL_INTERVAL);
        }
        warn!(
            "Processes still running in sub cgroup for {} pid {}",
            self.name, pid
        );
    }

    pub fn is_process(&self, pid: Pid) -> bool {
        self.lock().sub_scopes.contains_key(&pid)
    }

    /// Pids currently holding a sub-scope
    pub fn tracked_processes(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.lock().sub_scopes.keys().copied().collect();
        pids.sort_by_key(|pid| pid.as_raw());
        pids
    }

    /// Ceiling applied to the sub-scope of `pid`, if tracked
    pub fn sub_scope_memory_limit(&self, pid: Pid) -> Option<u64> {
        self.lock()
            .sub_scopes
            .get(&pid)
            .and_then(|scope| scope.memory_limit())
    }

    /// Remove every sub-scope, then the top-level scope. Failures are
    /// logged; a dangling scope is replaced on the next creation anyway.
    pub fn delete(&self) {
        let mut state = self.lock();
        for (pid, scope) in state.sub_scopes.drain() {
            if let Err(e) = scope.delete() {
                warn!(
                    "Unable to delete cgroup for {} pid {}: {}",
                    self.name, pid, e
                );
            }
        }
        if let Some(shared) = state.shared.take() {
            if let Err(e) = shared.delete() {
                warn!("Unable to delete shared cgroup for {}: {}", self.name, e);
            }
        }
        match state.control.delete() {
            Ok(()) => info!("Controller deleted for: {}", self.name),
            Err(e) => error!("Unable to delete controller for {}: {}", self.name, e),
        }
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("backend", &self.backend.name())
            .field("memory_limit", &self.memory_limit)
            .field("sub_scope_limit", &self.sub_scope_limit)
            .finish()
    }
}
