/// Resource-control backends for per-command and per-process memory ceilings
///
/// A backend creates, loads and deletes scopes addressed by a path relative
/// to its hierarchy root. cgroup v1 and v2 are supported, plus an unconfined
/// fallback for hosts without a usable cgroup filesystem.
use crate::types::{CgroupError, JailError, Result};
use log::{debug, info, warn};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

pub type CgroupResult<T> = std::result::Result<T, CgroupError>;

const CGROUP_MOUNT: &str = "/sys/fs/cgroup";
const PROCS_FILE: &str = "cgroup.procs";

/// Handle to one resource-control scope
pub trait ControlScope: Send + Sync + fmt::Debug {
    /// Path relative to the backend's hierarchy root
    fn path(&self) -> &Path;

    /// Memory ceiling in bytes, when one was applied
    fn memory_limit(&self) -> Option<u64>;

    fn attach_process(&self, pid: Pid) -> CgroupResult<()>;

    /// Processes currently in the scope
    fn processes(&self) -> CgroupResult<Vec<Pid>>;

    /// Remove the scope. Removing a scope that is already gone succeeds.
    fn delete(&self) -> CgroupResult<()>;
}

/// Factory for control scopes
pub trait CgroupBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, path: &Path, memory_limit: u64) -> CgroupResult<Box<dyn ControlScope>>;

    fn load(&self, path: &Path) -> CgroupResult<Box<dyn ControlScope>>;

    /// True when a scope with child scopes may not hold processes itself
    /// (the cgroup v2 no-internal-process rule)
    fn requires_leaf_attach(&self) -> bool {
        false
    }
}

/// Which backend to use, chosen at startup
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Auto,
    V1,
    V2,
    None,
}

/// Scope backed by a directory in a cgroup filesystem
#[derive(Debug)]
struct FsScope {
    path: PathBuf,
    full_path: PathBuf,
    memory_limit: Option<u64>,
}

impl ControlScope for FsScope {
    fn path(&self) -> &Path {
        &self.path
    }

    fn memory_limit(&self) -> Option<u64> {
        self.memory_limit
    }

    fn attach_process(&self, pid: Pid) -> CgroupResult<()> {
        write_cgroup_file(&self.full_path, PROCS_FILE, &pid.to_string())
    }

    fn processes(&self) -> CgroupResult<Vec<Pid>> {
        let file_path = self.full_path.join(PROCS_FILE);
        match fs::read_to_string(&file_path) {
            Ok(content) => Ok(parse_procs(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(CgroupError::io(file_path, e)),
        }
    }

    fn delete(&self) -> CgroupResult<()> {
        match remove_scope_dir(&self.full_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CgroupError::io(&self.full_path, e)),
        }
    }
}

/// cgroup v1 memory controller hierarchy
pub struct CgroupV1Backend {
    root: PathBuf,
}

impl CgroupV1Backend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for CgroupV1Backend {
    fn default() -> Self {
        Self::new(Path::new(CGROUP_MOUNT).join("memory"))
    }
}

impl CgroupBackend for CgroupV1Backend {
    fn name(&self) -> &'static str {
        "cgroup-v1"
    }

    fn create(&self, path: &Path, memory_limit: u64) -> CgroupResult<Box<dyn ControlScope>> {
        let full_path = resolve(&self.root, path)?;
        fs::create_dir_all(&full_path).map_err(|e| CgroupError::io(&full_path, e))?;

        write_cgroup_file(&full_path, "memory.limit_in_bytes", &memory_limit.to_string())?;

        // swap accounting is optional on v1 kernels
        if full_path.join("memory.memsw.limit_in_bytes").exists() {
            if let Err(e) = write_cgroup_file(
                &full_path,
                "memory.memsw.limit_in_bytes",
                &memory_limit.to_string(),
            ) {
                debug!("memsw limit not applied for {}: {}", path.display(), e);
            }
        }

        Ok(Box::new(FsScope {
            path: path.to_path_buf(),
            full_path,
            memory_limit: Some(memory_limit),
        }))
    }

    fn load(&self, path: &Path) -> CgroupResult<Box<dyn ControlScope>> {
        let full_path = resolve(&self.root, path)?;
        if !full_path.is_dir() {
            return Err(CgroupError::NotFound(path.to_path_buf()));
        }
        let memory_limit = read_limit(&full_path, "memory.limit_in_bytes");
        Ok(Box::new(FsScope {
            path: path.to_path_buf(),
            full_path,
            memory_limit,
        }))
    }
}

/// cgroup v2 unified hierarchy
pub struct CgroupV2Backend {
    root: PathBuf,
}

impl CgroupV2Backend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Children only get a memory.max file once the parent delegates the
    /// memory controller.
    fn enable_memory_controller(&self, parent: &Path) {
        let control = parent.join("cgroup.subtree_control");
        if !control.exists() {
            return;
        }
        if let Err(e) = fs::write(&control, "+memory") {
            warn!(
                "Failed to enable memory controller in {}: {}",
                control.display(),
                e
            );
        }
    }
}

impl Default for CgroupV2Backend {
    fn default() -> Self {
        Self::new(CGROUP_MOUNT)
    }
}

impl CgroupBackend for CgroupV2Backend {
    fn name(&self) -> &'static str {
        "cgroup-v2"
    }

    fn create(&self, path: &Path, memory_limit: u64) -> CgroupResult<Box<dyn ControlScope>> {
        let full_path = resolve(&self.root, path)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).map_err(|e| CgroupError::io(parent, e))?;
            self.enable_memory_controller(parent);
        }
        fs::create_dir_all(&full_path).map_err(|e| CgroupError::io(&full_path, e))?;

        write_cgroup_file(&full_path, "memory.max", &memory_limit.to_string())?;
        if full_path.join("memory.swap.max").exists() {
            if let Err(e) = write_cgroup_file(&full_path, "memory.swap.max", "0") {
                debug!("swap limit not applied for {}: {}", path.display(), e);
            }
        }

        Ok(Box::new(FsScope {
            path: path.to_path_buf(),
            full_path,
            memory_limit: Some(memory_limit),
        }))
    }

    fn load(&self, path: &Path) -> CgroupResult<Box<dyn ControlScope>> {
        let full_path = resolve(&self.root, path)?;
        if !full_path.is_dir() {
            return Err(CgroupError::NotFound(path.to_path_buf()));
        }
        let memory_limit = read_limit(&full_path, "memory.max");
        Ok(Box::new(FsScope {
            path: path.to_path_buf(),
            full_path,
            memory_limit,
        }))
    }

    fn requires_leaf_attach(&self) -> bool {
        true
    }
}

/// Backend that enforces nothing. Used where no cgroup filesystem is usable.
#[derive(Debug, Default)]
pub struct UnconfinedBackend;

#[derive(Debug)]
struct UnconfinedScope {
    path: PathBuf,
}

impl ControlScope for UnconfinedScope {
    fn path(&self) -> &Path {
        &self.path
    }

    fn memory_limit(&self) -> Option<u64> {
        None
    }

    fn attach_process(&self, _pid: Pid) -> CgroupResult<()> {
        Ok(())
    }

    fn processes(&self) -> CgroupResult<Vec<Pid>> {
        Ok(Vec::new())
    }

    fn delete(&self) -> CgroupResult<()> {
        Ok(())
    }
}

impl CgroupBackend for UnconfinedBackend {
    fn name(&self) -> &'static str {
        "unconfined"
    }

    fn create(&self, path: &Path, _memory_limit: u64) -> CgroupResult<Box<dyn ControlScope>> {
        Ok(Box::new(UnconfinedScope {
            path: path.to_path_buf(),
        }))
    }

    fn load(&self, path: &Path) -> CgroupResult<Box<dyn ControlScope>> {
        Err(CgroupError::NotFound(path.to_path_buf()))
    }
}

/// Select the backend for this host.
///
/// `root` overrides the hierarchy mount point. Without `strict`, a missing
/// cgroup filesystem degrades to [`UnconfinedBackend`].
pub fn detect_backend(
    kind: BackendKind,
    root: Option<&Path>,
    strict: bool,
) -> Result<Arc<dyn CgroupBackend>> {
    let mount = root.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(CGROUP_MOUNT));

    let backend: Option<Arc<dyn CgroupBackend>> = match kind {
        BackendKind::None => return Ok(Arc::new(UnconfinedBackend)),
        BackendKind::V2 if mount.is_dir() => {
            Some(Arc::new(CgroupV2Backend::new(&mount)) as Arc<dyn CgroupBackend>)
        }
        BackendKind::V1 => {
            // an explicit root for v1 points at the memory controller itself
            let memory = if root.is_some() { mount.clone() } else { mount.join("memory") };
            memory
                .is_dir()
                .then(|| Arc::new(CgroupV1Backend::new(memory)) as Arc<dyn CgroupBackend>)
        }
        BackendKind::Auto if mount.join("cgroup.controllers").exists() => {
            Some(Arc::new(CgroupV2Backend::new(&mount)) as Arc<dyn CgroupBackend>)
        }
        BackendKind::Auto if mount.join("memory").is_dir() => {
            Some(Arc::new(CgroupV1Backend::new(mount.join("memory"))) as Arc<dyn CgroupBackend>)
        }
        _ => None,
    };

    match backend {
        Some(backend) => {
            info!("Using {} backend at {}", backend.name(), mount.display());
            Ok(backend)
        }
        None if strict => Err(JailError::Cgroup(CgroupError::Unavailable(format!(
            "no usable cgroup hierarchy under {}",
            mount.display()
        )))),
        None => {
            warn!(
                "Cgroups not available under {}. Memory ceilings will not be enforced.",
                mount.display()
            );
            Ok(Arc::new(UnconfinedBackend))
        }
    }
}

pub fn cgroups_available() -> bool {
    Path::new("/proc/cgroups").exists() && Path::new(CGROUP_MOUNT).exists()
}

/// Controllers the kernel reports as enabled in /proc/cgroups
pub fn get_available_controllers() -> Result<HashSet<String>> {
    let content = fs::read_to_string("/proc/cgroups")
        .map_err(|e| CgroupError::io("/proc/cgroups", e))?;
    Ok(parse_controllers(&content))
}

fn parse_controllers(content: &str) -> HashSet<String> {
    let mut controllers = HashSet::new();

    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 4 && parts[3] == "1" {
            controllers.insert(parts[0].to_string());
        }
    }

    controllers
}

/// One pid per line, as in cgroup.procs
fn parse_procs(content: &str) -> Vec<Pid> {
    content
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .map(Pid::from_raw)
        .collect()
}

/// Join a relative scope path onto the hierarchy root, refusing anything
/// that would escape it.
fn resolve(root: &Path, path: &Path) -> CgroupResult<PathBuf> {
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes || path.as_os_str().is_empty() {
        return Err(CgroupError::InvalidPath(path.to_path_buf()));
    }
    Ok(root.join(path))
}

/// rmdir a scope and its child scopes, deepest first. Control files need no
/// removal; the kernel drops them with the directory.
fn remove_scope_dir(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            remove_scope_dir(&entry.path())?;
        }
    }
    fs::remove_dir(dir)
}

fn write_cgroup_file(dir: &Path, filename: &str, content: &str) -> CgroupResult<()> {
    let file_path = dir.join(filename);
    fs::write(&file_path, content).map_err(|e| CgroupError::io(file_path, e))
}

fn read_limit(dir: &Path, filename: &str) -> Option<u64> {
    fs::read_to_string(dir.join(filename))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}
