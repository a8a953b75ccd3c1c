/// In-memory cgroup backend that records every call and can be told to fail
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use ttyjail::cgroup::{CgroupBackend, CgroupResult, ControlScope};
use ttyjail::types::CgroupError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Create(PathBuf, u64),
    Attach(PathBuf, i32),
    Delete(PathBuf),
}

#[derive(Debug, Default)]
struct ScopeRecord {
    limit: u64,
    procs: Vec<i32>,
}

#[derive(Debug, Default)]
struct State {
    scopes: BTreeMap<PathBuf, ScopeRecord>,
    events: Vec<Event>,
    /// Executable of each pid at the moment it was attached
    images: BTreeMap<i32, Option<PathBuf>>,
    create_delays: BTreeMap<PathBuf, Duration>,
    fail_create: bool,
    fail_sub_scope_create: bool,
    fail_attach: bool,
}

#[derive(Debug, Default)]
pub struct RecordingBackend {
    state: Arc<Mutex<State>>,
}

fn injected(path: &Path) -> CgroupError {
    CgroupError::Io {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::PermissionDenied, "injected failure"),
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Leave a scope behind as if a previous run had crashed
    pub fn seed(&self, path: impl Into<PathBuf>) {
        lock(&self.state)
            .scopes
            .insert(path.into(), ScopeRecord::default());
    }

    pub fn fail_create(&self, fail: bool) {
        lock(&self.state).fail_create = fail;
    }

    pub fn fail_sub_scope_create(&self, fail: bool) {
        lock(&self.state).fail_sub_scope_create = fail;
    }

    /// Make every creation of `path` take at least `delay`
    pub fn slow_create(&self, path: impl Into<PathBuf>, delay: Duration) {
        lock(&self.state).create_delays.insert(path.into(), delay);
    }

    pub fn fail_attach(&self, fail: bool) {
        lock(&self.state).fail_attach = fail;
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        lock(&self.state).scopes.contains_key(path.as_ref())
    }

    pub fn limit(&self, path: impl AsRef<Path>) -> Option<u64> {
        lock(&self.state).scopes.get(path.as_ref()).map(|s| s.limit)
    }

    pub fn procs(&self, path: impl AsRef<Path>) -> Vec<i32> {
        lock(&self.state)
            .scopes
            .get(path.as_ref())
            .map(|s| s.procs.clone())
            .unwrap_or_default()
    }

    pub fn scope_count(&self) -> usize {
        lock(&self.state).scopes.len()
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.state).events.clone()
    }

    pub fn clear_events(&self) {
        lock(&self.state).events.clear();
    }

    /// What `pid` was running when it was attached, `None` if unreadable
    pub fn image_at_attach(&self, pid: Pid) -> Option<PathBuf> {
        lock(&self.state).images.get(&pid.as_raw()).cloned().flatten()
    }
}

#[derive(Debug)]
struct RecordingScope {
    path: PathBuf,
    limit: u64,
    state: Arc<Mutex<State>>,
}

impl ControlScope for RecordingScope {
    fn path(&self) -> &Path {
        &self.path
    }

    fn memory_limit(&self) -> Option<u64> {
        Some(self.limit)
    }

    fn attach_process(&self, pid: Pid) -> CgroupResult<()> {
        let mut state = lock(&self.state);
        if state.fail_attach {
            return Err(injected(&self.path));
        }
        let record = state
            .scopes
            .get_mut(&self.path)
            .ok_or_else(|| CgroupError::NotFound(self.path.clone()))?;
        record.procs.push(pid.as_raw());
        let image = fs::read_link(format!("/proc/{}/exe", pid)).ok();
        state.images.insert(pid.as_raw(), image);
        state
            .events
            .push(Event::Attach(self.path.clone(), pid.as_raw()));
        Ok(())
    }

    fn processes(&self) -> CgroupResult<Vec<Pid>> {
        Ok(lock(&self.state)
            .scopes
            .get(&self.path)
            .map(|record| record.procs.iter().copied().map(Pid::from_raw).collect())
            .unwrap_or_default())
    }

    fn delete(&self) -> CgroupResult<()> {
        let mut state = lock(&self.state);
        state.scopes.remove(&self.path);
        state.events.push(Event::Delete(self.path.clone()));
        Ok(())
    }
}

impl CgroupBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn create(&self, path: &Path, memory_limit: u64) -> CgroupResult<Box<dyn ControlScope>> {
        let delay = lock(&self.state).create_delays.get(path).copied();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut state = lock(&self.state);
        let is_sub_scope = path.components().count() > 1;
        if state.fail_create || (is_sub_scope && state.fail_sub_scope_create) {
            return Err(injected(path));
        }
        state.scopes.insert(
            path.to_path_buf(),
            ScopeRecord {
                limit: memory_limit,
                procs: Vec::new(),
            },
        );
        state
            .events
            .push(Event::Create(path.to_path_buf(), memory_limit));
        Ok(Box::new(RecordingScope {
            path: path.to_path_buf(),
            limit: memory_limit,
            state: Arc::clone(&self.state),
        }))
    }

    fn load(&self, path: &Path) -> CgroupResult<Box<dyn ControlScope>> {
        let state = lock(&self.state);
        let record = state
            .scopes
            .get(path)
            .ok_or_else(|| CgroupError::NotFound(path.to_path_buf()))?;
        Ok(Box::new(RecordingScope {
            path: path.to_path_buf(),
            limit: record.limit,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Pids far above pid_max so nothing real is ever touched
pub fn fake_pids(count: usize) -> Vec<Pid> {
    let mut pids = Vec::with_capacity(count);
    while pids.len() < count {
        let pid = Pid::from_raw(fastrand::i32(5_000_000..i32::MAX));
        if !pids.contains(&pid) {
            pids.push(pid);
        }
    }
    pids
}
