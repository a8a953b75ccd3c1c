/// Session orchestration
///
/// [`SessionManager`] is the context object every session handler receives.
/// Opening a session runs admission, obtains the command's container, builds
/// the argument vector, spawns the process (confined in its sub-scope before
/// it execs) and brings up loopback when the process owns a fresh network namespace.
/// Dropping the returned [`Session`] undoes all of it exactly once.
use crate::admission::{AdmissionController, AdmissionRejected, AdmissionTicket, RejectReason};
use crate::cancel::{CancelReason, CancellationToken, SessionTimer};
use crate::cgroup::{detect_backend, CgroupBackend};
use crate::command::{build_command_args, persist_source, SessionParams, WorkloadParams};
use crate::config::JailConfig;
use crate::container::Container;
use crate::limits::ResourceLimitTable;
use crate::namespace::{get_working_dir, NamespaceTemplate, NetworkEnabler};
use crate::spawn::{ConfinedChild, LaunchSpec, Launcher};
use crate::types::{JailError, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One inbound request for a session
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub command: String,
    pub args: Vec<String>,
    /// Process whose namespaces the session joins instead of creating its own
    pub parent: Option<Pid>,
    pub params: SessionParams,
    /// Terminal handed over by the multiplexer
    pub terminal: Option<RawFd>,
    pub workdir: Option<PathBuf>,
}

impl SessionRequest {
    pub fn new(command: impl Into<String>, params: SessionParams) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            parent: None,
            params,
            terminal: None,
            workdir: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn join(mut self, parent: Pid) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_terminal(mut self, fd: RawFd) -> Self {
        self.terminal = Some(fd);
        self
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }
}

/// Process-wide state shared by all sessions
pub struct SessionManager {
    config: JailConfig,
    limits: Arc<ResourceLimitTable>,
    backend: Arc<dyn CgroupBackend>,
    launcher: Launcher,
    network: NetworkEnabler,
    admission: AdmissionController,
    containers: Mutex<HashMap<String, ContainerSlot>>,
    shutdown: CancellationToken,
}

/// Registry entry for one command. Creation happens under the slot's own
/// lock, so first use of one command never blocks lookups of another.
type ContainerSlot = Arc<Mutex<Option<Arc<Container>>>>;

fn lock_slot(slot: &Mutex<Option<Arc<Container>>>) -> MutexGuard<'_, Option<Arc<Container>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionManager {
    /// Build from configuration, detecting the cgroup backend for this host
    pub fn new(config: JailConfig) -> Result<Self> {
        config.validate()?;
        let backend = detect_backend(config.cgroup, config.cgroup_root.as_deref(), config.strict)?;
        Self::with_backend(config, backend)
    }

    /// Build with an explicit backend
    pub fn with_backend(config: JailConfig, backend: Arc<dyn CgroupBackend>) -> Result<Self> {
        config.validate()?;
        let limits = Arc::new(config.limits_table()?);
        let launcher = if config.isolation {
            Launcher::for_host()
        } else {
            Launcher::Plain
        };
        let network = NetworkEnabler::new(
            config.nsenter_path.clone(),
            config.loopback_command.clone(),
        );
        let admission = AdmissionController::new(config.admission_config());

        info!(
            "Session manager ready: backend={}, launcher={:?}, max_connections={}",
            backend.name(),
            launcher,
            config.max_connections
        );
        Ok(Self {
            config,
            limits,
            backend,
            launcher,
            network,
            admission,
            containers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &JailConfig {
        &self.config
    }

    pub fn limits(&self) -> Arc<ResourceLimitTable> {
        Arc::clone(&self.limits)
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Fires once the host is shutting down
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Plain parameters bound to this manager's resource table
    pub fn params(&self) -> SessionParams {
        SessionParams::new(self.limits())
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, ContainerSlot>> {
        self.containers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Container for `command`, created on first use.
    ///
    /// The registry lock is only held to find the command's slot; the
    /// cgroup work of a first use runs under that slot alone.
    pub fn container(&self, command: &str) -> Result<Arc<Container>> {
        let slot = Arc::clone(
            self.registry()
                .entry(command.to_string())
                .or_insert_with(ContainerSlot::default),
        );

        let mut entry = lock_slot(&slot);
        if let Some(container) = entry.as_ref() {
            return Ok(Arc::clone(container));
        }
        let container = Arc::new(Container::with_template(
            command,
            self.limits.container_limit_bytes(command),
            Arc::clone(&self.backend),
            &self.limits,
            NamespaceTemplate::for_current_user(),
        )?);
        *entry = Some(Arc::clone(&container));
        Ok(container)
    }

    fn reject(&self, reason: RejectReason) -> JailError {
        JailError::AdmissionRejected(AdmissionRejected {
            reason,
            active_connections: self.admission.active_connections(),
            active_weight: self.admission.active_weight(),
        })
    }

    /// Admit and start a session.
    ///
    /// Rejections come back as [`JailError::AdmissionRejected`]; every other
    /// error means the session could not be established. Counters taken for
    /// a session that fails to start are released before returning.
    pub fn open(&self, request: SessionRequest) -> Result<Session> {
        if self.is_shutting_down() {
            return Err(self.reject(RejectReason::ShuttingDown));
        }

        let SessionRequest {
            command,
            args,
            parent,
            mut params,
            terminal,
            workdir,
        } = request;

        let ticket = self
            .admission
            .try_admit(self.limits.weight(&command))
            .map_err(|rejected| {
                info!("Session for {} rejected: {}", command, rejected);
                JailError::from(rejected)
            })?;

        let container = self.container(&command)?;

        if params.is_compiled() {
            if params.compilation_script(&command).is_none() {
                return Err(JailError::Config(format!(
                    "'{}' has no compilation script",
                    command
                )));
            }
            if let Some(name) = params.source_file.clone() {
                let dir = workdir.clone().unwrap_or_else(std::env::temp_dir);
                let path = persist_source(&dir, &name, &params.source)?;
                debug!("Source persisted to {}", path.display());
                params.source_file = Some(path.to_string_lossy().into_owned());
            }
        }

        let argv = build_command_args(&command, &args, parent, &params);
        let namespaces = match parent {
            Some(_) => None,
            None if self.config.isolation => Some(container.namespace_template()),
            None => None,
        };

        // the child is confined while still held, so anything it forks
        // starts inside the scope
        let is_compile_workload = params.is_compiled();
        let placed = Cell::new(None);
        let confine = |pid: Pid| {
            container.place_process(pid, is_compile_workload);
            placed.set(Some(pid));
        };
        let spec = LaunchSpec {
            args: &argv,
            namespaces,
            hostname: Some(container.name()),
            workdir: workdir.as_deref(),
            terminal,
            confine: Some(&confine),
        };

        let child = match self.launcher.launch(&spec) {
            Ok(child) => child,
            Err(e) => {
                if let Some(pid) = placed.get() {
                    container.delete_process_from_sub_scope(pid);
                }
                return Err(match parent {
                    Some(pid) => JailError::NamespaceJoin(format!("joining {}: {}", pid, e)),
                    None => e,
                });
            }
        };
        let pid = child.pid();

        let network = child
            .owns_fresh_network_namespace()
            .then(|| self.network.enable(pid));

        let token = CancellationToken::new();
        let timer = SessionTimer::start(
            self.config.idle_timeout(),
            token.clone(),
            self.shutdown.clone(),
        );

        let session = Session {
            id: Uuid::new_v4(),
            command,
            child,
            container,
            ticket: Some(ticket),
            token,
            timer: Some(timer),
            network,
            shutdown: self.shutdown.clone(),
            once: self.config.once,
            max_connections: self.config.max_connections,
            started_at: Utc::now(),
            started: Instant::now(),
            closed: false,
        };
        info!(
            "Session {} opened: {} pid {} (connections: {}/{}, weight: {})",
            session.id,
            session.command,
            pid,
            session.connections_at_open(),
            self.config.max_connections,
            session.weight_at_open()
        );
        Ok(session)
    }

    /// Cancel every session and delete every container
    pub fn shutdown(&self) {
        self.shutdown.cancel(CancelReason::Shutdown);
        let slots: Vec<ContainerSlot> = self.registry().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Some(container) = lock_slot(&slot).take() {
                container.delete();
            }
        }
        info!("Session manager shut down");
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if !self.registry().is_empty() {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("backend", &self.backend.name())
            .field("launcher", &self.launcher)
            .field("admission", &self.admission)
            .finish()
    }
}

/// Summary of a finished session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub id: Uuid,
    pub command: String,
    pub pid: i32,
    pub started_at: DateTime<Utc>,
    /// Seconds between spawn and exit
    pub wall_time: f64,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Set when the session was cancelled rather than exiting on its own
    pub close_reason: Option<CancelReason>,
}

/// One running, confined session process
pub struct Session {
    id: Uuid,
    command: String,
    child: ConfinedChild,
    container: Arc<Container>,
    ticket: Option<AdmissionTicket>,
    token: CancellationToken,
    timer: Option<SessionTimer>,
    network: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    once: bool,
    max_connections: u64,
    started_at: DateTime<Utc>,
    started: Instant,
    closed: bool,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> Pid {
        self.child.pid()
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn connections_at_open(&self) -> u64 {
        self.ticket
            .as_ref()
            .map_or(0, AdmissionTicket::connections_at_admission)
    }

    fn weight_at_open(&self) -> u64 {
        self.ticket
            .as_ref()
            .map_or(0, AdmissionTicket::weight_at_admission)
    }

    /// Record activity, renewing the idle deadline
    pub fn touch(&self) {
        if let Some(timer) = &self.timer {
            timer.touch();
        }
    }

    pub fn cancel(&self) -> bool {
        self.token.cancel(CancelReason::Requested)
    }

    /// The remote end went away
    pub fn peer_closed(&self) -> bool {
        self.token.cancel(CancelReason::PeerClosed)
    }

    /// Working directory of the session process, empty when unknown
    pub fn working_dir(&self) -> String {
        get_working_dir(self.pid())
    }

    /// Wait for the process to exit or the session to be cancelled, then
    /// release everything the session holds
    pub fn wait(&mut self) -> Result<SessionReport> {
        let exit = loop {
            if let Some(exit) = self.child.try_wait()? {
                break exit;
            }
            if self.token.wait_timeout(POLL_INTERVAL) {
                self.child.kill()?;
                break self.child.wait()?;
            }
        };

        let report = SessionReport {
            id: self.id,
            command: self.command.clone(),
            pid: self.pid().as_raw(),
            started_at: self.started_at,
            wall_time: self.started.elapsed().as_secs_f64(),
            exit_code: exit.exit_code,
            signal: exit.signal,
            close_reason: self.token.reason(),
        };
        self.close();
        Ok(report)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let pid = self.pid();

        // stop the timer first so it cannot race the teardown
        self.timer.take();

        // the process group can outlive the session process, and anything
        // that left the group is still in the sub-scope
        if let Err(e) = self.child.kill() {
            warn!("Failed to kill session {} pid {}: {}", self.id, pid, e);
        }
        self.container.kill_sub_scope_processes(pid);
        if self.child.exit_info().is_none() {
            if let Err(e) = self.child.wait() {
                warn!("Failed to reap session {} pid {}: {}", self.id, pid, e);
            }
        }

        self.container.delete_process_from_sub_scope(pid);

        if let Some(handle) = self.network.take() {
            if handle.is_finished() && handle.join().is_err() {
                warn!("Network helper for pid {} panicked", pid);
            }
        }

        if let Some(ticket) = self.ticket.take() {
            let (connections, weight) = ticket.release();
            info!(
                "Session {} closed: {} pid {} (connections: {}/{}, weight: {})",
                self.id, self.command, pid, connections, self.max_connections, weight
            );
        }

        if self.once && self.shutdown.cancel(CancelReason::Shutdown) {
            info!("Single session finished, shutting down");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("pid", &self.child.pid())
            .field("closed", &self.closed)
            .finish()
    }
}
