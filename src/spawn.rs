/// Process creation for session commands
///
/// Every session process is cloned and then held on a sync socket until the
/// parent has finished with it: id maps written for a fresh user namespace,
/// and the caller's confinement hook run. Nothing the command forks can
/// therefore start outside its scope. The namespaced launcher clones straight
/// into the namespace set described by a [`NamespaceTemplate`], so the
/// session command itself is pid 1 of its PID namespace. The plain launcher
/// clones without namespace flags, for namespace-join invocations and hosts
/// where isolation is switched off.
///
/// Each child leads its own process group, so a kill reaches whatever it
/// forked as well.
use crate::namespace::NamespaceTemplate;
use crate::types::{JailError, Result};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::Duration;

const CHILD_STACK_SIZE: usize = 1024 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How session processes are created, chosen at startup
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Launcher {
    /// Clone into fresh namespaces when a template is supplied
    Namespaced,
    /// No namespace changes
    Plain,
}

impl Launcher {
    /// Namespaced where the kernel exposes namespaces, plain otherwise
    pub fn for_host() -> Self {
        if crate::namespace::is_supported() {
            Launcher::Namespaced
        } else {
            Launcher::Plain
        }
    }

    pub fn launch(&self, spec: &LaunchSpec<'_>) -> Result<ConfinedChild> {
        if spec.args.is_empty() {
            return Err(JailError::Spawn("Empty command provided".to_string()));
        }
        match (self, spec.namespaces) {
            (Launcher::Namespaced, Some(template)) => launch_held(spec, Some(template)),
            _ => launch_held(spec, None),
        }
    }
}

/// Everything needed to start one session process
#[derive(Default)]
pub struct LaunchSpec<'a> {
    pub args: &'a [String],
    /// Namespaces to create for the child; `None` keeps the parent's
    pub namespaces: Option<&'a NamespaceTemplate>,
    /// Hostname set inside a fresh UTS namespace
    pub hostname: Option<&'a str>,
    pub workdir: Option<&'a Path>,
    /// Terminal that becomes the child's controlling tty and stdio
    pub terminal: Option<RawFd>,
    /// Runs with the child's pid while the child is still held before exec
    pub confine: Option<&'a dyn Fn(Pid)>,
}

impl std::fmt::Debug for LaunchSpec<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchSpec")
            .field("args", &self.args)
            .field("namespaces", &self.namespaces)
            .field("hostname", &self.hostname)
            .field("workdir", &self.workdir)
            .field("terminal", &self.terminal)
            .field("confine", &self.confine.is_some())
            .finish()
    }
}

/// How a session process ended
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A running (or reaped) session process
pub struct ConfinedChild {
    pid: Pid,
    fresh_network: bool,
    exit: Option<ExitInfo>,
}

impl ConfinedChild {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// True when the child was created with its own network namespace
    pub fn owns_fresh_network_namespace(&self) -> bool {
        self.fresh_network
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit
    }

    /// Reap the child if it has exited, without blocking
    pub fn try_wait(&mut self) -> Result<Option<ExitInfo>> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }

        let exit = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => Some(ExitInfo {
                exit_code: Some(code),
                signal: None,
            }),
            Ok(WaitStatus::Signaled(_, sig, _)) => Some(ExitInfo {
                exit_code: None,
                signal: Some(sig as i32),
            }),
            Ok(_) => None,
            // already reaped elsewhere
            Err(Errno::ECHILD) => Some(ExitInfo::default()),
            Err(e) => {
                return Err(JailError::Spawn(format!(
                    "Process monitoring error for {}: {}",
                    self.pid, e
                )))
            }
        };

        self.exit = exit;
        Ok(exit)
    }

    /// SIGKILL the child's process group: the child and everything it
    /// forked that stayed in the group. The group can outlive the child, so
    /// this still signals after the child has exited. An empty group is not
    /// an error.
    pub fn kill(&mut self) -> Result<()> {
        match signal::killpg(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                return Err(JailError::Spawn(format!(
                    "Failed to kill process group {}: {}",
                    self.pid, e
                )))
            }
        }
        if self.exit.is_some() {
            return Ok(());
        }
        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(JailError::Spawn(format!(
                "Failed to kill {}: {}",
                self.pid, e
            ))),
        }
    }

    /// Block until the child exits
    pub fn wait(&mut self) -> Result<ExitInfo> {
        loop {
            if let Some(exit) = self.try_wait()? {
                return Ok(exit);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl std::fmt::Debug for ConfinedChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfinedChild")
            .field("pid", &self.pid)
            .field("fresh_network", &self.fresh_network)
            .field("exit", &self.exit)
            .finish()
    }
}

fn launch_held(spec: &LaunchSpec<'_>, template: Option<&NamespaceTemplate>) -> Result<ConfinedChild> {
    let argv = spec
        .args
        .iter()
        .map(|arg| CString::new(arg.as_bytes()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| JailError::Spawn(format!("Argument contains a NUL byte: {}", e)))?;
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let workdir = spec
        .workdir
        .map(|dir| CString::new(dir.as_os_str().as_bytes()))
        .transpose()
        .map_err(|e| JailError::Spawn(format!("Working directory contains a NUL byte: {}", e)))?;
    let hostname: Option<Vec<u8>> = spec
        .hostname
        .filter(|_| template.map_or(false, NamespaceTemplate::creates_uts_namespace))
        .map(|name| name.as_bytes().to_vec());
    let terminal = spec.terminal;

    // the child blocks on `sync` until its id maps are written and it is
    // confined, and reports an exec failure as a raw errno on `errors`
    // (both ends close on exec)
    let (mut parent_sync, child_sync) = UnixStream::pair()?;
    let (mut parent_errors, child_errors) = UnixStream::pair()?;
    let sync_fd = child_sync.as_raw_fd();
    let errors_fd = child_errors.as_raw_fd();

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let child_main = Box::new(move || -> isize {
        // SAFETY: runs in the cloned child, which has a private copy of the
        // parent's memory and only issues raw syscalls before exec.
        unsafe {
            child_exec(
                sync_fd,
                errors_fd,
                &argv_ptrs,
                workdir.as_ref(),
                hostname.as_deref(),
                terminal,
            )
        }
    });

    let flags = template.map_or(CloneFlags::empty(), |t| t.clone_flags);
    // SAFETY: the callback never returns into Rust code shared with the parent.
    let pid = unsafe { clone(child_main, &mut stack, flags, Some(libc::SIGCHLD)) }
        .map_err(|e| JailError::Spawn(format!("Failed to clone {}: {}", spec.args[0], e)))?;
    drop(child_sync);
    drop(child_errors);

    let released = template
        .map_or(Ok(()), |t| write_id_maps(pid, t))
        .and_then(|()| {
            if let Some(confine) = spec.confine {
                confine(pid);
            }
            parent_sync.write_all(&[1])?;
            parent_sync.flush()
        });
    if let Err(e) = released {
        abandon(pid);
        return Err(JailError::Spawn(format!(
            "Failed to prepare child {} before exec: {}",
            pid, e
        )));
    }
    drop(parent_sync);

    let mut report = Vec::new();
    parent_errors.read_to_end(&mut report)?;
    if report.len() >= 4 {
        let errno = i32::from_ne_bytes([report[0], report[1], report[2], report[3]]);
        abandon(pid);
        return Err(JailError::Spawn(format!(
            "Failed to exec {}: {}",
            spec.args[0],
            io::Error::from_raw_os_error(errno)
        )));
    }

    match template {
        Some(t) => debug!(
            "Started {} as pid {} in namespaces {:?}",
            spec.args[0],
            pid,
            t.enabled_namespaces()
        ),
        None => debug!("Started {} as pid {}", spec.args[0], pid),
    }
    Ok(ConfinedChild {
        pid,
        fresh_network: template.map_or(false, NamespaceTemplate::creates_network_namespace),
        exit: None,
    })
}

/// Kill and reap a child that never made it to a usable state
fn abandon(pid: Pid) {
    if let Err(e) = signal::kill(pid, Signal::SIGKILL) {
        if e != Errno::ESRCH {
            warn!("Failed to kill abandoned child {}: {}", pid, e);
        }
    }
    let _ = waitpid(pid, None);
}

fn write_id_maps(pid: Pid, template: &NamespaceTemplate) -> io::Result<()> {
    if !template.creates_user_namespace() {
        return Ok(());
    }
    let proc_dir = Path::new("/proc").join(pid.to_string());

    // unprivileged writers must give up setgroups before mapping gids
    match fs::write(proc_dir.join("setgroups"), "deny") {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    fs::write(proc_dir.join("uid_map"), template.uid_map())?;
    fs::write(proc_dir.join("gid_map"), template.gid_map())?;
    Ok(())
}

/// Make `fd` the controlling terminal and stdio of the calling process
fn attach_terminal(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain syscalls on descriptors owned by this process.
    unsafe {
        if libc::setsid() < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::ioctl(fd, libc::TIOCSCTTY, 0) < 0 {
            return Err(io::Error::last_os_error());
        }
        for target in 0..3 {
            if libc::dup2(fd, target) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        if fd > 2 {
            libc::close(fd);
        }
    }
    Ok(())
}

unsafe fn report_errno(fd: RawFd) {
    let errno = io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL);
    let bytes = errno.to_ne_bytes();
    libc::write(fd, bytes.as_ptr().cast(), bytes.len());
}

unsafe fn child_exec(
    sync_fd: RawFd,
    errors_fd: RawFd,
    argv: &[*const libc::c_char],
    workdir: Option<&CString>,
    hostname: Option<&[u8]>,
    terminal: Option<RawFd>,
) -> isize {
    let mut byte = 0u8;
    if libc::read(sync_fd, (&mut byte as *mut u8).cast(), 1) != 1 {
        libc::_exit(126);
    }

    if let Some(name) = hostname {
        libc::sethostname(name.as_ptr().cast(), name.len());
    }
    // a new session also makes the child its group leader
    match terminal {
        Some(fd) => {
            if attach_terminal(fd).is_err() {
                report_errno(errors_fd);
                libc::_exit(126);
            }
        }
        None => {
            if libc::setpgid(0, 0) != 0 {
                report_errno(errors_fd);
                libc::_exit(126);
            }
        }
    }
    if let Some(dir) = workdir {
        if libc::chdir(dir.as_ptr()) != 0 {
            report_errno(errors_fd);
            libc::_exit(126);
        }
    }

    libc::execvp(argv[0], argv.as_ptr());
    report_errno(errors_fd);
    libc::_exit(127)
}
