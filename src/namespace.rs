/// Namespace isolation: the unsharing template applied to spawned sessions,
/// the nsenter prefix used to join an existing namespace set, and loopback
/// bring-up inside fresh network namespaces
use log::{debug, warn};
use nix::sched::CloneFlags;
use nix::unistd::{getgid, getuid, Pid};
use std::fs;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};

pub const NSENTER_PATH: &str = "/usr/bin/nsenter";

/// One line of a uid_map/gid_map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMapping {
    /// Map container-internal 0 onto a single host id
    pub fn root_to(host_id: u32) -> Self {
        Self {
            container_id: 0,
            host_id,
            size: 1,
        }
    }
}

/// Namespace-unsharing attributes handed to the process launcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceTemplate {
    pub clone_flags: CloneFlags,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
}

impl NamespaceTemplate {
    /// Fresh UTS, PID, mount, network and user namespaces, with the caller's
    /// real uid/gid mapped to root inside.
    pub fn for_current_user() -> Self {
        Self::with_identity(getuid().as_raw(), getgid().as_raw())
    }

    pub fn with_identity(uid: u32, gid: u32) -> Self {
        Self {
            clone_flags: CloneFlags::CLONE_NEWUTS
                | CloneFlags::CLONE_NEWPID
                | CloneFlags::CLONE_NEWNS
                | CloneFlags::CLONE_NEWNET
                | CloneFlags::CLONE_NEWUSER,
            uid_mappings: vec![IdMapping::root_to(uid)],
            gid_mappings: vec![IdMapping::root_to(gid)],
        }
    }

    pub fn creates_network_namespace(&self) -> bool {
        self.clone_flags.contains(CloneFlags::CLONE_NEWNET)
    }

    pub fn creates_user_namespace(&self) -> bool {
        self.clone_flags.contains(CloneFlags::CLONE_NEWUSER)
    }

    pub fn creates_uts_namespace(&self) -> bool {
        self.clone_flags.contains(CloneFlags::CLONE_NEWUTS)
    }

    /// Contents for /proc/<pid>/uid_map
    pub fn uid_map(&self) -> String {
        format_id_map(&self.uid_mappings)
    }

    /// Contents for /proc/<pid>/gid_map
    pub fn gid_map(&self) -> String {
        format_id_map(&self.gid_mappings)
    }

    /// Enabled namespaces, for diagnostics
    pub fn enabled_namespaces(&self) -> Vec<&'static str> {
        let mut namespaces = Vec::new();
        let flags = [
            (CloneFlags::CLONE_NEWUTS, "UTS"),
            (CloneFlags::CLONE_NEWPID, "PID"),
            (CloneFlags::CLONE_NEWNS, "Mount"),
            (CloneFlags::CLONE_NEWNET, "Network"),
            (CloneFlags::CLONE_NEWUSER, "User"),
        ];
        for (flag, name) in flags {
            if self.clone_flags.contains(flag) {
                namespaces.push(name);
            }
        }
        namespaces
    }
}

fn format_id_map(mappings: &[IdMapping]) -> String {
    mappings
        .iter()
        .map(|m| format!("{} {} {}\n", m.container_id, m.host_id, m.size))
        .collect()
}

/// nsenter invocation that attaches to every namespace of `target`.
///
/// The inner command vector is appended by the caller; nsenter is the outer
/// process and execs it once it has joined.
pub fn join_prefix(target: Pid) -> Vec<String> {
    vec![
        NSENTER_PATH.to_string(),
        "-t".to_string(),
        target.to_string(),
        "-U".to_string(),
        "-m".to_string(),
        "-u".to_string(),
        "-n".to_string(),
        "-p".to_string(),
    ]
}

/// Target pid of a vector built with [`join_prefix`], if it has one
pub fn join_target(args: &[String]) -> Option<Pid> {
    if args.first().map(String::as_str) != Some(NSENTER_PATH) {
        return None;
    }
    let position = args.iter().position(|a| a == "-t")?;
    args.get(position + 1)?.parse().ok().map(Pid::from_raw)
}

/// Number of leading elements [`join_prefix`] contributes
pub fn join_prefix_len() -> usize {
    join_prefix(Pid::from_raw(1)).len()
}

/// Brings the loopback interface up inside a process's network namespace.
///
/// A freshly unshared network namespace has no interface up, so anything
/// binding localhost inside the session fails until this runs.
#[derive(Debug, Clone)]
pub struct NetworkEnabler {
    nsenter_path: String,
    loopback_command: Vec<String>,
}

impl Default for NetworkEnabler {
    fn default() -> Self {
        Self::new(
            NSENTER_PATH,
            vec![
                "ip".to_string(),
                "link".to_string(),
                "set".to_string(),
                "lo".to_string(),
                "up".to_string(),
            ],
        )
    }
}

impl NetworkEnabler {
    pub fn new(nsenter_path: impl Into<String>, loopback_command: Vec<String>) -> Self {
        Self {
            nsenter_path: nsenter_path.into(),
            loopback_command,
        }
    }

    /// Argument vector run for `pid`
    pub fn command_args(&self, pid: Pid) -> Vec<String> {
        let mut args = vec![
            self.nsenter_path.clone(),
            "-n".to_string(),
            "-t".to_string(),
            pid.to_string(),
        ];
        args.extend(self.loopback_command.iter().cloned());
        args
    }

    /// Start the helper on its own thread and return immediately.
    ///
    /// The outcome only ever reaches the log; a sandbox without loopback must
    /// not abort the hosting session.
    pub fn enable(&self, pid: Pid) -> JoinHandle<()> {
        let args = self.command_args(pid);
        thread::spawn(move || {
            let output = Command::new(&args[0])
                .args(&args[1..])
                .stdin(Stdio::null())
                .output();

            match output {
                Ok(out) if out.status.success() => {
                    debug!("Loopback enabled for pid {}", pid);
                }
                Ok(out) => {
                    warn!(
                        "Enabling network for pid {} exited with {}: {}",
                        pid,
                        out.status,
                        String::from_utf8_lossy(&out.stderr).trim()
                    );
                }
                Err(e) => {
                    warn!("Error enabling network for pid {}: {}", pid, e);
                }
            }
        })
    }
}

/// Current working directory of `pid`, read from /proc.
///
/// Returns an empty string when it cannot be read; callers must treat that
/// as unknown, not as the root directory.
pub fn get_working_dir(pid: Pid) -> String {
    let path = format!("/proc/{}/cwd", pid);
    match fs::read_link(&path) {
        Ok(wd) => wd.to_string_lossy().into_owned(),
        Err(e) => {
            debug!("Cannot read working directory of {}: {}", pid, e);
            String::new()
        }
    }
}

/// Check if namespace isolation is supported on this system
pub fn is_supported() -> bool {
    fs::read_dir("/proc/self/ns").is_ok()
}
