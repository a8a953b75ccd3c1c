/// Command line interface for ttyjail
use crate::cgroup::{self, BackendKind};
use crate::command::{build_command_args, SessionParams};
use crate::config::JailConfig;
use crate::namespace::{self, NamespaceTemplate};
use crate::session::{SessionManager, SessionRequest};
use crate::types::JailError;
use anyhow::Context;
use clap::{Parser, Subcommand};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ttyjail")]
#[command(about = "Process containment and admission control for terminal sessions", long_about = None)]
pub struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by commands that build an argument vector
#[derive(clap::Args, Debug, Clone)]
pub struct WorkloadArgs {
    /// Command to run
    pub program: String,

    /// Arguments for the command
    #[arg(last = true)]
    pub args: Vec<String>,

    /// Compile the submitted source before running it
    #[arg(long, requires = "source")]
    pub compiled: bool,

    /// Source file submitted for a compile workload
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Join the namespaces of this process instead of creating new ones
    #[arg(long, value_name = "PID")]
    pub join: Option<i32>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Open one confined session, wait for it and print its report
    Run {
        #[command(flatten)]
        workload: WorkloadArgs,

        /// Override the connection ceiling (0 for unlimited)
        #[arg(long)]
        max_connections: Option<u64>,

        /// Exit after a single session
        #[arg(long)]
        once: bool,

        /// Cancel the session after this many idle seconds
        #[arg(long, value_name = "SECONDS")]
        idle_timeout: Option<u64>,

        /// Resource-control backend
        #[arg(long, value_enum)]
        cgroup: Option<BackendKind>,

        /// Run without namespace isolation
        #[arg(long)]
        no_isolation: bool,
    },

    /// Print the argument vector a session would execute
    Args {
        #[command(flatten)]
        workload: WorkloadArgs,
    },

    /// Print the effective resource table
    Limits {
        /// Only show the profile used for this command
        #[arg(long)]
        command: Option<String>,
    },

    /// Report cgroup and namespace support on this host
    Check,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<JailConfig> {
    match path {
        Some(path) => JailConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(JailConfig::default()),
    }
}

fn workload_params(
    workload: &WorkloadArgs,
    table: Arc<crate::limits::ResourceLimitTable>,
) -> anyhow::Result<SessionParams> {
    if !workload.compiled {
        return Ok(SessionParams::new(table));
    }
    let path = workload
        .source
        .as_ref()
        .context("--compiled needs --source")?;
    let source = fs::read_to_string(path)
        .with_context(|| format!("Failed to read source {}", path.display()))?;
    Ok(SessionParams::compile(table, source))
}

fn join_target(workload: &WorkloadArgs) -> anyhow::Result<Option<Pid>> {
    match workload.join {
        Some(pid) if pid <= 0 => anyhow::bail!("Invalid pid to join: {}", pid),
        Some(pid) => Ok(Some(Pid::from_raw(pid))),
        None => Ok(None),
    }
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            workload,
            max_connections,
            once,
            idle_timeout,
            cgroup,
            no_isolation,
        } => {
            if let Some(max) = max_connections {
                config.max_connections = max;
            }
            if once {
                config.once = true;
            }
            if let Some(secs) = idle_timeout {
                config.idle_timeout_secs = secs;
            }
            if let Some(kind) = cgroup {
                config.cgroup = kind;
            }
            if no_isolation {
                config.isolation = false;
            }

            let manager = SessionManager::new(config)?;
            let params = workload_params(&workload, manager.limits())?;
            let mut request =
                SessionRequest::new(&workload.program, params).with_args(workload.args.clone());
            if let Some(pid) = join_target(&workload)? {
                request = request.join(pid);
            }

            let mut session = match manager.open(request) {
                Ok(session) => session,
                Err(e @ JailError::AdmissionRejected(_)) => {
                    eprintln!("Session rejected: {}", e);
                    std::process::exit(2);
                }
                Err(e) => return Err(e.into()),
            };
            let report = session.wait()?;
            drop(session);
            manager.shutdown();

            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.exit_code != Some(0) {
                std::process::exit(1);
            }
        }

        Commands::Args { workload } => {
            let table = Arc::new(config.limits_table()?);
            let params = workload_params(&workload, table)?;
            let args = build_command_args(
                &workload.program,
                &workload.args,
                join_target(&workload)?,
                &params,
            );
            println!("{}", serde_json::to_string_pretty(&args)?);
        }

        Commands::Limits { command } => {
            let table = config.limits_table()?;
            let output = match command {
                Some(name) => serde_json::json!({
                    "command": name,
                    "known": table.contains(&name),
                    "profile": table.profile(&name),
                    "memory_limit_bytes": table.memory_limit_bytes(&name),
                    "container_limit_bytes": table.container_limit_bytes(&name),
                }),
                None => serde_json::to_value(&table)?,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }

        Commands::Check => {
            println!("ttyjail System Information");
            println!("==========================");

            let backend = cgroup::detect_backend(
                config.cgroup,
                config.cgroup_root.as_deref(),
                config.strict,
            )?;
            println!("Cgroup backend: {}", backend.name());
            match cgroup::get_available_controllers() {
                Ok(controllers) => {
                    let mut controllers: Vec<_> = controllers.into_iter().collect();
                    controllers.sort();
                    println!("Available controllers: {}", controllers.join(", "));
                }
                Err(e) => println!("Available controllers: unknown ({})", e),
            }

            if namespace::is_supported() {
                let template = NamespaceTemplate::for_current_user();
                println!(
                    "Namespaces: {}",
                    template.enabled_namespaces().join(", ")
                );
            } else {
                println!("Namespaces: not supported");
            }
            println!(
                "nsenter: {}",
                if Path::new(&config.nsenter_path).exists() {
                    config.nsenter_path.as_str()
                } else {
                    "missing"
                }
            );
        }
    }

    Ok(())
}
