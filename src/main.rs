/// ttyjail: confined terminal session runner
///
/// # Usage
/// ```bash
/// ttyjail check
/// ttyjail args python3 -- -i
/// ttyjail run --max-connections 4 --idle-timeout 600 bash
/// ttyjail run --compiled --source main.c gcc
/// ```
use anyhow::Result;

fn main() -> Result<()> {
    env_logger::init();

    if !cfg!(unix) {
        eprintln!("Error: ttyjail requires a Unix-like system");
        std::process::exit(1);
    }

    ttyjail::cli::run()
}
