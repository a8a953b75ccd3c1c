use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;
use std::io::Write;

fn ttyjail() -> Command {
    Command::cargo_bin("ttyjail").expect("binary should be built")
}

#[test]
fn test_args_plain_command() {
    let output = ttyjail()
        .args(["args", "python3", "--", "-c", "pass"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let args: Vec<String> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(&args[args.len() - 2..], &["-c", "pass"]);
    assert_ne!(args[0], "/usr/bin/nsenter");
}

#[test]
fn test_args_with_join() {
    ttyjail()
        .args(["args", "--join", "1234", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/usr/bin/nsenter"))
        .stdout(predicate::str::contains("\"1234\""));
}

#[test]
fn test_args_compiled_source() {
    let mut source = tempfile::NamedTempFile::new().unwrap();
    write!(source, "int main() {{ return 0; }}").unwrap();

    ttyjail()
        .args(["args", "--compiled", "--source"])
        .arg(source.path())
        .arg("gcc")
        .assert()
        .success()
        .stdout(predicate::str::contains("/bin/bash"))
        .stdout(predicate::str::contains("compile-c.sh"))
        .stdout(predicate::str::contains("int main()"));
}

#[test]
fn test_compiled_requires_source() {
    ttyjail()
        .args(["args", "--compiled", "gcc"])
        .assert()
        .failure();
}

#[test]
fn test_limits_for_command() {
    ttyjail()
        .args(["limits", "--command", "python"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"memory_limit_bytes\": 209715200"))
        .stdout(predicate::str::contains("\"known\": true"));
}

#[test]
fn test_limits_with_config_override() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    write!(config, r#"{{ "commands": {{ "lua": {{ "memory_mb": 16 }} }} }}"#).unwrap();

    ttyjail()
        .arg("--config")
        .arg(config.path())
        .args(["limits", "--command", "lua"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"memory_limit_bytes\": 16777216"));
}

#[test]
fn test_invalid_config_fails() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    write!(config, r#"{{ "nsenter_path": "" }}"#).unwrap();

    ttyjail()
        .arg("--config")
        .arg(config.path())
        .arg("limits")
        .assert()
        .failure()
        .stderr(predicate::str::contains("nsenter_path"));
}

#[test]
#[serial]
fn test_run_prints_report() {
    ttyjail()
        .args([
            "run",
            "--cgroup",
            "none",
            "--no-isolation",
            "sh",
            "--",
            "-c",
            "exit 0",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"exit_code\": 0"))
        .stdout(predicate::str::contains("\"command\": \"sh\""));
}

#[test]
#[serial]
fn test_run_reports_failure_exit() {
    ttyjail()
        .args([
            "run",
            "--cgroup",
            "none",
            "--no-isolation",
            "sh",
            "--",
            "-c",
            "exit 5",
        ])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("\"exit_code\": 5"));
}
