//! End-to-end checks against the real `portal` binary.
//!
//! These spawn detached portal processes, so they only run with
//! `--features integration-tests`.
#![cfg(feature = "integration-tests")]

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use tempfile::TempDir;

fn write_config(dir: &Path) -> PathBuf {
    let config = dir.join("portal.toml");
    std::fs::write(
        &config,
        r#"
endpoint = "server.port"
server_log = "portal.log"
accept_timeout_secs = 1
idle_timeouts = 5
start_poll_interval_ms = 100
start_poll_retries = 50

[tools.echo]
command = "echo"

[tools.fail]
command = "sh"
args = ["-c", "echo oops >&2; exit 7"]
"#,
    )
    .expect("config should be written");
    config
}

fn portal(config: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_portal"));
    cmd.arg("--config").arg(config).args(args).env("RUST_LOG", "info");
    cmd
}

fn run(config: &Path, args: &[&str]) -> Output {
    portal(config, args).output().expect("portal should run")
}

fn wait_until_gone(path: &Path) {
    for _ in 0..100 {
        if !path.exists() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("{} was not removed", path.display());
}

#[test]
fn racing_clients_share_one_portal() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    let first = portal(&config, &["run", "echo", "hello"]).stdout(Stdio::piped()).spawn().unwrap();
    let second = portal(&config, &["run", "echo", "hello"]).stdout(Stdio::piped()).spawn().unwrap();
    let first = first.wait_with_output().unwrap();
    let second = second.wait_with_output().unwrap();

    for output in [&first, &second] {
        assert_eq!(output.status.code(), Some(0));
        assert_eq!(String::from_utf8_lossy(&output.stdout), "hello\n");
    }

    let status = run(&config, &["status"]);
    assert_eq!(status.status.code(), Some(0));

    assert_eq!(run(&config, &["stop"]).status.code(), Some(0));
    wait_until_gone(&dir.path().join("server.port"));

    let log = std::fs::read_to_string(dir.path().join("portal.log")).unwrap();
    assert_eq!(log.matches("portal listening").count(), 1, "log:\n{log}");
    assert!(!dir.path().join("server.port.starting").exists());
}

#[test]
fn tool_status_and_stderr_are_relayed() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    let output = run(&config, &["run", "fail"]);
    assert_eq!(output.status.code(), Some(7));
    assert!(String::from_utf8_lossy(&output.stderr).contains("oops"));

    let unknown = run(&config, &["run", "javac", "-version"]);
    assert_eq!(unknown.status.code(), Some(nimbus_portal::TOOL_NOT_FOUND_STATUS));

    run(&config, &["stop"]);
    wait_until_gone(&dir.path().join("server.port"));
}

#[test]
fn stop_without_portal_is_harmless() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    assert_eq!(run(&config, &["stop"]).status.code(), Some(0));
    assert_eq!(run(&config, &["status"]).status.code(), Some(1));
}
