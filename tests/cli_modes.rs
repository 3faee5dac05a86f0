#[path = "util/mod.rs"]
mod util;

use std::time::Duration;

use assert_cmd::Command;
use predicates::prelude::*;
use predicates::str::contains;
use util::{ToolFixture, wait_until};

fn base_cmd() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("exec-server"));
    cmd.env("EXEC_SERVER_LOG", "warn");
    cmd
}

#[test]
fn no_arguments_prints_usage() {
    base_cmd()
        .assert()
        .success()
        .stdout(contains("/direct").and(contains("/server")));
}

#[test]
fn direct_mode_with_missing_target_fails() {
    let fx = ToolFixture::new();
    base_cmd()
        .arg("/direct")
        .arg(fx.path().join("absent.so"))
        .assert()
        .code(1)
        .stderr(contains("ERROR").and(contains("does not exist")));
}

#[test]
fn direct_mode_reports_unloadable_tool() {
    let fx = ToolFixture::new();
    base_cmd()
        .arg("/direct")
        .arg(&fx.target)
        .arg("--flag")
        .assert()
        .code(1)
        .stderr(contains("Unable to load"));
    assert_eq!(fx.shadow_dirs().len(), 1);
}

#[test]
fn direct_mode_runs_library_tool() {
    let fx = ToolFixture::echo_tool();
    base_cmd()
        .arg("/direct")
        .arg(&fx.target)
        .args(["hello", "world"])
        .assert()
        .code(42)
        .stdout(contains("argc=2 args=hello,world"))
        .stderr(contains("run=1"));
}

#[test]
fn server_mode_requires_a_target() {
    base_cmd()
        .arg("/server")
        .assert()
        .code(1)
        .stderr(contains("requires a target"));
}

#[test]
fn client_gives_up_when_no_server_comes_up() {
    let fx = ToolFixture::new();
    base_cmd()
        .env("EXEC_SERVER_SOCKET_DIR", fx.path().join("sock"))
        .env("EXEC_SERVER_BINARY", "true")
        .env("EXEC_SERVER_MAX_RETRIES", "3")
        .env("EXEC_SERVER_RETRY_WAIT_MS", "1")
        .arg(&fx.target)
        .arg("input.txt")
        .assert()
        .code(1)
        .stderr(contains("ERROR cannot connect to exec server:").and(contains("input.txt")));
}

#[test]
fn client_spawns_background_server_that_retires_when_idle() {
    let fx = ToolFixture::new();
    let socket_dir = fx.path().join("sock");

    base_cmd()
        .env("EXEC_SERVER_SOCKET_DIR", &socket_dir)
        .env("EXEC_SERVER_MAX_RETRIES", "100")
        .env("EXEC_SERVER_RETRY_WAIT_MS", "50")
        .env("EXEC_SERVER_IDLE_TIMEOUT_SECS", "1")
        .env("EXEC_SERVER_MONITOR_INTERVAL_MS", "50")
        .env_remove("EXEC_SERVER_BINARY")
        .arg(&fx.target)
        .assert()
        .code(1)
        .stderr(contains("Unable to load"));

    let log = fx.path().join(".shadow").join("logs").join("exec-server.log");
    assert!(wait_until(Duration::from_secs(5), || log.exists()));

    // Idle for a second: the server removes its socket and exits.
    assert!(wait_until(Duration::from_secs(10), || {
        std::fs::read_dir(&socket_dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }));
}

#[test]
fn pooled_background_server_reuses_the_loaded_tool() {
    let fx = ToolFixture::echo_tool();
    let socket_dir = fx.path().join("sock");
    let client = || {
        let mut cmd = base_cmd();
        cmd.env("EXEC_SERVER_SOCKET_DIR", &socket_dir)
            .env("EXEC_SERVER_POOLING", "1")
            .env("EXEC_SERVER_MAX_RETRIES", "100")
            .env("EXEC_SERVER_RETRY_WAIT_MS", "50")
            .env("EXEC_SERVER_IDLE_TIMEOUT_SECS", "2")
            .env("EXEC_SERVER_MONITOR_INTERVAL_MS", "50")
            .env_remove("EXEC_SERVER_BINARY")
            .arg(&fx.target);
        cmd
    };

    client()
        .args(["exit", "3"])
        .assert()
        .code(3)
        .stdout(contains("argc=2 args=exit,3"))
        .stderr(contains("run=1"));
    client()
        .arg("again")
        .assert()
        .code(41)
        .stdout(contains("argc=1 args=again"))
        .stderr(contains("run=2"));

    assert_eq!(fx.shadow_dirs().len(), 1);
    assert!(wait_until(Duration::from_secs(10), || {
        std::fs::read_dir(&socket_dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }));
}
