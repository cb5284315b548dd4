#[path = "common/mod.rs"]
mod common;

use std::{fs, thread, time::Duration};

use assert_cmd::Command;
use common::{BIN, Sandbox, spawn_supervisor, wait_for_exit, wait_for_pid, wait_for_workers};
use predicates::prelude::*;
use predicates::str::contains;

fn prefork() -> Command {
    Command::new(BIN)
}

#[test]
fn status_without_pidfile_reports_not_running() {
    let sandbox = Sandbox::new();
    prefork()
        .args(["status", "--pidfile", sandbox.pidfile().to_str().unwrap()])
        .assert()
        .code(1)
        .stdout(contains("not running"));
}

#[test]
fn commands_ignore_stale_pidfile() {
    let sandbox = Sandbox::new();
    let mut dead = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = dead.id();
    dead.wait().unwrap();
    fs::write(sandbox.pidfile(), dead_pid.to_string()).unwrap();
    let pidfile = sandbox.pidfile();
    let pidfile = pidfile.to_str().unwrap();

    prefork()
        .args(["status", "--pidfile", pidfile])
        .assert()
        .code(1);
    prefork()
        .args(["restart", "--pidfile", pidfile])
        .assert()
        .failure()
        .stderr(contains("no running supervisor"));
    prefork()
        .args(["stop", "--pidfile", pidfile])
        .assert()
        .failure()
        .stderr(contains("no running supervisor"));
}

#[test]
fn start_requires_worker_command() {
    let sandbox = Sandbox::new();
    prefork()
        .args([
            "start",
            "--port",
            &sandbox.port.to_string(),
            "--pidfile",
            sandbox.pidfile().to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(contains("no worker command"));
    assert!(!sandbox.pidfile().exists());
}

#[test]
fn invalid_config_is_rejected() {
    let sandbox = Sandbox::new();
    let config = sandbox.path("bad.yaml");
    fs::write(&config, "pool: 0\nworker: [\"sleep\", \"30\"]\n").unwrap();

    prefork()
        .args(["start", "--config", config.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(contains("pool").and(contains("at least 1")));
}

#[test]
fn status_and_stop_drive_a_running_supervisor() {
    let sandbox = Sandbox::new();
    let config = sandbox.write_config(2, "");
    let mut child = spawn_supervisor(&["--config", config.to_str().unwrap()]);
    let pid = wait_for_pid(&sandbox.pidfile());
    wait_for_workers(pid, 2);
    // Reap the supervisor as soon as it exits so `stop` never probes a zombie.
    let waiter = thread::spawn(move || wait_for_exit(&mut child, Duration::from_secs(30)));

    prefork()
        .args(["status", "--config", config.to_str().unwrap()])
        .assert()
        .success()
        .stdout(contains(format!("running (pid {pid})")));

    prefork()
        .args([
            "stop",
            "--pidfile",
            sandbox.pidfile().to_str().unwrap(),
            "--timeout",
            "20",
        ])
        .timeout(Duration::from_secs(30))
        .assert()
        .success()
        .stdout(contains("supervisor stopped"));

    assert!(waiter.join().unwrap().success());
    assert!(!sandbox.pidfile().exists());
}
