#[path = "common/mod.rs"]
mod common;

use std::{fs, net::TcpListener, path::PathBuf, time::Duration};

use assert_cmd::Command;
use common::{
    BIN, Sandbox, connect, send_signal, spawn_supervisor, wait_for_exit, wait_for_pid,
    wait_for_process_exit, wait_for_workers, worker_pids,
};
use nix::{
    sys::signal::Signal,
    unistd::{Pid, getsid},
};
use predicates::str::contains;

fn start_pool(sandbox: &Sandbox, pool: usize) -> std::process::Child {
    let config = sandbox.write_config(pool, "");
    spawn_supervisor(&["--config", config.to_str().unwrap()])
}

#[test]
fn interrupt_stops_workers_and_removes_pidfile() {
    let sandbox = Sandbox::new();
    let mut child = start_pool(&sandbox, 2);

    let pid = wait_for_pid(&sandbox.pidfile());
    assert_eq!(pid, child.id());
    let workers = wait_for_workers(pid, 2);
    assert!(connect(sandbox.port).is_ok(), "socket not accepting");

    send_signal(pid, Signal::SIGINT);
    let status = wait_for_exit(&mut child, Duration::from_secs(15));
    assert!(status.success(), "exit status {status:?}\n{}", sandbox.log());
    assert!(!sandbox.pidfile().exists());
    for worker in workers {
        wait_for_process_exit(worker);
    }
}

#[test]
fn hangup_without_restart_command_shuts_down() {
    let sandbox = Sandbox::new();
    let mut child = start_pool(&sandbox, 2);

    let pid = wait_for_pid(&sandbox.pidfile());
    let workers = wait_for_workers(pid, 2);

    send_signal(pid, Signal::SIGHUP);
    let status = wait_for_exit(&mut child, Duration::from_secs(15));
    assert!(status.success(), "exit status {status:?}\n{}", sandbox.log());
    assert!(!sandbox.pidfile().exists());
    for worker in workers {
        wait_for_process_exit(worker);
    }
}

#[test]
fn killed_worker_is_replaced() {
    let sandbox = Sandbox::new();
    let mut child = start_pool(&sandbox, 2);

    let pid = wait_for_pid(&sandbox.pidfile());
    let workers = wait_for_workers(pid, 2);
    send_signal(workers[0], Signal::SIGKILL);

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let replaced = loop {
        let current = worker_pids(pid);
        if current.len() == 2 && !current.contains(&workers[0]) {
            break current;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "worker was not replaced: {current:?}\n{}",
            sandbox.log()
        );
        std::thread::sleep(Duration::from_millis(50));
    };
    assert!(replaced.contains(&workers[1]));

    send_signal(pid, Signal::SIGTERM);
    assert!(wait_for_exit(&mut child, Duration::from_secs(15)).success());
}

#[test]
fn second_instance_is_rejected() {
    let sandbox = Sandbox::new();
    let mut child = start_pool(&sandbox, 1);
    let pid = wait_for_pid(&sandbox.pidfile());

    let other_port = common::free_port().to_string();
    Command::new(BIN)
        .args([
            "start",
            "--port",
            &other_port,
            "--pidfile",
            sandbox.pidfile().to_str().unwrap(),
            "--",
            "sleep",
            "30",
        ])
        .assert()
        .failure()
        .stderr(contains("already running"));

    assert_eq!(common::read_pid(&sandbox.pidfile()), Some(pid));
    send_signal(pid, Signal::SIGTERM);
    assert!(wait_for_exit(&mut child, Duration::from_secs(15)).success());
}

#[test]
fn port_in_use_fails_before_forking() {
    let sandbox = Sandbox::new();
    let holder = TcpListener::bind(("127.0.0.1", sandbox.port)).unwrap();

    Command::new(BIN)
        .args([
            "start",
            "--port",
            &sandbox.port.to_string(),
            "--pidfile",
            sandbox.pidfile().to_str().unwrap(),
            "--",
            "sleep",
            "30",
        ])
        .timeout(Duration::from_secs(10))
        .assert()
        .failure()
        .stderr(contains("Failed to bind"));

    assert!(!sandbox.pidfile().exists());
    drop(holder);
}

#[test]
fn stale_pidfile_is_replaced_on_start() {
    let sandbox = Sandbox::new();
    let mut dead = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = dead.id();
    dead.wait().unwrap();
    fs::write(sandbox.pidfile(), dead_pid.to_string()).unwrap();

    let mut child = start_pool(&sandbox, 1);
    let pid = common::wait_for_pid_change(&sandbox.pidfile(), dead_pid, Duration::from_secs(10));
    assert_eq!(pid, child.id());

    send_signal(pid, Signal::SIGQUIT);
    assert!(wait_for_exit(&mut child, Duration::from_secs(15)).success());
    assert!(!sandbox.pidfile().exists());
}

#[test]
fn daemonized_supervisor_detaches_and_logs_to_tmp() {
    let sandbox = Sandbox::new();
    let name = format!("prefork-daemon-{}", sandbox.port);
    let default_log = PathBuf::from(format!("/tmp/{name}.log"));
    let _ = fs::remove_file(&default_log);

    let config = sandbox.path("daemon.yaml");
    fs::write(
        &config,
        format!(
            "pool: 2\nport: {}\npidfile: {}\nname: {name}\ndaemonize: true\ntimeout: 5\nworker: [\"sleep\", \"30\"]\n",
            sandbox.port,
            sandbox.pidfile().display()
        ),
    )
    .unwrap();

    let mut launcher = spawn_supervisor(&["--config", config.to_str().unwrap()]);
    assert!(wait_for_exit(&mut launcher, Duration::from_secs(10)).success());

    let pid = wait_for_pid(&sandbox.pidfile());
    assert_ne!(pid, launcher.id());
    let workers = wait_for_workers(pid, 2);
    assert!(connect(sandbox.port).is_ok());
    assert_ne!(
        getsid(Some(Pid::from_raw(pid as i32))).unwrap(),
        getsid(None).unwrap()
    );

    let banner = format!("starting {name} master with 2 workers");
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let log = fs::read_to_string(&default_log).unwrap_or_default();
        if log.contains(&banner) {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "{log}");
        std::thread::sleep(Duration::from_millis(50));
    }

    Command::new(BIN)
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

    wait_for_process_exit(pid);
    for worker in workers {
        wait_for_process_exit(worker);
    }
    assert!(!sandbox.pidfile().exists());
    let _ = fs::remove_file(&default_log);
}
