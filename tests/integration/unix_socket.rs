#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    os::unix::{fs::PermissionsExt, net::UnixStream},
    time::Duration,
};

use common::{Sandbox, send_signal, spawn_supervisor, wait_for_exit, wait_for_pid, wait_for_workers};
use nix::sys::signal::Signal;

#[test]
fn path_socket_is_world_accessible_and_removed_on_shutdown() {
    let sandbox = Sandbox::new();
    let socket = sandbox.path("app.sock");
    let mut child = spawn_supervisor(&[
        "--pool",
        "2",
        "--socket",
        socket.to_str().unwrap(),
        "--pidfile",
        sandbox.pidfile().to_str().unwrap(),
        "--logfile",
        sandbox.logfile().to_str().unwrap(),
        "--",
        "sleep",
        "30",
    ]);

    let pid = wait_for_pid(&sandbox.pidfile());
    wait_for_workers(pid, 2);

    let mode = fs::metadata(&socket).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o777);
    UnixStream::connect(&socket).unwrap();

    send_signal(pid, Signal::SIGTERM);
    let status = wait_for_exit(&mut child, Duration::from_secs(15));
    assert!(status.success(), "{}", sandbox.log());
    assert!(!socket.exists());
    assert!(!sandbox.pidfile().exists());
}

#[test]
fn stale_socket_path_is_reclaimed() {
    let sandbox = Sandbox::new();
    let socket = sandbox.path("stale.sock");
    drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());

    let mut child = spawn_supervisor(&[
        "--socket",
        socket.to_str().unwrap(),
        "--pidfile",
        sandbox.pidfile().to_str().unwrap(),
        "--",
        "sleep",
        "30",
    ]);

    let pid = wait_for_pid(&sandbox.pidfile());
    UnixStream::connect(&socket).unwrap();

    send_signal(pid, Signal::SIGINT);
    assert!(wait_for_exit(&mut child, Duration::from_secs(15)).success());
    assert!(!socket.exists());
}
