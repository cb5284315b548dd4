#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use assert_cmd::Command;
use common::{
    BIN, Sandbox, connect, is_process_alive, processes_mentioning, read_pid, send_signal,
    spawn_supervisor, wait_for_exit, wait_for_pid, wait_for_pid_change, wait_for_process_exit,
    wait_for_workers, worker_pids,
};
use nix::sys::signal::Signal;

#[test]
fn failing_restart_command_rolls_back() {
    let sandbox = Sandbox::new();
    let config = sandbox.write_config(
        2,
        "restart_timeout: 5\nrestart_command: [\"/bin/sh\", \"-c\", \"exit 1\"]\n",
    );
    let mut child = spawn_supervisor(&["--config", config.to_str().unwrap()]);

    let pid = wait_for_pid(&sandbox.pidfile());
    let workers = wait_for_workers(pid, 2);
    let original = fs::read(sandbox.pidfile()).unwrap();

    send_signal(pid, Signal::SIGHUP);
    // The replacement exits at once; give the supervisor time to notice and undo.
    thread::sleep(Duration::from_secs(2));

    assert!(child.try_wait().unwrap().is_none(), "{}", sandbox.log());
    assert_eq!(fs::read(sandbox.pidfile()).unwrap(), original);
    assert!(!sandbox.path("prefork.pid.old").exists());
    assert_eq!(worker_pids(pid), workers);
    assert!(sandbox.log().contains("Restart rolled back"), "{}", sandbox.log());
    assert!(connect(sandbox.port).is_ok());

    send_signal(pid, Signal::SIGTERM);
    assert!(wait_for_exit(&mut child, Duration::from_secs(15)).success());
    assert!(!sandbox.pidfile().exists());
}

#[test]
fn successful_restart_hands_off_without_refusing_connections() {
    let sandbox = Sandbox::new();
    let config_path = sandbox.path("prefork.yaml");
    let config = sandbox.write_config(
        2,
        &format!(
            "restart_timeout: 15\nrestart_command: [\"{BIN}\", \"start\", \"--config\", \"{}\"]\n",
            config_path.display()
        ),
    );
    assert_eq!(config, config_path);

    let mut old = spawn_supervisor(&["--config", config.to_str().unwrap()]);
    let old_pid = wait_for_pid(&sandbox.pidfile());
    wait_for_workers(old_pid, 2);

    let stop = Arc::new(AtomicBool::new(false));
    let failures = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::new(AtomicUsize::new(0));
    let prober = {
        let (stop, failures, attempts) = (stop.clone(), failures.clone(), attempts.clone());
        let port = sandbox.port;
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                attempts.fetch_add(1, Ordering::SeqCst);
                if connect(port).is_err() {
                    failures.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(25));
            }
        })
    };

    Command::new(BIN)
        .args(["restart", "--pidfile", sandbox.pidfile().to_str().unwrap()])
        .assert()
        .success();

    let new_pid = wait_for_pid_change(&sandbox.pidfile(), old_pid, Duration::from_secs(20));
    let status = wait_for_exit(&mut old, Duration::from_secs(20));
    assert!(status.success(), "old supervisor: {status:?}\n{}", sandbox.log());

    stop.store(true, Ordering::SeqCst);
    prober.join().unwrap();
    assert!(attempts.load(Ordering::SeqCst) > 0);
    assert_eq!(
        failures.load(Ordering::SeqCst),
        0,
        "connections were refused during handoff\n{}",
        sandbox.log()
    );

    assert!(is_process_alive(new_pid));
    assert_eq!(wait_for_workers(new_pid, 2).len(), 2);
    assert!(!sandbox.path("prefork.pid.old").exists());
    assert!(connect(sandbox.port).is_ok());

    send_signal(new_pid, Signal::SIGTERM);
    wait_for_process_exit(new_pid);
    common::wait_for_path_removed(&sandbox.pidfile());
}

#[test]
fn late_replacement_of_daemonized_supervisor_gives_up_after_rollback() {
    let sandbox = Sandbox::new();
    let config_path = sandbox.path("prefork.yaml");
    // The replacement ignores the rollback's SIGTERM and only starts after
    // the restart has already timed out.
    let config = sandbox.write_config(
        2,
        &format!(
            "daemonize: true\nrestart_timeout: 1\nrestart_command: [\"/bin/sh\", \"-c\", \"trap '' TERM; sleep 2; exec {BIN} start --config {}\"]\n",
            config_path.display()
        ),
    );
    let config_arg = config.to_str().unwrap();

    let mut launcher = spawn_supervisor(&["--config", config_arg]);
    assert!(wait_for_exit(&mut launcher, Duration::from_secs(10)).success());
    let pid = wait_for_pid(&sandbox.pidfile());
    let workers = wait_for_workers(pid, 2);
    let original = fs::read(sandbox.pidfile()).unwrap();

    send_signal(pid, Signal::SIGHUP);
    sandbox.wait_for_log("Restart rolled back", Duration::from_secs(20));

    assert!(
        sandbox.log().contains("Previous supervisor kept the socket"),
        "{}",
        sandbox.log()
    );
    assert_eq!(fs::read(sandbox.pidfile()).unwrap(), original);
    assert!(!sandbox.path("prefork.pid.old").exists());
    assert_eq!(processes_mentioning(config_arg), vec![pid], "{}", sandbox.log());
    assert_eq!(worker_pids(pid), workers);
    assert!(connect(sandbox.port).is_ok());

    send_signal(pid, Signal::SIGTERM);
    wait_for_process_exit(pid);
    common::wait_for_path_removed(&sandbox.pidfile());
}

#[test]
fn interrupt_during_restart_aborts_and_shuts_down() {
    let sandbox = Sandbox::new();
    let marker = sandbox.path("replacement.pid");
    let config = sandbox.write_config(
        2,
        &format!(
            "restart_timeout: 30\nrestart_command: [\"/bin/sh\", \"-c\", \"echo $$ > {}; exec sleep 30\"]\n",
            marker.display()
        ),
    );
    let mut child = spawn_supervisor(&["--config", config.to_str().unwrap()]);

    let pid = wait_for_pid(&sandbox.pidfile());
    let workers = wait_for_workers(pid, 2);

    send_signal(pid, Signal::SIGHUP);
    let replacement = wait_for_pid(&marker);
    assert!(is_process_alive(replacement));

    send_signal(pid, Signal::SIGINT);
    let status = wait_for_exit(&mut child, Duration::from_secs(20));
    assert!(status.success(), "exit status {status:?}\n{}", sandbox.log());

    wait_for_process_exit(replacement);
    for worker in workers {
        wait_for_process_exit(worker);
    }
    assert_eq!(read_pid(&sandbox.pidfile()), None);
    assert!(!sandbox.pidfile().exists());
    assert!(!sandbox.path("prefork.pid.old").exists());
}
