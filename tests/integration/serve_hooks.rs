//! Runs a supervisor with an in-process runtime and fork hooks inside this
//! test process. Forking needs a single-threaded process, so this target has
//! no test harness.
#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    io::{self, BufRead, BufReader, Read, Write},
    net::TcpStream,
    panic,
    path::Path,
    process,
    time::{Duration, Instant},
};

use common::{
    free_port, is_process_alive, send_signal, wait_for_pid, wait_for_process_exit,
    wait_for_workers,
};
use nix::{
    sys::{
        signal::Signal,
        wait::{WaitStatus, waitpid},
    },
    unistd::{ForkResult, fork},
};
use prefork::{
    config::{RawConfig, SupervisorConfig},
    logs::init_logging,
    runtime::{Connection, ServeRuntime},
    supervisor::Supervisor,
};

fn main() {
    hooks_run_and_hangup_lets_in_flight_connection_finish();
    println!("test hooks_run_and_hangup_lets_in_flight_connection_finish ... ok");
}

/// Greets with the worker pid, then answers once the client has spoken.
fn greet_then_answer(mut connection: Connection) -> io::Result<()> {
    writeln!(connection, "{}", process::id())?;
    let mut request = [0u8; 1];
    connection.read_exact(&mut request)?;
    connection.write_all(b"done\n")
}

fn run_supervisor(dir: &Path, port: u16) -> ! {
    let outcome = panic::catch_unwind(|| {
        init_logging(Some("debug".parse().unwrap()), Some(dir.join("serve.log").as_path())).unwrap();
        let config = SupervisorConfig::from_raw(RawConfig {
            pool: Some(2),
            port: Some(port),
            pidfile: Some(dir.join("serve.pid")),
            timeout: Some(10),
            name: Some("serve-hooks".into()),
            ..Default::default()
        })
        .unwrap();

        let before = dir.join("before_fork");
        let hooks = dir.to_path_buf();
        Supervisor::new(config, ServeRuntime::new(greet_then_answer))
            .before_fork(move || fs::write(&before, process::id().to_string()).unwrap())
            .after_fork(move |index, pid| {
                fs::write(hooks.join(format!("after_fork-{index}")), pid.to_string()).unwrap()
            })
            .run()
            .is_ok()
    });
    process::exit(match outcome {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(_) => 2,
    });
}

fn hooks_run_and_hangup_lets_in_flight_connection_finish() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let pidfile = dir.path().join("serve.pid");
    let log = || fs::read_to_string(dir.path().join("serve.log")).unwrap_or_default();

    // SAFETY: nothing has started a second thread in this process yet.
    let supervisor = match unsafe { fork() }.unwrap() {
        ForkResult::Child => run_supervisor(dir.path(), port),
        ForkResult::Parent { child } => child,
    };

    let pid = wait_for_pid(&pidfile);
    assert_eq!(pid as i32, supervisor.as_raw());
    let workers = wait_for_workers(pid, 2);

    assert_eq!(wait_for_pid(&dir.path().join("before_fork")), pid);
    for index in 0..2 {
        let recorded = wait_for_pid(&dir.path().join(format!("after_fork-{index}")));
        assert!(workers.contains(&recorded), "{recorded} not in {workers:?}");
    }

    let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut reader = BufReader::new(client.try_clone().unwrap());
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    let serving: u32 = line.trim().parse().unwrap();
    assert!(workers.contains(&serving));

    send_signal(serving, Signal::SIGHUP);
    std::thread::sleep(Duration::from_millis(300));
    assert!(is_process_alive(serving), "worker quit with a connection in flight");

    (&client).write_all(b"x").unwrap();
    line.clear();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line, "done\n");

    wait_for_process_exit(serving);
    let exited = format!("(pid {serving}) exited with status 0");
    let deadline = Instant::now() + Duration::from_secs(5);
    while !log().contains(&exited) {
        assert!(Instant::now() < deadline, "{}", log());
        std::thread::sleep(Duration::from_millis(50));
    }

    send_signal(pid, Signal::SIGTERM);
    assert_eq!(waitpid(supervisor, None).unwrap(), WaitStatus::Exited(supervisor, 0));
    assert!(!pidfile.exists());
}
