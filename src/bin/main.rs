use std::{error::Error, process::ExitCode, time::Duration};

use tracing::{error, info};

use prefork::{
    cli::{Cli, Commands, StartArgs, parse_args},
    daemon,
    logs::init_logging,
    runtime::ExecRuntime,
    supervisor::{Exit, Supervisor},
};

fn main() -> ExitCode {
    let args = parse_args();
    match run(args) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            eprintln!("prefork: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Cli) -> Result<ExitCode, Box<dyn Error>> {
    match args.command {
        Commands::Start(start) => {
            let config = start.load()?;
            init_logging(args.log_level, config.log_path().as_deref())?;
            start_supervisor(start, config)
        }
        Commands::Stop { target, timeout } => {
            init_logging(args.log_level, None)?;
            let pidfile = target.pidfile()?;
            let killed = daemon::stop(&pidfile, Duration::from_secs(timeout))?;
            if killed {
                println!("supervisor killed after {timeout}s");
            } else {
                println!("supervisor stopped");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Restart { target } => {
            init_logging(args.log_level, None)?;
            let pid = daemon::request_restart(&target.pidfile()?)?;
            println!("restart requested for supervisor {pid}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { target } => {
            init_logging(args.log_level, None)?;
            let pidfile = target.pidfile()?;
            match daemon::running_pid(&pidfile)? {
                Some(pid) => {
                    println!("running (pid {pid})");
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    println!("not running");
                    Ok(ExitCode::from(1))
                }
            }
        }
    }
}

fn start_supervisor(
    start: StartArgs,
    config: prefork::config::SupervisorConfig,
) -> Result<ExitCode, Box<dyn Error>> {
    let worker = config.worker_command.clone().ok_or_else(|| {
        format!(
            "no worker command given; pass it after `--` or set `worker` in {}",
            start
                .config
                .as_deref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "the config file".into())
        )
    })?;

    let runtime = ExecRuntime::new(worker)?;
    match Supervisor::new(config, runtime).run()? {
        Exit::Shutdown(signal) => info!("Exited after {signal}"),
        Exit::HandedOff { replacement } => info!("Supervisor {replacement} took over"),
        Exit::Rejected => {
            error!("Previous supervisor rolled back the restart");
            return Ok(ExitCode::FAILURE);
        }
    }
    Ok(ExitCode::SUCCESS)
}
