//! Binary entry point: loads a config file, resolves protocol codecs,
//! assembles one [`wireframe_worker::WorkerGroup`] per listener and either
//! boots a [`wireframe_worker::Master`] (`start`) or pokes an already
//! running one via its pid file (`stop`/`restart`/`reload`/`status`/
//! `connections`).

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use wireframe_core::config::ListenerConfig;
use wireframe_core::error::{CoreError, ErrorKind};
use wireframe_hosting::Command;
use wireframe_transport::Callbacks;
use wireframe_worker::WorkerGroup;

const DEFAULT_CONFIG_PATH: &str = "wireframe.yaml";
const DEFAULT_PID_FILE: &str = "wireframe.pid";

fn main() {
    init_logging();

    let raw_args: Vec<String> = std::env::args().skip(1).collect();
    let command = match wireframe_hosting::parse_args(&raw_args) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(64);
        }
    };

    let config_path = config_path_arg(&raw_args).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if let Err(err) = run(command, &config_path) {
        tracing::error!(error = %err, "wireframe command failed");
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// `--config <path>` is the only flag shared across every subcommand; it
/// isn't part of [`wireframe_hosting::Command`] since it applies uniformly
/// rather than varying per verb.
fn config_path_arg(args: &[String]) -> Option<PathBuf> {
    args.iter()
        .position(|a| a == "--config")
        .and_then(|idx| args.get(idx + 1))
        .map(PathBuf::from)
}

fn run(command: Command, config_path: &Path) -> Result<(), CoreError> {
    match command {
        Command::Start { daemonize } => start(config_path, daemonize),
        Command::Stop => stop(config_path),
        Command::Restart => {
            stop(config_path)?;
            start(config_path, false)
        }
        Command::Reload { group } => reload(config_path, group),
        Command::Status { dump } => status(config_path, dump),
        Command::Connections => connections(config_path),
    }
}

fn start(config_path: &Path, daemonize: bool) -> Result<(), CoreError> {
    let configs = wireframe_hosting::load_listener_configs(config_path)?;
    let groups = build_groups(configs)?;

    if daemonize {
        wireframe_hosting::daemonize()?;
    }

    let master = wireframe_worker::Master::new(groups)?;
    let code = master.run();
    std::process::exit(code);
}

fn build_groups(configs: Vec<ListenerConfig>) -> Result<Vec<WorkerGroup>, CoreError> {
    let registry = wireframe_hosting::builtin_registry();
    configs
        .into_iter()
        .map(|config| {
            let codec = config
                .protocol
                .as_deref()
                .and_then(|name| registry.get(name));
            Ok(WorkerGroup {
                config,
                codec,
                tls_config: None,
                callbacks: Rc::new(Callbacks::new()),
                on_stop: None,
            })
        })
        .collect()
}

fn master_pid(config_path: &Path) -> Result<nix::unistd::Pid, CoreError> {
    let configs = wireframe_hosting::load_listener_configs(config_path)?;
    let pid_file = configs
        .iter()
        .find_map(|cfg| cfg.pid_file.as_deref())
        .unwrap_or(DEFAULT_PID_FILE);
    wireframe_worker::pidfile::read(Path::new(pid_file))
}

fn stop(config_path: &Path) -> Result<(), CoreError> {
    let pid = master_pid(config_path)?;
    wireframe_worker::signals::send(pid, wireframe_worker::signals::SIGTERM)
}

fn reload(config_path: &Path, group: Option<String>) -> Result<(), CoreError> {
    let configs = wireframe_hosting::load_listener_configs(config_path)?;
    let pid_file = configs
        .iter()
        .find_map(|cfg| cfg.pid_file.as_deref())
        .unwrap_or(DEFAULT_PID_FILE);
    if let Some(name) = group {
        let target = wireframe_worker::reload_target_path(Path::new(pid_file));
        std::fs::write(&target, name)
            .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::Uncaught, err))?;
    }
    let pid = wireframe_worker::pidfile::read(Path::new(pid_file))?;
    wireframe_worker::signals::send(pid, wireframe_worker::signals::SIGUSR1)
}

fn status(config_path: &Path, dump: bool) -> Result<(), CoreError> {
    let configs = wireframe_hosting::load_listener_configs(config_path)?;
    let pid_file = configs
        .iter()
        .find_map(|cfg| cfg.pid_file.as_deref())
        .unwrap_or(DEFAULT_PID_FILE);
    let status_file = configs
        .iter()
        .find_map(|cfg| cfg.status_file.as_deref())
        .ok_or_else(|| CoreError::new(ErrorKind::Uncaught, "no listener declares a statusFile"))?;

    let pid = wireframe_worker::pidfile::read(Path::new(pid_file))?;
    if dump {
        wireframe_worker::signals::send(pid, wireframe_worker::signals::SIGUSR2)?;
        // Workers and the master write their snapshot files asynchronously
        // off the signal; give them a moment before reading back.
        thread::sleep(Duration::from_millis(200));
    }

    let contents = std::fs::read_to_string(status_file)
        .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::Uncaught, err))?;
    print!("{contents}");
    Ok(())
}

fn connections(config_path: &Path) -> Result<(), CoreError> {
    // Workers render their per-connection dump straight to their own log on
    // SIGQUIT (there's no separate connections file); forwarding the signal
    // here and pointing the caller at the logs is all this subcommand does.
    let pid = master_pid(config_path)?;
    wireframe_worker::signals::send(pid, wireframe_worker::signals::SIGQUIT)?;
    println!("sent SIGQUIT to master {pid}; connection dump written to each worker's log");
    Ok(())
}
