//! The master process (spec.md §4.4 "Process model"): binds listening
//! sockets before any fork, forks N workers per listener group, and does
//! nothing else but supervise — reap, respawn, forward signals, render
//! status snapshots. Single-threaded; no event loop of its own.

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::time::Instant;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use signal_hook::iterator::Signals;

use wireframe_core::error::{CoreError, ErrorKind};
use wireframe_core::uri::{EndpointUri, TransportScheme};

use crate::context::{WorkerContext, WorkerGroup};
use crate::fault::ForkWindow;
use crate::pidfile;
use crate::signals::{self, MASTER_SIGNALS, SIGCHLD, SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
use crate::worker;

/// A listening socket bound once, before any worker for its group exists,
/// so all non-`reusePort` siblings inherit the identical fd across
/// `fork` (spec.md §4.4). Kept alive for the master's whole lifetime so a
/// later respawn can still inherit it.
enum Prebound {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
    Udp(std::net::UdpSocket),
    /// `reusePort` is set: each worker binds its own socket after fork
    /// instead of inheriting one from here.
    PerWorker,
}

struct GroupRuntime {
    group: WorkerGroup,
    prebound: Prebound,
    fork_window: ForkWindow,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Running,
    PendingReload,
    PendingShutdown,
}

struct WorkerDescriptor {
    group_index: usize,
    disposition: Disposition,
}

struct ReloadQueue {
    group_index: usize,
    pending: Vec<Pid>,
    in_flight: usize,
    bound: usize,
}

/// Owns every configured listener group and the pid-to-worker table
/// (spec.md §4.4 "The master maintains a mapping from pid to worker
/// descriptor").
pub struct Master {
    groups: Vec<GroupRuntime>,
    workers: HashMap<i32, WorkerDescriptor>,
    started_at: Instant,
    pid_file: Option<PathBuf>,
    status_file: Option<PathBuf>,
    reload_queues: Vec<ReloadQueue>,
    shutting_down: bool,
}

impl Master {
    pub fn new(groups: Vec<WorkerGroup>) -> Result<Self, CoreError> {
        let pid_file = groups
            .iter()
            .find_map(|g| g.config.pid_file.clone())
            .map(PathBuf::from);
        let status_file = groups
            .iter()
            .find_map(|g| g.config.status_file.clone())
            .map(PathBuf::from);

        let mut runtimes = Vec::with_capacity(groups.len());
        for group in groups {
            let prebound = prebind(&group)?;
            runtimes.push(GroupRuntime {
                group,
                prebound,
                fork_window: ForkWindow::new(),
            });
        }

        Ok(Self {
            groups: runtimes,
            workers: HashMap::new(),
            started_at: Instant::now(),
            pid_file,
            status_file,
            reload_queues: Vec::new(),
            shutting_down: false,
        })
    }

    /// Forks the initial worker pool, installs the signal kit, and blocks
    /// until every worker has exited after a graceful shutdown. Returns
    /// the process exit code.
    pub fn run(mut self) -> i32 {
        for index in 0..self.groups.len() {
            let count = self.groups[index].group.config.count.max(1);
            for _ in 0..count {
                if let Err(err) = self.spawn_worker(index) {
                    tracing::error!(error = %err, "failed to spawn initial worker pool");
                    return 70;
                }
            }
        }

        if let Some(path) = &self.pid_file {
            let _ = pidfile::write(path, Pid::this());
        }

        let mut signals = match Signals::new(MASTER_SIGNALS) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(error = %err, "master failed to install its signal handlers");
                return 70;
            }
        };

        for signum in &mut signals {
            if signum == SIGINT || signum == SIGTERM {
                self.begin_shutdown();
            } else if signum == SIGUSR1 {
                self.begin_reload();
            } else if signum == SIGUSR2 {
                self.emit_status();
            } else if signum == SIGQUIT {
                self.forward_all(SIGQUIT);
            } else if signum == SIGHUP {
                tracing::info!("master rotating its own log file on SIGHUP");
                self.forward_all(SIGHUP);
            } else if signum == SIGCHLD && self.reap() {
                break;
            }
        }

        if let Some(path) = &self.pid_file {
            pidfile::remove(path);
        }

        0
    }

    fn build_context(&self, group_index: usize) -> WorkerContext {
        let runtime = &self.groups[group_index];
        let listener_fd = match &runtime.prebound {
            Prebound::Tcp(l) => Some(l.as_raw_fd()),
            Prebound::Unix(l) => Some(l.as_raw_fd()),
            Prebound::Udp(s) => Some(s.as_raw_fd()),
            Prebound::PerWorker => None,
        };
        WorkerContext {
            group_name: runtime.group.config.name.clone(),
            config: runtime.group.config.clone(),
            listener_fd,
            codec: runtime.group.codec.clone(),
            tls_config: runtime.group.tls_config.clone(),
            callbacks: runtime.group.callbacks.clone(),
            on_stop: runtime.group.on_stop.clone(),
        }
    }

    fn spawn_worker(&mut self, group_index: usize) -> Result<(), CoreError> {
        let ctx = self.build_context(group_index);
        // Safety: the master has no threads of its own at this point —
        // the event-loop's background signal thread only exists inside a
        // worker, spawned after this fork returns in the child.
        let outcome = unsafe { fork() }
            .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::Uncaught, err.into()))?;
        match outcome {
            ForkResult::Parent { child } => {
                self.workers.insert(
                    child.as_raw(),
                    WorkerDescriptor {
                        group_index,
                        disposition: Disposition::Running,
                    },
                );
                Ok(())
            }
            ForkResult::Child => {
                let code = worker::run(ctx);
                std::process::exit(code);
            }
        }
    }

    fn respawn_after_crash(&mut self, group_index: usize) {
        let runtime = &mut self.groups[group_index];
        runtime.fork_window.record(Instant::now());
        if runtime.fork_window.is_crash_looping() {
            tracing::error!(
                group = %runtime.group.config.name,
                "worker group is crash-looping (8 forks within 1s); aborting master"
            );
            std::process::exit(70);
        }
        if let Err(err) = self.spawn_worker(group_index) {
            tracing::error!(error = %err, "failed to respawn crashed worker");
        }
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        tracing::info!("master received shutdown signal, stopping all workers");
        for (pid, descriptor) in self.workers.iter_mut() {
            descriptor.disposition = Disposition::PendingShutdown;
            let _ = signals::send(Pid::from_raw(*pid), SIGTERM);
        }
        if self.workers.is_empty() {
            // Nothing to wait for; the run loop's next `Signals` iteration
            // would block forever on an empty worker set otherwise.
            std::process::exit(0);
        }
    }

    /// Rolling reload (spec.md §4.4 `SIGUSR1`): queue every running
    /// worker per group, but only ever have `reloadable` of them mid-exit
    /// at once.
    fn begin_reload(&mut self) {
        if self.shutting_down {
            return;
        }
        let target_group = self.take_reload_target();
        if let Some(name) = &target_group {
            tracing::info!(group = %name, "master starting rolling reload for one group");
        } else {
            tracing::info!("master starting rolling reload for every group");
        }
        for index in 0..self.groups.len() {
            if let Some(name) = &target_group {
                if &self.groups[index].group.config.name != name {
                    continue;
                }
            }
            let bound = self.groups[index].group.config.reload_concurrency();
            if bound == 0 {
                continue;
            }
            let pending: Vec<Pid> = self
                .workers
                .iter()
                .filter(|(_, d)| d.group_index == index && d.disposition == Disposition::Running)
                .map(|(pid, _)| Pid::from_raw(*pid))
                .collect();
            if pending.is_empty() {
                continue;
            }
            let mut queue = ReloadQueue {
                group_index: index,
                pending,
                in_flight: 0,
                bound: bound.max(1),
            };
            self.drain_reload_queue(&mut queue);
            self.reload_queues.push(queue);
        }
    }

    /// Consumes the one-shot reload-target file the `reload -g` CLI
    /// subcommand drops next to the pid file, if any, so a single
    /// `SIGUSR1` can still be scoped to one listener group.
    fn take_reload_target(&self) -> Option<String> {
        let pid_file = self.pid_file.as_ref()?;
        let path = reload_target_path(pid_file);
        let name = std::fs::read_to_string(&path).ok()?;
        let _ = std::fs::remove_file(&path);
        Some(name.trim().to_string())
    }

    fn drain_reload_queue(&mut self, queue: &mut ReloadQueue) {
        while queue.in_flight < queue.bound {
            let Some(pid) = queue.pending.pop() else { break };
            if let Some(descriptor) = self.workers.get_mut(&pid.as_raw()) {
                descriptor.disposition = Disposition::PendingReload;
                let _ = signals::send(pid, SIGUSR1);
                queue.in_flight += 1;
            }
        }
    }

    fn forward_all(&self, signum: i32) {
        for pid in self.workers.keys() {
            let _ = signals::send(Pid::from_raw(*pid), signum);
        }
    }

    fn emit_status(&self) {
        tracing::info!("master forwarding SIGUSR2 to all workers for a status snapshot");
        self.forward_all(SIGUSR2);
        let Some(status_file) = &self.status_file else { return };

        let mut out = String::new();
        {
            use std::fmt::Write as _;
            let _ = writeln!(out, "[master]");
            let _ = writeln!(out, "pid = {}", std::process::id());
            let _ = writeln!(out, "uptime_secs = {}", self.started_at.elapsed().as_secs());
            let _ = writeln!(out, "workers = {}", self.workers.len());
        }

        for pid in self.workers.keys() {
            let per_worker_path = format!("{}.{}", status_file.display(), pid);
            if let Ok(section) = std::fs::read_to_string(&per_worker_path) {
                out.push('\n');
                out.push_str(&section);
            }
        }

        if let Err(err) = std::fs::write(status_file, out) {
            tracing::warn!(error = %err, "failed to write aggregated status file");
        }
    }

    /// Reaps every exited child this tick; returns `true` once the master
    /// should stop its signal loop (a graceful shutdown with no workers
    /// left).
    fn reap(&mut self) -> bool {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    self.on_worker_exited(pid);
                }
                Ok(_) => continue,
            }
        }
        self.shutting_down && self.workers.is_empty()
    }

    fn on_worker_exited(&mut self, pid: Pid) {
        let Some(descriptor) = self.workers.remove(&pid.as_raw()) else {
            return;
        };
        match descriptor.disposition {
            Disposition::PendingShutdown => {
                tracing::info!(pid = pid.as_raw(), "worker exited during shutdown");
            }
            Disposition::PendingReload => {
                tracing::info!(pid = pid.as_raw(), "worker exited for reload, respawning");
                if let Err(err) = self.spawn_worker(descriptor.group_index) {
                    tracing::error!(error = %err, "failed to respawn reloaded worker");
                }
                let index = self
                    .reload_queues
                    .iter()
                    .position(|q| q.group_index == descriptor.group_index);
                if let Some(index) = index {
                    let mut queue = self.reload_queues.remove(index);
                    queue.in_flight = queue.in_flight.saturating_sub(1);
                    self.drain_reload_queue(&mut queue);
                    if !(queue.pending.is_empty() && queue.in_flight == 0) {
                        self.reload_queues.push(queue);
                    }
                }
            }
            Disposition::Running => {
                tracing::warn!(pid = pid.as_raw(), "worker exited unexpectedly, respawning");
                self.respawn_after_crash(descriptor.group_index);
            }
        }
    }
}

/// Path of the one-shot file a `reload -g <name>` CLI invocation writes
/// next to the pid file before sending `SIGUSR1`, naming the single
/// listener group that reload should target.
pub fn reload_target_path(pid_file: &std::path::Path) -> PathBuf {
    let mut name = pid_file.as_os_str().to_owned();
    name.push(".reload-target");
    PathBuf::from(name)
}

fn prebind(group: &WorkerGroup) -> Result<Prebound, CoreError> {
    let uri = EndpointUri::parse(&group.config.listen)
        .map_err(|err| CoreError::new(ErrorKind::ConnectFail, err.to_string()))?;

    match uri.transport() {
        Some(TransportScheme::Unix) => {
            let path = std::path::Path::new(&uri.path);
            let _ = std::fs::remove_file(path);
            let listener = std::os::unix::net::UnixListener::bind(path)
                .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?;
            Ok(Prebound::Unix(listener))
        }
        Some(TransportScheme::Udp) => {
            if group.config.reuse_port {
                return Ok(Prebound::PerWorker);
            }
            let addr = format!("{}:{}", uri.host, uri.port.unwrap_or(0))
                .to_socket_addrs()
                .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?
                .next()
                .ok_or_else(|| {
                    CoreError::new(
                        ErrorKind::ConnectFail,
                        "listen address did not resolve to any socket address",
                    )
                })?;
            let socket = socket2::Socket::new(
                socket2::Domain::for_address(addr),
                socket2::Type::DGRAM,
                Some(socket2::Protocol::UDP),
            )
            .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?;
            socket
                .set_reuse_address(true)
                .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?;
            socket
                .bind(&addr.into())
                .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?;
            let socket = unsafe {
                std::net::UdpSocket::from_raw_fd(std::os::unix::io::IntoRawFd::into_raw_fd(socket))
            };
            Ok(Prebound::Udp(socket))
        }
        _ => {
            if group.config.reuse_port {
                return Ok(Prebound::PerWorker);
            }
            let addr = format!("{}:{}", uri.host, uri.port.unwrap_or(0))
                .to_socket_addrs()
                .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?
                .next()
                .ok_or_else(|| {
                    CoreError::new(
                        ErrorKind::ConnectFail,
                        "listen address did not resolve to any socket address",
                    )
                })?;
            let socket = socket2::Socket::new(
                socket2::Domain::for_address(addr),
                socket2::Type::STREAM,
                Some(socket2::Protocol::TCP),
            )
            .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?;
            socket
                .set_reuse_address(true)
                .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?;
            socket
                .bind(&addr.into())
                .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?;
            socket
                .listen(1024)
                .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?;
            let listener = unsafe {
                std::net::TcpListener::from_raw_fd(std::os::unix::io::IntoRawFd::into_raw_fd(socket))
            };
            Ok(Prebound::Tcp(listener))
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    #[traced_test]
    #[test]
    fn begin_reload_logs_when_no_groups_are_configured() {
        let mut master = Master::new(Vec::new()).expect("no groups means nothing to prebind");
        master.begin_reload();
        assert!(logs_contain("master starting rolling reload for every group"));
    }
}
