use nix::sys::signal::Signal;
use nix::unistd::Pid;
use wireframe_core::error::{CoreError, ErrorKind};

/// The signal kit spec.md §4.4 names, as raw numbers so both the master's
/// blocking `signal_hook` iterator and a worker's `on_signal` watchers can
/// share the same constants.
pub const SIGINT: i32 = libc::SIGINT;
pub const SIGTERM: i32 = libc::SIGTERM;
pub const SIGUSR1: i32 = libc::SIGUSR1;
pub const SIGUSR2: i32 = libc::SIGUSR2;
pub const SIGQUIT: i32 = libc::SIGQUIT;
pub const SIGHUP: i32 = libc::SIGHUP;
pub const SIGCHLD: i32 = libc::SIGCHLD;

/// The full set the master registers with `signal_hook`.
pub const MASTER_SIGNALS: [i32; 7] = [
    SIGINT, SIGTERM, SIGUSR1, SIGUSR2, SIGQUIT, SIGHUP, SIGCHLD,
];

/// The subset a worker forwards to its own loop via `on_signal` — workers
/// never see `SIGCHLD` (they have no children) and treat `SIGINT`/
/// `SIGTERM` the same way as `SIGUSR1` (immediate graceful stop, since a
/// worker is never the one deciding whether a reload should be rolling).
pub const WORKER_SIGNALS: [i32; 5] = [SIGTERM, SIGUSR1, SIGUSR2, SIGQUIT, SIGHUP];

/// Sends `signum` to `pid`, mapping both the signal-number lookup and the
/// underlying `kill(2)` failure into a [`CoreError`].
pub fn send(pid: Pid, signum: i32) -> Result<(), CoreError> {
    let signal = Signal::try_from(signum)
        .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::Uncaught, err.into()))?;
    nix::sys::signal::kill(pid, signal)
        .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::Uncaught, err.into()))
}
