//! Classic double-fork daemonize (spec.md §6 names daemonization as an
//! external collaborator; `start -d` still needs some implementation to be
//! runnable standalone).

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;

use nix::unistd::{dup2, fork, setsid, ForkResult};
use wireframe_core::error::{CoreError, ErrorKind};

/// Detaches the calling process from its controlling terminal: first fork
/// exits the parent so the child is no longer a process-group leader,
/// `setsid` starts a new session, second fork guarantees the daemon can
/// never reacquire a controlling terminal. Returns once running as the
/// final daemon process; the two throwaway parents `exit(0)` directly and
/// never return.
pub fn daemonize() -> Result<(), CoreError> {
    match unsafe { fork() }.map_err(map_fork_err)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().map_err(map_fork_err)?;

    match unsafe { fork() }.map_err(map_fork_err)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    redirect_standard_fds()
}

fn redirect_standard_fds() -> Result<(), CoreError> {
    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::Uncaught, err))?;
    let fd = devnull.as_raw_fd();
    for target in [0, 1, 2] {
        dup2(fd, target).map_err(map_fork_err)?;
    }
    Ok(())
}

fn map_fork_err(err: nix::Error) -> CoreError {
    wireframe_core::error::map_io_error(ErrorKind::Uncaught, err.into())
}
