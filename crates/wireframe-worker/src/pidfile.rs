use std::fs;
use std::path::Path;

use nix::unistd::Pid;
use wireframe_core::error::{CoreError, ErrorKind};

/// Writes the master pid to `path` (spec.md §6 "Persisted state"). Always
/// overwrites; the caller removes the file on clean exit.
pub fn write(path: &Path, pid: Pid) -> Result<(), CoreError> {
    fs::write(path, format!("{}\n", pid.as_raw()))
        .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::Uncaught, err))
}

/// Reads back a previously written pid file, for `stop`/`reload`/`status`
/// CLI subcommands that act on an already-running master.
pub fn read(path: &Path) -> Result<Pid, CoreError> {
    let contents = fs::read_to_string(path)
        .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::Uncaught, err))?;
    let raw: i32 = contents
        .trim()
        .parse()
        .map_err(|_| CoreError::new(ErrorKind::Uncaught, "pid file contents are not a number"))?;
    Ok(Pid::from_raw(raw))
}

pub fn remove(path: &Path) {
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_temp_file() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("wireframe-worker-test-{}.pid", std::process::id()));
        write(&path, Pid::from_raw(4242)).unwrap();
        let read_back = read(&path).unwrap();
        assert_eq!(read_back.as_raw(), 4242);
        remove(&path);
        assert!(!path.exists());
    }
}
