//! PID file access and signal-0 liveness checks.

use std::io;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::debug;

use ssrelay_core::LifecycleState;

/// What a PID file on disk says.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidFile {
    Absent,
    /// Present but not a positive integer.
    Garbage,
    Pid(Pid),
}

/// Read and parse a PID file.
pub fn read(path: &Path) -> io::Result<PidFile> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(PidFile::Absent),
        Err(e) => return Err(e),
    };
    // 0 and negative values would address process groups
    Ok(match content.trim().parse::<i32>() {
        Ok(raw) if raw > 0 => PidFile::Pid(Pid::from_raw(raw)),
        _ => {
            debug!(path = %path.display(), content = content.trim(), "Unparseable PID file");
            PidFile::Garbage
        }
    })
}

/// Write `pid` to `path`.
pub fn write(path: &Path, pid: u32) -> io::Result<()> {
    std::fs::write(path, format!("{pid}\n"))
}

/// Remove a PID file; a missing file is not an error.
pub fn remove(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Signal-0 probe. `EPERM` means the process exists but belongs to someone else.
pub fn is_alive(pid: Pid) -> bool {
    match kill(pid, None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Running if the PID file names a live process, Stopped otherwise.
pub fn liveness(path: &Path) -> LifecycleState {
    match read(path) {
        Ok(PidFile::Pid(pid)) if is_alive(pid) => LifecycleState::Running,
        _ => LifecycleState::Stopped,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn absent_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xray.pid");
        assert_eq!(read(&path).unwrap(), PidFile::Absent);

        for junk in ["", "abc", "-1", "0", "12 34"] {
            std::fs::write(&path, junk).unwrap();
            assert_eq!(read(&path).unwrap(), PidFile::Garbage, "content {junk:?}");
        }
    }

    #[test]
    fn own_pid_is_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xray.pid");
        write(&path, std::process::id()).unwrap();
        assert!(matches!(read(&path).unwrap(), PidFile::Pid(_)));
        assert_eq!(liveness(&path), LifecycleState::Running);
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xray.pid");
        std::fs::write(&path, "1").unwrap();
        remove(&path).unwrap();
        remove(&path).unwrap();
        assert!(!path.exists());
        assert_eq!(liveness(&path), LifecycleState::Stopped);
    }
}
