//! Process lookup and signalling via the `/proc` filesystem.
//!
//! `pidof`/`kill` equivalents without shelling out: PID directories are read
//! directly and signals are delivered with `libc::kill`.

use std::fs;
use std::path::Path;

use crate::error::{NetError, Result};

/// Find PIDs whose process name (`/proc/<pid>/comm`) matches `name` exactly.
pub fn pidof(name: &str) -> Result<Vec<i32>> {
    if name.is_empty() {
        return Err(NetError::InvalidInput("process name cannot be empty".into()));
    }

    let mut pids = Vec::new();
    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        let pid: i32 = match entry.file_name().to_string_lossy().parse() {
            Ok(pid) => pid,
            Err(_) => continue,
        };
        if let Ok(comm) = fs::read_to_string(format!("/proc/{}/comm", pid)) {
            if comm.trim() == name {
                pids.push(pid);
            }
        }
    }
    Ok(pids)
}

/// Whether a PID refers to a live process.
pub fn pid_alive(pid: i32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

/// Send `signal` to `pid`.
pub fn signal_pid(pid: i32, signal: i32) -> Result<()> {
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        return Err(NetError::CommandFailed(format!(
            "kill({}, {}): {}",
            pid,
            signal,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Send `signal` to every process named `name`. Returns the count signalled.
pub fn signal_name(name: &str, signal: i32) -> Result<usize> {
    let mut signalled = 0;
    for pid in pidof(name)? {
        if signal_pid(pid, signal).is_ok() {
            log::debug!("signalled {} (pid {}) with {}", name, pid, signal);
            signalled += 1;
        }
    }
    Ok(signalled)
}

/// Read a PID file and signal the recorded process. Missing or malformed
/// files are ignored; cleanup paths call this for every `*.pid` they find.
pub fn kill_from_pidfile(path: &Path, signal: i32) {
    let Ok(content) = fs::read_to_string(path) else {
        return;
    };
    let Ok(pid) = content.trim().parse::<i32>() else {
        log::warn!("pid file {} is malformed, skipping", path.display());
        return;
    };
    if pid > 0 {
        if let Err(e) = signal_pid(pid, signal) {
            log::debug!("kill via {} failed: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id() as i32));
        // PID 0 is never a /proc entry
        assert!(!pid_alive(0));
    }

    #[test]
    fn pidof_rejects_empty_name() {
        assert!(pidof("").is_err());
    }

    #[test]
    fn signal_zero_probes_own_process() {
        // Signal 0 performs permission/existence checks only.
        signal_pid(std::process::id() as i32, 0).unwrap();
        assert!(signal_pid(-99999, 0).is_err());
    }

    #[test]
    fn kill_from_pidfile_ignores_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.pid");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "not-a-pid").unwrap();
        // Must not panic or signal anything.
        kill_from_pidfile(&path, 0);
        kill_from_pidfile(&dir.path().join("missing.pid"), 0);
    }
}
