//! Snapshot and restore of proc-fs tunables.
//!
//! The controller flips `ip_forward` and friends for the lifetime of an AP
//! and must put the administrator's values back afterwards. Snapshots are
//! copies of the proc file contents into the shared conf directory; the proc
//! file itself is never moved or removed.

use std::fs;
use std::path::Path;

use crate::error::Result;

/// Copy the current value of `proc_path` to `saved_path`. An existing
/// snapshot is left alone so the first instance's value wins.
pub fn snapshot(proc_path: &Path, saved_path: &Path) -> Result<()> {
    if saved_path.exists() {
        log::debug!("snapshot {} already present", saved_path.display());
        return Ok(());
    }
    let value = fs::read_to_string(proc_path)?;
    fs::write(saved_path, value)?;
    log::debug!(
        "saved {} to {}",
        proc_path.display(),
        saved_path.display()
    );
    Ok(())
}

/// Write the saved value back into `proc_path` and drop the snapshot file.
/// A missing snapshot is a no-op; the tunable was never changed.
pub fn restore(saved_path: &Path, proc_path: &Path) -> Result<()> {
    let value = match fs::read_to_string(saved_path) {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    fs::write(proc_path, &value)?;
    fs::remove_file(saved_path)?;
    log::debug!(
        "restored {} from {}",
        proc_path.display(),
        saved_path.display()
    );
    Ok(())
}

/// Set a proc-fs tunable.
pub fn write_value(proc_path: &Path, value: &str) -> Result<()> {
    fs::write(proc_path, value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_then_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let tunable = dir.path().join("ip_forward");
        let saved = dir.path().join("ip_forward.saved");
        fs::write(&tunable, "0\n").unwrap();

        snapshot(&tunable, &saved).unwrap();
        write_value(&tunable, "1").unwrap();
        assert_eq!(fs::read_to_string(&tunable).unwrap(), "1");

        restore(&saved, &tunable).unwrap();
        assert_eq!(fs::read_to_string(&tunable).unwrap(), "0\n");
        assert!(!saved.exists());
    }

    #[test]
    fn first_snapshot_wins() {
        let dir = tempfile::tempdir().unwrap();
        let tunable = dir.path().join("forwarding");
        let saved = dir.path().join("forwarding.saved");

        fs::write(&tunable, "0").unwrap();
        snapshot(&tunable, &saved).unwrap();

        // A second instance snapshotting after the value changed must not
        // overwrite the original.
        fs::write(&tunable, "1").unwrap();
        snapshot(&tunable, &saved).unwrap();
        assert_eq!(fs::read_to_string(&saved).unwrap(), "0");
    }

    #[test]
    fn restore_without_snapshot_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let tunable = dir.path().join("forwarding");
        fs::write(&tunable, "1").unwrap();

        restore(&dir.path().join("missing.saved"), &tunable).unwrap();
        assert_eq!(fs::read_to_string(&tunable).unwrap(), "1");
    }
}
