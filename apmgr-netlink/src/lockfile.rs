//! Cross-process counting mutex built on advisory file locks.
//!
//! Two files cooperate: a global lock file shared by every apmgr process and
//! a per-process counter file. The counter makes the mutex recursive within
//! one process; the global `flock` provides mutual exclusion across
//! processes. The counter file's own lock is held only for the
//! read-modify-write, never across the (potentially blocking) global
//! acquisition, so one process waiting on the global lock cannot stall
//! another process's counter bookkeeping.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{NetError, Result};

const GLOBAL_LOCK_NAME: &str = "apmgr.all.lock";

fn flock(file: &File, op: libc::c_int) -> Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc != 0 {
        return Err(NetError::Lock(format!(
            "flock failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Recursive cross-process mutex.
///
/// Holds the global lock file open for the lifetime of the process so the
/// advisory lock survives as long as the counter is positive.
pub struct LockFile {
    global: File,
    global_path: PathBuf,
    counter_path: PathBuf,
}

impl LockFile {
    /// Initialize the lock pair under `dir`.
    ///
    /// Resets the per-process counter to 0 (a stale value from a crashed
    /// predecessor with the same PID must not wedge us) and opens or creates
    /// the global lock file with permissions that let any cooperating uid
    /// lock it. Safe against concurrent initialization by independent
    /// processes: everyone opens the same global file, and the counter file
    /// is keyed by PID.
    pub fn init(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let counter_path = dir.join(format!("apmgr.{}.lock", std::process::id()));
        fs::write(&counter_path, "0")?;

        let global_path = dir.join(GLOBAL_LOCK_NAME);
        let global = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o666)
            .open(&global_path)
            .map_err(|e| NetError::Lock(format!("open {}: {}", global_path.display(), e)))?;

        log::debug!(
            "lock files initialized: global={} counter={}",
            global_path.display(),
            counter_path.display()
        );
        Ok(Self {
            global,
            global_path,
            counter_path,
        })
    }

    fn open_counter(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.counter_path)
            .map_err(|e| NetError::Lock(format!("open {}: {}", self.counter_path.display(), e)))
    }

    fn read_counter(file: &mut File) -> Result<u32> {
        file.seek(SeekFrom::Start(0))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        buf.trim()
            .parse::<u32>()
            .map_err(|_| NetError::Lock(format!("corrupt counter value {:?}", buf.trim())))
    }

    fn write_counter(file: &mut File, value: u32) -> Result<()> {
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", value)?;
        Ok(())
    }

    /// Blocking, recursive acquire.
    ///
    /// Increments the per-process counter; on the 0 -> 1 transition also
    /// takes the global advisory lock. The counter lock is dropped before
    /// blocking on the global lock and re-taken afterwards.
    pub fn acquire(&self) -> Result<()> {
        let mut counter = self.open_counter()?;
        flock(&counter, libc::LOCK_EX)?;
        let value = Self::read_counter(&mut counter)?;

        if value == 0 {
            // Drop the counter lock while we may block on the global lock.
            flock(&counter, libc::LOCK_UN)?;
            flock(&self.global, libc::LOCK_EX)?;
            flock(&counter, libc::LOCK_EX)?;
        }

        let value = Self::read_counter(&mut counter)?;
        Self::write_counter(&mut counter, value + 1)?;
        flock(&counter, libc::LOCK_UN)?;
        log::trace!("mutex acquired (count {})", value + 1);
        Ok(())
    }

    /// Recursive release; releases the global lock on the 1 -> 0 transition.
    ///
    /// The counter never goes negative: releasing an unacquired mutex is a
    /// logged no-op rather than a panic, since cleanup paths may run with
    /// inconsistent bookkeeping.
    pub fn release(&self) -> Result<()> {
        let mut counter = self.open_counter()?;
        flock(&counter, libc::LOCK_EX)?;
        let value = Self::read_counter(&mut counter)?;

        if value > 0 {
            if value == 1 {
                flock(&self.global, libc::LOCK_UN)?;
            }
            Self::write_counter(&mut counter, value - 1)?;
            log::trace!("mutex released (count {})", value - 1);
        } else {
            log::warn!("mutex release with zero counter, ignoring");
        }

        flock(&counter, libc::LOCK_UN)?;
        Ok(())
    }

    /// Unconditionally drop the global lock and zero the counter.
    ///
    /// Used by the cleanup path, which must succeed even when the counter
    /// bookkeeping is inconsistent (e.g. teardown entered mid-acquire).
    pub fn force_release(&self) {
        let _ = flock(&self.global, libc::LOCK_UN);
        if let Ok(mut counter) = self.open_counter() {
            let _ = Self::write_counter(&mut counter, 0);
        }
    }

    /// Remove the per-process counter file. Final release for this process.
    pub fn remove(&self) {
        if let Err(e) = fs::remove_file(&self.counter_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "failed to remove counter file {}: {}",
                    self.counter_path.display(),
                    e
                );
            }
        }
    }

    /// Current counter value, read under the counter lock.
    pub fn count(&self) -> Result<u32> {
        let mut counter = self.open_counter()?;
        flock(&counter, libc::LOCK_EX)?;
        let value = Self::read_counter(&mut counter)?;
        flock(&counter, libc::LOCK_UN)?;
        Ok(value)
    }

    /// Path of the global lock file.
    pub fn global_path(&self) -> &Path {
        &self.global_path
    }
}
