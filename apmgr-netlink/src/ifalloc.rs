//! Virtual interface name allocation backed by marker files.
//!
//! Names are `<prefix><n>` with the lowest free `n` winning. A name is taken
//! when it is a live kernel interface or a marker file exists under the
//! shared `ifaces` directory. The whole scan-and-claim runs as one mutex
//! critical section so two processes can never claim the same name.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{NetError, Result};
use crate::lockfile::LockFile;

pub struct IfaceAllocator {
    dir: PathBuf,
    lock: Arc<LockFile>,
    sys_net: PathBuf,
}

impl IfaceAllocator {
    pub fn new(common_dir: &Path, lock: Arc<LockFile>) -> Self {
        Self {
            dir: common_dir.join("ifaces"),
            lock,
            sys_net: PathBuf::from("/sys/class/net"),
        }
    }

    /// Override the live-interface root. Test hook.
    #[cfg(test)]
    pub fn with_sys_net(mut self, sys_net: &Path) -> Self {
        self.sys_net = sys_net.to_path_buf();
        self
    }

    fn is_live_interface(&self, name: &str) -> bool {
        self.sys_net.join(name).exists()
    }

    fn marker(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Claim the first free `<prefix><n>` and create its marker file.
    pub fn allocate(&self, prefix: &str) -> Result<String> {
        self.lock.acquire()?;
        let result = self.allocate_locked(prefix);
        self.lock.release()?;
        result
    }

    fn allocate_locked(&self, prefix: &str) -> Result<String> {
        fs::create_dir_all(&self.dir)?;
        for i in 0..u32::MAX {
            let name = format!("{}{}", prefix, i);
            if self.is_live_interface(&name) || self.marker(&name).exists() {
                continue;
            }
            fs::File::create(self.marker(&name))
                .map_err(|e| NetError::Allocation(format!("claim {}: {}", name, e)))?;
            log::debug!("allocated interface name {}", name);
            return Ok(name);
        }
        Err(NetError::Allocation(format!(
            "no free name with prefix {}",
            prefix
        )))
    }

    /// Release a previously allocated name.
    ///
    /// Removing a name that was never allocated, or whose interface is still
    /// live, is a safe no-op: cleanup paths call this unconditionally.
    pub fn deallocate(&self, name: &str) -> Result<()> {
        self.lock.acquire()?;
        let marker = self.marker(name);
        if marker.exists() && !self.is_live_interface(name) {
            if let Err(e) = fs::remove_file(&marker) {
                log::warn!("failed to remove marker {}: {}", marker.display(), e);
            } else {
                log::debug!("deallocated interface name {}", name);
            }
        }
        self.lock.release()?;
        Ok(())
    }
}
