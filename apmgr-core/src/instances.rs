//! Run-directory layout and discovery of live instances.
//!
//! Every instance owns `<base>/apmgr.<pid>.run` with its pid file, interface
//! names and daemon state; shared state (interface markers, proc-fs
//! snapshots, lock files) lives in `<base>/apmgr.common`. Teardown decisions
//! like "am I the last instance using eth0" are answered by scanning the run
//! directories of processes that are still alive. Callers hold the mutex
//! around scans that feed a mutation.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use apmgr_netlink::process::pid_alive;
use apmgr_netlink::LockFile;

pub const PID_FILE: &str = "pid";
pub const WIFI_IFACE_FILE: &str = "wifi_iface";
pub const NAT_INTERNET_IFACE_FILE: &str = "nat_internet_iface";

#[derive(Debug, Clone)]
pub struct Paths {
    base: PathBuf,
}

impl Paths {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
        }
    }

    pub fn system() -> Self {
        Self::new(Path::new("/tmp"))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn common_dir(&self) -> PathBuf {
        self.base.join("apmgr.common")
    }

    pub fn run_dir(&self, pid: i32) -> PathBuf {
        self.base.join(format!("apmgr.{}.run", pid))
    }

    /// All run directories present on disk, live or stale.
    pub fn all_run_dirs(&self) -> Vec<(i32, PathBuf)> {
        let mut dirs = Vec::new();
        let Ok(entries) = fs::read_dir(&self.base) else {
            return dirs;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(pid) = name
                .strip_prefix("apmgr.")
                .and_then(|rest| rest.strip_suffix(".run"))
                .and_then(|pid| pid.parse::<i32>().ok())
            else {
                continue;
            };
            if entry.path().is_dir() {
                dirs.push((pid, entry.path()));
            }
        }
        dirs.sort_by_key(|(pid, _)| *pid);
        dirs
    }
}

/// A live instance as reconstructed from its run directory.
#[derive(Debug, Clone)]
pub struct Instance {
    pub pid: i32,
    pub run_dir: PathBuf,
    pub wifi_iface: Option<String>,
    pub internet_iface: Option<String>,
}

fn read_trimmed(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Instances whose recorded PID is still a running process. The recorded
/// pid file wins over the directory name; a mismatch marks a stale dir.
pub fn running_instances(paths: &Paths) -> Vec<Instance> {
    let mut running = Vec::new();
    for (dir_pid, run_dir) in paths.all_run_dirs() {
        let Some(pid) = read_trimmed(&run_dir.join(PID_FILE)).and_then(|s| s.parse::<i32>().ok())
        else {
            continue;
        };
        if pid != dir_pid || !pid_alive(pid) {
            continue;
        }
        running.push(Instance {
            pid,
            run_dir: run_dir.clone(),
            wifi_iface: read_trimmed(&run_dir.join(WIFI_IFACE_FILE)),
            internet_iface: read_trimmed(&run_dir.join(NAT_INTERNET_IFACE_FILE)),
        });
    }
    running
}

/// Run-dir scan under the instance mutex, so a directory another instance
/// is creating right now is never observed half-written.
pub fn locked_instances(paths: &Paths, lock: &LockFile) -> Result<Vec<Instance>> {
    lock.acquire()?;
    let instances = running_instances(paths);
    let _ = lock.release();
    Ok(instances)
}

/// `find_by_id` under the instance mutex.
pub fn locked_find_by_id(paths: &Paths, lock: &LockFile, id: &str) -> Result<Option<Instance>> {
    lock.acquire()?;
    let instance = find_by_id(paths, id);
    let _ = lock.release();
    Ok(instance)
}

/// Resolve a CLI `<id>` (PID or WiFi interface name) to an instance.
pub fn find_by_id(paths: &Paths, id: &str) -> Option<Instance> {
    let instances = running_instances(paths);
    if let Ok(pid) = id.parse::<i32>() {
        return instances.into_iter().find(|i| i.pid == pid);
    }
    instances
        .into_iter()
        .find(|i| i.wifi_iface.as_deref() == Some(id))
}

/// Whether a live instance other than `self_pid` shares the Internet-facing
/// interface. Controls whether per-interface forwarding may be restored.
pub fn internet_iface_in_use_by_other(paths: &Paths, iface: &str, self_pid: i32) -> bool {
    running_instances(paths)
        .iter()
        .any(|i| i.pid != self_pid && i.internet_iface.as_deref() == Some(iface))
}

/// Whether any live instance other than `self_pid` remains.
pub fn any_other_instance(paths: &Paths, self_pid: i32) -> bool {
    running_instances(paths)
        .iter()
        .any(|i| i.pid != self_pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_instance(paths: &Paths, pid: i32, wifi: &str, internet: Option<&str>) {
        let dir = paths.run_dir(pid);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(PID_FILE), pid.to_string()).unwrap();
        fs::write(dir.join(WIFI_IFACE_FILE), wifi).unwrap();
        if let Some(iface) = internet {
            fs::write(dir.join(NAT_INTERNET_IFACE_FILE), iface).unwrap();
        }
    }

    fn own_pid() -> i32 {
        std::process::id() as i32
    }

    // A pid that cannot be live: the kernel caps pids well below i32::MAX.
    const DEAD_PID: i32 = i32::MAX;

    #[test]
    fn live_instances_only() {
        let base = tempfile::tempdir().unwrap();
        let paths = Paths::new(base.path());

        write_instance(&paths, own_pid(), "xap0", Some("eth0"));
        write_instance(&paths, DEAD_PID, "xap1", Some("eth1"));
        // Not a run dir at all
        fs::create_dir(base.path().join("apmgr.common")).unwrap();

        let running = running_instances(&paths);
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].pid, own_pid());
        assert_eq!(running[0].wifi_iface.as_deref(), Some("xap0"));
        assert_eq!(running[0].internet_iface.as_deref(), Some("eth0"));
    }

    #[test]
    fn find_by_pid_and_by_iface() {
        let base = tempfile::tempdir().unwrap();
        let paths = Paths::new(base.path());
        write_instance(&paths, own_pid(), "xap0", None);

        assert!(find_by_id(&paths, &own_pid().to_string()).is_some());
        assert!(find_by_id(&paths, "xap0").is_some());
        assert!(find_by_id(&paths, "xap7").is_none());
        assert!(find_by_id(&paths, "12").is_none());
    }

    #[test]
    fn stale_dir_with_mismatched_pid_file_is_ignored() {
        let base = tempfile::tempdir().unwrap();
        let paths = Paths::new(base.path());

        let dir = paths.run_dir(4242);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(PID_FILE), own_pid().to_string()).unwrap();

        assert!(running_instances(&paths).is_empty());
    }

    #[test]
    fn shared_internet_iface_detection() {
        let base = tempfile::tempdir().unwrap();
        let paths = Paths::new(base.path());

        write_instance(&paths, own_pid(), "xap0", Some("eth0"));

        // Only our own instance uses eth0
        assert!(!internet_iface_in_use_by_other(&paths, "eth0", own_pid()));
        // From another instance's point of view our instance counts
        assert!(internet_iface_in_use_by_other(&paths, "eth0", DEAD_PID));
        assert!(!internet_iface_in_use_by_other(&paths, "wlan1", DEAD_PID));

        assert!(!any_other_instance(&paths, own_pid()));
        assert!(any_other_instance(&paths, DEAD_PID));
    }

    #[test]
    fn locked_scan_balances_the_mutex() {
        let base = tempfile::tempdir().unwrap();
        let paths = Paths::new(base.path());
        let lock = LockFile::init(base.path()).unwrap();
        write_instance(&paths, own_pid(), "xap0", None);

        let running = locked_instances(&paths, &lock).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(lock.count().unwrap(), 0);

        let found = locked_find_by_id(&paths, &lock, "xap0").unwrap();
        assert_eq!(found.unwrap().pid, own_pid());
        assert_eq!(lock.count().unwrap(), 0);
    }
}
