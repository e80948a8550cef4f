//! Teardown of everything an instance acquired.
//!
//! One idempotent pass, callable from the clean-exit path, the fatal path
//! and argument-validation bailouts alike. Every step is best effort: a
//! failed restore is logged and the remaining steps still run, since a
//! partially torn down instance must not block the rest of the cleanup.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use apmgr_netlink::process::kill_from_pidfile;
use apmgr_netlink::{
    interface, sysctl, IfaceAllocator, IptablesManager, LockFile, NetworkManager, Rule,
    SavedNetState,
};

use crate::instances::{self, Paths};
use crate::signals::SignalGuard;

/// Everything acquired during bring-up that teardown must release.
///
/// Fields are populated as the controller progresses, so a teardown entered
/// at any stage releases exactly what exists so far.
pub struct Resources {
    pub paths: Paths,
    pub pid: i32,
    pub lock: Arc<LockFile>,
    pub run_dir: PathBuf,
    /// Interface the AP ran on (virtual or physical)
    pub ap_iface: Option<String>,
    /// Virtual interface created in the kernel, if any
    pub virt_iface: Option<String>,
    pub bridge_iface: Option<String>,
    pub bridge_created: bool,
    pub internet_iface: Option<String>,
    /// Internet iface state captured before bridging
    pub saved_net: Option<SavedNetState>,
    /// (iface, mac) to put back when the MAC was changed
    pub original_mac: Option<(String, String)>,
    pub nat_rules: Vec<Rule>,
    pub dns_rules: Vec<Rule>,
    pub dhcp_rule: Option<Rule>,
    /// Allocator marker names to give back
    pub allocated_names: Vec<String>,
    pub watchdog: Option<crate::entropy::EntropyWatchdog>,
}

impl Resources {
    pub fn new(paths: Paths, lock: Arc<LockFile>) -> Self {
        let pid = process::id() as i32;
        let run_dir = paths.run_dir(pid);
        Self {
            paths,
            pid,
            lock,
            run_dir,
            ap_iface: None,
            virt_iface: None,
            bridge_iface: None,
            bridge_created: false,
            internet_iface: None,
            saved_net: None,
            original_mac: None,
            nat_rules: Vec::new(),
            dns_rules: Vec::new(),
            dhcp_rule: None,
            allocated_names: Vec::new(),
            watchdog: None,
        }
    }
}

static TEARDOWN_DONE: AtomicBool = AtomicBool::new(false);

/// SIGTERM every process recorded in a `*.pid` file under `dir`.
fn kill_recorded_children(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().ends_with(".pid") {
            kill_from_pidfile(&entry.path(), libc::SIGTERM);
        }
    }
}

/// Release everything in reverse bring-up order. Runs at most once per
/// process; later calls return immediately.
pub fn teardown(res: &mut Resources, nm: &mut NetworkManager) {
    if TEARDOWN_DONE.swap(true, Ordering::SeqCst) {
        return;
    }
    log::info!("doing cleanup...");

    let _ = res.lock.acquire();

    if let Some(mut watchdog) = res.watchdog.take() {
        watchdog.stop();
    }

    if res.run_dir.exists() {
        kill_recorded_children(&res.run_dir);
        if let Err(e) = fs::remove_dir_all(&res.run_dir) {
            log::warn!("failed to remove {}: {}", res.run_dir.display(), e);
        }
    }

    let common = res.paths.common_dir();

    if let Some(internet) = res.internet_iface.clone() {
        if !instances::internet_iface_in_use_by_other(&res.paths, &internet, res.pid) {
            let saved = common.join(format!("{}_forwarding", internet));
            let target = PathBuf::from(format!("/proc/sys/net/ipv4/conf/{}/forwarding", internet));
            if let Err(e) = sysctl::restore(&saved, &target) {
                log::warn!("failed to restore forwarding on {}: {}", internet, e);
            }
        }
    }

    // The run-dir scan and the restore below are not atomic with respect to
    // a brand-new instance starting right now; its LOCKED_INIT snapshot
    // races this restore.
    if !instances::any_other_instance(&res.paths, res.pid) {
        kill_recorded_children(&common);
        let _ = sysctl::restore(
            &common.join("ip_forward"),
            Path::new("/proc/sys/net/ipv4/ip_forward"),
        );
        let _ = sysctl::restore(
            &common.join("bridge-nf-call-iptables"),
            Path::new("/proc/sys/net/bridge/bridge-nf-call-iptables"),
        );
        if let Err(e) = fs::remove_dir_all(&common) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove {}: {}", common.display(), e);
            }
        }
    }

    match IptablesManager::new() {
        Ok(ipt) => {
            ipt.delete_rules(&res.nat_rules);
            ipt.delete_rules(&res.dns_rules);
            if let Some(rule) = &res.dhcp_rule {
                if let Err(e) = ipt.delete_rule(rule) {
                    log::warn!("failed to delete DHCP rule: {}", e);
                }
            }
        }
        Err(e) => {
            if !res.nat_rules.is_empty() || !res.dns_rules.is_empty() || res.dhcp_rule.is_some() {
                log::warn!("cannot remove iptables rules: {}", e);
            }
        }
    }

    if res.bridge_created {
        if let Some(bridge) = &res.bridge_iface {
            let _ = interface::set_link_down(bridge);
            if let Some(internet) = &res.internet_iface {
                let _ = interface::unset_master(internet);
            }
            let _ = interface::delete_link(bridge);
        }
        if let (Some(saved), Some(internet)) = (&res.saved_net, &res.internet_iface) {
            if let Err(e) = saved.apply_to(internet) {
                log::error!("failed to restore {} network state: {}", internet, e);
            }
        }
    }

    if let Some(virt) = &res.virt_iface {
        let _ = interface::delete_virtual_iface(virt);
    }
    if let Some((iface, mac)) = &res.original_mac {
        let _ = interface::set_mac(iface, mac);
    }

    let allocator = IfaceAllocator::new(&common, Arc::clone(&res.lock));
    for name in &res.allocated_names {
        let _ = allocator.deallocate(name);
    }

    if let Err(e) = nm.rm_added_entries() {
        log::warn!("failed to remove NetworkManager entries: {}", e);
    }

    res.lock.force_release();
    res.lock.remove();
    log::info!("cleanup done");
}

pub fn notify_parent(signal: libc::c_int) {
    let ppid = unsafe { libc::getppid() };
    if ppid > 1 {
        unsafe {
            libc::kill(ppid, signal);
        }
    }
}

/// Orderly shutdown: teardown, then exit 0.
pub fn clean_exit(
    msg: &str,
    res: &mut Resources,
    nm: &mut NetworkManager,
    guard: &SignalGuard,
    daemonized: bool,
) -> ! {
    log::info!("{}", msg);
    if daemonized {
        notify_parent(libc::SIGUSR1);
    }
    guard.restore();
    teardown(res, nm);
    process::exit(0);
}

/// Fatal abort: message on stderr, teardown, exit 1.
pub fn die(
    msg: &str,
    res: &mut Resources,
    nm: &mut NetworkManager,
    guard: &SignalGuard,
    daemonized: bool,
) -> ! {
    eprintln!("ERROR: {}", msg);
    if daemonized {
        notify_parent(libc::SIGUSR2);
    }
    guard.restore();
    teardown(res, nm);
    process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn killing_recorded_children_tolerates_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = fs::File::create(dir.path().join("hostapd.pid")).unwrap();
        writeln!(f, "not a pid").unwrap();
        fs::write(dir.path().join("dnsmasq.pid"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        // Must not panic or signal anything real.
        kill_recorded_children(dir.path());
        kill_recorded_children(&dir.path().join("missing"));
    }
}
