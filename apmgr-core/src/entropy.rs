//! Entropy watchdog.
//!
//! hostapd's WPA key handling stalls when the kernel entropy pool runs dry.
//! A background thread samples the pool every two seconds and starts
//! `haveged` when it drops below the threshold and the daemon is installed
//! but not running.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use apmgr_netlink::process::pidof;
use apmgr_netlink::wireless::tool_exists;
use apmgr_netlink::LockFile;

const ENTROPY_AVAIL: &str = "/proc/sys/kernel/random/entropy_avail";
const LOW_WATERMARK: u64 = 1000;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct EntropyWatchdog {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EntropyWatchdog {
    pub fn start(lock: Arc<LockFile>, pid_file: PathBuf) -> Self {
        Self::start_with_source(lock, pid_file, PathBuf::from(ENTROPY_AVAIL))
    }

    fn start_with_source(lock: Arc<LockFile>, pid_file: PathBuf, source: PathBuf) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::spawn(move || watchdog_loop(&lock, &pid_file, &source, &stop_flag));
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Ask the thread to finish and wait for it.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EntropyWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_entropy(source: &Path) -> Option<u64> {
    fs::read_to_string(source).ok()?.trim().parse().ok()
}

fn watchdog_loop(lock: &LockFile, pid_file: &Path, source: &Path, stop: &AtomicBool) {
    let mut warned = false;
    while !stop.load(Ordering::SeqCst) {
        if let Some(entropy) = read_entropy(source) {
            if entropy < LOW_WATERMARK {
                if !tool_exists("haveged") {
                    if !warned {
                        log::warn!(
                            "low entropy ({}) and haveged is not installed; \
                             WPA handshakes may stall",
                            entropy
                        );
                        warned = true;
                    }
                } else if !haveged_running() {
                    log::info!("low entropy ({}), starting haveged", entropy);
                    if lock.acquire().is_ok() {
                        start_haveged(pid_file);
                        let _ = lock.release();
                    }
                }
            }
        }
        // Sleep in short slices so stop() is honored promptly.
        for _ in 0..(POLL_INTERVAL.as_millis() / 100) {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
}

fn haveged_running() -> bool {
    pidof("haveged").map(|pids| !pids.is_empty()).unwrap_or(false)
}

fn start_haveged(pid_file: &Path) {
    let result = Command::new("haveged")
        .arg("-w")
        .arg("1024")
        .arg("-p")
        .arg(pid_file)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match result {
        Ok(status) if status.success() => {}
        Ok(status) => log::warn!("haveged exited with {}", status),
        Err(e) => log::warn!("failed to start haveged: {}", e),
    }
}
