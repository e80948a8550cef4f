//! Signal handling.
//!
//! Handlers only record the incoming signal number in an atomic; all real
//! work (teardown, process exit) happens on the main thread once it notices
//! the pending signal. SIGINT and SIGUSR1 request a clean exit, SIGUSR2 a
//! fatal abort.

use std::mem;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{bail, Result};
use libc::c_int;

static PENDING: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(signum: c_int) {
    PENDING.store(signum, Ordering::SeqCst);
}

/// Signal received so far, if any.
pub fn pending() -> Option<c_int> {
    match PENDING.load(Ordering::SeqCst) {
        0 => None,
        signum => Some(signum),
    }
}

/// Whether `signum` means orderly shutdown rather than fatal abort.
pub fn is_clean(signum: c_int) -> bool {
    signum == libc::SIGINT || signum == libc::SIGUSR1
}

/// Installs the recording handler for SIGINT, SIGUSR1 and SIGUSR2 and puts
/// the previous dispositions back in `restore`.
pub struct SignalGuard {
    previous: Vec<(c_int, libc::sigaction)>,
}

const HANDLED: [c_int; 3] = [libc::SIGINT, libc::SIGUSR1, libc::SIGUSR2];

impl SignalGuard {
    pub fn install() -> Result<Self> {
        let mut previous = Vec::with_capacity(HANDLED.len());
        for &signum in &HANDLED {
            unsafe {
                let mut action: libc::sigaction = mem::zeroed();
                action.sa_sigaction = record_signal as usize;
                libc::sigemptyset(&mut action.sa_mask);
                let mut old: libc::sigaction = mem::zeroed();
                if libc::sigaction(signum, &action, &mut old) != 0 {
                    bail!(
                        "sigaction({}) failed: {}",
                        signum,
                        std::io::Error::last_os_error()
                    );
                }
                previous.push((signum, old));
            }
        }
        Ok(Self { previous })
    }

    /// Reinstate the dispositions that were active before `install`.
    pub fn restore(&self) {
        for (signum, old) in &self.previous {
            unsafe {
                libc::sigaction(*signum, old, std::ptr::null_mut());
            }
        }
    }
}
