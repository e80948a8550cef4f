//! NetworkManager adapter.
//!
//! Probes the daemon through `nmcli` and keeps selected interfaces out of its
//! hands by editing the `unmanaged-devices` directive in its config file.
//! Edits go through the structured [`IniDocument`] model so comments and
//! unrelated sections survive untouched, and every file mutation runs under
//! the shared cross-process mutex.
//!
//! NetworkManager before 0.9.9 keys unmanaged entries by MAC address instead
//! of interface name; `exists()` detects the daemon version and the adapter
//! switches entry format accordingly.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;

use crate::error::{NetError, Result};
use crate::ini::IniDocument;
use crate::lockfile::LockFile;
use crate::process;

const LEGACY_BOUNDARY: &str = "0.9.9";

/// Compare dot-separated numeric versions. Missing trailing components count
/// as zero, so `1.2` equals `1.2.0`.
pub fn version_cmp(a: &str, b: &str) -> Result<Ordering> {
    fn parse(version: &str) -> Result<Vec<u64>> {
        version
            .split('.')
            .map(|part| {
                part.parse::<u64>().map_err(|_| {
                    NetError::InvalidInput(format!("malformed version string {:?}", version))
                })
            })
            .collect()
    }

    let (mut a, mut b) = (parse(a)?, parse(b)?);
    let width = a.len().max(b.len());
    a.resize(width, 0);
    b.resize(width, 0);
    Ok(a.cmp(&b))
}

fn run_nmcli(args: &[&str]) -> Result<String> {
    let output = Command::new("nmcli")
        .args(args)
        .output()
        .map_err(|e| NetError::CommandFailed(format!("nmcli {}: {}", args.join(" "), e)))?;
    if !output.status.success() {
        return Err(NetError::CommandFailed(format!(
            "nmcli {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Extract the version number from `nmcli -v` output.
fn parse_nmcli_version(output: &str) -> Option<String> {
    let re = Regex::new(r"(\d+(?:\.\d+)+)").ok()?;
    Some(re.captures(output)?.get(1)?.as_str().to_string())
}

/// Append `entry` to the `[keyfile] unmanaged-devices=` list unless already
/// present. Returns the rewritten document and whether it changed.
fn insert_entry(text: &str, entry: &str) -> (String, bool) {
    let mut doc = IniDocument::parse(text);
    let mut entries: Vec<String> = doc
        .get("keyfile", "unmanaged-devices")
        .map(split_entries)
        .unwrap_or_default();
    if entries.iter().any(|e| e == entry) {
        return (doc.render(), false);
    }
    entries.push(entry.to_string());
    doc.set("keyfile", "unmanaged-devices", &entries.join(";"));
    (doc.render(), true)
}

/// Remove `entry` from the list; drops the whole key when it was the last
/// entry. Returns the rewritten document and whether it changed.
fn remove_entry(text: &str, entry: &str) -> (String, bool) {
    let mut doc = IniDocument::parse(text);
    let Some(current) = doc.get("keyfile", "unmanaged-devices") else {
        return (doc.render(), false);
    };
    let entries: Vec<String> = split_entries(current)
        .into_iter()
        .filter(|e| e != entry)
        .collect();
    if entries.len() == split_entries(current).len() {
        return (doc.render(), false);
    }
    if entries.is_empty() {
        doc.remove("keyfile", "unmanaged-devices");
    } else {
        doc.set("keyfile", "unmanaged-devices", &entries.join(";"));
    }
    (doc.render(), true)
}

fn split_entries(value: &str) -> Vec<String> {
    value
        .split([';', ','])
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct NetworkManager {
    conf_path: PathBuf,
    legacy: bool,
    added: HashSet<String>,
    lock: Arc<LockFile>,
}

impl NetworkManager {
    pub fn new(conf_path: &Path, lock: Arc<LockFile>) -> Self {
        Self {
            conf_path: conf_path.to_path_buf(),
            legacy: false,
            added: HashSet::new(),
            lock,
        }
    }

    /// Probe for `nmcli` and record whether the daemon predates 0.9.9.
    pub fn exists(&mut self) -> bool {
        let output = match run_nmcli(&["-v"]) {
            Ok(out) => out,
            Err(_) => return false,
        };
        if let Some(version) = parse_nmcli_version(&output) {
            match version_cmp(&version, LEGACY_BOUNDARY) {
                Ok(Ordering::Less) => {
                    log::debug!("NetworkManager {} uses legacy mac: entries", version);
                    self.legacy = true;
                }
                Ok(_) => self.legacy = false,
                Err(e) => log::warn!("cannot parse nmcli version {:?}: {}", version, e),
            }
        }
        true
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    pub fn is_running(&self) -> bool {
        let object = if self.legacy { "nm" } else { "g" };
        match run_nmcli(&["-t", "-f", "RUNNING", object]) {
            Ok(out) => out.trim() == "running",
            Err(_) => false,
        }
    }

    pub fn knows_iface(&self, iface: &str) -> bool {
        match run_nmcli(&["-t", "-f", "DEVICE", "d"]) {
            Ok(out) => out.lines().any(|l| l.trim() == iface),
            Err(_) => false,
        }
    }

    pub fn iface_is_unmanaged(&self, iface: &str) -> bool {
        match run_nmcli(&["-t", "-f", "DEVICE,STATE", "d"]) {
            Ok(out) => out
                .lines()
                .any(|l| l.trim() == format!("{}:unmanaged", iface)),
            Err(_) => false,
        }
    }

    fn entry_for(&self, iface: &str, mac: Option<&str>) -> Result<String> {
        if self.legacy {
            let mac = mac.ok_or_else(|| {
                NetError::NetworkManager(format!(
                    "legacy NetworkManager needs a MAC address to unmanage {}",
                    iface
                ))
            })?;
            Ok(format!("mac:{}", mac))
        } else {
            Ok(format!("interface-name:{}", iface))
        }
    }

    fn read_conf(&self) -> Result<String> {
        match fs::read_to_string(&self.conf_path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(NetError::NetworkManager(format!(
                "read {}: {}",
                self.conf_path.display(),
                e
            ))),
        }
    }

    fn write_conf(&self, text: &str) -> Result<()> {
        fs::write(&self.conf_path, text).map_err(|e| {
            NetError::NetworkManager(format!("write {}: {}", self.conf_path.display(), e))
        })
    }

    fn reload_daemon(&self) {
        match process::signal_name("NetworkManager", libc::SIGHUP) {
            Ok(0) => log::debug!("no NetworkManager process to reload"),
            Ok(n) => log::debug!("sent SIGHUP to {} NetworkManager process(es)", n),
            Err(e) => log::warn!("NetworkManager reload failed: {}", e),
        }
    }

    /// Add `iface` to the daemon's unmanaged list and reload it. Idempotent:
    /// an entry that is already present is left alone and not recorded as
    /// ours. Returns whether the config file changed.
    pub fn add_unmanaged(&mut self, iface: &str, mac: Option<&str>) -> Result<bool> {
        let entry = self.entry_for(iface, mac)?;

        self.lock.acquire()?;
        let result = (|| {
            let (text, changed) = insert_entry(&self.read_conf()?, &entry);
            if changed {
                self.write_conf(&text)?;
                log::info!("marked {} unmanaged in {}", iface, self.conf_path.display());
            }
            Ok(changed)
        })();
        self.lock.release()?;

        if let Ok(true) = result {
            self.added.insert(entry);
            self.reload_daemon();
        }
        result
    }

    /// Remove the unmanaged entry for `iface`, but only when this process
    /// added it. Entries placed there by the administrator or by another
    /// instance stay.
    pub fn rm_unmanaged_if_added(&mut self, iface: &str, mac: Option<&str>) -> Result<()> {
        let entry = self.entry_for(iface, mac)?;
        if !self.added.contains(&entry) {
            return Ok(());
        }

        self.lock.acquire()?;
        let result = (|| {
            let (text, changed) = remove_entry(&self.read_conf()?, &entry);
            if changed {
                self.write_conf(&text)?;
                log::info!("removed unmanaged entry for {}", iface);
            }
            Ok(changed)
        })();
        self.lock.release()?;

        self.added.remove(&entry);
        if let Ok(true) = result {
            self.reload_daemon();
        }
        result.map(|_| ())
    }

    /// Remove every unmanaged entry this process added. Teardown path.
    pub fn rm_added_entries(&mut self) -> Result<()> {
        let entries: Vec<String> = self.added.drain().collect();
        if entries.is_empty() {
            return Ok(());
        }

        self.lock.acquire()?;
        let result = (|| {
            let mut text = self.read_conf()?;
            let mut changed = false;
            for entry in &entries {
                let (next, removed) = remove_entry(&text, entry);
                text = next;
                changed |= removed;
            }
            if changed {
                self.write_conf(&text)?;
                log::info!("removed {} unmanaged entr(ies)", entries.len());
            }
            Ok(changed)
        })();
        self.lock.release()?;

        if let Ok(true) = result {
            self.reload_daemon();
        }
        result.map(|_| ())
    }

    /// Drop the `unmanaged-devices` directive entirely. Recovery tool for
    /// entries orphaned by a killed instance.
    pub fn fix_unmanaged(&self) -> Result<()> {
        self.lock.acquire()?;
        let result = (|| {
            let mut doc = IniDocument::parse(&self.read_conf()?);
            if doc.remove("keyfile", "unmanaged-devices") {
                self.write_conf(&doc.render())?;
                log::info!("cleared unmanaged-devices in {}", self.conf_path.display());
            }
            Ok(())
        })();
        self.lock.release()?;

        if result.is_ok() {
            self.reload_daemon();
        }
        result
    }

    /// Poll until the daemon reports `iface` unmanaged.
    ///
    /// Returns Ok(false) when `timeout` elapses first. The interface
    /// vanishing from the kernel is fatal; a udev rule has most likely
    /// renamed it under us.
    pub fn wait_until_unmanaged(&self, iface: &str, timeout: Duration) -> Result<bool> {
        let started = Instant::now();
        loop {
            if self.iface_is_unmanaged(iface) {
                return Ok(true);
            }
            if !Path::new("/sys/class/net").join(iface).exists() {
                return Err(NetError::Interface(format!(
                    "interface {} disappeared while waiting for NetworkManager \
                     (renamed by a udev rule?)",
                    iface
                )));
            }
            if started.elapsed() >= timeout {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_cmp_orders_numerically() {
        assert_eq!(version_cmp("2.63", "2.63").unwrap(), Ordering::Equal);
        assert_eq!(version_cmp("2.5", "2.63").unwrap(), Ordering::Less);
        assert_eq!(version_cmp("3.0", "2.63").unwrap(), Ordering::Greater);
        assert_eq!(version_cmp("1.2", "1.2.0").unwrap(), Ordering::Equal);
        assert_eq!(version_cmp("0.9.8.10", "0.9.9").unwrap(), Ordering::Less);
    }

    #[test]
    fn version_cmp_rejects_garbage() {
        assert!(version_cmp("2.x", "1.0").is_err());
        assert!(version_cmp("", "1.0").is_err());
        assert!(version_cmp("1.0", "1..0").is_err());
    }

    #[test]
    fn parses_version_from_nmcli_banner() {
        assert_eq!(
            parse_nmcli_version("nmcli tool, version 1.42.4").as_deref(),
            Some("1.42.4")
        );
        assert_eq!(
            parse_nmcli_version("nmcli tool, version 0.9.8.10").as_deref(),
            Some("0.9.8.10")
        );
        assert_eq!(parse_nmcli_version("no version here"), None);
    }

    const CONF: &str = "\
# managed by the distribution
[main]
plugins=keyfile

[keyfile]
unmanaged-devices=interface-name:wlan9
";

    #[test]
    fn insert_entry_appends_and_is_idempotent() {
        let (text, changed) = insert_entry(CONF, "interface-name:xap0");
        assert!(changed);
        assert!(text.contains("unmanaged-devices=interface-name:wlan9;interface-name:xap0"));
        assert!(text.contains("# managed by the distribution"));

        let (text2, changed2) = insert_entry(&text, "interface-name:xap0");
        assert!(!changed2);
        assert_eq!(text, text2);
    }

    #[test]
    fn insert_entry_creates_missing_section() {
        let (text, changed) = insert_entry("[main]\nplugins=keyfile\n", "mac:00:11:22:33:44:55");
        assert!(changed);
        assert!(text.contains("[keyfile]\nunmanaged-devices=mac:00:11:22:33:44:55"));
    }

    #[test]
    fn remove_entry_drops_key_when_last_entry_goes() {
        let (text, changed) = remove_entry(CONF, "interface-name:wlan9");
        assert!(changed);
        assert!(!text.contains("unmanaged-devices"));
        assert!(text.contains("[keyfile]"));

        let (_, changed_again) = remove_entry(&text, "interface-name:wlan9");
        assert!(!changed_again);
    }

    #[test]
    fn remove_entry_keeps_other_entries() {
        let (text, _) = insert_entry(CONF, "interface-name:xap0");
        let (text, changed) = remove_entry(&text, "interface-name:xap0");
        assert!(changed);
        assert!(text.contains("unmanaged-devices=interface-name:wlan9"));
    }

    #[test]
    fn only_recorded_entries_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("NetworkManager.conf");
        fs::write(&conf, CONF).unwrap();
        let lock = Arc::new(LockFile::init(&dir.path().join("lock")).unwrap());
        let mut nm = NetworkManager::new(&conf, lock);

        // wlan9 was put there by someone else.
        nm.rm_unmanaged_if_added("wlan9", None).unwrap();
        assert!(fs::read_to_string(&conf)
            .unwrap()
            .contains("interface-name:wlan9"));
    }
}
