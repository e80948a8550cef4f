//! Persisted JSON configuration.
//!
//! A flat key-value map loaded from a base config file, with `hostapd.json`
//! and `netconf.json` overlays merged on top. Merging is whitelisted: only
//! keys already present in the loaded map are updated, so a stray key in an
//! overlay file cannot introduce new settings. Each run works from one
//! in-memory snapshot; concurrent runs never share it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};

pub const BASE_CONFIG: &str = "/etc/apmgr/config.json";
pub const HOSTAPD_OVERLAY: &str = "hostapd.json";
pub const NETCONF_OVERLAY: &str = "netconf.json";

pub struct ConfigManager {
    path: PathBuf,
    map: Map<String, Value>,
}

fn default_map() -> Map<String, Value> {
    let Value::Object(map) = json!({
        "wifi_iface": "wlan0",
        "internet_iface": "eth0",
        "ssid": Value::Null,
        "password": Value::Null,
        "psk": Value::Null,
        "use_psk": false,
        "share_method": "nat",
        "channel": 6,
        "wpa_version": "2",
        "hidden": false,
        "mac_filter": false,
        "mac_filter_accept": "/etc/hostapd/hostapd.accept",
        "redirect_to_localhost": false,
        "isolate_clients": false,
        "ieee80211n": false,
        "ieee80211ac": false,
        "ieee80211ax": false,
        "ht_capab": "[HT40+]",
        "vht_capab": Value::Null,
        "country": Value::Null,
        "freq_band": Value::Null,
        "driver": "nl80211",
        "no_virt": false,
        "no_haveged": false,
        "mac": Value::Null,
        "dhcp_dns": [],
        "dhcp_hosts": [],
        "gateway": "192.168.12.1",
        "dns_port": 53,
        "no_dns": false,
        "no_dnsmasq": false,
        "etc_hosts": false,
        "addn_hosts": [],
        "dns_logfile": Value::Null,
    }) else {
        unreachable!("default config literal is an object");
    };
    map
}

impl ConfigManager {
    /// Load the base config. A missing file yields the built-in defaults; a
    /// present file is merged over them so old configs pick up new keys.
    pub fn load(path: &Path) -> Result<Self> {
        let mut map = default_map();
        match fs::read_to_string(path) {
            Ok(text) => {
                let loaded: Map<String, Value> = serde_json::from_str(&text)
                    .with_context(|| format!("malformed config file {}", path.display()))?;
                for (key, value) in loaded {
                    map.insert(key, value);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("config {} not found, using defaults", path.display());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read {}", path.display()));
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            map,
        })
    }

    /// Merge `updates` into the snapshot, accepting only keys that already
    /// exist and skipping nulls.
    pub fn merge_known(&mut self, updates: &Map<String, Value>) {
        for (key, value) in updates {
            if value.is_null() {
                continue;
            }
            if let Some(slot) = self.map.get_mut(key) {
                *slot = value.clone();
            } else {
                log::debug!("ignoring unknown config key {}", key);
            }
        }
    }

    /// Merge an overlay file (same whitelisting rules). Missing overlays are
    /// fine.
    pub fn apply_overlay(&mut self, path: &Path) -> Result<()> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read {}", path.display()));
            }
        };
        let overlay: Map<String, Value> = serde_json::from_str(&text)
            .with_context(|| format!("malformed overlay {}", path.display()))?;
        self.merge_known(&overlay);
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&Value::Object(self.map.clone()))?;
        fs::write(&self.path, text)
            .with_context(|| format!("cannot write {}", self.path.display()))?;
        Ok(())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.map.get(key)?.as_str()
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.map.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.map.get(key)?.as_u64()
    }

    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.map
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.map.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ConfigManager::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(cfg.get_str("wifi_iface"), Some("wlan0"));
        assert_eq!(cfg.get_str("gateway"), Some("192.168.12.1"));
        assert_eq!(cfg.get_u64("dns_port"), Some(53));
        assert!(!cfg.get_bool("no_virt"));
    }

    #[test]
    fn merge_known_skips_unknown_keys_and_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = ConfigManager::load(&dir.path().join("config.json")).unwrap();

        let Value::Object(updates) = json!({
            "ssid": "MyNet",
            "password": Value::Null,
            "totally_unknown": "x",
        }) else {
            unreachable!();
        };
        cfg.merge_known(&updates);

        assert_eq!(cfg.get_str("ssid"), Some("MyNet"));
        assert_eq!(cfg.get_str("password"), None);
        assert_eq!(cfg.get_str("totally_unknown"), None);
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = ConfigManager::load(&path).unwrap();
        cfg.set("ssid", json!("Persisted"));
        cfg.save().unwrap();

        let reloaded = ConfigManager::load(&path).unwrap();
        assert_eq!(reloaded.get_str("ssid"), Some("Persisted"));
    }

    #[test]
    fn overlay_updates_existing_keys_only() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = dir.path().join("hostapd.json");
        fs::write(&overlay, r#"{"channel": 11, "bogus": true}"#).unwrap();

        let mut cfg = ConfigManager::load(&dir.path().join("config.json")).unwrap();
        cfg.apply_overlay(&overlay).unwrap();

        assert_eq!(cfg.get_u64("channel"), Some(11));
        assert_eq!(cfg.get_str("bogus"), None);
        assert!(!cfg.get_bool("bogus"));

        // Missing overlay is a no-op
        cfg.apply_overlay(&dir.path().join("netconf.json")).unwrap();
    }
}
