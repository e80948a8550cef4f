//! hostapd configuration rendering and process management.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use crate::error::{NetError, Result};
use crate::wireless::Band;

/// WPA protocol selection for the `wpa=` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WpaVersion {
    One,
    Two,
    /// WPA1+WPA2 mixed mode; hostapd gets plain WPA2
    Mixed,
    /// WPA2/WPA3 transition mode
    Three,
}

/// How the passphrase is supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WpaKey {
    /// 8..63 character passphrase (`wpa_passphrase=`)
    Passphrase(String),
    /// 64 hex digit pre-shared key (`wpa_psk=`)
    Psk(String),
}

#[derive(Debug, Clone)]
pub struct WpaSettings {
    pub version: WpaVersion,
    pub key: WpaKey,
}

/// Everything that goes into a `hostapd.conf`.
///
/// `security: None` renders an open network with no `wpa*` directives at all.
#[derive(Debug, Clone)]
pub struct HostapdConfig {
    pub ssid: String,
    pub interface: String,
    pub driver: String,
    pub channel: u32,
    pub ctrl_interface: PathBuf,
    pub hidden: bool,
    pub isolate_clients: bool,
    pub country: Option<String>,
    pub band: Band,
    /// Path to the accepted-MACs file; enables `macaddr_acl=1`
    pub mac_filter_accept: Option<PathBuf>,
    pub ieee80211n: bool,
    pub ht_capab: Option<String>,
    pub ieee80211ac: bool,
    pub ieee80211ax: bool,
    pub vht_capab: Option<String>,
    pub wmm_enabled: bool,
    pub security: Option<WpaSettings>,
    pub bridge: Option<String>,
}

impl HostapdConfig {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut line = |s: String| {
            out.push_str(&s);
            out.push('\n');
        };

        line("beacon_int=100".to_string());
        line(format!("ssid={}", self.ssid));
        line(format!("interface={}", self.interface));
        line(format!("driver={}", self.driver));
        line(format!("channel={}", self.channel));
        line(format!("ctrl_interface={}", self.ctrl_interface.display()));
        line("ctrl_interface_group=0".to_string());
        line(format!("ignore_broadcast_ssid={}", self.hidden as u8));
        line(format!("ap_isolate={}", self.isolate_clients as u8));

        if let Some(country) = &self.country {
            line(format!("country_code={}", country));
            line("ieee80211d=1".to_string());
        }
        line(format!("hw_mode={}", self.band.hw_mode()));

        if let Some(accept_file) = &self.mac_filter_accept {
            line("macaddr_acl=1".to_string());
            line(format!("accept_mac_file={}", accept_file.display()));
        }
        if self.ieee80211n {
            line("ieee80211n=1".to_string());
            if let Some(ht) = &self.ht_capab {
                line(format!("ht_capab={}", ht));
            }
        }
        if self.ieee80211ac {
            line("ieee80211ac=1".to_string());
        }
        if self.ieee80211ax {
            line("ieee80211ax=1".to_string());
        }
        if let Some(vht) = &self.vht_capab {
            line(format!("vht_capab={}", vht));
        }
        if self.wmm_enabled {
            line("wmm_enabled=1".to_string());
        }

        if let Some(security) = &self.security {
            let key_line = match &security.key {
                WpaKey::Passphrase(p) => format!("wpa_passphrase={}", p),
                WpaKey::Psk(k) => format!("wpa_psk={}", k),
            };
            match security.version {
                WpaVersion::Three => {
                    // WPA3 transition mode; ieee80211w=1 is the only value
                    // Apple clients accept here.
                    line("wpa=2".to_string());
                    line(key_line);
                    line("wpa_key_mgmt=WPA-PSK SAE".to_string());
                    line("wpa_pairwise=CCMP".to_string());
                    line("rsn_pairwise=CCMP".to_string());
                    line("ieee80211w=1".to_string());
                }
                version => {
                    let wpa = match version {
                        WpaVersion::One => 1,
                        _ => 2,
                    };
                    line(format!("wpa={}", wpa));
                    line(key_line);
                    line("wpa_key_mgmt=WPA-PSK".to_string());
                    line("wpa_pairwise=CCMP".to_string());
                    line("rsn_pairwise=CCMP".to_string());
                }
            }
        }

        if let Some(bridge) = &self.bridge {
            line(format!("bridge={}", bridge));
        }

        out
    }

    /// Render into `<run_dir>/hostapd.conf`.
    pub fn write_to(&self, run_dir: &Path) -> Result<PathBuf> {
        let path = run_dir.join("hostapd.conf");
        fs::write(&path, self.render())?;
        log::debug!("wrote {}", path.display());
        Ok(path)
    }
}

/// Start hostapd on `conf` and record its PID into `pid_file`.
pub fn spawn(conf: &Path, pid_file: &Path) -> Result<Child> {
    let child = Command::new("hostapd")
        .arg(conf)
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| NetError::CommandFailed(format!("failed to start hostapd: {}", e)))?;
    fs::write(pid_file, child.id().to_string())?;
    log::info!("hostapd started (pid {})", child.id());
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> HostapdConfig {
        HostapdConfig {
            ssid: "TestNet".to_string(),
            interface: "xap0".to_string(),
            driver: "nl80211".to_string(),
            channel: 1,
            ctrl_interface: PathBuf::from("/tmp/run/hostapd_ctrl"),
            hidden: false,
            isolate_clients: false,
            country: None,
            band: Band::Ghz2,
            mac_filter_accept: None,
            ieee80211n: false,
            ht_capab: None,
            ieee80211ac: false,
            ieee80211ax: false,
            vht_capab: None,
            wmm_enabled: false,
            security: None,
            bridge: None,
        }
    }

    #[test]
    fn open_network_has_no_wpa_lines() {
        let conf = base_config().render();
        assert!(!conf.contains("wpa"));
        assert!(conf.starts_with("beacon_int=100\nssid=TestNet\n"));
        assert!(conf.contains("interface=xap0\n"));
        assert!(conf.contains("hw_mode=g\n"));
        assert!(conf.contains("ignore_broadcast_ssid=0\n"));
        assert!(conf.contains("ap_isolate=0\n"));
    }

    #[test]
    fn wpa2_passphrase_block() {
        let mut config = base_config();
        config.security = Some(WpaSettings {
            version: WpaVersion::Two,
            key: WpaKey::Passphrase("hunter22".to_string()),
        });
        let conf = config.render();
        assert!(conf.contains("wpa=2\n"));
        assert!(conf.contains("wpa_passphrase=hunter22\n"));
        assert!(conf.contains("wpa_key_mgmt=WPA-PSK\n"));
        assert!(conf.contains("wpa_pairwise=CCMP\n"));
        assert!(conf.contains("rsn_pairwise=CCMP\n"));
        assert!(!conf.contains("ieee80211w"));
        assert!(!conf.contains("SAE"));
    }

    #[test]
    fn wpa3_transition_mode() {
        let mut config = base_config();
        config.security = Some(WpaSettings {
            version: WpaVersion::Three,
            key: WpaKey::Passphrase("hunter22".to_string()),
        });
        let conf = config.render();
        assert!(conf.contains("wpa=2\n"));
        assert!(conf.contains("wpa_key_mgmt=WPA-PSK SAE\n"));
        assert!(conf.contains("ieee80211w=1\n"));
    }

    #[test]
    fn mixed_mode_downgrades_to_wpa2() {
        let mut config = base_config();
        config.security = Some(WpaSettings {
            version: WpaVersion::Mixed,
            key: WpaKey::Psk("ab".repeat(32)),
        });
        let conf = config.render();
        assert!(conf.contains("wpa=2\n"));
        assert!(conf.contains(&format!("wpa_psk={}\n", "ab".repeat(32))));
    }

    #[test]
    fn optional_directives() {
        let mut config = base_config();
        config.country = Some("DE".to_string());
        config.band = Band::Ghz5;
        config.channel = 36;
        config.mac_filter_accept = Some(PathBuf::from("/etc/allowed_macs"));
        config.ieee80211n = true;
        config.ht_capab = Some("[HT40+]".to_string());
        config.ieee80211ac = true;
        config.wmm_enabled = true;
        config.bridge = Some("xbr0".to_string());

        let conf = config.render();
        assert!(conf.contains("country_code=DE\nieee80211d=1\n"));
        assert!(conf.contains("hw_mode=a\n"));
        assert!(conf.contains("macaddr_acl=1\naccept_mac_file=/etc/allowed_macs\n"));
        assert!(conf.contains("ieee80211n=1\nht_capab=[HT40+]\n"));
        assert!(conf.contains("ieee80211ac=1\n"));
        assert!(conf.contains("wmm_enabled=1\n"));
        assert!(conf.ends_with("bridge=xbr0\n"));
    }
}
