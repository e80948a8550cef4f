//! Resolved, validated run settings.
//!
//! CLI arguments win over the persisted config; everything is validated
//! before any resource is touched, so a bad invocation exits with a message
//! and no cleanup debt.

use std::path::PathBuf;

use anyhow::{bail, Result};
use apmgr_netlink::wireless::{is_macaddr, is_unicast_macaddr, Band};
use apmgr_netlink::{WpaKey, WpaSettings, WpaVersion};

use crate::cli::{FreqBandArg, ShareMethod, StartArgs, WpaVersionArg};
use crate::config::ConfigManager;

#[derive(Debug, Clone)]
pub struct Settings {
    pub wifi_iface: String,
    pub internet_iface: String,
    pub ssid: String,
    pub security: Option<WpaSettings>,
    pub share_method: ShareMethod,
    pub channel: u32,
    pub hidden: bool,
    pub mac_filter_accept: Option<PathBuf>,
    pub redirect_to_localhost: bool,
    pub isolate_clients: bool,
    pub ieee80211n: bool,
    pub ieee80211ac: bool,
    pub ieee80211ax: bool,
    pub ht_capab: String,
    pub vht_capab: Option<String>,
    pub country: Option<String>,
    pub freq_band: Option<Band>,
    pub driver: String,
    pub no_virt: bool,
    pub no_haveged: bool,
    pub mac: Option<String>,
    pub dhcp_dns: Vec<String>,
    pub dhcp_hosts: Vec<String>,
    pub gateway: String,
    pub dns_port: u16,
    pub no_dns: bool,
    pub no_dnsmasq: bool,
    pub etc_hosts: bool,
    pub addn_hosts: Vec<String>,
    pub dns_logfile: Option<PathBuf>,
}

fn resolve_security(args: &StartArgs, cfg: &ConfigManager) -> Result<Option<WpaSettings>> {
    let version = match args.wpa_version {
        WpaVersionArg::One => WpaVersion::One,
        WpaVersionArg::Two => WpaVersion::Two,
        WpaVersionArg::Mixed => WpaVersion::Mixed,
        WpaVersionArg::Three => WpaVersion::Three,
    };

    if args.use_psk {
        let psk = match &args.psk {
            Some(psk) => psk.clone(),
            None => match cfg.get_str("psk") {
                Some(psk) => psk.to_string(),
                None => bail!("--use-psk requires --psk or a psk in the config"),
            },
        };
        if psk.len() != 64 || !psk.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("pre-shared key must be exactly 64 hex digits");
        }
        return Ok(Some(WpaSettings {
            version,
            key: WpaKey::Psk(psk),
        }));
    }

    let password = args
        .password
        .clone()
        .or_else(|| cfg.get_str("password").map(str::to_string));
    match password {
        None => Ok(None),
        Some(password) => {
            if password.len() < 8 || password.len() > 63 {
                bail!(
                    "invalid passphrase length {} (expected 8..63)",
                    password.len()
                );
            }
            Ok(Some(WpaSettings {
                version,
                key: WpaKey::Passphrase(password),
            }))
        }
    }
}

impl Settings {
    pub fn resolve(args: &StartArgs, cfg: &ConfigManager) -> Result<Self> {
        let ssid = match args
            .ssid
            .clone()
            .or_else(|| cfg.get_str("ssid").map(str::to_string))
        {
            Some(ssid) => ssid,
            None => bail!("an SSID is required (--ssid or config)"),
        };
        if ssid.is_empty() || ssid.len() > 32 {
            bail!("invalid SSID length {} (expected 1..32)", ssid.len());
        }

        if let Some(mac) = &args.mac {
            if !is_macaddr(mac) {
                bail!("'{}' is not a valid MAC address", mac);
            }
            if !is_unicast_macaddr(mac) {
                bail!("the first byte of MAC address {} must be even", mac);
            }
        }

        if args.no_virt && args.wifi_iface == args.internet_iface {
            bail!(
                "cannot share the connection from {} while the AP runs on it; \
                 drop --no-virt or use another interface",
                args.wifi_iface
            );
        }

        let mut freq_band = args.freq_band.map(|band| match band {
            FreqBandArg::Ghz2 => Band::Ghz2,
            FreqBandArg::Ghz5 => Band::Ghz5,
        });
        // Channels above 14 only exist in the 5 GHz band.
        if args.channel > 14 && freq_band != Some(Band::Ghz5) {
            log::info!("channel {} implies the 5 GHz band", args.channel);
            freq_band = Some(Band::Ghz5);
        }

        let security = resolve_security(args, cfg)?;

        Ok(Self {
            wifi_iface: args.wifi_iface.clone(),
            internet_iface: args.internet_iface.clone(),
            ssid,
            security,
            share_method: args.share_method,
            channel: args.channel,
            hidden: args.hidden,
            mac_filter_accept: args.mac_filter.then(|| args.mac_filter_accept.clone()),
            redirect_to_localhost: args.redirect_to_localhost,
            isolate_clients: args.isolate_clients,
            ieee80211n: args.ieee80211n,
            ieee80211ac: args.ieee80211ac,
            ieee80211ax: args.ieee80211ax,
            ht_capab: args.ht_capab.clone(),
            vht_capab: args.vht_capab.clone(),
            country: args.country.clone(),
            freq_band,
            driver: args.driver.clone(),
            no_virt: args.no_virt,
            no_haveged: args.no_haveged,
            mac: args.mac.clone(),
            dhcp_dns: args.dhcp_dns.clone(),
            dhcp_hosts: args.dhcp_hosts.clone(),
            gateway: args.gateway.clone(),
            dns_port: args.dns_port,
            no_dns: args.no_dns,
            no_dnsmasq: args.no_dnsmasq,
            etc_hosts: args.etc_hosts,
            addn_hosts: args.addn_hosts.clone(),
            dns_logfile: args.dns_logfile.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    use crate::cli::{Cli, Commands};

    fn parse_start(argv: &[&str]) -> StartArgs {
        let mut full = vec!["apmgr", "start"];
        full.extend_from_slice(argv);
        let cli = Cli::try_parse_from(full).unwrap();
        match cli.command {
            Commands::Start(args) => args,
            _ => unreachable!(),
        }
    }

    fn empty_config() -> ConfigManager {
        let dir = tempfile::tempdir().unwrap();
        ConfigManager::load(&dir.path().join("config.json")).unwrap()
    }

    #[test]
    fn requires_ssid() {
        let err = Settings::resolve(&parse_start(&[]), &empty_config()).unwrap_err();
        assert!(err.to_string().contains("SSID"));
    }

    #[test]
    fn open_network_when_no_password_anywhere() {
        let settings =
            Settings::resolve(&parse_start(&["--ssid", "Net"]), &empty_config()).unwrap();
        assert!(settings.security.is_none());
    }

    #[test]
    fn passphrase_length_bounds() {
        let short = parse_start(&["--ssid", "Net", "--password", "short"]);
        assert!(Settings::resolve(&short, &empty_config()).is_err());

        let ok = parse_start(&["--ssid", "Net", "--password", "longenough"]);
        let settings = Settings::resolve(&ok, &empty_config()).unwrap();
        match settings.security.unwrap().key {
            WpaKey::Passphrase(p) => assert_eq!(p, "longenough"),
            other => panic!("unexpected key {:?}", other),
        }
    }

    #[test]
    fn psk_must_be_64_hex_digits() {
        let bad = parse_start(&["--ssid", "Net", "--use-psk", "--psk", "abcd"]);
        assert!(Settings::resolve(&bad, &empty_config()).is_err());

        let hex = "ab".repeat(32);
        let good = parse_start(&["--ssid", "Net", "--use-psk", "--psk", &hex]);
        let settings = Settings::resolve(&good, &empty_config()).unwrap();
        assert!(matches!(settings.security.unwrap().key, WpaKey::Psk(_)));
    }

    #[test]
    fn mac_validation() {
        let bad = parse_start(&["--ssid", "Net", "--mac", "nope"]);
        assert!(Settings::resolve(&bad, &empty_config()).is_err());

        let multicast = parse_start(&["--ssid", "Net", "--mac", "01:02:03:04:05:06"]);
        assert!(Settings::resolve(&multicast, &empty_config()).is_err());
    }

    #[test]
    fn high_channel_forces_5ghz() {
        let args = parse_start(&["--ssid", "Net", "--channel", "36"]);
        let settings = Settings::resolve(&args, &empty_config()).unwrap();
        assert_eq!(settings.freq_band, Some(Band::Ghz5));
    }

    #[test]
    fn no_virt_refuses_shared_interface() {
        let args = parse_start(&[
            "--ssid",
            "Net",
            "--no-virt",
            "--wifi-iface",
            "wlan0",
            "--internet-iface",
            "wlan0",
        ]);
        assert!(Settings::resolve(&args, &empty_config()).is_err());
    }

    #[test]
    fn config_supplies_password_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"password": "fromconfig"}"#,
        )
        .unwrap();
        let cfg = ConfigManager::load(&dir.path().join("config.json")).unwrap();

        let settings = Settings::resolve(&parse_start(&["--ssid", "Net"]), &cfg).unwrap();
        match settings.security.unwrap().key {
            WpaKey::Passphrase(p) => assert_eq!(p, "fromconfig"),
            other => panic!("unexpected key {:?}", other),
        }
    }
}
