//! dnsmasq configuration rendering and process management.
//!
//! dnsmasq provides DHCP and DNS for AP clients. Versions before 2.63 lack
//! `bind-dynamic`, so the bind directive is picked from `dnsmasq -v`.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use regex::Regex;

use crate::error::{NetError, Result};
use crate::networkmanager::version_cmp;
use crate::wireless::run_cmd;

const BIND_DYNAMIC_SINCE: &str = "2.63";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    Interfaces,
    Dynamic,
}

impl BindMode {
    fn as_str(&self) -> &str {
        match self {
            BindMode::Interfaces => "bind-interfaces",
            BindMode::Dynamic => "bind-dynamic",
        }
    }
}

/// Pick the bind directive supported by the installed dnsmasq.
pub fn detect_bind_mode() -> Result<BindMode> {
    let banner = run_cmd("dnsmasq", &["-v"])?;
    let version = parse_dnsmasq_version(&banner)
        .ok_or_else(|| NetError::Parse(format!("no version in dnsmasq banner: {}", banner.trim())))?;
    match version_cmp(&version, BIND_DYNAMIC_SINCE)? {
        Ordering::Less => Ok(BindMode::Interfaces),
        _ => Ok(BindMode::Dynamic),
    }
}

fn parse_dnsmasq_version(banner: &str) -> Option<String> {
    let re = Regex::new(r"[0-9]+(?:\.[0-9]+)+").ok()?;
    Some(re.find(banner)?.as_str().to_string())
}

/// First three octets of a dotted-quad IPv4 address.
pub fn net_prefix(addr: &str) -> Result<String> {
    let octets: Vec<&str> = addr.split('.').collect();
    if octets.len() != 4 || octets.iter().any(|o| o.parse::<u8>().is_err()) {
        return Err(NetError::InvalidInput(format!(
            "not an IPv4 address: {}",
            addr
        )));
    }
    Ok(octets[..3].join("."))
}

/// Everything that goes into a `dnsmasq.conf`.
#[derive(Debug, Clone)]
pub struct DnsmasqConfig {
    pub gateway: String,
    pub bind_mode: BindMode,
    /// DNS servers pushed to clients; empty list omits the option
    pub dhcp_dns: Vec<String>,
    pub mtu: Option<u32>,
    /// When false, `/etc/hosts` is ignored (`no-hosts`)
    pub etc_hosts: bool,
    pub addn_hosts: Vec<String>,
    /// Raw `dhcp-host=` values for static leases
    pub dhcp_hosts: Vec<String>,
    pub log_file: Option<PathBuf>,
    /// Resolve every name to the gateway (captive-style local mode)
    pub redirect_all: bool,
}

impl DnsmasqConfig {
    pub fn render(&self) -> Result<String> {
        let net = net_prefix(&self.gateway)?;
        let mut out = String::new();
        let mut line = |s: String| {
            out.push_str(&s);
            out.push('\n');
        };

        line(format!("listen-address={}", self.gateway));
        line(self.bind_mode.as_str().to_string());
        line(format!(
            "dhcp-range={net}.1,{net}.254,255.255.255.0,24h",
            net = net
        ));
        line(format!("dhcp-option-force=option:router,{}", self.gateway));
        if !self.dhcp_dns.is_empty() {
            line(format!(
                "dhcp-option-force=option:dns-server,{}",
                self.dhcp_dns.join(",")
            ));
        }
        if let Some(mtu) = self.mtu {
            line(format!("dhcp-option-force=option:mtu,{}", mtu));
        }
        if !self.etc_hosts {
            line("no-hosts".to_string());
        }
        if !self.addn_hosts.is_empty() {
            line(format!("addn-hosts={}", self.addn_hosts.join(",")));
        }
        for host in &self.dhcp_hosts {
            line(format!("dhcp-host={}", host));
        }
        if let Some(log_file) = &self.log_file {
            line("log-queries".to_string());
            line(format!("log-facility={}", log_file.display()));
        }
        if self.redirect_all {
            line(format!("address=/#/{}", self.gateway));
        }

        Ok(out)
    }

    /// Render into `<run_dir>/dnsmasq.conf`.
    pub fn write_to(&self, run_dir: &Path) -> Result<PathBuf> {
        let path = run_dir.join("dnsmasq.conf");
        fs::write(&path, self.render()?)?;
        log::debug!("wrote {}", path.display());
        Ok(path)
    }
}

/// Start dnsmasq against `conf`. dnsmasq daemonizes itself and records its
/// PID into `pid_file` via `-x`.
pub fn spawn(conf: &Path, pid_file: &Path, lease_file: &Path, dns_port: u16) -> Result<()> {
    let status = Command::new("dnsmasq")
        .arg("-C")
        .arg(conf)
        .arg("-x")
        .arg(pid_file)
        .arg("-l")
        .arg(lease_file)
        .arg("-p")
        .arg(dns_port.to_string())
        .status()
        .map_err(|e| NetError::CommandFailed(format!("failed to start dnsmasq: {}", e)))?;
    if !status.success() {
        return Err(NetError::CommandFailed("dnsmasq failed to start".to_string()));
    }
    log::info!("dnsmasq started (pid file {})", pid_file.display());
    Ok(())
}

/// One DHCP lease as parsed from `dnsmasq.leases`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub mac: String,
    pub ip: String,
    pub hostname: String,
}

/// Parse a dnsmasq lease file (expiry, MAC, IP, hostname, client-id).
pub fn parse_leases(content: &str) -> Vec<Lease> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let _expiry = parts.next()?;
            Some(Lease {
                mac: parts.next()?.to_string(),
                ip: parts.next()?.to_string(),
                hostname: parts.next().unwrap_or("*").to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> DnsmasqConfig {
        DnsmasqConfig {
            gateway: "192.168.12.1".to_string(),
            bind_mode: BindMode::Dynamic,
            dhcp_dns: Vec::new(),
            mtu: None,
            etc_hosts: false,
            addn_hosts: Vec::new(),
            dhcp_hosts: Vec::new(),
            log_file: None,
            redirect_all: false,
        }
    }

    #[test]
    fn minimal_config_shape() {
        let conf = base_config().render().unwrap();
        assert!(conf.starts_with("listen-address=192.168.12.1\nbind-dynamic\n"));
        assert!(conf.contains("dhcp-range=192.168.12.1,192.168.12.254,255.255.255.0,24h\n"));
        assert!(conf.contains("dhcp-option-force=option:router,192.168.12.1\n"));
        assert_eq!(conf.matches("no-hosts").count(), 1);
        assert!(!conf.contains("dhcp-host="));
        assert!(!conf.contains("log-queries"));
        assert!(!conf.contains("address=/#/"));
    }

    #[test]
    fn etc_hosts_suppresses_no_hosts() {
        let mut config = base_config();
        config.etc_hosts = true;
        let conf = config.render().unwrap();
        assert!(!conf.contains("no-hosts"));
    }

    #[test]
    fn static_hosts_and_dns_options() {
        let mut config = base_config();
        config.bind_mode = BindMode::Interfaces;
        config.dhcp_dns = vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()];
        config.mtu = Some(1500);
        config.dhcp_hosts = vec!["00:11:22:33:44:55,192.168.12.10".to_string()];
        config.log_file = Some(PathBuf::from("/var/log/ap-dns.log"));

        let conf = config.render().unwrap();
        assert!(conf.contains("bind-interfaces\n"));
        assert!(conf.contains("dhcp-option-force=option:dns-server,1.1.1.1,8.8.8.8\n"));
        assert!(conf.contains("dhcp-option-force=option:mtu,1500\n"));
        assert_eq!(conf.matches("dhcp-host=").count(), 1);
        assert!(conf.contains("dhcp-host=00:11:22:33:44:55,192.168.12.10\n"));
        assert!(conf.contains("log-queries\nlog-facility=/var/log/ap-dns.log\n"));
    }

    #[test]
    fn redirect_all_points_at_gateway() {
        let mut config = base_config();
        config.redirect_all = true;
        let conf = config.render().unwrap();
        assert!(conf.ends_with("address=/#/192.168.12.1\n"));
    }

    #[test]
    fn version_detection_from_banner() {
        assert_eq!(
            parse_dnsmasq_version("Dnsmasq version 2.80  Copyright (c) 2000-2018").as_deref(),
            Some("2.80")
        );
        assert_eq!(parse_dnsmasq_version("garbage"), None);
    }

    #[test]
    fn net_prefix_validation() {
        assert_eq!(net_prefix("192.168.12.1").unwrap(), "192.168.12");
        assert_eq!(net_prefix("10.0.0.254").unwrap(), "10.0.0");
        assert!(net_prefix("not-an-ip").is_err());
        assert!(net_prefix("192.168.12").is_err());
        assert!(net_prefix("192.168.12.300").is_err());
    }

    #[test]
    fn lease_parsing() {
        let leases = "\
1693500000 00:11:22:33:44:55 192.168.12.10 laptop 01:00:11:22:33:44:55
1693500100 aa:bb:cc:dd:ee:ff 192.168.12.11 * *
";
        let parsed = parse_leases(leases);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].mac, "00:11:22:33:44:55");
        assert_eq!(parsed[0].ip, "192.168.12.10");
        assert_eq!(parsed[0].hostname, "laptop");
        assert_eq!(parsed[1].hostname, "*");
    }
}
