//! The access point lifecycle, from preflight checks to the supervising
//! loop.
//!
//! Bring-up runs in stages; every acquired resource is recorded in
//! [`Resources`](crate::cleanup::Resources) the moment it exists, so a
//! failure at any point tears down exactly what was built so far. After the
//! services are up the controller parks, watching for signals and for
//! hostapd dying underneath us.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{self, Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use apmgr_netlink::wireless::{self, Band};
use apmgr_netlink::{
    dnsmasq, hostapd, interface, iptables, sysctl, BindMode, DnsmasqConfig, HostapdConfig,
    IfaceAllocator, IptablesManager, LockFile, NetworkManager, SavedNetState,
};

use crate::cleanup::{self, Resources};
use crate::cli::ShareMethod;
use crate::instances::{Paths, NAT_INTERNET_IFACE_FILE, PID_FILE, WIFI_IFACE_FILE};
use crate::settings::Settings;
use crate::signals::{self, SignalGuard};

pub const NM_CONF: &str = "/etc/NetworkManager/NetworkManager.conf";

const HOSTAPD_CTRL_DIR: &str = "hostapd_ctrl";
const NM_UNMANAGED_TIMEOUT: Duration = Duration::from_secs(30);

/// Bring the AP up, supervise it, and never return. Every exit path goes
/// through `clean_exit` or `die`, so cleanup always runs.
pub fn run_ap(mut settings: Settings, daemonized: bool) -> ! {
    let paths = Paths::system();
    let lock = match LockFile::init(paths.base()) {
        Ok(lock) => Arc::new(lock),
        Err(e) => {
            eprintln!("ERROR: cannot set up the instance lock: {}", e);
            if daemonized {
                cleanup::notify_parent(libc::SIGUSR2);
            }
            process::exit(1);
        }
    };

    // Nothing is acquired yet, so a failed install needs no teardown.
    let guard = match SignalGuard::install() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            if daemonized {
                cleanup::notify_parent(libc::SIGUSR2);
            }
            process::exit(1);
        }
    };

    let mut nm = NetworkManager::new(Path::new(NM_CONF), Arc::clone(&lock));
    let mut res = Resources::new(paths, Arc::clone(&lock));

    let mut hostapd = match bring_up(&mut settings, &mut res, &mut nm) {
        Ok(child) => child,
        Err(e) => cleanup::die(&format!("{:#}", e), &mut res, &mut nm, &guard, daemonized),
    };

    if daemonized {
        cleanup::notify_parent(libc::SIGUSR1);
    }

    let signum = supervise(&mut hostapd);
    match signum {
        Some(signum) if signals::is_clean(signum) => {
            cleanup::clean_exit("exiting...", &mut res, &mut nm, &guard, daemonized)
        }
        Some(_) => cleanup::die("aborted", &mut res, &mut nm, &guard, daemonized),
        None => cleanup::die("hostapd exited unexpectedly", &mut res, &mut nm, &guard, daemonized),
    }
}

/// Park until a signal arrives or hostapd exits. Returns the signal, or
/// `None` when hostapd died.
fn supervise(hostapd: &mut Child) -> Option<i32> {
    loop {
        if let Some(signum) = signals::pending() {
            return Some(signum);
        }
        if let Ok(Some(_)) = hostapd.try_wait() {
            return None;
        }
        thread::sleep(Duration::from_millis(250));
    }
}

fn bring_up(
    settings: &mut Settings,
    res: &mut Resources,
    nm: &mut NetworkManager,
) -> Result<Child> {
    let facts = preflight(settings, nm)?;
    locked_init(settings, res)?;
    interface_setup(settings, res, nm, &facts)?;
    start_services(settings, res)
}

struct AdapterFacts {
    info: String,
    connected_freq: Option<u32>,
}

fn preflight(settings: &mut Settings, nm: &mut NetworkManager) -> Result<AdapterFacts> {
    if unsafe { libc::geteuid() } != 0 {
        bail!("you must run it as root");
    }

    let mut tools = vec!["ip", "iw", "hostapd"];
    let dnsmasq_enabled = !settings.no_dnsmasq && settings.share_method != ShareMethod::Bridge;
    if settings.share_method == ShareMethod::Nat || dnsmasq_enabled {
        tools.push("iptables");
    }
    if dnsmasq_enabled {
        tools.push("dnsmasq");
    }
    wireless::ensure_tools_present(&tools)?;

    if !wireless::is_interface(&settings.wifi_iface) {
        bail!("'{}' is not an interface", settings.wifi_iface);
    }
    if !wireless::is_wifi_interface(&settings.wifi_iface) {
        bail!("'{}' is not a WiFi interface", settings.wifi_iface);
    }
    if settings.share_method != ShareMethod::None
        && !wireless::is_interface(&settings.internet_iface)
    {
        bail!("'{}' is not an interface", settings.internet_iface);
    }

    let info = wireless::adapter_info(&settings.wifi_iface)
        .with_context(|| format!("cannot read adapter info for {}", settings.wifi_iface))?;
    if !wireless::can_be_ap(&info) {
        bail!("your adapter does not support AP (master) mode");
    }

    let mut connected_freq = None;
    if wireless::is_wifi_connected(&settings.wifi_iface) {
        if !wireless::can_be_sta_and_ap(&info) {
            bail!(
                "your adapter cannot be a station and an AP at the same time; \
                 disconnect {} first",
                settings.wifi_iface
            );
        }
        connected_freq = Some(wireless::interface_frequency(&settings.wifi_iface)?);
    } else if !settings.no_virt && !wireless::can_be_sta_and_ap(&info) {
        log::warn!("your adapter cannot use a virtual interface, using --no-virt");
        settings.no_virt = true;
    }

    // brcmfmac kills the AP when a second virtual interface appears.
    if !settings.no_virt {
        if let Some(module) = wireless::kernel_module(&settings.wifi_iface) {
            if module == "brcmfmac" {
                log::warn!("brcmfmac does not support virtual interfaces, using --no-virt");
                settings.no_virt = true;
            }
        }
    }

    if settings.no_virt && settings.wifi_iface == settings.internet_iface {
        bail!(
            "cannot share the connection from {} while the AP runs on it",
            settings.wifi_iface
        );
    }

    if nm.exists() {
        log::debug!(
            "NetworkManager found (legacy: {})",
            nm.is_legacy()
        );
    }

    Ok(AdapterFacts {
        info,
        connected_freq,
    })
}

/// Create the shared and per-instance directories under the mutex, and
/// snapshot the proc-fs values teardown will put back.
fn locked_init(settings: &Settings, res: &mut Resources) -> Result<()> {
    res.lock.acquire()?;
    let result = locked_init_inner(settings, res);
    let _ = res.lock.release();
    result
}

fn locked_init_inner(settings: &Settings, res: &mut Resources) -> Result<()> {
    let common = res.paths.common_dir();
    fs::create_dir_all(common.join("ifaces"))?;
    fs::create_dir_all(&res.run_dir)?;

    let pid_path = res.run_dir.join(PID_FILE);
    fs::write(&pid_path, res.pid.to_string())?;
    fs::set_permissions(&pid_path, fs::Permissions::from_mode(0o444))?;

    sysctl::snapshot(
        Path::new("/proc/sys/net/ipv4/ip_forward"),
        &common.join("ip_forward"),
    )?;
    // Only present when the br_netfilter module is loaded.
    let bridge_nf = Path::new("/proc/sys/net/bridge/bridge-nf-call-iptables");
    if bridge_nf.exists() {
        sysctl::snapshot(bridge_nf, &common.join("bridge-nf-call-iptables"))?;
    }

    if settings.share_method == ShareMethod::Nat {
        res.internet_iface = Some(settings.internet_iface.clone());
        fs::write(
            res.run_dir.join(NAT_INTERNET_IFACE_FILE),
            &settings.internet_iface,
        )?;
        let forwarding = PathBuf::from(format!(
            "/proc/sys/net/ipv4/conf/{}/forwarding",
            settings.internet_iface
        ));
        sysctl::snapshot(
            &forwarding,
            &common.join(format!("{}_forwarding", settings.internet_iface)),
        )?;
    }
    Ok(())
}

/// Pick the band and channel the AP will actually use.
///
/// When the adapter is associated, a single-channel radio is pinned to the
/// channel of the association; multi-channel radios keep the requested one
/// if the regulatory domain allows transmitting there.
fn negotiate_channel(
    info: &str,
    requested: u32,
    band_override: Option<Band>,
    connected_freq: Option<u32>,
) -> Result<(Band, u32)> {
    let band = band_override.unwrap_or(if requested > 14 { Band::Ghz5 } else { Band::Ghz2 });

    if let Some(freq) = connected_freq {
        let conn_channel = wireless::frequency_to_channel(freq);
        let conn_band = Band::from_frequency(freq);
        if conn_channel == requested && conn_band == band {
            return Ok((band, requested));
        }
        if wireless::supports_multiple_channels(info)
            && wireless::can_transmit_on_channel(info, band, requested)
        {
            return Ok((band, requested));
        }
        if !wireless::can_transmit_on_channel(info, conn_band, conn_channel) {
            bail!(
                "the adapter cannot run the AP on channel {} while associated, \
                 and transmission on the associated channel {} is not allowed",
                requested,
                conn_channel
            );
        }
        log::warn!(
            "the adapter cannot run the AP on channel {} while associated, \
             using channel {} instead",
            requested,
            conn_channel
        );
        return Ok((conn_band, conn_channel));
    }

    if !wireless::can_transmit_on_channel(info, band, requested) {
        bail!(
            "transmission on channel {} ({} GHz) is not allowed on this device",
            requested,
            band.as_ghz()
        );
    }
    Ok((band, requested))
}

fn interface_setup(
    settings: &mut Settings,
    res: &mut Resources,
    nm: &mut NetworkManager,
    facts: &AdapterFacts,
) -> Result<()> {
    let (band, channel) = negotiate_channel(
        &facts.info,
        settings.channel,
        settings.freq_band,
        facts.connected_freq,
    )?;
    settings.freq_band = Some(band);
    settings.channel = channel;

    let common = res.paths.common_dir();
    let allocator = IfaceAllocator::new(&common, Arc::clone(&res.lock));

    if settings.share_method == ShareMethod::Bridge {
        if wireless::is_bridge_interface(&settings.internet_iface) {
            res.bridge_iface = Some(settings.internet_iface.clone());
        } else {
            let bridge = allocator.allocate("xbr")?;
            res.allocated_names.push(bridge.clone());
            res.internet_iface = Some(settings.internet_iface.clone());
            res.saved_net = Some(SavedNetState::capture(&settings.internet_iface)?);
            interface::create_bridge(&bridge)?;
            res.bridge_iface = Some(bridge.clone());
            res.bridge_created = true;
            interface::flush_addresses(&settings.internet_iface)?;
            interface::set_master(&settings.internet_iface, &bridge)?;
            interface::set_link_up(&bridge)?;
            if let Some(saved) = &res.saved_net {
                saved.apply_to(&bridge)?;
            }
        }
    }

    let ap_iface = if settings.no_virt {
        if let Some(mac) = &settings.mac {
            if let Some(original) = wireless::interface_mac(&settings.wifi_iface) {
                res.original_mac = Some((settings.wifi_iface.clone(), original));
            }
            interface::set_link_down(&settings.wifi_iface)?;
            interface::set_mac(&settings.wifi_iface, mac)?;
        }
        settings.wifi_iface.clone()
    } else {
        let virt = allocator.allocate("xap")?;
        res.allocated_names.push(virt.clone());
        interface::add_virtual_ap(&settings.wifi_iface, &virt)
            .context("failed to create a virtual WiFi interface")?;
        res.virt_iface = Some(virt.clone());

        // The virtual interface inherits the physical MAC; two interfaces
        // with the same address confuse some drivers and most APs.
        let mac = match &settings.mac {
            Some(mac) => Some(mac.clone()),
            None => wireless::interface_mac(&settings.wifi_iface)
                .and_then(|current| wireless::next_free_macaddr(&current, &wireless::all_macs())),
        };
        if let Some(mac) = mac {
            interface::set_mac(&virt, &mac)?;
        } else {
            log::warn!("could not find a free MAC address for {}", virt);
        }
        virt
    };
    res.ap_iface = Some(ap_iface.clone());
    let iface_path = res.run_dir.join(WIFI_IFACE_FILE);
    fs::write(&iface_path, &ap_iface)?;
    fs::set_permissions(&iface_path, fs::Permissions::from_mode(0o444))?;

    if nm.exists() && nm.is_running() && nm.knows_iface(&ap_iface) {
        let mac = wireless::interface_mac(&ap_iface);
        nm.add_unmanaged(&ap_iface, mac.as_deref())?;
        match nm.wait_until_unmanaged(&ap_iface, NM_UNMANAGED_TIMEOUT) {
            Ok(true) => {}
            Ok(false) => {
                log::warn!("NetworkManager did not release {} in time, continuing", ap_iface)
            }
            Err(e) => return Err(anyhow!(e).context(format!("{} disappeared", ap_iface))),
        }
    }

    Ok(())
}

fn subnet_of(gateway: &str) -> Result<String> {
    Ok(format!("{}.0/24", dnsmasq::net_prefix(gateway)?))
}

fn broadcast_of(gateway: &str) -> Result<String> {
    Ok(format!("{}.255", dnsmasq::net_prefix(gateway)?))
}

fn start_services(settings: &Settings, res: &mut Resources) -> Result<Child> {
    let ap_iface = res
        .ap_iface
        .clone()
        .ok_or_else(|| anyhow!("interface setup did not run"))?;
    let band = settings.freq_band.unwrap_or(Band::Ghz2);

    interface::set_link_down(&ap_iface)?;
    interface::flush_addresses(&ap_iface)?;
    interface::set_link_up(&ap_iface)?;
    if settings.share_method != ShareMethod::Bridge {
        interface::add_address(&ap_iface, &settings.gateway, &broadcast_of(&settings.gateway)?)?;
    }

    if settings.share_method == ShareMethod::Nat {
        sysctl::write_value(Path::new("/proc/sys/net/ipv4/ip_forward"), "1")?;
        let forwarding = PathBuf::from(format!(
            "/proc/sys/net/ipv4/conf/{}/forwarding",
            settings.internet_iface
        ));
        sysctl::write_value(&forwarding, "1")?;
        // Lets PPTP clients behind the AP connect; absence is not an error.
        let _ = Command::new("modprobe")
            .arg("nf_nat_pptp")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    } else if settings.share_method == ShareMethod::Bridge {
        let bridge_nf = Path::new("/proc/sys/net/bridge/bridge-nf-call-iptables");
        if bridge_nf.exists() {
            sysctl::write_value(bridge_nf, "0")?;
        }
    }

    apply_firewall(settings, res, &ap_iface)?;

    let dnsmasq_enabled = !settings.no_dnsmasq && settings.share_method != ShareMethod::Bridge;
    if dnsmasq_enabled {
        start_dnsmasq(settings, res)?;
    }

    let hostapd_child = start_hostapd(settings, res, &ap_iface, band)?;

    if settings.security.is_some() && !settings.no_haveged {
        res.watchdog = Some(crate::entropy::EntropyWatchdog::start(
            Arc::clone(&res.lock),
            res.paths.common_dir().join("haveged.pid"),
        ));
    }

    println!("{}: AP enabled on {}", settings.ssid, ap_iface);
    println!(
        "to poke hostapd: hostapd_cli -p {} <command>",
        res.run_dir.join(HOSTAPD_CTRL_DIR).display()
    );
    Ok(hostapd_child)
}

/// Install the iptables rules the chosen share method needs, recording each
/// one as it lands so teardown removes exactly what was added.
fn apply_firewall(settings: &Settings, res: &mut Resources, ap_iface: &str) -> Result<()> {
    let wants_nat = settings.share_method == ShareMethod::Nat;
    let dnsmasq_enabled = !settings.no_dnsmasq && settings.share_method != ShareMethod::Bridge;
    let wants_dns = dnsmasq_enabled && !settings.no_dns;
    if !wants_nat && !dnsmasq_enabled {
        return Ok(());
    }

    let ipt = IptablesManager::new()?;
    let subnet = subnet_of(&settings.gateway)?;

    if wants_nat {
        for rule in iptables::nat_rules(&subnet, ap_iface, &settings.internet_iface) {
            ipt.insert_rule(&rule).context("failed to set up NAT")?;
            res.nat_rules.push(rule);
        }
    }
    if wants_dns {
        for rule in iptables::dns_rules(&settings.gateway, &subnet, settings.dns_port) {
            ipt.insert_rule(&rule)
                .context("failed to redirect DNS to the gateway")?;
            res.dns_rules.push(rule);
        }
    }
    if dnsmasq_enabled {
        let rule = iptables::dhcp_input_rule();
        ipt.insert_rule(&rule).context("failed to open the DHCP port")?;
        res.dhcp_rule = Some(rule);
    }
    Ok(())
}

fn start_dnsmasq(settings: &Settings, res: &mut Resources) -> Result<()> {
    let bind_mode = dnsmasq::detect_bind_mode().unwrap_or(BindMode::Interfaces);
    let mtu = if settings.share_method == ShareMethod::Nat {
        wireless::interface_mtu(&settings.internet_iface)
    } else {
        None
    };
    let dhcp_dns = if settings.no_dns {
        Vec::new()
    } else if settings.dhcp_dns.is_empty() {
        vec![settings.gateway.clone()]
    } else {
        settings.dhcp_dns.clone()
    };

    let config = DnsmasqConfig {
        gateway: settings.gateway.clone(),
        bind_mode,
        dhcp_dns,
        mtu,
        etc_hosts: settings.etc_hosts,
        addn_hosts: settings.addn_hosts.clone(),
        dhcp_hosts: settings.dhcp_hosts.clone(),
        log_file: settings.dns_logfile.clone(),
        redirect_all: settings.share_method == ShareMethod::None && settings.redirect_to_localhost,
    };
    let conf = config.write_to(&res.run_dir)?;

    let dns_port = if settings.no_dns { 0 } else { settings.dns_port };
    dnsmasq::spawn(
        &conf,
        &res.run_dir.join("dnsmasq.pid"),
        &res.run_dir.join("dnsmasq.leases"),
        dns_port,
    )
    .context("failed to start dnsmasq")?;
    Ok(())
}

fn start_hostapd(
    settings: &Settings,
    res: &mut Resources,
    ap_iface: &str,
    band: Band,
) -> Result<Child> {
    let ctrl_dir = res.run_dir.join(HOSTAPD_CTRL_DIR);
    fs::create_dir_all(&ctrl_dir)?;

    let config = HostapdConfig {
        ssid: settings.ssid.clone(),
        interface: ap_iface.to_string(),
        driver: settings.driver.clone(),
        channel: settings.channel,
        ctrl_interface: ctrl_dir,
        hidden: settings.hidden,
        isolate_clients: settings.isolate_clients,
        country: settings.country.clone(),
        band,
        mac_filter_accept: settings.mac_filter_accept.clone(),
        ieee80211n: settings.ieee80211n,
        ht_capab: settings.ieee80211n.then(|| settings.ht_capab.clone()),
        ieee80211ac: settings.ieee80211ac,
        ieee80211ax: settings.ieee80211ax,
        vht_capab: settings.vht_capab.clone(),
        wmm_enabled: settings.ieee80211n || settings.ieee80211ac || settings.ieee80211ax,
        security: settings.security.clone(),
        bridge: if settings.share_method == ShareMethod::Bridge {
            res.bridge_iface.clone()
        } else {
            None
        },
    };
    let conf = config.write_to(&res.run_dir)?;
    hostapd::spawn(&conf, &res.run_dir.join("hostapd.pid")).context("failed to start hostapd")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHY_INFO: &str = "\
Wiphy phy0
	Supported interface modes:
		 * managed
		 * AP
	software interface modes (can always be added):
	valid interface combinations:
		 * #{ managed, AP, P2P-client } <= 2,
		   total <= 2, #channels <= 2
	Band 1:
		Frequencies:
			* 2412 MHz [1] (20.0 dBm)
			* 2437 MHz [6] (20.0 dBm)
			* 2462 MHz [11] (20.0 dBm)
			* 2467 MHz [12] (disabled)
	Band 2:
		Frequencies:
			* 5180 MHz [36] (20.0 dBm)
			* 5260 MHz [52] (20.0 dBm) (no IR, radar detection)
";

    const SINGLE_CHANNEL_INFO: &str = "\
Wiphy phy1
	valid interface combinations:
		 * #{ managed, AP } <= 2,
		   total <= 2, #channels <= 1
	Band 1:
		Frequencies:
			* 2412 MHz [1] (20.0 dBm)
			* 2437 MHz [6] (20.0 dBm)
";

    #[test]
    fn unassociated_adapter_keeps_requested_channel() {
        let (band, channel) = negotiate_channel(PHY_INFO, 6, None, None).unwrap();
        assert_eq!(band, Band::Ghz2);
        assert_eq!(channel, 6);
    }

    #[test]
    fn disabled_channel_is_rejected() {
        assert!(negotiate_channel(PHY_INFO, 12, None, None).is_err());
        assert!(negotiate_channel(PHY_INFO, 52, Some(Band::Ghz5), None).is_err());
    }

    #[test]
    fn single_channel_adapter_follows_the_association() {
        // Associated on channel 1 (2412 MHz), channel 6 requested.
        let (band, channel) =
            negotiate_channel(SINGLE_CHANNEL_INFO, 6, None, Some(2412)).unwrap();
        assert_eq!(band, Band::Ghz2);
        assert_eq!(channel, 1);
    }

    #[test]
    fn multi_channel_adapter_keeps_requested_channel_when_associated() {
        let (band, channel) = negotiate_channel(PHY_INFO, 11, None, Some(2412)).unwrap();
        assert_eq!(band, Band::Ghz2);
        assert_eq!(channel, 11);
    }

    #[test]
    fn fallback_to_an_untransmittable_association_channel_is_fatal() {
        // Associated on a DFS channel (5260 MHz = 52, no IR) with a
        // single-channel radio; falling back there would make hostapd fail,
        // so bring-up must die instead.
        let info = "\
Wiphy phy2
	valid interface combinations:
		 * #{ managed, AP } <= 2,
		   total <= 2, #channels <= 1
	Band 2:
		Frequencies:
			* 5180 MHz [36] (20.0 dBm)
			* 5260 MHz [52] (20.0 dBm) (no IR, radar detection)
";
        let err = negotiate_channel(info, 36, Some(Band::Ghz5), Some(5260)).unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn matching_association_channel_needs_no_multichannel_support() {
        let (band, channel) =
            negotiate_channel(SINGLE_CHANNEL_INFO, 1, None, Some(2412)).unwrap();
        assert_eq!(band, Band::Ghz2);
        assert_eq!(channel, 1);
    }

    #[test]
    fn subnet_and_broadcast_derive_from_gateway() {
        assert_eq!(subnet_of("192.168.12.1").unwrap(), "192.168.12.0/24");
        assert_eq!(broadcast_of("192.168.12.1").unwrap(), "192.168.12.255");
        assert!(subnet_of("not an address").is_err());
    }
}
