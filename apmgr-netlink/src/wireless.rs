//! Wireless adapter queries via sysfs and the `iw` tool.
//!
//! Everything the controller needs to know about an adapter before
//! committing to AP mode lives here: current association frequency, channel
//! conversion, AP capability, MAC address helpers. Parsing is split from
//! command invocation so the parsers can be exercised on captured output.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use regex::Regex;

use crate::error::{NetError, Result};

/// Run an external command and capture stdout.
pub fn run_cmd(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| NetError::CommandFailed(format!("{} {}: {}", program, args.join(" "), e)))?;
    if !output.status.success() {
        return Err(NetError::CommandFailed(format!(
            "{} {}: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Whether `tool` resolves on PATH.
pub fn tool_exists(tool: &str) -> bool {
    Command::new("which")
        .arg(tool)
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Fail early when a required external tool is missing.
pub fn ensure_tools_present(tools: &[&str]) -> Result<()> {
    for tool in tools {
        if !tool_exists(tool) {
            return Err(NetError::CommandFailed(format!(
                "required tool {} not found on PATH",
                tool
            )));
        }
    }
    Ok(())
}

pub fn is_interface(iface: &str) -> bool {
    Path::new("/sys/class/net").join(iface).exists()
}

pub fn is_bridge_interface(iface: &str) -> bool {
    Path::new("/sys/class/net").join(iface).join("bridge").exists()
}

pub fn is_wifi_interface(iface: &str) -> bool {
    run_cmd("iw", &["dev", iface, "info"]).is_ok()
}

/// MAC address of `iface` from sysfs.
pub fn interface_mac(iface: &str) -> Option<String> {
    let addr = fs::read_to_string(Path::new("/sys/class/net").join(iface).join("address")).ok()?;
    let addr = addr.trim().to_string();
    is_macaddr(&addr).then_some(addr)
}

/// MAC addresses of every interface on the system.
pub fn all_macs() -> HashSet<String> {
    let mut macs = HashSet::new();
    if let Ok(entries) = fs::read_dir("/sys/class/net") {
        for entry in entries.flatten() {
            if let Some(mac) = interface_mac(&entry.file_name().to_string_lossy()) {
                macs.insert(mac);
            }
        }
    }
    macs
}

pub fn interface_mtu(iface: &str) -> Option<u32> {
    fs::read_to_string(Path::new("/sys/class/net").join(iface).join("mtu"))
        .ok()?
        .trim()
        .parse()
        .ok()
}

pub fn is_macaddr(mac: &str) -> bool {
    let mut parts = 0;
    for part in mac.split(':') {
        if part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
            return false;
        }
        parts += 1;
    }
    parts == 6
}

/// Unicast MACs have an even first octet; hostapd refuses multicast BSSIDs.
pub fn is_unicast_macaddr(mac: &str) -> bool {
    if !is_macaddr(mac) {
        return false;
    }
    match u8::from_str_radix(&mac[..2], 16) {
        Ok(first) => first % 2 == 0,
        Err(_) => false,
    }
}

/// Derive a fresh unicast MAC from `current` by stepping the last octet,
/// skipping anything in `taken`.
pub fn next_free_macaddr(current: &str, taken: &HashSet<String>) -> Option<String> {
    if !is_macaddr(current) {
        return None;
    }
    let prefix = &current[..current.len() - 2];
    let last = u8::from_str_radix(&current[current.len() - 2..], 16).ok()?;
    for step in 1..=255u16 {
        let candidate = format!("{}{:02x}", prefix, (last as u16 + step) as u8);
        if is_unicast_macaddr(&candidate) && !taken.contains(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Frequency line from `iw dev <iface> link` output, in MHz.
pub fn parse_link_frequency(output: &str) -> Option<u32> {
    let line = output.lines().find(|l| l.trim_start().starts_with("freq:"))?;
    let value = line.split(':').nth(1)?.trim();
    // iw may print fractional MHz
    value.split('.').next()?.parse().ok()
}

/// Frequency the interface is currently associated on.
pub fn interface_frequency(iface: &str) -> Result<u32> {
    let output = run_cmd("iw", &["dev", iface, "link"])?;
    parse_link_frequency(&output).ok_or_else(|| {
        NetError::Parse(format!("no frequency in iw link output for {}", iface))
    })
}

pub fn is_wifi_connected(iface: &str) -> bool {
    match run_cmd("iw", &["dev", iface, "link"]) {
        Ok(out) => out.contains("Connected to"),
        Err(_) => false,
    }
}

/// Convert a frequency in MHz to an IEEE 802.11 channel number.
///
/// Mapping as used by the iw tool; 0 means no defined channel.
pub fn frequency_to_channel(freq: u32) -> u32 {
    if freq < 1000 {
        0
    } else if freq == 2484 {
        14
    } else if freq == 5935 {
        2
    } else if freq < 2484 {
        (freq - 2407) / 5
    } else if (4910..=4980).contains(&freq) {
        (freq - 4000) / 5
    } else if freq < 5950 {
        (freq - 5000) / 5
    } else if freq <= 45000 {
        (freq - 5950) / 5
    } else if (58320..=70200).contains(&freq) {
        (freq - 56160) / 2160
    } else {
        0
    }
}

pub fn is_5ghz_frequency(freq: u32) -> bool {
    (4900..6000).contains(&freq)
}

/// Frequency band the AP operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Ghz2,
    Ghz5,
}

impl Band {
    pub fn from_frequency(freq: u32) -> Self {
        if is_5ghz_frequency(freq) {
            Band::Ghz5
        } else {
            Band::Ghz2
        }
    }

    /// hostapd `hw_mode` value for this band.
    pub fn hw_mode(&self) -> &'static str {
        match self {
            Band::Ghz2 => "g",
            Band::Ghz5 => "a",
        }
    }

    pub fn as_ghz(&self) -> &'static str {
        match self {
            Band::Ghz2 => "2.4",
            Band::Ghz5 => "5",
        }
    }
}

/// The phy device backing a network interface.
pub fn phy_device(iface: &str) -> Option<String> {
    phy_device_in(Path::new("/sys/class/ieee80211"), iface)
}

fn phy_device_in(root: &Path, iface: &str) -> Option<String> {
    for entry in fs::read_dir(root).ok()?.flatten() {
        let phy = entry.file_name().to_string_lossy().into_owned();
        let base: PathBuf = root.join(&phy).join("device");
        if phy == iface
            || base.join("net").join(iface).exists()
            || base.join(format!("net:{}", iface)).exists()
        {
            return Some(phy);
        }
    }
    None
}

/// Full `iw phy <phy> info` dump for the interface's radio.
pub fn adapter_info(iface: &str) -> Result<String> {
    let phy = phy_device(iface)
        .ok_or_else(|| NetError::Interface(format!("no phy device for {}", iface)))?;
    run_cmd("iw", &["phy", &phy, "info"])
}

/// Kernel module driving the interface, from the sysfs driver symlink.
pub fn kernel_module(iface: &str) -> Option<String> {
    let link = Path::new("/sys/class/net")
        .join(iface)
        .join("device/driver/module");
    let target = fs::canonicalize(link).ok()?;
    Some(target.file_name()?.to_string_lossy().into_owned())
}

/// Whether the radio advertises an AP interface combination.
pub fn can_be_ap(info: &str) -> bool {
    match Regex::new(r"\{[^}]*\bAP\b[^}]*\}") {
        Ok(re) => re.is_match(info),
        Err(_) => false,
    }
}

/// Whether the radio can run a managed station and an AP at the same time.
pub fn can_be_sta_and_ap(info: &str) -> bool {
    let combined = Regex::new(r"\{\s*managed[^}]*\bAP\b[^}]*\}|\{[^}]*\bAP\b[^}]*managed\s*\}");
    match combined {
        Ok(re) => re.is_match(info),
        Err(_) => false,
    }
}

/// Whether the radio can operate on two or more channels at once
/// (`#channels <= N` in the interface combination block).
pub fn supports_multiple_channels(info: &str) -> bool {
    let Ok(re) = Regex::new(r"#channels\s*<=\s*(\d+)") else {
        return false;
    };
    let found = re
        .captures_iter(info)
        .filter_map(|c| c.get(1)?.as_str().parse::<u32>().ok())
        .any(|n| n >= 2);
    found
}

/// MACs of associated stations from `iw dev <iface> station dump` output.
pub fn parse_station_dump(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim_start().strip_prefix("Station ")?;
            let mac = rest.split_whitespace().next()?;
            is_macaddr(mac).then(|| mac.to_string())
        })
        .collect()
}

/// Stations currently associated with the AP interface.
pub fn station_macs(iface: &str) -> Result<Vec<String>> {
    let output = run_cmd("iw", &["dev", iface, "station", "dump"])?;
    Ok(parse_station_dump(&output))
}

/// Whether the radio may transmit on `channel` in `band`.
///
/// Frequencies flagged `no IR` or `disabled` in the phy dump cannot host an
/// AP; this is checked up front rather than discovered when hostapd fails.
pub fn can_transmit_on_channel(info: &str, band: Band, channel: u32) -> bool {
    let pattern = match band {
        Band::Ghz2 => format!(r" 24[0-9][0-9](?:\.0+)? MHz \[{}\]", channel),
        Band::Ghz5 => format!(r" (?:49[0-9][0-9]|5[0-9]{{3}})(?:\.0+)? MHz \[{}\]", channel),
    };
    let Ok(re) = Regex::new(&pattern) else {
        return false;
    };
    for line in info.lines() {
        if re.is_match(line) {
            return !line.contains("no IR") && !line.contains("disabled");
        }
    }
    false
}
