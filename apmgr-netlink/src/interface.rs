//! Link, address, route and bridge manipulation through the `ip` tool.
//!
//! Bridge sharing moves the Internet-facing interface's addresses and routes
//! onto the bridge. The existing state is captured first, replayed onto the
//! bridge (non-default routes before default routes, since a default route
//! needs its on-link subnet present), and rolled back symmetrically when any
//! replay step fails.

use crate::error::{NetError, Result};
use crate::wireless::run_cmd;

pub fn set_link_up(iface: &str) -> Result<()> {
    run_cmd("ip", &["link", "set", "up", "dev", iface]).map(|_| ())
}

pub fn set_link_down(iface: &str) -> Result<()> {
    run_cmd("ip", &["link", "set", "down", "dev", iface]).map(|_| ())
}

pub fn set_mac(iface: &str, mac: &str) -> Result<()> {
    run_cmd("ip", &["link", "set", "dev", iface, "address", mac]).map(|_| ())
}

pub fn flush_addresses(iface: &str) -> Result<()> {
    run_cmd("ip", &["addr", "flush", iface]).map(|_| ())
}

/// Assign `addr/24` with its broadcast address.
pub fn add_address(iface: &str, addr: &str, broadcast: &str) -> Result<()> {
    let cidr = format!("{}/24", addr);
    run_cmd(
        "ip",
        &["addr", "add", &cidr, "broadcast", broadcast, "dev", iface],
    )
    .map(|_| ())
}

pub fn create_bridge(name: &str) -> Result<()> {
    run_cmd("ip", &["link", "add", "name", name, "type", "bridge"]).map(|_| ())
}

pub fn delete_link(name: &str) -> Result<()> {
    run_cmd("ip", &["link", "del", name]).map(|_| ())
}

pub fn set_master(iface: &str, bridge: &str) -> Result<()> {
    run_cmd("ip", &["link", "set", "dev", iface, "master", bridge]).map(|_| ())
}

pub fn unset_master(iface: &str) -> Result<()> {
    run_cmd("ip", &["link", "set", "dev", iface, "nomaster"]).map(|_| ())
}

/// Create a virtual AP interface on top of `parent`.
pub fn add_virtual_ap(parent: &str, name: &str) -> Result<()> {
    run_cmd(
        "iw",
        &["dev", parent, "interface", "add", name, "type", "__ap"],
    )
    .map(|_| ())
}

pub fn delete_virtual_iface(name: &str) -> Result<()> {
    run_cmd("iw", &["dev", name, "del"]).map(|_| ())
}

/// An IPv4 address as captured from `ip -o addr show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedAddress {
    pub cidr: String,
    pub broadcast: Option<String>,
}

/// Addresses and routes of an interface, captured before it is enslaved to a
/// bridge so they can be replayed onto the bridge (and back on teardown).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedNetState {
    pub addresses: Vec<SavedAddress>,
    /// Route specs without the `dev` part, in `ip route show` order
    pub routes: Vec<String>,
}

impl SavedNetState {
    pub fn capture(iface: &str) -> Result<Self> {
        let addrs = run_cmd("ip", &["-o", "addr", "show", "dev", iface])?;
        let routes = run_cmd("ip", &["route", "show", "dev", iface])?;
        Ok(Self {
            addresses: parse_addr_show(&addrs),
            routes: parse_route_show(&routes),
        })
    }

    /// Non-default routes first; a default route is unusable until its
    /// gateway's subnet route exists.
    pub fn ordered_routes(&self) -> Vec<&str> {
        let mut ordered: Vec<&str> = Vec::with_capacity(self.routes.len());
        ordered.extend(
            self.routes
                .iter()
                .filter(|r| !r.starts_with("default"))
                .map(String::as_str),
        );
        ordered.extend(
            self.routes
                .iter()
                .filter(|r| r.starts_with("default"))
                .map(String::as_str),
        );
        ordered
    }

    /// Replay the captured addresses and routes onto `iface`.
    ///
    /// Any failure undoes what this call already applied and returns the
    /// error; half-migrated network state must not be left behind.
    pub fn apply_to(&self, iface: &str) -> Result<()> {
        let mut applied_addrs: Vec<&SavedAddress> = Vec::new();
        let mut applied_routes: Vec<&str> = Vec::new();

        let result = (|| {
            for addr in &self.addresses {
                apply_address(iface, addr)?;
                applied_addrs.push(addr);
            }
            for route in self.ordered_routes() {
                apply_route(iface, route)?;
                applied_routes.push(route);
            }
            Ok(())
        })();

        if let Err(e) = result {
            log::error!("failed to apply saved state to {}: {}", iface, e);
            for route in applied_routes.iter().rev() {
                let _ = remove_route(iface, route);
            }
            for addr in applied_addrs.iter().rev() {
                let _ = remove_address(iface, addr);
            }
            return Err(e);
        }
        Ok(())
    }
}

fn apply_address(iface: &str, addr: &SavedAddress) -> Result<()> {
    let mut args = vec!["addr", "add", addr.cidr.as_str()];
    if let Some(brd) = &addr.broadcast {
        args.push("broadcast");
        args.push(brd);
    }
    args.extend(["dev", iface]);
    run_cmd("ip", &args).map(|_| ())
}

fn remove_address(iface: &str, addr: &SavedAddress) -> Result<()> {
    run_cmd("ip", &["addr", "del", &addr.cidr, "dev", iface]).map(|_| ())
}

fn apply_route(iface: &str, route: &str) -> Result<()> {
    let mut args = vec!["route", "add"];
    args.extend(route.split_whitespace());
    args.extend(["dev", iface]);
    run_cmd("ip", &args).map(|_| ())
}

fn remove_route(iface: &str, route: &str) -> Result<()> {
    let mut args = vec!["route", "del"];
    args.extend(route.split_whitespace());
    args.extend(["dev", iface]);
    run_cmd("ip", &args).map(|_| ())
}

/// IPv4 addresses from `ip -o addr show dev <iface>` one-line output.
fn parse_addr_show(output: &str) -> Vec<SavedAddress> {
    let mut addrs = Vec::new();
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(inet) = tokens.iter().position(|t| *t == "inet") else {
            continue;
        };
        let Some(cidr) = tokens.get(inet + 1) else {
            continue;
        };
        let broadcast = match tokens.get(inet + 2) {
            Some(&"brd") => tokens.get(inet + 3).map(|b| b.to_string()),
            _ => None,
        };
        addrs.push(SavedAddress {
            cidr: cidr.to_string(),
            broadcast,
        });
    }
    addrs
}

/// Route specs from `ip route show dev <iface>`, stripped of attributes that
/// do not survive replay on a different device.
fn parse_route_show(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            // `proto kernel` routes reappear on their own when the address
            // is configured; keep the spec but drop the proto/scope/src
            // attributes tied to the old device.
            let mut kept: Vec<&str> = Vec::new();
            let mut tokens = line.split_whitespace().peekable();
            while let Some(token) = tokens.next() {
                match token {
                    "proto" | "scope" | "src" | "metric" => {
                        tokens.next();
                    }
                    other => kept.push(other),
                }
            }
            kept.join(" ")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR_SHOW: &str = "\
2: eth0    inet 192.168.1.5/24 brd 192.168.1.255 scope global dynamic eth0\\       valid_lft 85000sec preferred_lft 85000sec
2: eth0    inet 10.0.0.2/8 scope global eth0\\       valid_lft forever preferred_lft forever
2: eth0    inet6 fe80::1/64 scope link \\       valid_lft forever preferred_lft forever
";

    #[test]
    fn parses_ipv4_addresses_with_broadcast() {
        let addrs = parse_addr_show(ADDR_SHOW);
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].cidr, "192.168.1.5/24");
        assert_eq!(addrs[0].broadcast.as_deref(), Some("192.168.1.255"));
        assert_eq!(addrs[1].cidr, "10.0.0.2/8");
        assert_eq!(addrs[1].broadcast, None);
    }

    const ROUTE_SHOW: &str = "\
default via 192.168.1.1 proto dhcp metric 100
192.168.1.0/24 proto kernel scope link src 192.168.1.5 metric 100
10.9.0.0/16 via 192.168.1.254
";

    #[test]
    fn route_parsing_strips_device_bound_attributes() {
        let routes = parse_route_show(ROUTE_SHOW);
        assert_eq!(
            routes,
            vec![
                "default via 192.168.1.1",
                "192.168.1.0/24",
                "10.9.0.0/16 via 192.168.1.254",
            ]
        );
    }

    #[test]
    fn default_routes_replay_last() {
        let state = SavedNetState {
            addresses: Vec::new(),
            routes: parse_route_show(ROUTE_SHOW),
        };
        let ordered = state.ordered_routes();
        assert_eq!(
            ordered,
            vec![
                "192.168.1.0/24",
                "10.9.0.0/16 via 192.168.1.254",
                "default via 192.168.1.1",
            ]
        );
    }
}
