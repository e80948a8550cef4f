//! iptables rule construction and application.
//!
//! Rules are built with a typed builder, rendered to argument vectors and
//! applied through the `iptables` binary with `-w` so concurrent instances
//! queue on the xtables lock instead of failing. The same [`Rule`] value is
//! used for insertion (`-I`) and deletion (`-D`), which keeps setup and
//! teardown symmetric by construction.

use std::process::Command;

use crate::error::{NetError, Result};

/// Table types in netfilter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    fn as_str(&self) -> &str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

/// Chain names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Input,
    Forward,
    Prerouting,
    Postrouting,
}

impl Chain {
    fn as_str(&self) -> &str {
        match self {
            Chain::Input => "INPUT",
            Chain::Forward => "FORWARD",
            Chain::Prerouting => "PREROUTING",
            Chain::Postrouting => "POSTROUTING",
        }
    }
}

/// Target actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Accept,
    Masquerade,
    /// REDIRECT to a local port (transparent DNS interception)
    Redirect { to_ports: u16 },
}

impl Target {
    fn as_str(&self) -> &str {
        match self {
            Target::Accept => "ACCEPT",
            Target::Masquerade => "MASQUERADE",
            Target::Redirect { .. } => "REDIRECT",
        }
    }
}

/// Protocol types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_str(&self) -> &str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Iptables rule builder
#[derive(Debug, Clone)]
pub struct Rule {
    table: Table,
    chain: Chain,
    protocol: Option<Protocol>,
    in_interface: Option<String>,
    /// (name, negated); negated renders as `! -o <name>`
    out_interface: Option<(String, bool)>,
    source: Option<String>,
    destination: Option<String>,
    dst_port: Option<u16>,
    target: Target,
}

impl Rule {
    pub fn new(table: Table, chain: Chain, target: Target) -> Self {
        Self {
            table,
            chain,
            protocol: None,
            in_interface: None,
            out_interface: None,
            source: None,
            destination: None,
            dst_port: None,
            target,
        }
    }

    pub fn protocol(mut self, proto: Protocol) -> Self {
        self.protocol = Some(proto);
        self
    }

    pub fn in_interface(mut self, iface: &str) -> Self {
        self.in_interface = Some(iface.to_string());
        self
    }

    pub fn out_interface(mut self, iface: &str) -> Self {
        self.out_interface = Some((iface.to_string(), false));
        self
    }

    /// Match any output interface except `iface`.
    pub fn not_out_interface(mut self, iface: &str) -> Self {
        self.out_interface = Some((iface.to_string(), true));
        self
    }

    /// Source address or CIDR network.
    pub fn source(mut self, addr: &str) -> Self {
        self.source = Some(addr.to_string());
        self
    }

    /// Destination address or CIDR network.
    pub fn destination(mut self, addr: &str) -> Self {
        self.destination = Some(addr.to_string());
        self
    }

    pub fn dst_port(mut self, port: u16) -> Self {
        self.dst_port = Some(port);
        self
    }

    fn to_args(&self, action: &str) -> Vec<String> {
        let mut args = vec![
            "-w".to_string(),
            "-t".to_string(),
            self.table.as_str().to_string(),
            action.to_string(),
            self.chain.as_str().to_string(),
        ];

        if let Some(src) = &self.source {
            args.push("-s".to_string());
            args.push(src.clone());
        }

        if let Some(dst) = &self.destination {
            args.push("-d".to_string());
            args.push(dst.clone());
        }

        if let Some(iface) = &self.in_interface {
            args.push("-i".to_string());
            args.push(iface.clone());
        }

        if let Some((iface, negated)) = &self.out_interface {
            if *negated {
                args.push("!".to_string());
            }
            args.push("-o".to_string());
            args.push(iface.clone());
        }

        if let Some(proto) = &self.protocol {
            args.push("-p".to_string());
            args.push(proto.as_str().to_string());
            args.push("-m".to_string());
            args.push(proto.as_str().to_string());
        }

        if let Some(port) = self.dst_port {
            args.push("--dport".to_string());
            args.push(port.to_string());
        }

        args.push("-j".to_string());
        args.push(self.target.as_str().to_string());

        if let Target::Redirect { to_ports } = &self.target {
            args.push("--to-ports".to_string());
            args.push(to_ports.to_string());
        }

        args
    }
}

/// NAT internet sharing: masquerade the client subnet out of every interface
/// except the AP's own, and accept forwarded traffic in both directions.
pub fn nat_rules(subnet: &str, wifi_iface: &str, internet_iface: &str) -> Vec<Rule> {
    vec![
        Rule::new(Table::Nat, Chain::Postrouting, Target::Masquerade)
            .source(subnet)
            .not_out_interface(wifi_iface),
        Rule::new(Table::Filter, Chain::Forward, Target::Accept)
            .in_interface(wifi_iface)
            .source(subnet),
        Rule::new(Table::Filter, Chain::Forward, Target::Accept)
            .in_interface(internet_iface)
            .destination(subnet),
    ]
}

/// Redirect client DNS queries aimed at the gateway onto dnsmasq's port and
/// open that port on INPUT.
pub fn dns_rules(gateway: &str, subnet: &str, dns_port: u16) -> Vec<Rule> {
    let mut rules = Vec::new();
    for proto in [Protocol::Tcp, Protocol::Udp] {
        rules.push(
            Rule::new(Table::Nat, Chain::Prerouting, Target::Redirect { to_ports: dns_port })
                .source(subnet)
                .destination(gateway)
                .protocol(proto)
                .dst_port(53),
        );
    }
    for proto in [Protocol::Tcp, Protocol::Udp] {
        rules.push(
            Rule::new(Table::Filter, Chain::Input, Target::Accept)
                .protocol(proto)
                .dst_port(dns_port),
        );
    }
    rules
}

/// Accept DHCP requests from clients.
pub fn dhcp_input_rule() -> Rule {
    Rule::new(Table::Filter, Chain::Input, Target::Accept)
        .protocol(Protocol::Udp)
        .dst_port(67)
}

/// Applies and removes rules through the `iptables` binary.
pub struct IptablesManager;

impl IptablesManager {
    /// Returns `NetError::PermissionDenied` when not running as root.
    pub fn new() -> Result<Self> {
        if unsafe { libc::geteuid() } != 0 {
            log::error!("iptables operations require root privileges");
            return Err(NetError::PermissionDenied);
        }
        Ok(Self)
    }

    fn execute(&self, args: &[String]) -> Result<()> {
        log::debug!("executing: iptables {}", args.join(" "));

        let output = Command::new("iptables")
            .args(args)
            .output()
            .map_err(|e| NetError::CommandFailed(format!("failed to spawn iptables: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetError::CommandFailed(stderr.trim().to_string()));
        }
        Ok(())
    }

    /// Insert a rule at the head of its chain.
    pub fn insert_rule(&self, rule: &Rule) -> Result<()> {
        self.execute(&rule.to_args("-I"))
    }

    /// Delete a rule. A rule that is already gone is not an error; teardown
    /// must cope with partially applied setups.
    pub fn delete_rule(&self, rule: &Rule) -> Result<()> {
        self.execute(&rule.to_args("-D")).or_else(|e| {
            if e.to_string().contains("does a matching rule exist") {
                log::debug!("rule already absent, nothing to delete");
                Ok(())
            } else {
                Err(e)
            }
        })
    }

    pub fn insert_rules(&self, rules: &[Rule]) -> Result<()> {
        for rule in rules {
            self.insert_rule(rule)?;
        }
        Ok(())
    }

    /// Best-effort removal of every rule in the set.
    pub fn delete_rules(&self, rules: &[Rule]) {
        for rule in rules {
            if let Err(e) = self.delete_rule(rule) {
                log::warn!("failed to delete iptables rule: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masquerade_rule_args() {
        let rules = nat_rules("192.168.12.0/24", "xap0", "eth0");
        let args = rules[0].to_args("-I");
        assert_eq!(
            args,
            vec![
                "-w",
                "-t",
                "nat",
                "-I",
                "POSTROUTING",
                "-s",
                "192.168.12.0/24",
                "!",
                "-o",
                "xap0",
                "-j",
                "MASQUERADE"
            ]
        );
    }

    #[test]
    fn forward_rules_cover_both_directions() {
        let rules = nat_rules("192.168.12.0/24", "xap0", "eth0");
        assert_eq!(rules.len(), 3);

        let inbound = rules[1].to_args("-I");
        assert!(inbound.windows(2).any(|w| w == ["-i", "xap0"]));
        assert!(inbound.windows(2).any(|w| w == ["-s", "192.168.12.0/24"]));

        let outbound = rules[2].to_args("-I");
        assert!(outbound.windows(2).any(|w| w == ["-i", "eth0"]));
        assert!(outbound.windows(2).any(|w| w == ["-d", "192.168.12.0/24"]));
    }

    #[test]
    fn dns_redirect_targets_custom_port() {
        let rules = dns_rules("192.168.12.1", "192.168.12.0/24", 5353);
        assert_eq!(rules.len(), 4);

        let redirect = rules[0].to_args("-I");
        assert!(redirect.windows(2).any(|w| w == ["--dport", "53"]));
        assert!(redirect.windows(2).any(|w| w == ["--to-ports", "5353"]));
        assert!(redirect.contains(&"REDIRECT".to_string()));
        // Protocol match module is explicit
        assert!(redirect.windows(2).any(|w| w == ["-m", "tcp"]));

        let input = rules[2].to_args("-I");
        assert!(input.windows(2).any(|w| w == ["--dport", "5353"]));
        assert!(input.contains(&"ACCEPT".to_string()));
    }

    #[test]
    fn insert_and_delete_args_differ_only_in_action() {
        let rule = dhcp_input_rule();
        let insert = rule.to_args("-I");
        let delete = rule.to_args("-D");
        assert_eq!(insert.len(), delete.len());
        for (a, b) in insert.iter().zip(delete.iter()) {
            if a != b {
                assert_eq!(a, "-I");
                assert_eq!(b, "-D");
            }
        }
    }
}
