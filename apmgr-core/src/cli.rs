use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "apmgr",
    author,
    version,
    about = "Wi-Fi access point lifecycle manager"
)]
pub struct Cli {
    /// Config file with default values
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bring up an access point and run until signalled
    Start(StartArgs),
    /// Stop a running instance by PID or WiFi interface
    Stop {
        /// PID or WiFi interface of the instance (see list-running)
        id: String,
    },
    /// Show the instances that are already running
    ListRunning,
    /// List the clients connected to an instance
    ListClients {
        /// PID or WiFi interface of the instance; pass the virtual
        /// interface if one was created
        id: String,
    },
    /// Persist the given start options as defaults without starting
    Configure(StartArgs),
    /// Remove the unmanaged-devices entries left in NetworkManager.conf
    /// after an instance was killed uncleanly
    FixUnmanaged,
    /// List wireless interfaces available on this machine
    Interfaces,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ShareMethod {
    Nat,
    Bridge,
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum WpaVersionArg {
    #[value(name = "1")]
    One,
    #[value(name = "2")]
    Two,
    #[value(name = "1+2")]
    Mixed,
    #[value(name = "3")]
    Three,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FreqBandArg {
    #[value(name = "2.4")]
    Ghz2,
    #[value(name = "5")]
    Ghz5,
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// WiFi interface to run the AP on
    #[arg(long, default_value = "wlan0")]
    pub wifi_iface: String,

    /// Internet-facing interface to share
    #[arg(long, default_value = "eth0")]
    pub internet_iface: String,

    /// SSID for the access point
    #[arg(long)]
    pub ssid: Option<String>,

    /// WPA passphrase (8..63 characters); omit for an open network
    #[arg(long)]
    pub password: Option<String>,

    /// Use a 64 hex digit pre-shared key instead of a passphrase
    #[arg(long)]
    pub use_psk: bool,

    /// 64 hex digit pre-shared key
    #[arg(long)]
    pub psk: Option<String>,

    /// Method for Internet sharing
    #[arg(short = 'm', long, value_enum, default_value_t = ShareMethod::Nat)]
    pub share_method: ShareMethod,

    /// Channel number
    #[arg(long, default_value_t = 6)]
    pub channel: u32,

    /// WPA version
    #[arg(short = 'w', long, value_enum, default_value_t = WpaVersionArg::Two)]
    pub wpa_version: WpaVersionArg,

    /// Make the access point hidden (do not broadcast the SSID)
    #[arg(long)]
    pub hidden: bool,

    /// Enable MAC address filtering
    #[arg(long)]
    pub mac_filter: bool,

    /// Location of the MAC address filter list
    #[arg(long, default_value = "/etc/hostapd/hostapd.accept")]
    pub mac_filter_accept: PathBuf,

    /// With share method none, resolve every name to the gateway
    #[arg(long)]
    pub redirect_to_localhost: bool,

    /// Disable communication between clients
    #[arg(long)]
    pub isolate_clients: bool,

    /// Enable IEEE 802.11n (HT)
    #[arg(long)]
    pub ieee80211n: bool,

    /// Enable IEEE 802.11ac (VHT)
    #[arg(long)]
    pub ieee80211ac: bool,

    /// Enable IEEE 802.11ax (HE)
    #[arg(long)]
    pub ieee80211ax: bool,

    /// HT capabilities
    #[arg(long, default_value = "[HT40+]")]
    pub ht_capab: String,

    /// VHT capabilities
    #[arg(long)]
    pub vht_capab: Option<String>,

    /// Two-letter country code for regulatory compliance (example: US)
    #[arg(long)]
    pub country: Option<String>,

    /// Frequency band; defaults to whatever the current association uses
    #[arg(long, value_enum)]
    pub freq_band: Option<FreqBandArg>,

    /// WiFi adapter driver for hostapd
    #[arg(long, default_value = "nl80211")]
    pub driver: String,

    /// Run the AP directly on the WiFi interface instead of creating a
    /// virtual one
    #[arg(long)]
    pub no_virt: bool,

    /// Do not start haveged automatically when entropy runs low
    #[arg(long)]
    pub no_haveged: bool,

    /// MAC address for the AP interface
    #[arg(long)]
    pub mac: Option<String>,

    /// DNS servers returned by DHCP (repeatable)
    #[arg(long = "dhcp-dns")]
    pub dhcp_dns: Vec<String>,

    /// dnsmasq dhcp-host= entries for static leases (repeatable)
    #[arg(long = "dhcp-host")]
    pub dhcp_hosts: Vec<String>,

    /// IPv4 gateway for the access point
    #[arg(long, default_value = "192.168.12.1")]
    pub gateway: String,

    /// Listen port for the DNS server
    #[arg(long, default_value_t = 53)]
    pub dns_port: u16,

    /// Disable the dnsmasq DNS server (DHCP stays)
    #[arg(long)]
    pub no_dns: bool,

    /// Disable dnsmasq completely
    #[arg(long)]
    pub no_dnsmasq: bool,

    /// DNS server takes /etc/hosts into account
    #[arg(short = 'd', long)]
    pub etc_hosts: bool,

    /// Additional hosts files for the DNS server (repeatable)
    #[arg(long = "addn-hosts")]
    pub addn_hosts: Vec<String>,

    /// Log DNS queries to file
    #[arg(long)]
    pub dns_logfile: Option<PathBuf>,

    /// Run in the background
    #[arg(long)]
    pub daemon: bool,

    /// Save daemon PID to file
    #[arg(long)]
    pub pidfile: Option<PathBuf>,

    /// Redirect daemon messages to file
    #[arg(long)]
    pub logfile: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_defaults() {
        let cli = Cli::try_parse_from(["apmgr", "start", "--ssid", "Net"]).unwrap();
        let Commands::Start(args) = cli.command else {
            panic!("expected start command");
        };
        assert_eq!(args.wifi_iface, "wlan0");
        assert_eq!(args.internet_iface, "eth0");
        assert_eq!(args.share_method, ShareMethod::Nat);
        assert_eq!(args.channel, 6);
        assert_eq!(args.wpa_version, WpaVersionArg::Two);
        assert_eq!(args.gateway, "192.168.12.1");
        assert_eq!(args.dns_port, 53);
        assert!(!args.no_virt);
    }

    #[test]
    fn wpa_version_accepts_mixed_spelling() {
        let cli = Cli::try_parse_from(["apmgr", "start", "-w", "1+2"]).unwrap();
        let Commands::Start(args) = cli.command else {
            panic!("expected start command");
        };
        assert_eq!(args.wpa_version, WpaVersionArg::Mixed);
    }

    #[test]
    fn repeatable_list_flags() {
        let cli = Cli::try_parse_from([
            "apmgr",
            "start",
            "--dhcp-dns",
            "1.1.1.1",
            "--dhcp-dns",
            "8.8.8.8",
            "--dhcp-host",
            "00:11:22:33:44:55,192.168.12.10",
        ])
        .unwrap();
        let Commands::Start(args) = cli.command else {
            panic!("expected start command");
        };
        assert_eq!(args.dhcp_dns, vec!["1.1.1.1", "8.8.8.8"]);
        assert_eq!(args.dhcp_hosts.len(), 1);
    }

    #[test]
    fn stop_takes_pid_or_iface() {
        let cli = Cli::try_parse_from(["apmgr", "stop", "xap0"]).unwrap();
        assert!(matches!(cli.command, Commands::Stop { id } if id == "xap0"));
    }
}
