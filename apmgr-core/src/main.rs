mod cleanup;
mod cli;
mod config;
mod controller;
mod entropy;
mod instances;
mod settings;
mod signals;

use std::fs;
use std::io;
use std::os::unix::io::IntoRawFd;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use serde_json::{json, Map, Value};

use apmgr_netlink::{dnsmasq, process as procs, wireless, LockFile, NetworkManager};

use crate::cli::{Cli, Commands, FreqBandArg, ShareMethod, StartArgs, WpaVersionArg};
use crate::config::ConfigManager;
use crate::instances::Paths;
use crate::settings::Settings;
use crate::signals::SignalGuard;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("ERROR: {:#}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(config::BASE_CONFIG));
    match cli.command {
        Commands::Start(args) => cmd_start(args, &config_path),
        Commands::Stop { id } => cmd_stop(&id),
        Commands::ListRunning => cmd_list_running(),
        Commands::ListClients { id } => cmd_list_clients(&id),
        Commands::Configure(args) => cmd_configure(&args, &config_path),
        Commands::FixUnmanaged => cmd_fix_unmanaged(),
        Commands::Interfaces => cmd_interfaces(),
    }
}

fn load_config(path: &Path) -> Result<ConfigManager> {
    let mut cfg = ConfigManager::load(path)?;
    if let Some(dir) = path.parent() {
        cfg.apply_overlay(&dir.join(config::HOSTAPD_OVERLAY))?;
        cfg.apply_overlay(&dir.join(config::NETCONF_OVERLAY))?;
    }
    Ok(cfg)
}

fn cmd_start(args: StartArgs, config_path: &Path) -> Result<()> {
    let cfg = load_config(config_path)?;
    let settings = Settings::resolve(&args, &cfg)?;
    if args.daemon {
        daemon_start(settings, args.pidfile, args.logfile)
    } else {
        controller::run_ap(settings, false)
    }
}

/// Fork, run the AP in the child and wait for it to report readiness.
/// The child raises SIGUSR1 once the services are up and SIGUSR2 when
/// bring-up fails; the parent's exit code relays the outcome.
fn daemon_start(
    settings: Settings,
    pidfile: Option<PathBuf>,
    logfile: Option<PathBuf>,
) -> Result<()> {
    let guard = SignalGuard::install()?;
    match unsafe { libc::fork() } {
        -1 => bail!("fork failed: {}", io::Error::last_os_error()),
        0 => {
            unsafe {
                libc::setsid();
            }
            if let Some(path) = &pidfile {
                fs::write(path, process::id().to_string())?;
            }
            if let Some(path) = &logfile {
                redirect_output(path)?;
            }
            guard.restore();
            controller::run_ap(settings, true)
        }
        child => {
            loop {
                if let Some(signum) = signals::pending() {
                    guard.restore();
                    if signum == libc::SIGUSR1 {
                        println!("AP running in the background (pid {})", child);
                        process::exit(0);
                    }
                    process::exit(1);
                }
                let mut status = 0;
                if unsafe { libc::waitpid(child, &mut status, libc::WNOHANG) } == child {
                    bail!("the daemon exited during startup");
                }
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn redirect_output(path: &Path) -> Result<()> {
    let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    // The fd stays open for the life of the process.
    let fd = file.into_raw_fd();
    unsafe {
        libc::dup2(fd, libc::STDOUT_FILENO);
        libc::dup2(fd, libc::STDERR_FILENO);
    }
    Ok(())
}

fn cmd_stop(id: &str) -> Result<()> {
    let paths = Paths::system();
    let lock = LockFile::init(paths.base())?;
    let instance = instances::locked_find_by_id(&paths, &lock, id)?;
    lock.remove();
    let instance =
        instance.ok_or_else(|| anyhow!("'{}' does not match a running instance", id))?;
    procs::signal_pid(instance.pid, libc::SIGUSR1)?;
    println!("sent the stop signal to instance {}", instance.pid);
    Ok(())
}

fn cmd_list_running() -> Result<()> {
    let paths = Paths::system();
    let lock = LockFile::init(paths.base())?;
    let running = instances::locked_instances(&paths, &lock)?;
    lock.remove();
    for instance in running {
        println!(
            "{} {}",
            instance.pid,
            instance.wifi_iface.as_deref().unwrap_or("?")
        );
    }
    Ok(())
}

fn cmd_list_clients(id: &str) -> Result<()> {
    let paths = Paths::system();
    let lock = LockFile::init(paths.base())?;
    let instance = instances::locked_find_by_id(&paths, &lock, id)?;
    lock.remove();
    let instance =
        instance.ok_or_else(|| anyhow!("'{}' does not match a running instance", id))?;
    let iface = instance
        .wifi_iface
        .ok_or_else(|| anyhow!("instance {} has no recorded interface", instance.pid))?;

    let macs = wireless::station_macs(&iface)?;
    let leases = fs::read_to_string(instance.run_dir.join("dnsmasq.leases"))
        .map(|text| dnsmasq::parse_leases(&text))
        .unwrap_or_default();

    println!("{:<17} {:<15} {}", "MAC", "IP", "Hostname");
    for mac in macs {
        let lease = leases.iter().find(|l| l.mac.eq_ignore_ascii_case(&mac));
        let ip = lease.map(|l| l.ip.as_str()).unwrap_or("*");
        let hostname = lease.map(|l| l.hostname.as_str()).unwrap_or("*");
        println!("{:<17} {:<15} {}", mac, ip, hostname);
    }
    Ok(())
}

fn args_to_map(args: &StartArgs) -> Map<String, Value> {
    let share_method = match args.share_method {
        ShareMethod::Nat => "nat",
        ShareMethod::Bridge => "bridge",
        ShareMethod::None => "none",
    };
    let wpa_version = match args.wpa_version {
        WpaVersionArg::One => "1",
        WpaVersionArg::Two => "2",
        WpaVersionArg::Mixed => "1+2",
        WpaVersionArg::Three => "3",
    };
    let freq_band = args.freq_band.map(|band| match band {
        FreqBandArg::Ghz2 => "2.4",
        FreqBandArg::Ghz5 => "5",
    });
    let Value::Object(map) = json!({
        "wifi_iface": args.wifi_iface,
        "internet_iface": args.internet_iface,
        "ssid": args.ssid,
        "password": args.password,
        "psk": args.psk,
        "use_psk": args.use_psk,
        "share_method": share_method,
        "channel": args.channel,
        "wpa_version": wpa_version,
        "hidden": args.hidden,
        "mac_filter": args.mac_filter,
        "mac_filter_accept": args.mac_filter_accept.display().to_string(),
        "redirect_to_localhost": args.redirect_to_localhost,
        "isolate_clients": args.isolate_clients,
        "ieee80211n": args.ieee80211n,
        "ieee80211ac": args.ieee80211ac,
        "ieee80211ax": args.ieee80211ax,
        "ht_capab": args.ht_capab,
        "vht_capab": args.vht_capab,
        "country": args.country,
        "freq_band": freq_band,
        "driver": args.driver,
        "no_virt": args.no_virt,
        "no_haveged": args.no_haveged,
        "mac": args.mac,
        "dhcp_dns": args.dhcp_dns,
        "dhcp_hosts": args.dhcp_hosts,
        "gateway": args.gateway,
        "dns_port": args.dns_port,
        "no_dns": args.no_dns,
        "no_dnsmasq": args.no_dnsmasq,
        "etc_hosts": args.etc_hosts,
        "addn_hosts": args.addn_hosts,
        "dns_logfile": args.dns_logfile.as_ref().map(|p| p.display().to_string()),
    }) else {
        unreachable!("start args literal is an object");
    };
    map
}

fn cmd_configure(args: &StartArgs, config_path: &Path) -> Result<()> {
    let mut cfg = ConfigManager::load(config_path)?;
    cfg.merge_known(&args_to_map(args));
    cfg.save()?;
    println!("saved configuration to {}", config_path.display());
    Ok(())
}

fn cmd_fix_unmanaged() -> Result<()> {
    let paths = Paths::system();
    let lock = Arc::new(LockFile::init(paths.base())?);
    let nm = NetworkManager::new(Path::new(controller::NM_CONF), lock);
    nm.fix_unmanaged()?;
    println!("removed the unmanaged-devices entries");
    Ok(())
}

fn cmd_interfaces() -> Result<()> {
    let mut names = Vec::new();
    for entry in fs::read_dir("/sys/class/net")? {
        let entry = entry?;
        if entry.path().join("wireless").is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    for name in names {
        println!("{}", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn start_args_round_trip_into_config() {
        let cli = Cli::try_parse_from([
            "apmgr",
            "configure",
            "--ssid",
            "Persisted",
            "--password",
            "longenough",
            "--channel",
            "11",
        ])
        .unwrap();
        let Commands::Configure(args) = cli.command else {
            panic!("expected configure command");
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        cmd_configure(&args, &path).unwrap();

        let cfg = ConfigManager::load(&path).unwrap();
        assert_eq!(cfg.get_str("ssid"), Some("Persisted"));
        assert_eq!(cfg.get_str("password"), Some("longenough"));
        assert_eq!(cfg.get_u64("channel"), Some(11));
        // Unset options stay at their defaults.
        assert_eq!(cfg.get_str("gateway"), Some("192.168.12.1"));
        assert_eq!(cfg.get_str("psk"), None);
    }
}
