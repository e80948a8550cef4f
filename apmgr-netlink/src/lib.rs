//! # apmgr-netlink
//!
//! System plumbing for the `apmgr` access point manager: everything that
//! touches the kernel, shared on-disk coordination state, or external
//! network daemons.
//!
//! ## Modules
//!
//! - **lockfile**: cross-process recursive mutex over advisory file locks
//! - **ifalloc**: unique virtual interface name allocation
//! - **networkmanager**: nmcli probing and `unmanaged-devices` editing
//! - **ini**: ordered INI model backing the NetworkManager config edits
//! - **interface**: link/address/route/bridge manipulation via `ip`
//! - **iptables**: typed rule builder applied through the `iptables` binary
//! - **wireless**: adapter capability and association queries via `iw`
//! - **hostapd** / **dnsmasq**: config rendering and child daemons
//! - **sysctl**: proc-fs tunable snapshot/restore
//! - **process**: /proc based pidof and signalling
//!
//! Linux-only; the controlled daemons and kernel interfaces do not exist
//! elsewhere.

pub mod dnsmasq;
pub mod error;
pub mod hostapd;
pub mod ifalloc;
pub mod ini;
pub mod interface;
pub mod iptables;
pub mod lockfile;
pub mod networkmanager;
pub mod process;
pub mod sysctl;
pub mod wireless;

pub use dnsmasq::{BindMode, DnsmasqConfig, Lease};
pub use error::{NetError, Result};
pub use hostapd::{HostapdConfig, WpaKey, WpaSettings, WpaVersion};
pub use ifalloc::IfaceAllocator;
pub use ini::IniDocument;
pub use interface::{SavedAddress, SavedNetState};
pub use iptables::{Chain, IptablesManager, Protocol, Rule, Table, Target};
pub use lockfile::LockFile;
pub use networkmanager::{version_cmp, NetworkManager};
pub use wireless::Band;
