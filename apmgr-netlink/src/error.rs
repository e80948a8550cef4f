//! Error types for apmgr-netlink

use thiserror::Error;

/// Result type alias for network plumbing operations
pub type Result<T> = std::result::Result<T, NetError>;

/// Main error type for network plumbing operations
#[derive(Error, Debug)]
pub enum NetError {
    /// Bad caller input (MAC address, SSID, version string, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Interface not found or in the wrong state
    #[error("Interface error: {0}")]
    Interface(String),

    /// Lock file or counter file manipulation failed
    #[error("Lock error: {0}")]
    Lock(String),

    /// Interface name allocation failed
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// NetworkManager probing or config mutation failed
    #[error("NetworkManager error: {0}")]
    NetworkManager(String),

    /// A wrapped external command returned nonzero or could not be spawned
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Output of an external command could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Polling wait elapsed without convergence
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Insufficient privileges (requires root/CAP_NET_ADMIN)
    #[error("Permission denied (requires root/CAP_NET_ADMIN)")]
    PermissionDenied,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
