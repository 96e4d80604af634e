//! Error types for neighsnoopd.

use thiserror::Error;

/// Errors that can occur in neighsnoopd.
///
/// Setup failures propagate out of `main` and abort the process; runtime
/// conditions that the event handlers can survive are logged and absorbed at
/// the call site instead of being raised through this type.
#[derive(Debug, Error)]
pub enum Error {
    /// Netlink transport or decode error
    #[error("netlink error: {0}")]
    Netlink(String),

    /// Failed to load the eBPF classifier object
    #[error("BPF load error: {0}")]
    BpfLoad(#[from] aya::EbpfError),

    /// Failed to attach or configure an eBPF program
    #[error("BPF program error: {0}")]
    BpfProgram(#[from] aya::programs::ProgramError),

    /// eBPF map access failed
    #[error("BPF map error: {0}")]
    BpfMap(#[from] aya::maps::MapError),

    /// Interface lookup failed
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    /// Invalid command line or derived configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// System call failure
    #[error("system error: {0}")]
    Sys(#[from] nix::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for neighsnoopd operations.
pub type Result<T> = std::result::Result<T, Error>;
