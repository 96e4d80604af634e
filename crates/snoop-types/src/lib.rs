//! Identifier types for the neighbor snooping daemon.
//!
//! This crate provides the small, byte-exact primitives the daemon keys its
//! caches with:
//!
//! - [`MacAddr`]: 48-bit Ethernet MAC addresses
//! - [`NetAddr`]: canonical 128-bit IP addresses (IPv4 stored IPv4-mapped)
//!
//! Both types hash and compare over their full byte content, serialize as
//! their display strings, and parse back from them.

mod ip;
mod mac;

pub use ip::NetAddr;
pub use mac::MacAddr;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddr(String),

    #[error("invalid IP address format: {0}")]
    InvalidNetAddr(String),

    #[error("invalid prefix length: {0} (must be <= {1})")]
    InvalidPrefixLen(u8, u8),
}
