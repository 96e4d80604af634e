//! Canonical 128-bit IP addresses with CIDR masking.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// A canonical 128-bit network address.
///
/// Both address families are stored in one 128-bit form; IPv4 addresses use
/// the IPv4-mapped encoding (`::ffff:a.b.c.d`). This gives every cache index
/// a single fixed-width, byte-exact key type.
///
/// # Examples
///
/// ```
/// use snoop_types::NetAddr;
///
/// let addr: NetAddr = "10.0.0.5".parse().unwrap();
/// assert!(addr.is_ipv4_mapped());
/// assert_eq!(addr.network(24).to_string(), "10.0.0.0");
///
/// let v6: NetAddr = "2001:db8::1".parse().unwrap();
/// assert_eq!(v6.network(32).to_string(), "2001:db8::");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetAddr(Ipv6Addr);

impl NetAddr {
    /// The all-zeros address.
    pub const UNSPECIFIED: NetAddr = NetAddr(Ipv6Addr::UNSPECIFIED);

    /// Creates an address from its raw 16-byte form.
    pub const fn from_octets(octets: [u8; 16]) -> Self {
        NetAddr(Ipv6Addr::new(
            u16::from_be_bytes([octets[0], octets[1]]),
            u16::from_be_bytes([octets[2], octets[3]]),
            u16::from_be_bytes([octets[4], octets[5]]),
            u16::from_be_bytes([octets[6], octets[7]]),
            u16::from_be_bytes([octets[8], octets[9]]),
            u16::from_be_bytes([octets[10], octets[11]]),
            u16::from_be_bytes([octets[12], octets[13]]),
            u16::from_be_bytes([octets[14], octets[15]]),
        ))
    }

    /// Returns the raw 16-byte form.
    pub const fn octets(&self) -> [u8; 16] {
        self.0.octets()
    }

    /// Returns the underlying 128-bit address.
    pub const fn inner(&self) -> Ipv6Addr {
        self.0
    }

    /// Returns true if this is an IPv4 address in the mapped encoding.
    pub fn is_ipv4_mapped(&self) -> bool {
        self.0.to_ipv4_mapped().is_some()
    }

    /// Returns the IPv4 form, if this is a mapped IPv4 address.
    pub fn to_ipv4(&self) -> Option<Ipv4Addr> {
        self.0.to_ipv4_mapped()
    }

    /// Returns true if this is an IPv6 link-local address (fe80::/10).
    ///
    /// Mapped IPv4 addresses are never link-local in this sense.
    pub fn is_ipv6_link_local(&self) -> bool {
        !self.is_ipv4_mapped() && (self.0.segments()[0] & 0xffc0) == 0xfe80
    }

    /// Returns the family-native maximum prefix length (32 or 128).
    pub fn max_prefix_len(&self) -> u8 {
        if self.is_ipv4_mapped() {
            32
        } else {
            128
        }
    }

    /// Returns the canonical network address for this address under the
    /// family-native `prefix_len`: every bit beyond the prefix is zeroed.
    ///
    /// For mapped IPv4 addresses the prefix is counted from bit 96, so the
    /// mapped encoding is preserved: `10.0.0.5/24` masks to `10.0.0.0`.
    pub fn network(&self, prefix_len: u8) -> NetAddr {
        let bits = if self.is_ipv4_mapped() {
            96 + u32::from(prefix_len.min(32))
        } else {
            u32::from(prefix_len.min(128))
        };

        let value = u128::from_be_bytes(self.octets());
        let mask = if bits == 0 {
            0
        } else {
            u128::MAX << (128 - bits)
        };
        NetAddr(Ipv6Addr::from((value & mask).to_be_bytes()))
    }

    /// Returns true if this address lies inside `network`/`prefix_len`.
    pub fn in_network(&self, network: &NetAddr, prefix_len: u8) -> bool {
        self.network(prefix_len) == *network
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.to_ipv4_mapped() {
            Some(v4) => v4.fmt(f),
            None => self.0.fmt(f),
        }
    }
}

impl FromStr for NetAddr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<IpAddr>()
            .map(NetAddr::from)
            .map_err(|_| ParseError::InvalidNetAddr(s.to_string()))
    }
}

impl TryFrom<String> for NetAddr {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NetAddr> for String {
    fn from(addr: NetAddr) -> String {
        addr.to_string()
    }
}

impl From<IpAddr> for NetAddr {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => NetAddr(v4.to_ipv6_mapped()),
            IpAddr::V6(v6) => NetAddr(v6),
        }
    }
}

impl From<Ipv4Addr> for NetAddr {
    fn from(addr: Ipv4Addr) -> Self {
        NetAddr(addr.to_ipv6_mapped())
    }
}

impl From<Ipv6Addr> for NetAddr {
    fn from(addr: Ipv6Addr) -> Self {
        NetAddr(addr)
    }
}
