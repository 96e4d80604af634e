//! Kernel-facing event types.
//!
//! The netlink transport and the eBPF ring buffer both deliver their payloads
//! as the plain data structures defined here; nothing in an event points into
//! the cache. The topology engine dispatches on the [`NetlinkEvent`] tag.

use snoop_types::{MacAddr, NetAddr};

/// Kernel neighbor state (NUD_* values from linux/neighbour.h).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[repr(u16)]
pub enum NudState {
    /// Neighbor resolution in progress
    Incomplete = 0x01,
    /// Neighbor confirmed reachable
    Reachable = 0x02,
    /// Reachability no longer confirmed
    Stale = 0x04,
    /// Resolution delayed
    Delay = 0x08,
    /// Probe in progress
    Probe = 0x10,
    /// Resolution failed
    Failed = 0x20,
    /// No resolution needed
    NoArp = 0x40,
    /// Permanent entry
    Permanent = 0x80,
    /// Unknown state
    None = 0x00,
}

impl NudState {
    /// Create from a kernel NUD_* value.
    pub fn from_kernel(state: u16) -> Self {
        match state {
            0x01 => Self::Incomplete,
            0x02 => Self::Reachable,
            0x04 => Self::Stale,
            0x08 => Self::Delay,
            0x10 => Self::Probe,
            0x20 => Self::Failed,
            0x40 => Self::NoArp,
            0x80 => Self::Permanent,
            _ => Self::None,
        }
    }
}

/// A kernel link (interface) notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub ifindex: u32,
    pub ifname: String,
    pub mac: MacAddr,
    /// Interface kind string ("vlan", "bridge", "macvlan", ...)
    pub kind: String,
    /// Slave kind string when the interface is enslaved
    pub slave_kind: String,
    pub vlan_id: u16,
    pub vlan_protocol: u16,
    pub has_vlan: bool,
    pub is_macvlan: bool,
    /// IFLA_LINK: the lower interface this one sits on (0 if none)
    pub link_ifindex: u32,
}

/// A kernel address notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrEvent {
    pub ifindex: u32,
    /// The interface's own address, canonical 128-bit form
    pub ip: NetAddr,
    /// Family-native prefix length used for masking and the eBPF key
    pub prefixlen: u8,
    /// Prefix length exactly as the kernel reported it
    pub true_prefixlen: u8,
}

impl AddrEvent {
    /// Canonical network address this event describes.
    pub fn network(&self) -> NetAddr {
        self.ip.network(self.prefixlen)
    }
}

/// A bridge forwarding-database notification (AF_BRIDGE neighbor message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdbEvent {
    pub ifindex: u32,
    pub mac: MacAddr,
    pub vlan_id: u16,
    pub externally_learned: bool,
}

/// A kernel neighbor-table notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighEvent {
    pub ifindex: u32,
    pub ip: NetAddr,
    pub mac: MacAddr,
    pub nud_state: NudState,
    pub externally_learned: bool,
}

/// The tagged union of decoded netlink notifications consumed by the
/// topology engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetlinkEvent {
    LinkAdd(LinkEvent),
    LinkDel(LinkEvent),
    AddrAdd(AddrEvent),
    AddrDel(AddrEvent),
    FdbAdd(FdbEvent),
    FdbDel(FdbEvent),
    NeighAdd(NeighEvent),
    NeighDel(NeighEvent),
}

/// AF_INET, as seen in ring-buffer records.
pub const AF_INET: u16 = libc::AF_INET as u16;
/// AF_INET6, as seen in ring-buffer records.
pub const AF_INET6: u16 = libc::AF_INET6 as u16;

/// One record from the in-kernel classifier's ring buffer.
///
/// Matches the shared C layout: `{u16 in_family, u16 vlan_id,
/// u32 network_id, u8 mac[6], (pad), u8 ip[16]}`, 32 bytes total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyRecord {
    pub in_family: u16,
    pub vlan_id: u16,
    pub network_id: u32,
    pub mac: MacAddr,
    pub ip: NetAddr,
}

impl ReplyRecord {
    /// Serialized size of one record.
    pub const LEN: usize = 32;

    /// Decode a record from raw ring-buffer bytes.
    pub fn from_bytes(data: &[u8]) -> Option<ReplyRecord> {
        if data.len() < Self::LEN {
            return None;
        }

        let in_family = u16::from_ne_bytes([data[0], data[1]]);
        let vlan_id = u16::from_ne_bytes([data[2], data[3]]);
        let network_id = u32::from_ne_bytes([data[4], data[5], data[6], data[7]]);

        let mut mac = [0u8; 6];
        mac.copy_from_slice(&data[8..14]);
        // two bytes of struct padding before the 4-byte-aligned address
        let mut ip = [0u8; 16];
        ip.copy_from_slice(&data[16..32]);

        Some(ReplyRecord {
            in_family,
            vlan_id,
            network_id,
            mac: MacAddr::new(mac),
            ip: NetAddr::from_octets(ip),
        })
    }
}
