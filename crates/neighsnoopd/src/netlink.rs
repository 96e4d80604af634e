//! Netlink transport: event subscription, initial dumps, decode, and
//! outbound neighbor installs.
//!
//! One `NETLINK_ROUTE` socket joins the link, address, and neighbor
//! multicast groups. At startup a dump state machine walks links →
//! addresses → bridge FDB → neighbors; each completed dump raises the
//! matching readiness flag on the engine before the next one is requested,
//! which is what makes the engine's startup gating airtight.

use crate::engine::{Engine, NeighborInstall};
use crate::error::{Error, Result};
use crate::types::{AddrEvent, FdbEvent, LinkEvent, NeighEvent, NetlinkEvent, NudState};
use netlink_packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_CREATE, NLM_F_DUMP, NLM_F_REQUEST,
    NLM_F_REPLACE,
};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{InfoData, InfoKind, InfoPortKind, InfoVlan, LinkAttribute, LinkInfo, LinkMessage};
use netlink_packet_route::neighbour::{
    NeighbourAddress, NeighbourAttribute, NeighbourFlag, NeighbourMessage, NeighbourState,
};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use snoop_types::{MacAddr, NetAddr};
use std::io;
use std::os::fd::AsRawFd;
use tracing::{debug, info, trace, warn};

// rtnetlink multicast groups (RTNLGRP_* from linux/rtnetlink.h)
const RTNLGRP_LINK: u32 = 1;
const RTNLGRP_NEIGH: u32 = 3;
const RTNLGRP_IPV4_IFADDR: u32 = 5;
const RTNLGRP_IPV6_IFADDR: u32 = 9;

const fn group_mask(group: u32) -> u32 {
    1 << (group - 1)
}

/// Startup dump progression; `Live` once all dumps are in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DumpPhase {
    Links,
    Addrs,
    Fdb,
    Neigh,
    Live,
}

/// The daemon's rtnetlink connection.
pub struct NetlinkConn {
    socket: Socket,
    buffer: Vec<u8>,
    phase: DumpPhase,
    seq: u32,
}

impl NetlinkConn {
    /// Open the socket and join the link/address/neighbor groups.
    pub fn new() -> Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)
            .map_err(|e| Error::Netlink(format!("failed to create socket: {e}")))?;

        let groups = group_mask(RTNLGRP_LINK)
            | group_mask(RTNLGRP_NEIGH)
            | group_mask(RTNLGRP_IPV4_IFADDR)
            | group_mask(RTNLGRP_IPV6_IFADDR);
        let addr = SocketAddr::new(0, groups);
        socket
            .bind(&addr)
            .map_err(|e| Error::Netlink(format!("failed to bind socket: {e}")))?;
        socket
            .set_non_blocking(true)
            .map_err(|e| Error::Netlink(format!("failed to set non-blocking: {e}")))?;

        debug!("netlink socket bound to link/addr/neigh groups");

        Ok(NetlinkConn {
            socket,
            buffer: Vec::with_capacity(64 * 1024),
            phase: DumpPhase::Links,
            seq: 1,
        })
    }

    pub fn as_raw_fd(&self) -> i32 {
        self.socket.as_raw_fd()
    }

    /// Kick off the initial enumeration with the link dump.
    pub fn start_dumps(&mut self) -> Result<()> {
        self.phase = DumpPhase::Links;
        self.send_dump(RouteNetlinkMessage::GetLink(LinkMessage::default()))
    }

    /// Read and dispatch everything the socket has buffered.
    pub fn drain(&mut self, engine: &mut Engine) -> Result<()> {
        loop {
            self.buffer.clear();
            let len = match self.socket.recv(&mut self.buffer, 0) {
                Ok(len) => len,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::Netlink(format!("recv failed: {e}"))),
            };

            let mut offset = 0;
            while offset < len {
                let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(
                    &self.buffer[offset..len],
                )
                .map_err(|e| Error::Netlink(format!("failed to parse message: {e}")))?;

                let size = msg.header.length as usize;
                match msg.payload {
                    NetlinkPayload::Done(_) => self.advance_dump(engine)?,
                    NetlinkPayload::Error(err) => {
                        // An error with no code is an ACK for a request.
                        if let Some(code) = err.code {
                            warn!(code = code.get(), "netlink error reply");
                        }
                    }
                    NetlinkPayload::InnerMessage(inner) => {
                        if let Some(event) = decode_route_message(inner) {
                            trace!(?event, "netlink event");
                            engine.handle_event(&event);
                        }
                    }
                    _ => {}
                }

                if size == 0 {
                    break;
                }
                // messages are 4-byte aligned
                offset += (size + 3) & !3;
            }
        }
        Ok(())
    }

    /// Ask the kernel to install (or refresh) a REACHABLE neighbor entry.
    /// The kernel's RTM_NEWNEIGH broadcast loops the result back through
    /// the topology engine.
    pub fn send_install(&mut self, install: &NeighborInstall) -> Result<()> {
        let mut neigh = NeighbourMessage::default();
        neigh.header.ifindex = install.ifindex;
        neigh.header.state = NeighbourState::Reachable;

        let destination = match install.ip.to_ipv4() {
            Some(v4) => {
                neigh.header.family = AddressFamily::Inet;
                NeighbourAddress::Inet(v4)
            }
            None => {
                neigh.header.family = AddressFamily::Inet6;
                NeighbourAddress::Inet6(install.ip.inner())
            }
        };
        neigh
            .attributes
            .push(NeighbourAttribute::Destination(destination));
        neigh
            .attributes
            .push(NeighbourAttribute::LinkLocalAddress(
                install.mac.octets().to_vec(),
            ));

        let mut header = NetlinkHeader::default();
        header.flags = NLM_F_REQUEST | NLM_F_CREATE | NLM_F_REPLACE;
        header.sequence_number = self.next_seq();

        let mut packet = NetlinkMessage::new(
            header,
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewNeighbour(neigh)),
        );
        packet.finalize();

        let mut buf = vec![0u8; packet.buffer_len()];
        packet.serialize(&mut buf);
        self.socket
            .send(&buf, 0)
            .map_err(|e| Error::Netlink(format!("failed to send neighbor install: {e}")))?;

        debug!(ifindex = install.ifindex, ip = %install.ip, mac = %install.mac, "neighbor install sent");
        Ok(())
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    fn send_dump(&mut self, payload: RouteNetlinkMessage) -> Result<()> {
        let mut header = NetlinkHeader::default();
        header.flags = NLM_F_REQUEST | NLM_F_DUMP;
        header.sequence_number = self.next_seq();

        let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
        packet.finalize();

        let mut buf = vec![0u8; packet.buffer_len()];
        packet.serialize(&mut buf);
        self.socket
            .send(&buf, 0)
            .map_err(|e| Error::Netlink(format!("failed to send dump request: {e}")))?;
        Ok(())
    }

    /// One dump finished: raise the matching readiness flag and request the
    /// next one.
    fn advance_dump(&mut self, engine: &mut Engine) -> Result<()> {
        match self.phase {
            DumpPhase::Links => {
                engine.mark_links_loaded();
                info!("initial link dump complete");
                self.phase = DumpPhase::Addrs;
                self.send_dump(RouteNetlinkMessage::GetAddress(AddressMessage::default()))
            }
            DumpPhase::Addrs => {
                engine.mark_networks_loaded();
                info!("initial address dump complete");
                self.phase = DumpPhase::Fdb;
                let mut fdb = NeighbourMessage::default();
                fdb.header.family = AddressFamily::Bridge;
                self.send_dump(RouteNetlinkMessage::GetNeighbour(fdb))
            }
            DumpPhase::Fdb => {
                engine.mark_fdb_loaded();
                info!("initial FDB dump complete");
                self.phase = DumpPhase::Neigh;
                self.send_dump(RouteNetlinkMessage::GetNeighbour(
                    NeighbourMessage::default(),
                ))
            }
            DumpPhase::Neigh => {
                info!("initial neighbor dump complete, live");
                self.phase = DumpPhase::Live;
                Ok(())
            }
            DumpPhase::Live => Ok(()),
        }
    }
}

/// Decode one rtnetlink message into an engine event. Messages the engine
/// has no use for decode to `None`.
pub fn decode_route_message(msg: RouteNetlinkMessage) -> Option<NetlinkEvent> {
    match msg {
        RouteNetlinkMessage::NewLink(m) => decode_link(m).map(NetlinkEvent::LinkAdd),
        RouteNetlinkMessage::DelLink(m) => decode_link(m).map(NetlinkEvent::LinkDel),
        RouteNetlinkMessage::NewAddress(m) => decode_addr(m).map(NetlinkEvent::AddrAdd),
        RouteNetlinkMessage::DelAddress(m) => decode_addr(m).map(NetlinkEvent::AddrDel),
        RouteNetlinkMessage::NewNeighbour(m) => decode_neigh(m, true),
        RouteNetlinkMessage::DelNeighbour(m) => decode_neigh(m, false),
        _ => None,
    }
}

fn info_kind_name(kind: &InfoKind) -> String {
    match kind {
        InfoKind::Other(name) => name.clone(),
        other => format!("{other:?}").to_lowercase(),
    }
}

fn slave_kind_name(kind: &InfoPortKind) -> String {
    match kind {
        InfoPortKind::Other(name) => name.clone(),
        other => format!("{other:?}").to_lowercase(),
    }
}

fn decode_link(msg: LinkMessage) -> Option<LinkEvent> {
    if msg.header.index == 0 {
        return None;
    }

    let mut ev = LinkEvent {
        ifindex: msg.header.index,
        ifname: String::new(),
        mac: MacAddr::ZERO,
        kind: String::new(),
        slave_kind: String::new(),
        vlan_id: 0,
        vlan_protocol: 0,
        has_vlan: false,
        is_macvlan: false,
        link_ifindex: 0,
    };

    for attr in msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => ev.ifname = name,
            LinkAttribute::Address(bytes) => {
                if bytes.len() == 6 {
                    let mut mac = [0u8; 6];
                    mac.copy_from_slice(&bytes);
                    ev.mac = MacAddr::new(mac);
                }
            }
            LinkAttribute::Link(ifindex) => ev.link_ifindex = ifindex,
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    match info {
                        LinkInfo::Kind(kind) => {
                            ev.is_macvlan = matches!(kind, InfoKind::MacVlan);
                            ev.kind = info_kind_name(&kind);
                        }
                        LinkInfo::PortKind(kind) => {
                            ev.slave_kind = slave_kind_name(&kind);
                        }
                        LinkInfo::Data(InfoData::Vlan(vlan_attrs)) => {
                            ev.has_vlan = true;
                            for vlan in vlan_attrs {
                                match vlan {
                                    InfoVlan::Id(id) => ev.vlan_id = id,
                                    InfoVlan::Protocol(proto) => ev.vlan_protocol = proto.into(),
                                    _ => {}
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    Some(ev)
}

fn decode_addr(msg: AddressMessage) -> Option<AddrEvent> {
    let prefixlen = msg.header.prefix_len;
    let ifindex = msg.header.index;

    let mut address = None;
    let mut local = None;
    for attr in msg.attributes {
        match attr {
            AddressAttribute::Address(ip) => address = Some(ip),
            AddressAttribute::Local(ip) => local = Some(ip),
            _ => {}
        }
    }

    // IFA_LOCAL is the interface's own address when both are present
    // (IFA_ADDRESS is the peer on pointopoint links).
    let ip = local.or(address)?;
    Some(AddrEvent {
        ifindex,
        ip: NetAddr::from(ip),
        prefixlen,
        true_prefixlen: prefixlen,
    })
}

fn neighbour_address_ip(addr: NeighbourAddress) -> Option<NetAddr> {
    match addr {
        NeighbourAddress::Inet(v4) => Some(NetAddr::from(v4)),
        NeighbourAddress::Inet6(v6) => Some(NetAddr::from(v6)),
        _ => None,
    }
}

fn decode_neigh(msg: NeighbourMessage, is_add: bool) -> Option<NetlinkEvent> {
    let ifindex = msg.header.ifindex;
    let externally_learned = msg.header.flags.contains(&NeighbourFlag::ExtLearned);
    let is_bridge = msg.header.family == AddressFamily::Bridge;

    let mut mac = MacAddr::ZERO;
    let mut ip = None;
    let mut vlan_id = 0u16;
    for attr in msg.attributes {
        match attr {
            NeighbourAttribute::Destination(addr) => ip = neighbour_address_ip(addr),
            NeighbourAttribute::LinkLocalAddress(bytes) => {
                if bytes.len() == 6 {
                    let mut buf = [0u8; 6];
                    buf.copy_from_slice(&bytes);
                    mac = MacAddr::new(buf);
                }
            }
            NeighbourAttribute::Vlan(vlan) => vlan_id = vlan,
            _ => {}
        }
    }

    if is_bridge {
        // AF_BRIDGE neighbor messages are bridge FDB entries.
        let ev = FdbEvent {
            ifindex,
            mac,
            vlan_id,
            externally_learned,
        };
        return Some(if is_add {
            NetlinkEvent::FdbAdd(ev)
        } else {
            NetlinkEvent::FdbDel(ev)
        });
    }

    if !matches!(
        msg.header.family,
        AddressFamily::Inet | AddressFamily::Inet6
    ) {
        return None;
    }

    let ev = NeighEvent {
        ifindex,
        ip: ip?,
        mac,
        nud_state: nud_from(msg.header.state),
        externally_learned,
    };
    Some(if is_add {
        NetlinkEvent::NeighAdd(ev)
    } else {
        NetlinkEvent::NeighDel(ev)
    })
}

fn nud_from(state: NeighbourState) -> NudState {
    match state {
        NeighbourState::Incomplete => NudState::Incomplete,
        NeighbourState::Reachable => NudState::Reachable,
        NeighbourState::Stale => NudState::Stale,
        NeighbourState::Delay => NudState::Delay,
        NeighbourState::Probe => NudState::Probe,
        NeighbourState::Failed => NudState::Failed,
        NeighbourState::Noarp => NudState::NoArp,
        NeighbourState::Permanent => NudState::Permanent,
        _ => NudState::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_link_event() {
        let mut msg = LinkMessage::default();
        msg.header.index = 7;
        msg.attributes.push(LinkAttribute::IfName("br0.100".to_string()));
        msg.attributes
            .push(LinkAttribute::Address(vec![2, 0, 0, 0, 0, 7]));
        msg.attributes.push(LinkAttribute::Link(2));
        msg.attributes.push(LinkAttribute::LinkInfo(vec![
            LinkInfo::Kind(InfoKind::Vlan),
            LinkInfo::Data(InfoData::Vlan(vec![InfoVlan::Id(100)])),
        ]));

        let Some(NetlinkEvent::LinkAdd(ev)) =
            decode_route_message(RouteNetlinkMessage::NewLink(msg))
        else {
            panic!("expected link add");
        };
        assert_eq!(ev.ifindex, 7);
        assert_eq!(ev.ifname, "br0.100");
        assert_eq!(ev.link_ifindex, 2);
        assert_eq!(ev.kind, "vlan");
        assert!(ev.has_vlan);
        assert_eq!(ev.vlan_id, 100);
        assert!(!ev.is_macvlan);
    }

    #[test]
    fn test_decode_addr_prefers_local() {
        let mut msg = AddressMessage::default();
        msg.header.index = 7;
        msg.header.prefix_len = 24;
        msg.attributes.push(AddressAttribute::Address(
            "10.0.0.2".parse().unwrap(),
        ));
        msg.attributes
            .push(AddressAttribute::Local("10.0.0.1".parse().unwrap()));

        let Some(NetlinkEvent::AddrAdd(ev)) =
            decode_route_message(RouteNetlinkMessage::NewAddress(msg))
        else {
            panic!("expected addr add");
        };
        assert_eq!(ev.ip, "10.0.0.1".parse().unwrap());
        assert_eq!(ev.prefixlen, 24);
        assert_eq!(ev.true_prefixlen, 24);
    }

    #[test]
    fn test_decode_bridge_neigh_as_fdb() {
        let mut msg = NeighbourMessage::default();
        msg.header.family = AddressFamily::Bridge;
        msg.header.ifindex = 7;
        msg.header.flags = vec![NeighbourFlag::ExtLearned];
        msg.attributes
            .push(NeighbourAttribute::LinkLocalAddress(vec![2, 0, 0, 0, 0, 9]));
        msg.attributes.push(NeighbourAttribute::Vlan(100));

        let Some(NetlinkEvent::FdbAdd(ev)) =
            decode_route_message(RouteNetlinkMessage::NewNeighbour(msg))
        else {
            panic!("expected FDB add");
        };
        assert_eq!(ev.ifindex, 7);
        assert_eq!(ev.vlan_id, 100);
        assert!(ev.externally_learned);
        assert_eq!(ev.mac, MacAddr::new([2, 0, 0, 0, 0, 9]));
    }

    #[test]
    fn test_decode_inet_neigh() {
        let mut msg = NeighbourMessage::default();
        msg.header.family = AddressFamily::Inet;
        msg.header.ifindex = 7;
        msg.header.state = NeighbourState::Reachable;
        msg.attributes.push(NeighbourAttribute::Destination(
            NeighbourAddress::Inet("10.0.0.5".parse().unwrap()),
        ));
        msg.attributes
            .push(NeighbourAttribute::LinkLocalAddress(vec![2, 0, 0, 0, 0, 5]));

        let Some(NetlinkEvent::NeighAdd(ev)) =
            decode_route_message(RouteNetlinkMessage::NewNeighbour(msg))
        else {
            panic!("expected neighbor add");
        };
        assert_eq!(ev.ifindex, 7);
        assert_eq!(ev.ip, "10.0.0.5".parse().unwrap());
        assert_eq!(ev.nud_state, NudState::Reachable);
        assert!(!ev.externally_learned);
    }
}
