//! The refresh scheduler: keeps installed neighbors REACHABLE by probing
//! them before the kernel ages them to STALE.
//!
//! Timers live in a binary heap keyed by absolute deadline. Cancellation is
//! lazy: each armed timer gets a fresh token, the neighbor remembers only
//! its current token, and an entry surfacing from the heap whose token no
//! longer matches is discarded. One process-wide timerfd is programmed to
//! the earliest deadline by the event loop.

use crate::cache::NeighKey;
use crate::engine::Engine;
use crate::packet::{ETH_P_ARP, ETH_P_IPV6};
use byteorder::{ByteOrder, NetworkEndian};
use rand::Rng;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};
use snoop_types::MacAddr;
use tracing::{debug, warn};

/// Identifies one arming of a neighbor's refresh timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

#[derive(Debug)]
struct TimerEntry {
    deadline: Instant,
    token: TimerToken,
    neigh: NeighKey,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.token == other.token
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.token.0.cmp(&other.token.0))
    }
}

/// Min-heap of pending refresh timers.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    next_token: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue::default()
    }

    /// Schedule a timer for `neigh`, `after` from now.
    pub fn arm(&mut self, neigh: NeighKey, after: Duration) -> TimerToken {
        let token = TimerToken(self.next_token);
        self.next_token += 1;
        self.heap.push(Reverse(TimerEntry {
            deadline: Instant::now() + after,
            token,
            neigh,
        }));
        token
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Pop the next entry whose deadline has passed.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerToken, NeighKey)> {
        match self.heap.peek() {
            Some(Reverse(entry)) if entry.deadline <= now => {}
            _ => return None,
        }
        self.heap.pop().map(|Reverse(entry)| (entry.token, entry.neigh))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Probe interval for a neighbor whose interface reports
/// `base_reachable_time_ms`.
///
/// One quarter of the base time stays comfortably inside the REACHABLE
/// window (the kernel keeps an entry REACHABLE for 50–150% of the base
/// time); up to two seconds of jitter keeps fleets of gateways from probing
/// in lockstep.
pub fn refresh_interval(base_reachable_time_ms: u64) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..2000u64);
    Duration::from_millis(base_reachable_time_ms / 4 + jitter_ms)
}

/// Build a directed gratuitous ARP request.
///
/// Sender fields carry the SVI's address, the target hardware address is
/// zero, and the frame is unicast to the neighbor's cached MAC.
pub fn build_arp_request(
    src_mac: MacAddr,
    src_ip: std::net::Ipv4Addr,
    dst_mac: MacAddr,
    target_ip: std::net::Ipv4Addr,
) -> [u8; 42] {
    let mut frame = [0u8; 42];

    // Ethernet header
    frame[0..6].copy_from_slice(&dst_mac.octets());
    frame[6..12].copy_from_slice(&src_mac.octets());
    NetworkEndian::write_u16(&mut frame[12..14], ETH_P_ARP);

    // ARP request
    NetworkEndian::write_u16(&mut frame[14..16], 1); // hardware type: Ethernet
    NetworkEndian::write_u16(&mut frame[16..18], 0x0800); // protocol type: IPv4
    frame[18] = 6; // hardware address length
    frame[19] = 4; // protocol address length
    NetworkEndian::write_u16(&mut frame[20..22], 1); // opcode: request
    frame[22..28].copy_from_slice(&src_mac.octets());
    frame[28..32].copy_from_slice(&src_ip.octets());
    // target hardware address stays zero
    frame[38..42].copy_from_slice(&target_ip.octets());

    frame
}

/// Build a directed unicast Neighbor Solicitation with a Source Link-Layer
/// Address option. Hop limit is 255 as RFC 4861 requires.
pub fn build_neighbor_solicitation(
    src_mac: MacAddr,
    src_ip: Ipv6Addr,
    dst_mac: MacAddr,
    target_ip: Ipv6Addr,
) -> [u8; 86] {
    const ICMP_LEN: u16 = 32; // NS header + SLL option
    let mut frame = [0u8; 86];

    // Ethernet header
    frame[0..6].copy_from_slice(&dst_mac.octets());
    frame[6..12].copy_from_slice(&src_mac.octets());
    NetworkEndian::write_u16(&mut frame[12..14], ETH_P_IPV6);

    // IPv6 header
    frame[14] = 0x60; // version 6, no traffic class
    NetworkEndian::write_u16(&mut frame[18..20], ICMP_LEN);
    frame[20] = 58; // next header: ICMPv6
    frame[21] = 255; // hop limit, required for NS
    frame[22..38].copy_from_slice(&src_ip.octets());
    frame[38..54].copy_from_slice(&target_ip.octets());

    // ICMPv6 Neighbor Solicitation
    frame[54] = 135; // type
    frame[55] = 0; // code
    // checksum at 56..58, filled below
    // 4 reserved bytes stay zero
    frame[62..78].copy_from_slice(&target_ip.octets());

    // Option: Source Link-Layer Address
    frame[78] = 1; // option type
    frame[79] = 1; // length in units of 8 octets
    frame[80..86].copy_from_slice(&src_mac.octets());

    let checksum = icmpv6_checksum(&src_ip, &target_ip, &frame[54..86]);
    NetworkEndian::write_u16(&mut frame[56..58], checksum);

    frame
}

/// ICMPv6 checksum over the standard pseudo-header:
/// `{src, dst, u32 payload length, 3 zero bytes, next-header 58}` followed
/// by the ICMPv6 payload.
pub fn icmpv6_checksum(src: &Ipv6Addr, dst: &Ipv6Addr, payload: &[u8]) -> u16 {
    let mut pseudo = Vec::with_capacity(40 + payload.len());
    pseudo.extend_from_slice(&src.octets());
    pseudo.extend_from_slice(&dst.octets());
    let mut len = [0u8; 4];
    NetworkEndian::write_u32(&mut len, payload.len() as u32);
    pseudo.extend_from_slice(&len);
    pseudo.extend_from_slice(&[0, 0, 0]);
    pseudo.push(58);
    pseudo.extend_from_slice(payload);

    rfc1071(&pseudo)
}

/// RFC 1071 internet checksum: one's-complement sum of 16-bit words,
/// carries folded, complemented.
fn rfc1071(data: &[u8]) -> u16 {
    let mut acc: u32 = 0;

    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        acc += u32::from(NetworkEndian::read_u16(chunk));
    }
    if let Some(&last) = chunks.remainder().first() {
        acc += u32::from(last) << 8;
    }

    let mut sum = (acc >> 16) + (acc & 0xffff);
    sum += sum >> 16;
    !(sum as u16)
}

impl Engine {
    /// Arm (or re-arm) the refresh timer of a cached neighbor. Replaces any
    /// armed timer; the displaced heap entry dies as a stale token. Returns
    /// false when the sysctl read or a cache resolution fails, in which case
    /// the neighbor is left without a timer.
    pub(crate) fn arm_refresh(&mut self, key: NeighKey) -> bool {
        let Some(neigh) = self.cache.peek_neigh(key.ifindex, &key.ip) else {
            return false;
        };
        let binding_key = neigh.sending_link_network;
        let is_ipv4 = key.ip.is_ipv4_mapped();

        let ifname = match self
            .cache
            .binding(binding_key)
            .and_then(|_| self.cache.peek_link(binding_key.ifindex))
        {
            Some(link) => link.ifname.clone(),
            None => {
                debug!(ip = %key.ip, "sending network gone, not arming refresh");
                self.clear_timer_slot(key);
                return false;
            }
        };

        let base_ms = match self.reachable_time.base_reachable_time_ms(&ifname, is_ipv4) {
            Ok(ms) => ms,
            Err(e) => {
                warn!(error = %e, ifname = %ifname, "failed to read base_reachable_time_ms");
                self.clear_timer_slot(key);
                return false;
            }
        };

        let interval = refresh_interval(base_ms);
        let token = self.timers.arm(key, interval);
        if let Some(neigh) = self.cache.get_neigh(key.ifindex, &key.ip) {
            neigh.timer = Some(token);
        }
        self.counters.timers_armed += 1;
        debug!(
            ip = %key.ip,
            nic = %ifname,
            interval_ms = interval.as_millis() as u64,
            "armed refresh timer"
        );
        true
    }

    fn clear_timer_slot(&mut self, key: NeighKey) {
        if let Some(neigh) = self.cache.get_neigh(key.ifindex, &key.ip) {
            neigh.timer = None;
        }
    }

    /// Emit a gratuitous probe to a cached neighbor: a directed ARP request
    /// for IPv4-mapped addresses, a unicast Neighbor Solicitation otherwise.
    pub(crate) fn send_gratuitous(&mut self, key: NeighKey) {
        let Some(neigh) = self.cache.peek_neigh(key.ifindex, &key.ip) else {
            return;
        };
        let dst_mac = neigh.mac;
        let binding_key = neigh.sending_link_network;

        let Some(binding) = self.cache.binding(binding_key) else {
            debug!(ip = %key.ip, "sending network gone, skipping probe");
            return;
        };
        let src_ip = binding.ip;

        let Some(link) = self.cache.peek_link(binding_key.ifindex) else {
            return;
        };
        let src_mac = link.mac;
        let ifindex = link.ifindex;
        let ifname = link.ifname.clone();

        let result = if let (Some(src4), Some(dst4)) = (src_ip.to_ipv4(), key.ip.to_ipv4()) {
            let frame = build_arp_request(src_mac, src4, dst_mac, dst4);
            self.counters.probes_arp += 1;
            self.probes.send(&frame, ifindex, dst_mac, ETH_P_ARP)
        } else if !key.ip.is_ipv4_mapped() && !src_ip.is_ipv4_mapped() {
            let frame =
                build_neighbor_solicitation(src_mac, src_ip.inner(), dst_mac, key.ip.inner());
            self.counters.probes_ns += 1;
            self.probes.send(&frame, ifindex, dst_mac, ETH_P_IPV6)
        } else {
            debug!(ip = %key.ip, src = %src_ip, "address family mismatch, skipping probe");
            return;
        };

        match result {
            Ok(()) => {
                debug!(ip = %key.ip, nic = %ifname, "gratuitous neighbor request sent");
            }
            Err(e) => {
                // Not retried here: the kernel will age the entry to STALE
                // and the neighbor-add path probes again.
                self.counters.probe_errors += 1;
                warn!(error = %e, ip = %key.ip, "probe send failed");
            }
        }
    }

    /// Fire every timer whose deadline has passed. Entries whose token no
    /// longer matches the neighbor's slot were cancelled or superseded and
    /// are dropped silently.
    pub fn fire_due_timers(&mut self, now: Instant) {
        while let Some((token, key)) = self.timers.pop_due(now) {
            let fired = match self.cache.get_neigh(key.ifindex, &key.ip) {
                Some(neigh) if neigh.timer == Some(token) => {
                    neigh.timer = None;
                    true
                }
                _ => false,
            };
            if fired {
                self.counters.timers_fired += 1;
                self.send_gratuitous(key);
            } else {
                self.counters.timers_stale += 1;
            }
        }
    }
}
