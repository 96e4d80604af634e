//! The topology cache: owning tables and lookup indices.
//!
//! Five entity kinds live here. Links, networks, FDB entries, and neighbors
//! are owned by their keyed tables; link↔network bindings are owned by a
//! table keyed on `(network_id, ifindex)`. Everything else — the two binding
//! lookup indices, the network-by-address index, and the per-entity key
//! vectors — refers to entities by key, never by pointer, so cascading
//! removal can walk and unwind the graph without aliasing.
//!
//! Invariants maintained by this module:
//!
//! - a binding reachable from a link is reachable from its network and from
//!   both lookup indices, and vice versa;
//! - no two networks share a canonical network address;
//! - `Network.refcnt` equals the number of bindings on the network;
//! - every FDB key attached to a link is present in the FDB table.

use crate::refresh::TimerToken;
use crate::types::{AddrEvent, FdbEvent, LinkEvent, NeighEvent, NudState};
use snoop_types::{MacAddr, NetAddr};
use std::collections::HashMap;
use std::time::SystemTime;

/// Creation/update/reference timestamps kept on every entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityTimes {
    pub created: SystemTime,
    pub updated: SystemTime,
    pub referenced: SystemTime,
}

impl EntityTimes {
    fn now() -> Self {
        let now = SystemTime::now();
        EntityTimes {
            created: now,
            updated: now,
            referenced: now,
        }
    }
}

/// Key of a link↔network binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkNetKey {
    pub network_id: u32,
    pub ifindex: u32,
}

/// Key of a bridge FDB entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdbKey {
    pub mac: MacAddr,
    pub ifindex: u32,
    pub vlan_id: u16,
}

/// Key of a tracked neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NeighKey {
    pub ifindex: u32,
    pub ip: NetAddr,
}

/// A kernel interface relevant to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub ifindex: u32,
    pub ifname: String,
    pub mac: MacAddr,
    pub kind: String,
    pub slave_kind: String,
    pub vlan_id: u16,
    pub vlan_protocol: u16,
    pub has_vlan: bool,
    pub is_macvlan: bool,
    pub is_svi: bool,
    pub ignore_link: bool,
    pub link_ifindex: u32,
    pub times: EntityTimes,
    pub reference_count: u64,
    /// Bindings attached through this link
    pub networks: Vec<LinkNetKey>,
    /// FDB entries learned on this link
    pub fdb: Vec<FdbKey>,
}

/// One IP subnet served on some SVI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub id: u32,
    /// Canonical (masked) network address
    pub addr: NetAddr,
    pub prefixlen: u8,
    /// Prefix length exactly as the kernel reported it; distinguishes
    /// /32 and /128 host routes in the stats output
    pub true_prefixlen: u8,
    pub refcnt: u32,
    pub links: Vec<LinkNetKey>,
    pub times: EntityTimes,
    pub reference_count: u64,
}

impl Network {
    /// True for /32 (IPv4) and /128 (IPv6) host routes.
    pub fn is_host_route(&self) -> bool {
        self.true_prefixlen == self.addr.max_prefix_len()
    }
}

/// A binding between one link and one network, carrying the SVI's own
/// address on that network (the source address for outgoing probes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkNetwork {
    pub key: LinkNetKey,
    pub ip: NetAddr,
}

/// An externally-learned bridge FDB record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdbEntry {
    pub key: FdbKey,
    pub times: EntityTimes,
    pub reference_count: u64,
}

/// A tracked kernel neighbor entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub id: u64,
    pub key: NeighKey,
    pub mac: MacAddr,
    pub mac_str: String,
    pub ip_str: String,
    pub nud_state: NudState,
    /// Binding whose address sources this neighbor's probes
    pub sending_link_network: LinkNetKey,
    /// Live refresh timer, if armed
    pub timer: Option<TimerToken>,
    pub update_count: u64,
    pub reference_count: u64,
    pub times: EntityTimes,
}

/// The owning tables and lookup indices.
#[derive(Debug, Default)]
pub struct Cache {
    links: HashMap<u32, Link>,
    networks: HashMap<u32, Network>,
    bindings: HashMap<LinkNetKey, LinkNetwork>,
    fdb: HashMap<FdbKey, FdbEntry>,
    neighbors: HashMap<NeighKey, Neighbor>,

    by_network_addr: HashMap<NetAddr, u32>,
    by_vlan_network: HashMap<(u32, u16), LinkNetKey>,
    by_addr_ifindex: HashMap<(NetAddr, u32), LinkNetKey>,

    next_network_id: u32,
    next_neigh_id: u64,
}

impl Cache {
    pub fn new() -> Self {
        Cache {
            next_network_id: 1,
            next_neigh_id: 1,
            ..Default::default()
        }
    }

    // ---- links ----------------------------------------------------------

    /// Insert a new link from a kernel event.
    pub fn add_link(&mut self, ev: &LinkEvent) -> &mut Link {
        let link = Link {
            ifindex: ev.ifindex,
            ifname: ev.ifname.clone(),
            mac: ev.mac,
            kind: ev.kind.clone(),
            slave_kind: ev.slave_kind.clone(),
            vlan_id: ev.vlan_id,
            vlan_protocol: ev.vlan_protocol,
            has_vlan: ev.has_vlan,
            is_macvlan: ev.is_macvlan,
            is_svi: false,
            ignore_link: false,
            link_ifindex: ev.link_ifindex,
            times: EntityTimes::now(),
            reference_count: 0,
            networks: Vec::new(),
            fdb: Vec::new(),
        };
        self.links.entry(ev.ifindex).or_insert(link)
    }

    /// Refresh an existing link's attributes; returns true if anything
    /// actually changed (and bumps `updated` when it did).
    pub fn update_link(&mut self, ev: &LinkEvent) -> bool {
        let Some(link) = self.links.get_mut(&ev.ifindex) else {
            return false;
        };

        let mut updated = false;
        if link.link_ifindex != ev.link_ifindex {
            tracing::debug!(
                ifname = %link.ifname,
                from = link.link_ifindex,
                to = ev.link_ifindex,
                "link parent changed"
            );
            link.link_ifindex = ev.link_ifindex;
            updated = true;
        }
        if link.ifname != ev.ifname {
            tracing::debug!(from = %link.ifname, to = %ev.ifname, "link renamed");
            link.ifname = ev.ifname.clone();
            updated = true;
        }
        if link.mac != ev.mac {
            tracing::debug!(ifname = %link.ifname, mac = %ev.mac, "link MAC changed");
            link.mac = ev.mac;
            updated = true;
        }
        if link.kind != ev.kind {
            link.kind = ev.kind.clone();
            updated = true;
        }
        if link.slave_kind != ev.slave_kind {
            link.slave_kind = ev.slave_kind.clone();
            updated = true;
        }
        if link.vlan_protocol != ev.vlan_protocol {
            link.vlan_protocol = ev.vlan_protocol;
            updated = true;
        }
        if link.vlan_id != ev.vlan_id {
            link.vlan_id = ev.vlan_id;
            updated = true;
        }
        if link.has_vlan != ev.has_vlan {
            link.has_vlan = ev.has_vlan;
            updated = true;
        }
        if link.is_macvlan != ev.is_macvlan {
            link.is_macvlan = ev.is_macvlan;
            updated = true;
        }

        if updated {
            link.times.updated = SystemTime::now();
        }
        updated
    }

    /// Look up a link, bumping its reference bookkeeping.
    pub fn get_link(&mut self, ifindex: u32) -> Option<&mut Link> {
        let link = self.links.get_mut(&ifindex)?;
        link.times.referenced = SystemTime::now();
        link.reference_count += 1;
        Some(link)
    }

    /// Look up a link without touching reference bookkeeping.
    pub fn peek_link(&self, ifindex: u32) -> Option<&Link> {
        self.links.get(&ifindex)
    }

    /// Remove a link and cascade: all its bindings, all its FDB entries,
    /// and every neighbor keyed on its ifindex.
    pub fn remove_link(&mut self, ifindex: u32) -> Option<Link> {
        // Snapshot the key vectors before unwinding; the removal helpers
        // mutate the lists they would otherwise be iterating.
        let binding_keys = self.links.get(&ifindex)?.networks.clone();
        for key in binding_keys {
            self.remove_binding(key);
        }

        let fdb_keys = self.links.get(&ifindex)?.fdb.clone();
        for key in fdb_keys {
            self.fdb.remove(&key);
        }

        self.neighbors.retain(|key, _| key.ifindex != ifindex);

        self.links.remove(&ifindex)
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    // ---- networks and bindings ------------------------------------------

    /// Create a network with the next monotonic id and index it by address.
    ///
    /// The caller checks for an existing network first; the address index
    /// keeps the "one network per canonical address" invariant.
    pub fn add_network(&mut self, ev: &AddrEvent) -> u32 {
        let addr = ev.network();
        debug_assert!(!self.by_network_addr.contains_key(&addr));

        let id = self.next_network_id;
        self.next_network_id += 1;

        self.networks.insert(
            id,
            Network {
                id,
                addr,
                prefixlen: ev.prefixlen,
                true_prefixlen: ev.true_prefixlen,
                refcnt: 0,
                links: Vec::new(),
                times: EntityTimes::now(),
                reference_count: 0,
            },
        );
        self.by_network_addr.insert(addr, id);
        id
    }

    /// Look up a network by id, bumping its reference bookkeeping.
    pub fn get_network(&mut self, id: u32) -> Option<&mut Network> {
        let network = self.networks.get_mut(&id)?;
        network.times.referenced = SystemTime::now();
        network.reference_count += 1;
        Some(network)
    }

    pub fn peek_network(&self, id: u32) -> Option<&Network> {
        self.networks.get(&id)
    }

    /// Look up a network by canonical network address.
    pub fn network_id_by_addr(&self, addr: &NetAddr) -> Option<u32> {
        self.by_network_addr.get(addr).copied()
    }

    /// Remove a network and all bindings that point at it.
    pub fn remove_network(&mut self, id: u32) -> Option<Network> {
        let binding_keys = self.networks.get(&id)?.links.clone();
        for key in binding_keys {
            self.remove_binding(key);
        }

        let network = self.networks.remove(&id)?;
        self.by_network_addr.remove(&network.addr);
        Some(network)
    }

    pub fn network_count(&self) -> usize {
        self.networks.len()
    }

    pub fn networks(&self) -> impl Iterator<Item = &Network> {
        self.networks.values()
    }

    /// Bind a link to a network, recording the SVI's own address on the
    /// network. Updates both lookup indices, both key vectors, and the
    /// network's refcnt in one step.
    pub fn add_binding(&mut self, network_id: u32, ifindex: u32, ip: NetAddr) -> Option<LinkNetKey> {
        let key = LinkNetKey {
            network_id,
            ifindex,
        };
        let vlan_id = self.links.get(&ifindex)?.vlan_id;
        let addr = self.networks.get(&network_id)?.addr;

        self.bindings.insert(key, LinkNetwork { key, ip });
        self.by_vlan_network.insert((network_id, vlan_id), key);
        self.by_addr_ifindex.insert((addr, ifindex), key);

        if let Some(link) = self.links.get_mut(&ifindex) {
            link.networks.push(key);
        }
        if let Some(network) = self.networks.get_mut(&network_id) {
            network.links.push(key);
            network.refcnt += 1;
        }
        Some(key)
    }

    /// Remove a binding, unwinding both lookup indices, both key vectors,
    /// and the network's refcnt.
    pub fn remove_binding(&mut self, key: LinkNetKey) -> Option<LinkNetwork> {
        let binding = self.bindings.remove(&key)?;

        if let Some(link) = self.links.get(&key.ifindex) {
            self.by_vlan_network.remove(&(key.network_id, link.vlan_id));
        }
        if let Some(network) = self.networks.get(&key.network_id) {
            self.by_addr_ifindex.remove(&(network.addr, key.ifindex));
        }

        if let Some(link) = self.links.get_mut(&key.ifindex) {
            link.networks.retain(|k| *k != key);
        }
        if let Some(network) = self.networks.get_mut(&key.network_id) {
            network.links.retain(|k| *k != key);
            network.refcnt = network.refcnt.saturating_sub(1);
        }
        Some(binding)
    }

    /// Resolve a binding by its owning key.
    pub fn binding(&self, key: LinkNetKey) -> Option<&LinkNetwork> {
        self.bindings.get(&key)
    }

    /// Resolve a binding from a reply's `(network_id, vlan_id)` pair.
    pub fn binding_by_vlan_network(&self, network_id: u32, vlan_id: u16) -> Option<&LinkNetwork> {
        let key = self.by_vlan_network.get(&(network_id, vlan_id))?;
        self.bindings.get(key)
    }

    /// Resolve a binding from a `(network address, ifindex)` pair.
    pub fn binding_by_addr_ifindex(&self, addr: &NetAddr, ifindex: u32) -> Option<&LinkNetwork> {
        let key = self.by_addr_ifindex.get(&(*addr, ifindex))?;
        self.bindings.get(key)
    }

    /// Scan a link's networks for the one containing `ip`: the host is on
    /// network N iff masking `ip` with N's prefix yields N's address.
    pub fn binding_for_ip(&self, ifindex: u32, ip: &NetAddr) -> Option<LinkNetKey> {
        let link = self.links.get(&ifindex)?;
        for key in &link.networks {
            let Some(network) = self.networks.get(&key.network_id) else {
                continue;
            };
            if ip.in_network(&network.addr, network.prefixlen) {
                return Some(*key);
            }
        }
        None
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    // ---- FDB -------------------------------------------------------------

    /// Insert an externally-learned FDB entry and attach it to its link.
    pub fn add_fdb(&mut self, ev: &FdbEvent) -> Option<FdbKey> {
        let key = FdbKey {
            mac: ev.mac,
            ifindex: ev.ifindex,
            vlan_id: ev.vlan_id,
        };
        self.links.get(&ev.ifindex)?;

        self.fdb.insert(
            key,
            FdbEntry {
                key,
                times: EntityTimes::now(),
                reference_count: 0,
            },
        );
        if let Some(link) = self.links.get_mut(&ev.ifindex) {
            if !link.fdb.contains(&key) {
                link.fdb.push(key);
            }
        }
        Some(key)
    }

    /// Look up an FDB entry, bumping its reference bookkeeping.
    pub fn get_fdb(&mut self, mac: MacAddr, ifindex: u32, vlan_id: u16) -> Option<&mut FdbEntry> {
        let key = FdbKey {
            mac,
            ifindex,
            vlan_id,
        };
        let entry = self.fdb.get_mut(&key)?;
        entry.times.referenced = SystemTime::now();
        entry.reference_count += 1;
        Some(entry)
    }

    pub fn peek_fdb(&self, mac: MacAddr, ifindex: u32, vlan_id: u16) -> Option<&FdbEntry> {
        self.fdb.get(&FdbKey {
            mac,
            ifindex,
            vlan_id,
        })
    }

    /// Remove an FDB entry and detach it from its link.
    pub fn remove_fdb(&mut self, mac: MacAddr, ifindex: u32, vlan_id: u16) -> Option<FdbEntry> {
        let key = FdbKey {
            mac,
            ifindex,
            vlan_id,
        };
        let entry = self.fdb.remove(&key)?;
        if let Some(link) = self.links.get_mut(&ifindex) {
            link.fdb.retain(|k| *k != key);
        }
        Some(entry)
    }

    pub fn fdb_count(&self) -> usize {
        self.fdb.len()
    }

    // ---- neighbors -------------------------------------------------------

    /// Insert a tracked neighbor with the next monotonic id.
    pub fn add_neigh(&mut self, binding: LinkNetKey, ev: &NeighEvent) -> &mut Neighbor {
        let key = NeighKey {
            ifindex: ev.ifindex,
            ip: ev.ip,
        };
        let next_id = &mut self.next_neigh_id;
        self.neighbors.entry(key).or_insert_with(|| {
            let id = *next_id;
            *next_id += 1;
            Neighbor {
                id,
                key,
                mac: ev.mac,
                mac_str: ev.mac.to_string(),
                ip_str: ev.ip.to_string(),
                nud_state: ev.nud_state,
                sending_link_network: binding,
                timer: None,
                update_count: 0,
                reference_count: 0,
                times: EntityTimes::now(),
            }
        })
    }

    /// Apply a subsequent add event to a cached neighbor: MAC changes take
    /// effect silently, NUD transitions bump the update bookkeeping.
    pub fn update_neigh(&mut self, ev: &NeighEvent) -> Option<&mut Neighbor> {
        let key = NeighKey {
            ifindex: ev.ifindex,
            ip: ev.ip,
        };
        let neigh = self.neighbors.get_mut(&key)?;

        if neigh.mac != ev.mac {
            neigh.mac = ev.mac;
            neigh.mac_str = ev.mac.to_string();
        }
        if neigh.nud_state != ev.nud_state {
            neigh.nud_state = ev.nud_state;
            let now = SystemTime::now();
            neigh.times.updated = now;
            neigh.times.referenced = now;
            neigh.update_count += 1;
        }
        Some(neigh)
    }

    /// Look up a neighbor, bumping its reference bookkeeping.
    pub fn get_neigh(&mut self, ifindex: u32, ip: &NetAddr) -> Option<&mut Neighbor> {
        let key = NeighKey { ifindex, ip: *ip };
        let neigh = self.neighbors.get_mut(&key)?;
        neigh.times.referenced = SystemTime::now();
        neigh.reference_count += 1;
        Some(neigh)
    }

    pub fn peek_neigh(&self, ifindex: u32, ip: &NetAddr) -> Option<&Neighbor> {
        self.neighbors.get(&NeighKey { ifindex, ip: *ip })
    }

    pub fn remove_neigh(&mut self, ifindex: u32, ip: &NetAddr) -> Option<Neighbor> {
        self.neighbors.remove(&NeighKey { ifindex, ip: *ip })
    }

    pub fn neigh_count(&self) -> usize {
        self.neighbors.len()
    }

    pub fn neighbors(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn link_event(ifindex: u32, ifname: &str, vlan_id: u16) -> LinkEvent {
        LinkEvent {
            ifindex,
            ifname: ifname.to_string(),
            mac: MacAddr::new([0x02, 0, 0, 0, 0, ifindex as u8]),
            kind: "vlan".to_string(),
            slave_kind: String::new(),
            vlan_id,
            vlan_protocol: 0x8100,
            has_vlan: vlan_id != 0,
            is_macvlan: false,
            link_ifindex: 1,
        }
    }

    fn addr_event(ifindex: u32, ip: &str, prefixlen: u8) -> AddrEvent {
        AddrEvent {
            ifindex,
            ip: ip.parse().unwrap(),
            prefixlen,
            true_prefixlen: prefixlen,
        }
    }

    fn cache_with_binding() -> (Cache, u32, LinkNetKey) {
        let mut cache = Cache::new();
        cache.add_link(&link_event(10, "br0.100", 100));
        let ev = addr_event(10, "10.0.0.1", 24);
        let id = cache.add_network(&ev);
        let key = cache.add_binding(id, 10, ev.ip).unwrap();
        (cache, id, key)
    }

    #[test]
    fn test_binding_reachable_from_both_indices() {
        let (cache, id, key) = cache_with_binding();
        let net_addr: NetAddr = "10.0.0.0".parse().unwrap();

        let by_vlan = cache.binding_by_vlan_network(id, 100).unwrap();
        let by_addr = cache.binding_by_addr_ifindex(&net_addr, 10).unwrap();
        assert_eq!(by_vlan.key, key);
        assert_eq!(by_addr.key, key);

        assert!(cache.peek_link(10).unwrap().networks.contains(&key));
        assert!(cache.peek_network(id).unwrap().links.contains(&key));
    }

    #[test]
    fn test_refcnt_tracks_bindings() {
        let (mut cache, id, key) = cache_with_binding();
        assert_eq!(cache.peek_network(id).unwrap().refcnt, 1);
        assert_eq!(cache.peek_network(id).unwrap().links.len(), 1);

        cache.remove_binding(key);
        assert_eq!(cache.peek_network(id).unwrap().refcnt, 0);
        assert!(cache.peek_network(id).unwrap().links.is_empty());
    }

    #[test]
    fn test_remove_binding_clears_both_indices() {
        let (mut cache, id, key) = cache_with_binding();
        cache.remove_binding(key);

        let net_addr: NetAddr = "10.0.0.0".parse().unwrap();
        assert!(cache.binding_by_vlan_network(id, 100).is_none());
        assert!(cache.binding_by_addr_ifindex(&net_addr, 10).is_none());
        assert!(cache.peek_link(10).unwrap().networks.is_empty());
    }

    #[test]
    fn test_remove_link_cascades() {
        let (mut cache, id, _key) = cache_with_binding();
        cache.add_fdb(&FdbEvent {
            ifindex: 10,
            mac: MacAddr::new([2, 0, 0, 0, 0, 9]),
            vlan_id: 100,
            externally_learned: true,
        });
        let neigh_ev = NeighEvent {
            ifindex: 10,
            ip: "10.0.0.9".parse().unwrap(),
            mac: MacAddr::new([2, 0, 0, 0, 0, 9]),
            nud_state: NudState::Reachable,
            externally_learned: false,
        };
        let binding = cache.binding_for_ip(10, &neigh_ev.ip).unwrap();
        cache.add_neigh(binding, &neigh_ev);

        cache.remove_link(10);

        assert_eq!(cache.link_count(), 0);
        assert_eq!(cache.binding_count(), 0);
        assert_eq!(cache.fdb_count(), 0);
        assert_eq!(cache.neigh_count(), 0);
        assert_eq!(cache.peek_network(id).unwrap().refcnt, 0);
    }

    #[test]
    fn test_remove_network_cascades_bindings() {
        let (mut cache, id, key) = cache_with_binding();
        cache.remove_network(id);

        assert!(cache.peek_network(id).is_none());
        assert!(cache.binding(key).is_none());
        assert!(cache.peek_link(10).unwrap().networks.is_empty());
        assert!(cache.network_id_by_addr(&"10.0.0.0".parse().unwrap()).is_none());
    }

    #[test]
    fn test_network_ids_are_monotonic() {
        let mut cache = Cache::new();
        cache.add_link(&link_event(10, "br0.100", 100));
        cache.add_link(&link_event(11, "br0.200", 200));

        let first = cache.add_network(&addr_event(10, "10.0.0.1", 24));
        let second = cache.add_network(&addr_event(11, "10.0.1.1", 24));
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        // Ids are never reused, even after removal.
        cache.remove_network(first);
        let third = cache.add_network(&addr_event(10, "10.0.2.1", 24));
        assert_eq!(third, 3);
    }

    #[test]
    fn test_binding_for_ip_matches_cidr() {
        let (mut cache, _id, key) = cache_with_binding();
        assert_eq!(
            cache.binding_for_ip(10, &"10.0.0.77".parse().unwrap()),
            Some(key)
        );
        assert!(cache.binding_for_ip(10, &"10.0.1.77".parse().unwrap()).is_none());

        // A second, narrower network on the same link.
        let ev = addr_event(10, "192.168.5.1", 28);
        let id2 = cache.add_network(&ev);
        let key2 = cache.add_binding(id2, 10, ev.ip).unwrap();
        assert_eq!(
            cache.binding_for_ip(10, &"192.168.5.14".parse().unwrap()),
            Some(key2)
        );
        assert!(cache
            .binding_for_ip(10, &"192.168.5.200".parse().unwrap())
            .is_none());
    }

    #[test]
    fn test_lookup_bumps_reference_count() {
        let (mut cache, _id, _key) = cache_with_binding();
        assert_eq!(cache.peek_link(10).unwrap().reference_count, 0);
        cache.get_link(10).unwrap();
        cache.get_link(10).unwrap();
        assert_eq!(cache.peek_link(10).unwrap().reference_count, 2);
    }

    #[test]
    fn test_update_link_reports_changes() {
        let (mut cache, _id, _key) = cache_with_binding();
        let mut ev = link_event(10, "br0.100", 100);
        assert!(!cache.update_link(&ev));

        ev.ifname = "br0.101".to_string();
        assert!(cache.update_link(&ev));
        assert_eq!(cache.peek_link(10).unwrap().ifname, "br0.101");
    }

    #[test]
    fn test_fdb_detaches_from_link() {
        let (mut cache, _id, _key) = cache_with_binding();
        let mac = MacAddr::new([2, 0, 0, 0, 0, 9]);
        cache.add_fdb(&FdbEvent {
            ifindex: 10,
            mac,
            vlan_id: 100,
            externally_learned: true,
        });
        assert_eq!(cache.peek_link(10).unwrap().fdb.len(), 1);

        cache.remove_fdb(mac, 10, 100);
        assert!(cache.peek_link(10).unwrap().fdb.is_empty());
        assert_eq!(cache.fdb_count(), 0);
    }

    #[test]
    fn test_neigh_update_tracks_transitions() {
        let (mut cache, _id, key) = cache_with_binding();
        let mut ev = NeighEvent {
            ifindex: 10,
            ip: "10.0.0.9".parse().unwrap(),
            mac: MacAddr::new([2, 0, 0, 0, 0, 9]),
            nud_state: NudState::Reachable,
            externally_learned: false,
        };
        cache.add_neigh(key, &ev);

        ev.nud_state = NudState::Stale;
        cache.update_neigh(&ev).unwrap();
        let neigh = cache.peek_neigh(10, &ev.ip).unwrap();
        assert_eq!(neigh.nud_state, NudState::Stale);
        assert_eq!(neigh.update_count, 1);

        // Same state again: no update counted.
        cache.update_neigh(&ev).unwrap();
        assert_eq!(cache.peek_neigh(10, &ev.ip).unwrap().update_count, 1);
    }
}
