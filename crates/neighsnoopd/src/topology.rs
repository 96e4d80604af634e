//! The topology engine: applies kernel link/address/FDB/neighbor events to
//! the cache.
//!
//! The engine is edge-triggered and idempotent: re-adding an existing key
//! updates it, deleting an unknown key is a no-op. Neighbor events are
//! ignored until all three initial dumps have completed, FDB events until
//! links and networks are loaded, and address events until links are loaded,
//! so startup enumeration never trips over an interface the cache has not
//! seen yet.

use crate::engine::Engine;
use crate::types::{AddrEvent, FdbEvent, LinkEvent, NeighEvent, NetlinkEvent, NudState};
use tracing::{debug, error, info, warn};

impl Engine {
    /// Apply one decoded netlink notification.
    pub fn handle_event(&mut self, ev: &NetlinkEvent) {
        match ev {
            NetlinkEvent::LinkAdd(link) => self.on_link_add(link),
            NetlinkEvent::LinkDel(link) => self.on_link_del(link),
            NetlinkEvent::AddrAdd(addr) => self.on_addr_add(addr),
            NetlinkEvent::AddrDel(addr) => self.on_addr_del(addr),
            NetlinkEvent::FdbAdd(fdb) => self.on_fdb_add(fdb),
            NetlinkEvent::FdbDel(fdb) => self.on_fdb_del(fdb),
            NetlinkEvent::NeighAdd(neigh) => self.on_neigh_add(neigh),
            NetlinkEvent::NeighDel(neigh) => self.on_neigh_del(neigh),
        }
    }

    fn on_link_add(&mut self, ev: &LinkEvent) {
        self.counters.link_events += 1;

        if self.cache.peek_link(ev.ifindex).is_some() {
            debug!(ifindex = ev.ifindex, ifname = %ev.ifname, "link already cached");
            self.cache.update_link(ev);
            return;
        }

        let is_svi = ev.link_ifindex == self.config.ifindex_mon;
        let ignore_link = self.config.deny_matches(&ev.ifname);
        let link = self.cache.add_link(ev);
        link.is_svi = is_svi;
        link.ignore_link = ignore_link;

        if ignore_link {
            debug!(ifname = %ev.ifname, "link matches deny filter");
        }
        if is_svi {
            info!(ifname = %ev.ifname, vlan = ev.vlan_id, "cached SVI");
        } else {
            debug!(ifname = %ev.ifname, vlan = ev.vlan_id, "cached link");
        }
    }

    fn on_link_del(&mut self, ev: &LinkEvent) {
        self.counters.link_events += 1;

        if self.cache.remove_link(ev.ifindex).is_some() {
            info!(ifname = %ev.ifname, ifindex = ev.ifindex, "link removed");
        } else {
            debug!(ifname = %ev.ifname, "link not cached, nothing to remove");
        }
    }

    fn on_addr_add(&mut self, ev: &AddrEvent) {
        self.counters.addr_events += 1;

        if !self.ready.links {
            return;
        }
        if !self.config.disable_ipv6ll_filter && ev.ip.is_ipv6_link_local() {
            return;
        }

        let Some(link) = self.cache.get_link(ev.ifindex) else {
            debug!(ifindex = ev.ifindex, "address for unknown interface");
            return;
        };
        if !link.is_svi {
            debug!(ifname = %link.ifname, "not an SVI on the monitored bridge");
            return;
        }

        let net_addr = ev.network();
        let network_id = match self.cache.network_id_by_addr(&net_addr) {
            Some(id) => id,
            None => {
                let id = self.cache.add_network(ev);
                if let Err(e) = self.target_networks.insert(ev.prefixlen, &net_addr, id) {
                    error!(
                        error = %e,
                        network = %net_addr,
                        "target-networks map update failed, rolling back network"
                    );
                    self.cache.remove_network(id);
                    return;
                }
                id
            }
        };

        if self.cache.binding_by_addr_ifindex(&net_addr, ev.ifindex).is_none() {
            self.cache.add_binding(network_id, ev.ifindex, ev.ip);
            info!(
                network = %net_addr,
                prefixlen = ev.prefixlen,
                id = network_id,
                ifindex = ev.ifindex,
                "added network binding"
            );
        }
    }

    fn on_addr_del(&mut self, ev: &AddrEvent) {
        self.counters.addr_events += 1;

        let net_addr = ev.network();
        let Some(link) = self.cache.peek_link(ev.ifindex) else {
            debug!(ifindex = ev.ifindex, "address removal for unknown interface");
            return;
        };

        // Find the network through the link's own binding list.
        let mut network_id = None;
        for key in &link.networks {
            if let Some(network) = self.cache.peek_network(key.network_id) {
                if network.addr == net_addr && network.prefixlen == ev.prefixlen {
                    network_id = Some(network.id);
                    break;
                }
            }
        }
        let Some(id) = network_id else {
            debug!(network = %net_addr, prefixlen = ev.prefixlen, "network not cached");
            return;
        };

        if let Err(e) = self.target_networks.remove(ev.prefixlen, &net_addr) {
            error!(error = %e, network = %net_addr, "target-networks map removal failed");
        }
        self.cache.remove_network(id);
        info!(network = %net_addr, prefixlen = ev.prefixlen, "removed network");
    }

    fn on_fdb_add(&mut self, ev: &FdbEvent) {
        self.counters.fdb_events += 1;

        if !(self.ready.links && self.ready.networks) {
            return;
        }
        if ev.ifindex == 0 {
            return;
        }
        if self.cache.get_link(ev.ifindex).is_none() {
            warn!(ifindex = ev.ifindex, "FDB entry for unknown interface");
            return;
        }
        // Only bridge-relayed (externally learned) entries matter: they are
        // what suppresses neighbor installs for MACs behind another port.
        if !ev.externally_learned {
            debug!(mac = %ev.mac, "FDB entry not externally learned, not cached");
            return;
        }
        if self.cache.peek_fdb(ev.mac, ev.ifindex, ev.vlan_id).is_some() {
            return;
        }

        self.cache.add_fdb(ev);
        debug!(mac = %ev.mac, ifindex = ev.ifindex, vlan = ev.vlan_id, "cached FDB entry");
    }

    fn on_fdb_del(&mut self, ev: &FdbEvent) {
        self.counters.fdb_events += 1;

        if self.cache.remove_fdb(ev.mac, ev.ifindex, ev.vlan_id).is_some() {
            debug!(mac = %ev.mac, ifindex = ev.ifindex, vlan = ev.vlan_id, "FDB entry removed");
        }
    }

    fn on_neigh_add(&mut self, ev: &NeighEvent) {
        self.counters.neigh_events += 1;

        // Ignore neighbor events until the initial dumps are in.
        if !self.ready.all() {
            return;
        }
        if ev.ifindex == 0 {
            debug!(ip = %ev.ip, mac = %ev.mac, "neighbor without interface");
            return;
        }
        // Incomplete entries have no hardware address yet.
        if ev.mac.is_zero() {
            return;
        }
        if ev.externally_learned {
            debug!(ip = %ev.ip, mac = %ev.mac, "neighbor externally learned");
            return;
        }

        let Some(link) = self.cache.get_link(ev.ifindex) else {
            debug!(ifindex = ev.ifindex, "neighbor on unknown interface");
            return;
        };
        if link.ignore_link {
            debug!(ifname = %link.ifname, ip = %ev.ip, "interface deny-listed");
            return;
        }
        let ifname = link.ifname.clone();

        // Ignore IPs outside every target network on this link.
        let Some(binding) = self.cache.binding_for_ip(ev.ifindex, &ev.ip) else {
            return;
        };

        if self.cache.peek_neigh(ev.ifindex, &ev.ip).is_some() {
            self.cache.update_neigh(ev);
        } else {
            self.cache.add_neigh(binding, ev);
            info!(ip = %ev.ip, mac = %ev.mac, nic = %ifname, "neighbor added to cache");
        }

        let Some(neigh) = self.cache.peek_neigh(ev.ifindex, &ev.ip) else {
            return;
        };
        let key = neigh.key;
        let has_timer = neigh.timer.is_some();

        match neigh.nud_state {
            NudState::Reachable if !has_timer => {
                self.arm_refresh(key);
            }
            NudState::Reachable => {
                debug!(ip = %ev.ip, nic = %ifname, "neighbor already has a refresh timer");
            }
            // Confirm a stale neighbor right away instead of waiting for
            // the kernel to probe it.
            NudState::Stale => {
                self.send_gratuitous(key);
            }
            _ => {}
        }
    }

    fn on_neigh_del(&mut self, ev: &NeighEvent) {
        self.counters.neigh_events += 1;

        if let Some(neigh) = self.cache.remove_neigh(ev.ifindex, &ev.ip) {
            // Any armed timer entry is now stale and will be discarded when
            // it surfaces from the heap.
            debug!(ip = %neigh.ip_str, mac = %neigh.mac_str, "neighbor removed");
        }
    }
}
