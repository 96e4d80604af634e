//! The reply correlator: maps classifier ring-buffer records onto the cache
//! and asks the kernel to install the neighbor.
//!
//! The correlator never inserts into the neighbor table itself. The install
//! request it enqueues makes the kernel broadcast an RTM_NEWNEIGH, and that
//! event — like any other neighbor event — is what populates the cache, so
//! the cache only ever reflects state the kernel has confirmed.

use crate::engine::{Engine, NeighborInstall};
use crate::types::{ReplyRecord, AF_INET, AF_INET6};
use tracing::{debug, warn};

impl Engine {
    /// Handle one observed ARP reply / Neighbor Advertisement.
    pub fn handle_reply(&mut self, rec: &ReplyRecord) {
        if self.config.only_ipv6 && rec.in_family != AF_INET6 {
            self.counters.replies_family_filtered += 1;
            return;
        }
        if self.config.only_ipv4 && rec.in_family != AF_INET {
            self.counters.replies_family_filtered += 1;
            return;
        }

        self.counters.replies += 1;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }

        let Some(binding) = self
            .cache
            .binding_by_vlan_network(rec.network_id, rec.vlan_id)
        else {
            warn!(
                vlan = rec.vlan_id,
                network_id = rec.network_id,
                "reply for unknown VLAN/network pair"
            );
            self.counters.replies_unmatched += 1;
            return;
        };
        let ifindex = binding.key.ifindex;

        // A hit here means the bridge only relayed this MAC from another
        // port; installing it on the SVI would blackhole the host.
        if self.cache.get_fdb(rec.mac, ifindex, rec.vlan_id).is_some() {
            debug!(ip = %rec.ip, mac = %rec.mac, "externally learned, skipping");
            self.counters.replies_suppressed += 1;
            return;
        }

        debug!(ip = %rec.ip, mac = %rec.mac, ifindex, "neighbor reply");

        // A fresh reply restarts the refresh clock of a tracked neighbor.
        if let Some(neigh) = self.cache.get_neigh(ifindex, &rec.ip) {
            let key = neigh.key;
            self.arm_refresh(key);
        }

        self.installs.push_back(NeighborInstall {
            ifindex,
            mac: rec.mac,
            ip: rec.ip,
        });
        self.counters.installs_enqueued += 1;
    }
}
