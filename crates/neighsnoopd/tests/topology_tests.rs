//! Topology engine integration tests: readiness gating, cache invariants,
//! cascades, and the eBPF map mirror, all driven through in-memory sinks.

use neighsnoopd::bpf::TargetNetworksMap;
use neighsnoopd::config::Config;
use neighsnoopd::engine::Engine;
use neighsnoopd::packet::ProbeSink;
use neighsnoopd::sysctl::ReachableTimeSource;
use neighsnoopd::types::{
    AddrEvent, FdbEvent, LinkEvent, NeighEvent, NetlinkEvent, NudState,
};
use pretty_assertions::assert_eq;
use snoop_types::{MacAddr, NetAddr};

/// ifindex of the monitored bridge in these tests.
const BR0: u32 = 2;
/// ifindex of a VLAN SVI on the bridge.
const SVI: u32 = 10;

fn engine_with(config: Config) -> Engine {
    Engine::new(
        config,
        TargetNetworksMap::memory(),
        ProbeSink::memory(),
        ReachableTimeSource::Fixed(30000),
    )
}

fn engine() -> Engine {
    engine_with(Config::for_monitor("br0", BR0))
}

fn mac(last: u8) -> MacAddr {
    MacAddr::new([0x02, 0, 0, 0, 0, last])
}

fn link_add(ifindex: u32, ifname: &str, vlan_id: u16, link_ifindex: u32) -> NetlinkEvent {
    NetlinkEvent::LinkAdd(LinkEvent {
        ifindex,
        ifname: ifname.to_string(),
        mac: mac(ifindex as u8),
        kind: if vlan_id != 0 { "vlan" } else { "bridge" }.to_string(),
        slave_kind: String::new(),
        vlan_id,
        vlan_protocol: if vlan_id != 0 { 0x8100 } else { 0 },
        has_vlan: vlan_id != 0,
        is_macvlan: false,
        link_ifindex,
    })
}

fn addr_add(ifindex: u32, ip: &str, prefixlen: u8) -> NetlinkEvent {
    NetlinkEvent::AddrAdd(AddrEvent {
        ifindex,
        ip: ip.parse().unwrap(),
        prefixlen,
        true_prefixlen: prefixlen,
    })
}

fn addr_del(ifindex: u32, ip: &str, prefixlen: u8) -> NetlinkEvent {
    NetlinkEvent::AddrDel(AddrEvent {
        ifindex,
        ip: ip.parse().unwrap(),
        prefixlen,
        true_prefixlen: prefixlen,
    })
}

fn neigh_add(ifindex: u32, ip: &str, mac_last: u8, nud_state: NudState) -> NetlinkEvent {
    NetlinkEvent::NeighAdd(NeighEvent {
        ifindex,
        ip: ip.parse().unwrap(),
        mac: mac(mac_last),
        nud_state,
        externally_learned: false,
    })
}

fn fdb_add(ifindex: u32, mac_last: u8, vlan_id: u16, externally_learned: bool) -> NetlinkEvent {
    NetlinkEvent::FdbAdd(FdbEvent {
        ifindex,
        mac: mac(mac_last),
        vlan_id,
        externally_learned,
    })
}

fn mark_ready(engine: &mut Engine) {
    engine.mark_links_loaded();
    engine.mark_networks_loaded();
    engine.mark_fdb_loaded();
}

/// Bridge with its own address: the starting topology most tests build on.
fn engine_with_bridge_network() -> Engine {
    let mut engine = engine();
    mark_ready(&mut engine);
    engine.handle_event(&link_add(BR0, "br0", 0, BR0));
    engine.handle_event(&addr_add(BR0, "10.0.0.1", 24));
    engine
}

#[test]
fn test_bridge_itself_is_svi() {
    let mut engine = engine();
    engine.mark_links_loaded();
    engine.handle_event(&link_add(BR0, "br0", 0, BR0));

    let link = engine.cache().peek_link(BR0).unwrap();
    assert!(link.is_svi);
    assert!(!link.ignore_link);
}

#[test]
fn test_vlan_svi_and_foreign_link() {
    let mut engine = engine();
    engine.mark_links_loaded();
    engine.handle_event(&link_add(SVI, "br0.100", 100, BR0));
    engine.handle_event(&link_add(20, "eth7", 0, 19));

    assert!(engine.cache().peek_link(SVI).unwrap().is_svi);
    assert!(!engine.cache().peek_link(20).unwrap().is_svi);
}

#[test]
fn test_addr_add_creates_network_and_map_entry() {
    let engine = engine_with_bridge_network();

    let net: NetAddr = "10.0.0.0".parse().unwrap();
    let id = engine.cache().network_id_by_addr(&net).unwrap();
    assert_eq!(id, 1);

    let network = engine.cache().peek_network(id).unwrap();
    assert_eq!(network.addr, net);
    assert_eq!(network.prefixlen, 24);
    assert_eq!(network.refcnt, 1);

    // Mirrored into the classifier's map, keyed by the native prefix.
    assert_eq!(engine.target_networks().memory_get(24, &net), Some(1));
    assert_eq!(engine.target_networks().memory_len(), 1);

    // The binding carries the SVI's own address, not the masked network.
    let binding = engine.cache().binding_by_vlan_network(1, 0).unwrap();
    assert_eq!(binding.ip, "10.0.0.1".parse().unwrap());
}

#[test]
fn test_second_svi_joins_existing_network() {
    let mut engine = engine_with_bridge_network();
    engine.handle_event(&link_add(SVI, "br0.100", 100, BR0));
    engine.handle_event(&addr_add(SVI, "10.0.0.2", 24));

    let net: NetAddr = "10.0.0.0".parse().unwrap();
    let id = engine.cache().network_id_by_addr(&net).unwrap();
    let network = engine.cache().peek_network(id).unwrap();
    assert_eq!(network.refcnt, 2);
    assert_eq!(network.refcnt as usize, network.links.len());
    // Still exactly one map entry for the network.
    assert_eq!(engine.target_networks().memory_len(), 1);
}

#[test]
fn test_addr_replay_is_idempotent() {
    let mut engine = engine_with_bridge_network();

    let before_networks = engine.cache().network_count();
    let before_bindings = engine.cache().binding_count();
    let before_map = engine.target_networks().memory_len();

    engine.handle_event(&addr_add(BR0, "10.0.0.1", 24));

    assert_eq!(engine.cache().network_count(), before_networks);
    assert_eq!(engine.cache().binding_count(), before_bindings);
    assert_eq!(engine.target_networks().memory_len(), before_map);
    let net: NetAddr = "10.0.0.0".parse().unwrap();
    assert_eq!(engine.cache().network_id_by_addr(&net), Some(1));
}

#[test]
fn test_link_replay_is_idempotent() {
    let mut engine = engine_with_bridge_network();

    let before = engine.cache().peek_link(BR0).unwrap().clone();
    engine.handle_event(&link_add(BR0, "br0", 0, BR0));
    let after = engine.cache().peek_link(BR0).unwrap();

    assert_eq!(engine.cache().link_count(), 1);
    assert_eq!(after.networks, before.networks);
    assert_eq!(after.fdb, before.fdb);
    assert_eq!(after.ifname, before.ifname);
    assert_eq!(after.is_svi, before.is_svi);
    // An update that changes nothing must not bump `updated`.
    assert_eq!(after.times.updated, before.times.updated);
}

#[test]
fn test_deletes_of_unknown_keys_are_noops() {
    let mut engine = engine();
    mark_ready(&mut engine);

    engine.handle_event(&NetlinkEvent::LinkDel(LinkEvent {
        ifindex: 99,
        ifname: "ghost".to_string(),
        mac: mac(9),
        kind: String::new(),
        slave_kind: String::new(),
        vlan_id: 0,
        vlan_protocol: 0,
        has_vlan: false,
        is_macvlan: false,
        link_ifindex: 0,
    }));
    engine.handle_event(&addr_del(99, "10.9.9.1", 24));
    engine.handle_event(&NetlinkEvent::FdbDel(FdbEvent {
        ifindex: 99,
        mac: mac(9),
        vlan_id: 0,
        externally_learned: true,
    }));
    engine.handle_event(&NetlinkEvent::NeighDel(NeighEvent {
        ifindex: 99,
        ip: "10.9.9.9".parse().unwrap(),
        mac: mac(9),
        nud_state: NudState::Reachable,
        externally_learned: false,
    }));

    assert_eq!(engine.cache().link_count(), 0);
    assert_eq!(engine.cache().network_count(), 0);
    assert_eq!(engine.cache().fdb_count(), 0);
    assert_eq!(engine.cache().neigh_count(), 0);
}

#[test]
fn test_neigh_gating_before_readiness() {
    let mut engine = engine();
    engine.handle_event(&link_add(BR0, "br0", 0, BR0));

    // Links are loaded but networks/FDB are not: neighbor adds are dropped.
    engine.mark_links_loaded();
    engine.handle_event(&addr_add(BR0, "10.0.0.1", 24));
    engine.handle_event(&neigh_add(BR0, "10.0.0.5", 5, NudState::Reachable));
    assert_eq!(engine.cache().neigh_count(), 0);

    engine.mark_networks_loaded();
    engine.handle_event(&neigh_add(BR0, "10.0.0.5", 5, NudState::Reachable));
    assert_eq!(engine.cache().neigh_count(), 0);

    engine.mark_fdb_loaded();
    engine.handle_event(&neigh_add(BR0, "10.0.0.5", 5, NudState::Reachable));
    assert_eq!(engine.cache().neigh_count(), 1);
}

#[test]
fn test_addr_gating_before_links_loaded() {
    let mut engine = engine();
    engine.handle_event(&link_add(BR0, "br0", 0, BR0));
    // The link dump has not finished: the address is dropped.
    engine.handle_event(&addr_add(BR0, "10.0.0.1", 24));
    assert_eq!(engine.cache().network_count(), 0);
}

#[test]
fn test_fdb_gating_and_external_learned_only() {
    let mut engine = engine();
    engine.handle_event(&link_add(BR0, "br0", 0, BR0));
    engine.mark_links_loaded();

    // Networks not loaded yet: dropped.
    engine.handle_event(&fdb_add(BR0, 9, 0, true));
    assert_eq!(engine.cache().fdb_count(), 0);

    engine.mark_networks_loaded();
    // Locally learned entries are of no interest.
    engine.handle_event(&fdb_add(BR0, 9, 0, false));
    assert_eq!(engine.cache().fdb_count(), 0);

    engine.handle_event(&fdb_add(BR0, 9, 0, true));
    assert_eq!(engine.cache().fdb_count(), 1);
}

#[test]
fn test_neigh_add_arms_timer_once() {
    let mut engine = engine_with_bridge_network();

    engine.handle_event(&neigh_add(BR0, "10.0.0.5", 5, NudState::Reachable));
    let first = engine.cache().peek_neigh(BR0, &"10.0.0.5".parse().unwrap()).unwrap().timer;
    assert!(first.is_some());
    assert_eq!(engine.counters().timers_armed, 1);

    // A second REACHABLE add leaves the existing timer in place.
    engine.handle_event(&neigh_add(BR0, "10.0.0.5", 5, NudState::Reachable));
    let second = engine.cache().peek_neigh(BR0, &"10.0.0.5".parse().unwrap()).unwrap().timer;
    assert_eq!(first, second);
    assert_eq!(engine.counters().timers_armed, 1);
}

#[test]
fn test_stale_neigh_probed_immediately() {
    let mut engine = engine_with_bridge_network();

    engine.handle_event(&neigh_add(BR0, "10.0.0.5", 5, NudState::Stale));

    let neigh = engine.cache().peek_neigh(BR0, &"10.0.0.5".parse().unwrap()).unwrap();
    assert!(neigh.timer.is_none());
    assert_eq!(engine.probes().sent().len(), 1);
    assert_eq!(engine.counters().probes_arp, 1);
}

#[test]
fn test_neigh_filters() {
    let mut engine = engine_with_bridge_network();

    // Zero MAC: incomplete, ignored.
    engine.handle_event(&neigh_add(BR0, "10.0.0.5", 0, NudState::Incomplete));
    assert_eq!(engine.cache().neigh_count(), 0);

    // Externally learned: ignored.
    engine.handle_event(&NetlinkEvent::NeighAdd(NeighEvent {
        ifindex: BR0,
        ip: "10.0.0.5".parse().unwrap(),
        mac: mac(5),
        nud_state: NudState::Reachable,
        externally_learned: true,
    }));
    assert_eq!(engine.cache().neigh_count(), 0);

    // Outside every target network: ignored.
    engine.handle_event(&neigh_add(BR0, "172.16.0.5", 5, NudState::Reachable));
    assert_eq!(engine.cache().neigh_count(), 0);

    // No interface: ignored.
    engine.handle_event(&neigh_add(0, "10.0.0.5", 5, NudState::Reachable));
    assert_eq!(engine.cache().neigh_count(), 0);
}

#[test]
fn test_deny_filter_blocks_neighbors() {
    let mut config = Config::for_monitor("br0", BR0);
    config.deny_filter = Some(regex::Regex::new("^br0$").unwrap());
    let mut engine = engine_with(config);
    mark_ready(&mut engine);

    engine.handle_event(&link_add(BR0, "br0", 0, BR0));
    assert!(engine.cache().peek_link(BR0).unwrap().ignore_link);

    engine.handle_event(&addr_add(BR0, "10.0.0.1", 24));
    engine.handle_event(&neigh_add(BR0, "10.0.0.5", 5, NudState::Reachable));
    assert_eq!(engine.cache().neigh_count(), 0);
}

#[test]
fn test_ipv6_link_local_filter() {
    let mut engine = engine();
    mark_ready(&mut engine);
    engine.handle_event(&link_add(BR0, "br0", 0, BR0));

    engine.handle_event(&addr_add(BR0, "fe80::1", 64));
    assert_eq!(engine.cache().network_count(), 0);

    // Global IPv6 addresses pass.
    engine.handle_event(&addr_add(BR0, "2001:db8::1", 64));
    assert_eq!(engine.cache().network_count(), 1);
}

#[test]
fn test_ipv6_link_local_filter_disabled() {
    let mut config = Config::for_monitor("br0", BR0);
    config.disable_ipv6ll_filter = true;
    let mut engine = engine_with(config);
    mark_ready(&mut engine);
    engine.handle_event(&link_add(BR0, "br0", 0, BR0));

    engine.handle_event(&addr_add(BR0, "fe80::1", 64));
    assert_eq!(engine.cache().network_count(), 1);
}

#[test]
fn test_addr_on_non_svi_ignored() {
    let mut engine = engine();
    mark_ready(&mut engine);
    engine.handle_event(&link_add(20, "eth7", 0, 19));

    engine.handle_event(&addr_add(20, "10.0.0.1", 24));
    assert_eq!(engine.cache().network_count(), 0);
    assert_eq!(engine.target_networks().memory_len(), 0);
}

#[test]
fn test_addr_del_removes_network_but_keeps_neighbor() {
    let mut engine = engine_with_bridge_network();
    engine.handle_event(&neigh_add(BR0, "10.0.0.5", 5, NudState::Reachable));
    assert_eq!(engine.cache().neigh_count(), 1);

    engine.handle_event(&addr_del(BR0, "10.0.0.1", 24));

    let net: NetAddr = "10.0.0.0".parse().unwrap();
    assert_eq!(engine.target_networks().memory_len(), 0);
    assert!(engine.cache().network_id_by_addr(&net).is_none());
    assert_eq!(engine.cache().network_count(), 0);
    assert_eq!(engine.cache().binding_count(), 0);
    assert!(engine.cache().peek_link(BR0).unwrap().networks.is_empty());

    // The tracked neighbor stays until its own NEIGH DEL arrives.
    assert_eq!(engine.cache().neigh_count(), 1);
}

#[test]
fn test_addr_del_of_unknown_network_is_noop() {
    let mut engine = engine_with_bridge_network();
    engine.handle_event(&addr_del(BR0, "192.168.0.1", 24));
    assert_eq!(engine.cache().network_count(), 1);
    assert_eq!(engine.target_networks().memory_len(), 1);
}

#[test]
fn test_link_del_cascades_everything() {
    let mut engine = engine_with_bridge_network();
    engine.handle_event(&fdb_add(BR0, 9, 0, true));
    engine.handle_event(&neigh_add(BR0, "10.0.0.5", 5, NudState::Reachable));

    engine.handle_event(&NetlinkEvent::LinkDel(LinkEvent {
        ifindex: BR0,
        ifname: "br0".to_string(),
        mac: mac(BR0 as u8),
        kind: "bridge".to_string(),
        slave_kind: String::new(),
        vlan_id: 0,
        vlan_protocol: 0,
        has_vlan: false,
        is_macvlan: false,
        link_ifindex: BR0,
    }));

    // Nothing referencing the ifindex survives in any index.
    assert!(engine.cache().peek_link(BR0).is_none());
    assert_eq!(engine.cache().binding_count(), 0);
    assert_eq!(engine.cache().fdb_count(), 0);
    assert_eq!(engine.cache().neigh_count(), 0);
    let net: NetAddr = "10.0.0.0".parse().unwrap();
    let id = engine.cache().network_id_by_addr(&net).unwrap();
    assert_eq!(engine.cache().peek_network(id).unwrap().refcnt, 0);
}

#[test]
fn test_map_failure_rolls_back_network() {
    let mut map = TargetNetworksMap::memory();
    if let TargetNetworksMap::Memory(mem) = &mut map {
        mem.fail_next_insert = true;
    }
    let mut engine = Engine::new(
        Config::for_monitor("br0", BR0),
        map,
        ProbeSink::memory(),
        ReachableTimeSource::Fixed(30000),
    );
    mark_ready(&mut engine);
    engine.handle_event(&link_add(BR0, "br0", 0, BR0));

    engine.handle_event(&addr_add(BR0, "10.0.0.1", 24));

    // All three inserts rolled back; no binding was created.
    let net: NetAddr = "10.0.0.0".parse().unwrap();
    assert_eq!(engine.cache().network_count(), 0);
    assert!(engine.cache().network_id_by_addr(&net).is_none());
    assert_eq!(engine.cache().binding_count(), 0);
    assert_eq!(engine.target_networks().memory_len(), 0);

    // The next address event succeeds and allocates a fresh id.
    engine.handle_event(&addr_add(BR0, "10.0.0.1", 24));
    assert_eq!(engine.cache().network_count(), 1);
    assert_eq!(engine.target_networks().memory_len(), 1);
}

#[test]
fn test_refcnt_law_across_event_sequences() {
    let mut engine = engine_with_bridge_network();
    engine.handle_event(&link_add(SVI, "br0.100", 100, BR0));
    engine.handle_event(&addr_add(SVI, "10.0.0.3", 24));
    engine.handle_event(&addr_add(SVI, "192.168.0.1", 16));

    for network in engine.cache().networks() {
        assert_eq!(network.refcnt as usize, network.links.len());
    }

    engine.handle_event(&addr_del(SVI, "10.0.0.3", 24));
    for network in engine.cache().networks() {
        assert_eq!(network.refcnt as usize, network.links.len());
    }
}

#[test]
fn test_cross_index_coherence() {
    let mut engine = engine_with_bridge_network();
    engine.handle_event(&link_add(SVI, "br0.100", 100, BR0));
    engine.handle_event(&addr_add(SVI, "192.168.0.1", 16));

    let cache = engine.cache();
    for network in cache.networks() {
        for key in &network.links {
            let link = cache.peek_link(key.ifindex).unwrap();
            // Reachable from the link side too.
            assert!(link.networks.contains(key));
            // Both lookup indices resolve to the same binding.
            let by_vlan = cache
                .binding_by_vlan_network(network.id, link.vlan_id)
                .unwrap();
            let by_addr = cache
                .binding_by_addr_ifindex(&network.addr, link.ifindex)
                .unwrap();
            assert_eq!(by_vlan.key, *key);
            assert_eq!(by_addr.key, *key);
        }
    }
}
