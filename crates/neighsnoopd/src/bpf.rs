//! In-kernel classifier attachment and shared maps.
//!
//! The classifier itself is an external collaborator: a prebuilt object file
//! loaded from disk. This module owns its lifecycle — load, TC or XDP
//! attach, and handles to the two shared maps: `target_networks`, which the
//! topology engine mirrors the live networks into, and `neighbor_ringbuf`,
//! which delivers candidate replies to the correlator.

use crate::config::Config;
use crate::error::{Error, Result};
use aya::maps::{HashMap as BpfHashMap, MapData, RingBuf};
use aya::programs::{tc, SchedClassifier, TcAttachType, Xdp, XdpFlags};
use aya::{Ebpf, Pod};
use snoop_types::NetAddr;
use std::io;
use tracing::{debug, info};

/// Default location of the classifier object.
pub const DEFAULT_OBJECT_PATH: &str = "/usr/lib/neighsnoopd/neighsnoopd.bpf.o";
/// Environment override for the classifier object path.
pub const OBJECT_PATH_ENV: &str = "NEIGHSNOOPD_BPF_OBJECT";

const MAP_TARGET_NETWORKS: &str = "target_networks";
const MAP_NEIGHBOR_RINGBUF: &str = "neighbor_ringbuf";
const PROG_TC: &str = "handle_neighbor_reply_tc";
const PROG_XDP: &str = "handle_neighbor_reply_xdp";

/// Key of the `target_networks` map, shared with the classifier.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetNetworkKey {
    pub prefixlen: u32,
    pub network: [u8; 16],
}

// SAFETY: plain-old-data, no padding beyond the trailing array.
unsafe impl Pod for TargetNetworkKey {}

/// Value of the `target_networks` map.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetNetworkValue {
    pub network_id: u32,
}

// SAFETY: plain-old-data.
unsafe impl Pod for TargetNetworkValue {}

/// In-memory stand-in for the kernel map, used by the test suites.
#[derive(Debug, Default)]
pub struct MemoryTargetNetworks {
    entries: std::collections::HashMap<(u32, [u8; 16]), u32>,
    /// Fault injection: fail the next insert, once.
    pub fail_next_insert: bool,
}

/// Handle to the `target_networks` map consulted by the classifier.
#[derive(Debug)]
pub enum TargetNetworksMap {
    Kernel(BpfHashMap<MapData, TargetNetworkKey, TargetNetworkValue>),
    Memory(MemoryTargetNetworks),
}

impl TargetNetworksMap {
    /// An in-memory map for tests and dry runs.
    pub fn memory() -> Self {
        TargetNetworksMap::Memory(MemoryTargetNetworks::default())
    }

    /// Publish `(prefixlen, network) → network_id`.
    pub fn insert(&mut self, prefixlen: u8, network: &NetAddr, network_id: u32) -> Result<()> {
        match self {
            TargetNetworksMap::Kernel(map) => {
                let key = TargetNetworkKey {
                    prefixlen: u32::from(prefixlen),
                    network: network.octets(),
                };
                map.insert(key, TargetNetworkValue { network_id }, 0)?;
                Ok(())
            }
            TargetNetworksMap::Memory(mem) => {
                if mem.fail_next_insert {
                    mem.fail_next_insert = false;
                    return Err(Error::Config("injected map insert failure".to_string()));
                }
                mem.entries
                    .insert((u32::from(prefixlen), network.octets()), network_id);
                Ok(())
            }
        }
    }

    /// Withdraw `(prefixlen, network)`.
    pub fn remove(&mut self, prefixlen: u8, network: &NetAddr) -> Result<()> {
        match self {
            TargetNetworksMap::Kernel(map) => {
                let key = TargetNetworkKey {
                    prefixlen: u32::from(prefixlen),
                    network: network.octets(),
                };
                map.remove(&key)?;
                Ok(())
            }
            TargetNetworksMap::Memory(mem) => {
                mem.entries.remove(&(u32::from(prefixlen), network.octets()));
                Ok(())
            }
        }
    }

    /// Current id for an entry of the in-memory map (None for the kernel map).
    pub fn memory_get(&self, prefixlen: u8, network: &NetAddr) -> Option<u32> {
        match self {
            TargetNetworksMap::Kernel(_) => None,
            TargetNetworksMap::Memory(mem) => mem
                .entries
                .get(&(u32::from(prefixlen), network.octets()))
                .copied(),
        }
    }

    /// Entry count of the in-memory map (0 for the kernel map).
    pub fn memory_len(&self) -> usize {
        match self {
            TargetNetworksMap::Kernel(_) => 0,
            TargetNetworksMap::Memory(mem) => mem.entries.len(),
        }
    }
}

/// The loaded classifier and the ring buffer it feeds.
///
/// Dropping this detaches the programs (links are owned by the `Ebpf`
/// object); an existing clsact qdisc is deliberately left in place.
pub struct BpfState {
    pub ringbuf: RingBuf<MapData>,
    _ebpf: Ebpf,
}

/// Load the classifier object and attach it to the monitored interface,
/// returning the attachment state and the target-networks map handle.
pub fn load_and_attach(config: &Config) -> Result<(BpfState, TargetNetworksMap)> {
    let path = std::env::var(OBJECT_PATH_ENV).unwrap_or_else(|_| DEFAULT_OBJECT_PATH.to_string());
    let mut ebpf = Ebpf::load_file(&path)?;
    info!(object = %path, "loaded BPF classifier");

    if config.attach_xdp {
        let program: &mut Xdp = ebpf
            .program_mut(PROG_XDP)
            .ok_or_else(|| Error::Config(format!("program {PROG_XDP} not found in object")))?
            .try_into()?;
        program.load()?;
        program.attach(&config.ifname_mon, XdpFlags::default())?;
        info!(iface = %config.ifname_mon, "attached XDP classifier");
    } else {
        // The clsact qdisc may already exist: other tooling creates it, and
        // a previous run leaves it behind on purpose.
        match tc::qdisc_add_clsact(&config.ifname_mon) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if config.fail_on_qdisc_filter {
                    return Err(Error::Config(format!(
                        "ingress qdisc already present on {}",
                        config.ifname_mon
                    )));
                }
                debug!(iface = %config.ifname_mon, "clsact qdisc already present");
            }
            Err(e) => return Err(Error::Io(e)),
        }

        let program: &mut SchedClassifier = ebpf
            .program_mut(PROG_TC)
            .ok_or_else(|| Error::Config(format!("program {PROG_TC} not found in object")))?
            .try_into()?;
        program.load()?;
        program.attach(&config.ifname_mon, TcAttachType::Ingress)?;
        info!(iface = %config.ifname_mon, "attached TC ingress classifier");
    }

    let target_networks = BpfHashMap::try_from(
        ebpf.take_map(MAP_TARGET_NETWORKS)
            .ok_or_else(|| Error::Config(format!("map {MAP_TARGET_NETWORKS} not found")))?,
    )?;

    let ringbuf = RingBuf::try_from(
        ebpf.take_map(MAP_NEIGHBOR_RINGBUF)
            .ok_or_else(|| Error::Config(format!("map {MAP_NEIGHBOR_RINGBUF} not found")))?,
    )?;

    Ok((
        BpfState {
            ringbuf,
            _ebpf: ebpf,
        },
        TargetNetworksMap::Kernel(target_networks),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_map_roundtrip() {
        let mut map = TargetNetworksMap::memory();
        let net: NetAddr = "10.0.0.0".parse().unwrap();

        map.insert(24, &net, 1).unwrap();
        assert_eq!(map.memory_get(24, &net), Some(1));
        assert_eq!(map.memory_len(), 1);

        map.remove(24, &net).unwrap();
        assert_eq!(map.memory_get(24, &net), None);
        assert_eq!(map.memory_len(), 0);
    }

    #[test]
    fn test_memory_map_fault_injection() {
        let mut map = TargetNetworksMap::memory();
        let net: NetAddr = "10.0.0.0".parse().unwrap();

        if let TargetNetworksMap::Memory(mem) = &mut map {
            mem.fail_next_insert = true;
        }
        assert!(map.insert(24, &net, 1).is_err());
        // The failure is one-shot.
        assert!(map.insert(24, &net, 1).is_ok());
    }

    #[test]
    fn test_key_layout() {
        // The key must match the classifier's C struct: u32 prefix, 16 bytes.
        assert_eq!(std::mem::size_of::<TargetNetworkKey>(), 20);
        assert_eq!(std::mem::size_of::<TargetNetworkValue>(), 4);
    }
}
