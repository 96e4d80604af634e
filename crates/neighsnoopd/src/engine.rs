//! The engine: cache, readiness, timers, and side-effect sinks in one place.
//!
//! Event handlers live beside their subsystems — topology handlers in
//! `topology`, the reply correlator in `reply`, the refresh scheduler in
//! `refresh` — all as `impl Engine` blocks over this state.

use crate::bpf::TargetNetworksMap;
use crate::cache::Cache;
use crate::config::Config;
use crate::packet::ProbeSink;
use crate::refresh::TimerQueue;
use crate::sysctl::ReachableTimeSource;
use serde::Serialize;
use snoop_types::{MacAddr, NetAddr};
use std::collections::VecDeque;
use std::time::Instant;

/// A queued kernel neighbor install, drained by the event loop into the
/// netlink socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborInstall {
    pub ifindex: u32,
    pub mac: MacAddr,
    pub ip: NetAddr,
}

/// Readiness flags raised as the initial kernel dumps complete.
#[derive(Debug, Default, Clone, Copy)]
pub struct Readiness {
    pub links: bool,
    pub networks: bool,
    pub fdb: bool,
}

impl Readiness {
    pub fn all(&self) -> bool {
        self.links && self.networks && self.fdb
    }
}

/// Running counters, exported through the stats socket.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Counters {
    pub link_events: u64,
    pub addr_events: u64,
    pub fdb_events: u64,
    pub neigh_events: u64,
    pub replies: u64,
    pub replies_family_filtered: u64,
    pub replies_unmatched: u64,
    pub replies_suppressed: u64,
    pub installs_enqueued: u64,
    pub installs_sent: u64,
    pub probes_arp: u64,
    pub probes_ns: u64,
    pub probe_errors: u64,
    pub timers_armed: u64,
    pub timers_fired: u64,
    pub timers_stale: u64,
}

/// Cache, scheduler, and sinks behind the daemon's event handlers.
pub struct Engine {
    pub(crate) config: Config,
    pub(crate) cache: Cache,
    pub(crate) ready: Readiness,
    pub(crate) timers: TimerQueue,
    pub(crate) target_networks: TargetNetworksMap,
    pub(crate) probes: ProbeSink,
    pub(crate) reachable_time: ReachableTimeSource,
    pub(crate) installs: VecDeque<NeighborInstall>,
    pub(crate) counters: Counters,
    /// Remaining replies before exit in `--count` mode
    pub(crate) remaining: Option<i64>,
}

impl Engine {
    pub fn new(
        config: Config,
        target_networks: TargetNetworksMap,
        probes: ProbeSink,
        reachable_time: ReachableTimeSource,
    ) -> Self {
        let remaining = config.count.map(|n| n as i64);
        Engine {
            config,
            cache: Cache::new(),
            ready: Readiness::default(),
            timers: TimerQueue::new(),
            target_networks,
            probes,
            reachable_time,
            installs: VecDeque::new(),
            counters: Counters::default(),
            remaining,
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn readiness(&self) -> Readiness {
        self.ready
    }

    pub fn probes(&self) -> &ProbeSink {
        &self.probes
    }

    pub fn target_networks(&self) -> &TargetNetworksMap {
        &self.target_networks
    }

    /// Raised when the initial link dump completes.
    pub fn mark_links_loaded(&mut self) {
        self.ready.links = true;
    }

    /// Raised when the initial address dump completes.
    pub fn mark_networks_loaded(&mut self) {
        self.ready.networks = true;
    }

    /// Raised when the initial bridge FDB dump completes.
    pub fn mark_fdb_loaded(&mut self) {
        self.ready.fdb = true;
    }

    /// Take everything queued for the kernel since the last drain.
    pub fn take_installs(&mut self) -> Vec<NeighborInstall> {
        self.installs.drain(..).collect()
    }

    pub fn note_install_sent(&mut self) {
        self.counters.installs_sent += 1;
    }

    /// Deadline of the nearest armed refresh timer.
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// True once `--count` replies have been handled.
    pub fn replies_exhausted(&self) -> bool {
        matches!(self.remaining, Some(n) if n <= 0)
    }
}
