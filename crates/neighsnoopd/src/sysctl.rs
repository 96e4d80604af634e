//! Kernel neighbor sysctl access.

use std::io;

/// Source of the per-interface `base_reachable_time_ms` value.
///
/// The daemon reads `/proc`; tests pin a fixed value.
#[derive(Debug, Clone, Copy)]
pub enum ReachableTimeSource {
    Proc,
    Fixed(u64),
}

impl ReachableTimeSource {
    /// Read `base_reachable_time_ms` for `ifname`, selecting the ipv4 or
    /// ipv6 branch of the neighbor sysctl tree.
    pub fn base_reachable_time_ms(&self, ifname: &str, is_ipv4: bool) -> io::Result<u64> {
        match self {
            ReachableTimeSource::Fixed(ms) => Ok(*ms),
            ReachableTimeSource::Proc => {
                let family = if is_ipv4 { "ipv4" } else { "ipv6" };
                let path =
                    format!("/proc/sys/net/{family}/neigh/{ifname}/base_reachable_time_ms");
                let raw = std::fs::read_to_string(&path)?;
                raw.trim().parse::<u64>().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unparseable value in {path}: {raw:?}"),
                    )
                })
            }
        }
    }
}
