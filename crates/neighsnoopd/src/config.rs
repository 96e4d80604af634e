//! Runtime configuration derived from the command line.

use regex::Regex;

/// Resolved daemon configuration. Built once in `main` and passed
/// explicitly; there is no global state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the monitored bridge interface
    pub ifname_mon: String,
    /// Resolved ifindex of the monitored bridge
    pub ifindex_mon: u32,
    /// Handle only IPv4 ARP replies
    pub only_ipv4: bool,
    /// Handle only IPv6 NA replies
    pub only_ipv6: bool,
    /// Exit after this many replies (debug aid)
    pub count: Option<u64>,
    /// Interfaces matching this pattern never feed the neighbor cache
    pub deny_filter: Option<Regex>,
    /// Keep IPv6 link-local addresses instead of filtering them
    pub disable_ipv6ll_filter: bool,
    /// Fail if an ingress qdisc filter is already present
    pub fail_on_qdisc_filter: bool,
    /// Attach the classifier at XDP instead of TC
    pub attach_xdp: bool,
}

impl Config {
    /// A minimal configuration for a monitored ifindex, used by the test
    /// suites.
    pub fn for_monitor(ifname: &str, ifindex: u32) -> Self {
        Config {
            ifname_mon: ifname.to_string(),
            ifindex_mon: ifindex,
            only_ipv4: false,
            only_ipv6: false,
            count: None,
            deny_filter: None,
            disable_ipv6ll_filter: false,
            fail_on_qdisc_filter: false,
            attach_xdp: false,
        }
    }

    /// True if `ifname` matches the deny filter.
    pub fn deny_matches(&self, ifname: &str) -> bool {
        self.deny_filter
            .as_ref()
            .is_some_and(|re| re.is_match(ifname))
    }
}
