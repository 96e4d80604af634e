//! Daemon entry point: argument parsing, logging, setup, run.

use clap::Parser;
use neighsnoopd::{Config, Daemon, Error, Result};
use std::process::ExitCode;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Listens for ARP and NA replies and adds the neighbor to the neighbor
/// table of the SVI serving the reply's network.
#[derive(Parser, Debug)]
#[command(name = "neighsnoopd", version, about, long_about = None)]
struct Args {
    /// Bridge interface whose attached SVIs define the monitored networks
    #[arg(value_name = "IFNAME_MON")]
    ifname_mon: String,

    /// Only handle IPv4 ARP reply packets
    #[arg(short = '4', long = "ipv4", conflicts_with = "only_ipv6")]
    only_ipv4: bool,

    /// Only handle IPv6 NA packets
    #[arg(short = '6', long = "ipv6")]
    only_ipv6: bool,

    /// Handle a fixed number of replies before terminating (debugging aid)
    #[arg(short = 'c', long = "count", value_name = "NUM")]
    count: Option<u64>,

    /// Never add neighbors for interfaces matching this regular
    /// expression, e.g. -f '^br0|.*-v1$'
    #[arg(short = 'f', long = "deny-filter", value_name = "REGEXP")]
    deny_filter: Option<String>,

    /// Disable the default IPv6 link-local address filter
    #[arg(short = 'l', long = "disable-ipv6ll-filter")]
    disable_ipv6ll_filter: bool,

    /// Fail if a qdisc filter is already present on the ingress device
    /// instead of replacing it
    #[arg(short = 'q', long = "no-qfilter-replace")]
    fail_on_qdisc_filter: bool,

    /// Verbose output (-v info, -vv debug, -vvv netlink tracing)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Attach the classifier with XDP instead of TC. Only works on devices
    /// that still see the VLAN header at the XDP hook
    #[arg(short = 'x', long = "xdp")]
    attach_xdp: bool,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn build_config(args: &Args) -> Result<Config> {
    let ifindex_mon = nix::net::if_::if_nametoindex(args.ifname_mon.as_str())
        .map_err(|_| Error::InterfaceNotFound(args.ifname_mon.clone()))?;

    let deny_filter = args
        .deny_filter
        .as_deref()
        .map(regex::Regex::new)
        .transpose()
        .map_err(|e| Error::Config(format!("invalid deny filter: {e}")))?;

    Ok(Config {
        ifname_mon: args.ifname_mon.clone(),
        ifindex_mon,
        only_ipv4: args.only_ipv4,
        only_ipv6: args.only_ipv6,
        count: args.count,
        deny_filter,
        disable_ipv6ll_filter: args.disable_ipv6ll_filter,
        fail_on_qdisc_filter: args.fail_on_qdisc_filter,
        attach_xdp: args.attach_xdp,
    })
}

fn run(config: Config) -> Result<()> {
    let mut daemon = Daemon::new(config)?;
    daemon.run()
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(config) {
        Ok(()) => {
            info!("neighsnoopd exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "neighsnoopd failed");
            ExitCode::FAILURE
        }
    }
}
