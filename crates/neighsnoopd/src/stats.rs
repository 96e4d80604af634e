//! Stats export over a Unix socket.
//!
//! One client at a time: on accept a JSON snapshot of the counters and the
//! cache is rendered, and the event loop pushes it out in chunks as the
//! client socket becomes writable.

use crate::engine::{Counters, Engine};
use crate::error::Result;
use serde::Serialize;
use std::io::Write;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Where stats clients connect.
pub const STATS_SOCKET_PATH: &str = "/run/neighsnoopd.sock";

#[derive(Serialize)]
struct LinkStat {
    ifindex: u32,
    ifname: String,
    mac: String,
    kind: String,
    vlan_id: u16,
    is_svi: bool,
    ignore_link: bool,
    networks: usize,
    fdb_entries: usize,
    reference_count: u64,
}

#[derive(Serialize)]
struct NetworkStat {
    id: u32,
    network: String,
    true_prefixlen: u8,
    host_route: bool,
    refcnt: u32,
}

#[derive(Serialize)]
struct NeighborStat {
    ifindex: u32,
    ip: String,
    mac: String,
    nud_state: crate::types::NudState,
    has_timer: bool,
    update_count: u64,
}

#[derive(Serialize)]
struct Snapshot {
    counters: Counters,
    links_ready: bool,
    networks_ready: bool,
    fdb_ready: bool,
    fdb_entries: usize,
    links: Vec<LinkStat>,
    networks: Vec<NetworkStat>,
    neighbors: Vec<NeighborStat>,
}

/// Render the stats snapshot served to a client.
pub fn render_snapshot(engine: &Engine) -> Vec<u8> {
    let cache = engine.cache();
    let ready = engine.readiness();

    let mut links: Vec<LinkStat> = cache
        .links()
        .map(|link| LinkStat {
            ifindex: link.ifindex,
            ifname: link.ifname.clone(),
            mac: link.mac.to_string(),
            kind: link.kind.clone(),
            vlan_id: link.vlan_id,
            is_svi: link.is_svi,
            ignore_link: link.ignore_link,
            networks: link.networks.len(),
            fdb_entries: link.fdb.len(),
            reference_count: link.reference_count,
        })
        .collect();
    links.sort_by_key(|l| l.ifindex);

    let mut networks: Vec<NetworkStat> = cache
        .networks()
        .map(|network| NetworkStat {
            id: network.id,
            network: format!("{}/{}", network.addr, network.prefixlen),
            true_prefixlen: network.true_prefixlen,
            host_route: network.is_host_route(),
            refcnt: network.refcnt,
        })
        .collect();
    networks.sort_by_key(|n| n.id);

    let mut neighbors: Vec<NeighborStat> = cache
        .neighbors()
        .map(|neigh| NeighborStat {
            ifindex: neigh.key.ifindex,
            ip: neigh.ip_str.clone(),
            mac: neigh.mac_str.clone(),
            nud_state: neigh.nud_state,
            has_timer: neigh.timer.is_some(),
            update_count: neigh.update_count,
        })
        .collect();
    neighbors.sort_by(|a, b| (a.ifindex, &a.ip).cmp(&(b.ifindex, &b.ip)));

    let snapshot = Snapshot {
        counters: engine.counters().clone(),
        links_ready: ready.links,
        networks_ready: ready.networks,
        fdb_ready: ready.fdb,
        fdb_entries: cache.fdb_count(),
        links,
        networks,
        neighbors,
    };

    let mut payload = serde_json::to_vec_pretty(&snapshot).unwrap_or_else(|e| {
        warn!(error = %e, "failed to render stats snapshot");
        b"{}".to_vec()
    });
    payload.push(b'\n');
    payload
}

/// Progress of the current client transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientProgress {
    Pending,
    Done,
}

struct StatsClient {
    stream: UnixStream,
    payload: Vec<u8>,
    offset: usize,
}

/// The listening socket and the (single) in-flight client.
pub struct StatsServer {
    listener: UnixListener,
    path: PathBuf,
    client: Option<StatsClient>,
}

impl StatsServer {
    /// Bind the stats socket, replacing a stale socket file if present.
    pub fn bind() -> Result<Self> {
        Self::bind_at(STATS_SOCKET_PATH)
    }

    pub fn bind_at(path: &str) -> Result<Self> {
        let path = PathBuf::from(path);
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        Ok(StatsServer {
            listener,
            path,
            client: None,
        })
    }

    pub fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn client_fd(&self) -> Option<RawFd> {
        self.client.as_ref().map(|c| c.stream.as_raw_fd())
    }

    /// Accept a pending connection and hand it the given snapshot. Returns
    /// the new client fd, or None if the connection went away or another
    /// transfer is still running (the newcomer is dropped).
    pub fn accept(&mut self, payload: Vec<u8>) -> Result<Option<RawFd>> {
        let (stream, _) = match self.listener.accept() {
            Ok(conn) => conn,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if self.client.is_some() {
            debug!("stats client already active, dropping new connection");
            return Ok(None);
        }

        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        self.client = Some(StatsClient {
            stream,
            payload,
            offset: 0,
        });
        Ok(Some(fd))
    }

    /// Push more of the snapshot to the client. `Done` means the transfer
    /// finished or failed; call [`StatsServer::close_client`] after removing
    /// the fd from the poll set.
    pub fn flush_client(&mut self) -> ClientProgress {
        let Some(client) = self.client.as_mut() else {
            return ClientProgress::Done;
        };

        while client.offset < client.payload.len() {
            match client.stream.write(&client.payload[client.offset..]) {
                Ok(0) => return ClientProgress::Done,
                Ok(n) => client.offset += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return ClientProgress::Pending;
                }
                Err(e) => {
                    debug!(error = %e, "stats client write failed");
                    return ClientProgress::Done;
                }
            }
        }
        ClientProgress::Done
    }

    /// Drop the current client (closing its socket).
    pub fn close_client(&mut self) {
        self.client = None;
    }
}

impl Drop for StatsServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_snapshot_transfer() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("neighsnoopd-stats-test-{}.sock", std::process::id()));
        let path_str = path.to_str().unwrap();

        let mut server = StatsServer::bind_at(path_str).unwrap();
        let mut conn = UnixStream::connect(path_str).unwrap();

        let fd = server.accept(b"{\"ok\":true}\n".to_vec()).unwrap();
        assert!(fd.is_some());

        // Drive the transfer to completion.
        while server.flush_client() == ClientProgress::Pending {}
        server.close_client();

        let mut body = String::new();
        conn.read_to_string(&mut body).unwrap();
        assert_eq!(body, "{\"ok\":true}\n");
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("neighsnoopd-stats-stale-{}.sock", std::process::id()));
        let path_str = path.to_str().unwrap();

        let first = StatsServer::bind_at(path_str).unwrap();
        drop(first);
        // A fresh bind over the same path must succeed.
        let _second = StatsServer::bind_at(path_str).unwrap();
    }
}
