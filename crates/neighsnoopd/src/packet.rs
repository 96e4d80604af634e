//! Raw packet socket for emitting probe frames.

use crate::error::{Error, Result};
use snoop_types::MacAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// EtherType for ARP.
pub const ETH_P_ARP: u16 = 0x0806;
/// EtherType for IPv4.
pub const ETH_P_IP: u16 = 0x0800;
/// EtherType for IPv6.
pub const ETH_P_IPV6: u16 = 0x86dd;

/// An `AF_PACKET/SOCK_RAW` socket. One socket serves every interface; the
/// target interface is selected per send through `sll_ifindex`.
#[derive(Debug)]
pub struct PacketSocket {
    fd: OwnedFd,
}

impl PacketSocket {
    /// Open the raw socket. Requires CAP_NET_RAW.
    pub fn open() -> Result<Self> {
        // man 2 socket: returns a file descriptor or -1 on error.
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                (libc::ETH_P_ALL as u16).to_be() as i32,
            )
        };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(PacketSocket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Send one Ethernet frame out of `ifindex`, addressed to `dst_mac`.
    pub fn send(&self, frame: &[u8], ifindex: u32, dst_mac: MacAddr, protocol: u16) -> Result<()> {
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = protocol.to_be();
        addr.sll_ifindex = ifindex as i32;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&dst_mac.octets());

        let rc = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// A probe frame captured by the in-memory sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentProbe {
    pub ifindex: u32,
    pub dst_mac: MacAddr,
    pub protocol: u16,
    pub frame: Vec<u8>,
}

/// Where probe frames go: the wire, or a buffer the tests can inspect.
#[derive(Debug)]
pub enum ProbeSink {
    Packet(PacketSocket),
    Memory(Vec<SentProbe>),
}

impl ProbeSink {
    /// An in-memory sink that records every frame.
    pub fn memory() -> Self {
        ProbeSink::Memory(Vec::new())
    }

    pub fn send(&mut self, frame: &[u8], ifindex: u32, dst_mac: MacAddr, protocol: u16) -> Result<()> {
        match self {
            ProbeSink::Packet(socket) => socket.send(frame, ifindex, dst_mac, protocol),
            ProbeSink::Memory(sent) => {
                sent.push(SentProbe {
                    ifindex,
                    dst_mac,
                    protocol,
                    frame: frame.to_vec(),
                });
                Ok(())
            }
        }
    }

    /// Frames recorded by the in-memory sink (empty for the socket sink).
    pub fn sent(&self) -> &[SentProbe] {
        match self {
            ProbeSink::Packet(_) => &[],
            ProbeSink::Memory(sent) => sent,
        }
    }
}
