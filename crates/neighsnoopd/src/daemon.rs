//! The single-threaded event loop.
//!
//! One epoll instance multiplexes every source. Handlers run in a fixed
//! order within each wake-up: signals, timers, netlink, ring buffer, the
//! outbound netlink queue, then stats traffic — netlink drains before the
//! ring buffer so the cache is as fresh as possible when replies are
//! correlated. Teardown happens in reverse setup order through field drop
//! order.

use crate::bpf::{self, BpfState};
use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::netlink::NetlinkConn;
use crate::packet::{PacketSocket, ProbeSink};
use crate::stats::{self, ClientProgress, StatsServer};
use crate::sysctl::ReachableTimeSource;
use crate::types::ReplyRecord;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const TOK_SIGNAL: u64 = 0;
const TOK_TIMER: u64 = 1;
const TOK_NETLINK: u64 = 2;
const TOK_RINGBUF: u64 = 3;
const TOK_STATS_SERVER: u64 = 4;
const TOK_STATS_CLIENT: u64 = 5;

/// Everything the daemon owns. Field order is teardown order: epoll first,
/// then stats, timerfd, BPF, netlink, signals, and finally the engine with
/// the cache and the packet socket.
pub struct Daemon {
    epoll: Epoll,
    stats: StatsServer,
    timerfd: TimerFd,
    bpf: BpfState,
    netlink: NetlinkConn,
    signals: SignalFd,
    engine: Engine,
}

fn add_interest(epoll: &Epoll, fd: RawFd, flags: EpollFlags, token: u64) -> Result<()> {
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    epoll.add(fd, EpollEvent::new(flags, token))?;
    Ok(())
}

impl Daemon {
    /// Acquire every resource, in the order the teardown mirrors.
    pub fn new(config: Config) -> Result<Self> {
        let packet = PacketSocket::open()?;

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.thread_block()?;
        let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;

        let netlink = NetlinkConn::new()?;
        let (bpf, target_networks) = bpf::load_and_attach(&config)?;

        let timerfd = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;

        let stats = StatsServer::bind()?;

        let engine = Engine::new(
            config,
            target_networks,
            ProbeSink::Packet(packet),
            ReachableTimeSource::Proc,
        );

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        add_interest(&epoll, signals.as_raw_fd(), EpollFlags::EPOLLIN, TOK_SIGNAL)?;
        add_interest(
            &epoll,
            timerfd.as_fd().as_raw_fd(),
            EpollFlags::EPOLLIN,
            TOK_TIMER,
        )?;
        add_interest(&epoll, netlink.as_raw_fd(), EpollFlags::EPOLLIN, TOK_NETLINK)?;
        add_interest(
            &epoll,
            bpf.ringbuf.as_raw_fd(),
            EpollFlags::EPOLLIN,
            TOK_RINGBUF,
        )?;
        add_interest(
            &epoll,
            stats.listener_fd(),
            EpollFlags::EPOLLIN,
            TOK_STATS_SERVER,
        )?;

        Ok(Daemon {
            epoll,
            stats,
            timerfd,
            bpf,
            netlink,
            signals,
            engine,
        })
    }

    /// Run until SIGINT/SIGTERM, a fatal error, or `--count` exhaustion.
    pub fn run(&mut self) -> Result<()> {
        self.netlink.start_dumps()?;
        info!("entering event loop");

        let mut events = [EpollEvent::empty(); 16];
        loop {
            let n = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Sys(e)),
            };

            // 1. signals end the loop
            for ev in &events[..n] {
                if ev.data() == TOK_SIGNAL && self.handle_signal()? {
                    info!("received termination signal, exiting");
                    return Ok(());
                }
            }

            // 2. timers may clear slots before later handlers look
            for ev in &events[..n] {
                if ev.data() == TOK_TIMER {
                    self.handle_timerfd()?;
                }
            }

            // 3. netlink, drained fully before replies are correlated
            for ev in &events[..n] {
                if ev.data() == TOK_NETLINK {
                    self.netlink.drain(&mut self.engine)?;
                }
            }

            // 4. classifier ring buffer
            for ev in &events[..n] {
                if ev.data() == TOK_RINGBUF {
                    self.drain_ringbuf();
                }
            }

            // 5. flush the outbound netlink queue
            for install in self.engine.take_installs() {
                match self.netlink.send_install(&install) {
                    Ok(()) => self.engine.note_install_sent(),
                    Err(e) => warn!(error = %e, ip = %install.ip, "neighbor install failed"),
                }
            }

            // 6. stats server accept
            for ev in &events[..n] {
                if ev.data() == TOK_STATS_SERVER {
                    self.handle_stats_accept()?;
                }
            }

            // 7. stats client writes
            for ev in &events[..n] {
                if ev.data() == TOK_STATS_CLIENT {
                    self.handle_stats_client()?;
                }
            }

            self.program_timerfd()?;

            if self.engine.replies_exhausted() {
                info!("reply count reached, exiting");
                return Ok(());
            }
        }
    }

    fn handle_signal(&mut self) -> Result<bool> {
        while let Some(siginfo) = self.signals.read_signal()? {
            let signo = siginfo.ssi_signo as i32;
            if signo == Signal::SIGINT as i32 || signo == Signal::SIGTERM as i32 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn handle_timerfd(&mut self) -> Result<()> {
        // Consume the expiration; the heap decides what actually fires.
        match self.timerfd.wait() {
            Ok(()) => {}
            Err(Errno::EAGAIN) => {}
            Err(e) => return Err(Error::Sys(e)),
        }
        self.engine.fire_due_timers(Instant::now());
        Ok(())
    }

    fn drain_ringbuf(&mut self) {
        while let Some(item) = self.bpf.ringbuf.next() {
            match ReplyRecord::from_bytes(&item) {
                Some(rec) => self.engine.handle_reply(&rec),
                None => warn!(len = item.len(), "short ring buffer record"),
            }
        }
    }

    fn handle_stats_accept(&mut self) -> Result<()> {
        let snapshot = stats::render_snapshot(&self.engine);
        if let Some(fd) = self.stats.accept(snapshot)? {
            debug!("stats client connected");
            add_interest(
                &self.epoll,
                fd,
                EpollFlags::EPOLLOUT | EpollFlags::EPOLLRDHUP,
                TOK_STATS_CLIENT,
            )?;
            // Often the whole snapshot fits into the socket buffer at once.
            self.handle_stats_client()?;
        }
        Ok(())
    }

    fn handle_stats_client(&mut self) -> Result<()> {
        let Some(fd) = self.stats.client_fd() else {
            return Ok(());
        };
        if self.stats.flush_client() == ClientProgress::Done {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            let _ = self.epoll.delete(borrowed);
            self.stats.close_client();
            debug!("stats client done");
        }
        Ok(())
    }

    /// Program the timerfd to the earliest heap deadline.
    fn program_timerfd(&mut self) -> Result<()> {
        match self.engine.next_timer_deadline() {
            Some(deadline) => {
                let delta = deadline
                    .saturating_duration_since(Instant::now())
                    // zero would disarm the timerfd entirely
                    .max(Duration::from_millis(1));
                self.timerfd.set(
                    Expiration::OneShot(TimeSpec::from_duration(delta)),
                    TimerSetTimeFlags::empty(),
                )?;
            }
            None => self.timerfd.unset()?,
        }
        Ok(())
    }
}
