//! The packet relay loop.

use crate::addr::prefix_changed;
use crate::config::ClatConfig;
use crate::constants::{ETH_P_IP, PACKETLEN};
use crate::error::Result;
use crate::netif::InterfaceAddrs;
use crate::ring::PacketRing;
use crate::signal::RunningFlag;
use crate::translate::{ChecksumMode, Direction, Translator};
use crate::tunhdr::{strip_tun_pi, TunPi};
use crate::tunnel::TunnelSession;
use std::fs::File;
use std::io::{self, Read};
use std::net::Ipv6Addr;
use std::os::fd::AsFd;
use std::time::Duration;
use tokio::io::unix::AsyncFdReadyGuard;
use tokio::io::Interest;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

/// Why [`RelayLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The running flag was cleared.
    Stopped,
    /// The TUN device went away.
    InterfaceRemoved,
    /// The uplink moved to a different /64.
    PrefixChanged,
}

pub struct RelayLoop<'a, T, A> {
    session: &'a TunnelSession,
    translator: &'a mut T,
    addrs: &'a A,
    running: RunningFlag,
    uplink: String,
    ipv6_local: Ipv6Addr,
    interface_poll: Duration,
    idle_poll: Duration,
    last_interface_poll: Instant,
}

impl<'a, T, A> RelayLoop<'a, T, A>
where
    T: Translator,
    A: InterfaceAddrs,
{
    pub fn new(
        session: &'a TunnelSession,
        config: &ClatConfig,
        translator: &'a mut T,
        addrs: &'a A,
        running: RunningFlag,
    ) -> Self {
        Self {
            session,
            translator,
            addrs,
            running,
            uplink: config.uplink.clone(),
            ipv6_local: config.ipv6_local,
            interface_poll: config.interface_poll,
            idle_poll: config.idle_poll,
            last_interface_poll: Instant::now(),
        }
    }

    /// Relays packets in both directions until stopped, the TUN device is
    /// removed, or the uplink prefix changes.
    pub async fn run(&mut self) -> Result<LoopExit> {
        let mut buf = vec![0u8; PACKETLEN];
        let session = self.session;
        self.last_interface_poll = Instant::now();

        info!("Relaying between {} and {}", session.device4, self.uplink);

        while self.running.is_running() {
            tokio::select! {
                res = session.ring.ready() => {
                    let mut guard = res?;
                    let ready = guard.ready();
                    if ready.is_readable() {
                        let n = PacketRing::read(&mut guard, &mut buf, &mut *self.translator, session.tun.get_ref().as_fd());
                        debug!("Read {} packets from uplink", n);
                    }
                    if ready.is_error() {
                        PacketRing::clear_error(&mut guard);
                    }
                }
                res = session.tun.ready(Interest::READABLE | Interest::ERROR) => {
                    let mut guard = res?;
                    if let Some(exit) = self.read_tun(&mut guard, &mut buf) {
                        return Ok(exit);
                    }
                }
                _ = self.running.stopped() => {}
                _ = time::sleep(self.idle_poll) => {}
            }

            if self.last_interface_poll.elapsed() >= self.interface_poll {
                self.last_interface_poll = Instant::now();
                if prefix_changed(&self.uplink, &self.ipv6_local, self.addrs) {
                    return Ok(LoopExit::PrefixChanged);
                }
            }
        }
        Ok(LoopExit::Stopped)
    }

    /// Reads exactly one frame from the TUN device.
    fn read_tun(&mut self, guard: &mut AsyncFdReadyGuard<'_, File>, buf: &mut [u8]) -> Option<LoopExit> {
        let res = guard.try_io(|inner| {
            let mut tun = inner.get_ref();
            tun.read(buf)
        });
        match res {
            Ok(Ok(0)) => {
                warn!("tun interface removed");
                self.running.stop();
                Some(LoopExit::InterfaceRemoved)
            }
            Ok(Ok(n)) => {
                self.handle_tun_frame(&buf[..n]);
                None
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => None,
            Ok(Err(e)) => {
                warn!("read error on tun: {}", e);
                guard.clear_ready();
                None
            }
            Err(_would_block) => None,
        }
    }

    fn handle_tun_frame(&mut self, frame: &[u8]) {
        let Some(pi) = TunPi::parse(frame) else {
            warn!("short read: got {} bytes", frame.len());
            return;
        };
        if pi.proto != ETH_P_IP {
            warn!("unknown packet type = {:#x}", pi.proto);
            return;
        }
        if pi.flags != 0 {
            warn!("unexpected flags = {}", pi.flags);
        }
        self.translator.translate(
            self.session.raw6.as_fd(),
            Direction::ToIpv6,
            strip_tun_pi(frame),
            ChecksumMode::Recompute,
        );
    }
}
