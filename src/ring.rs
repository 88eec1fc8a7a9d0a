//! Batched IPv6 ingress from the uplink packet socket.

use crate::constants::{BATCH_SIZE, ETH_P_IPV6};
use crate::error::{ClatError, Result};
use crate::privilege::Privileged;
use crate::translate::{ChecksumMode, Direction, Translator};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read};
use std::mem::MaybeUninit;
use std::os::fd::BorrowedFd;
use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};
use tokio::io::{Interest, Ready};
use tracing::{debug, warn};

/// AF_PACKET/SOCK_DGRAM socket delivering IPv6 packets without the link header.
pub struct PacketRing {
    sock: AsyncFd<Socket>,
}

impl PacketRing {
    /// Opens the packet socket. Until the filter is attached it queues IPv6
    /// packets from every interface; the translator drops those not addressed
    /// to the synthetic address.
    pub fn create(_privileged: &Privileged) -> Result<Self> {
        let protocol = Protocol::from(i32::from(ETH_P_IPV6.to_be()));
        let sock = Socket::new(Domain::PACKET, Type::DGRAM.nonblocking().cloexec(), Some(protocol))
            .map_err(ClatError::socket("packet socket"))?;
        Self::from_socket(sock).map_err(ClatError::socket("register packet socket"))
    }

    /// Wraps an already non-blocking socket.
    pub fn from_socket(sock: Socket) -> io::Result<Self> {
        let sock = AsyncFd::with_interest(sock, Interest::READABLE | Interest::ERROR)?;
        Ok(Self { sock })
    }

    pub fn socket(&self) -> &Socket {
        self.sock.get_ref()
    }

    pub async fn ready(&self) -> io::Result<AsyncFdReadyGuard<'_, Socket>> {
        self.sock.ready(Interest::READABLE | Interest::ERROR).await
    }

    /// Drains up to `BATCH_SIZE` packets, translating each one to IPv4 and
    /// writing it to `dest`. Returns the number of packets handed to the
    /// translator.
    pub fn read(
        guard: &mut AsyncFdReadyGuard<'_, Socket>,
        buf: &mut [u8],
        translator: &mut impl Translator,
        dest: BorrowedFd<'_>,
    ) -> usize {
        let mut count = 0;
        for _ in 0..BATCH_SIZE {
            let res = guard.try_io(|inner| {
                let mut sock = inner.get_ref();
                sock.read(buf)
            });
            match res {
                Ok(Ok(0)) => continue,
                Ok(Ok(n)) => {
                    translator.translate(dest, Direction::ToIpv4, &buf[..n], ChecksumMode::Recompute);
                    count += 1;
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => {
                    debug!("packet socket read: {}", e);
                    break;
                }
                // WouldBlock; readiness already cleared.
                Err(_) => break,
            }
        }
        count
    }

    /// Clears a pending socket error so the next wait does not report it again.
    pub fn clear_error(guard: &mut AsyncFdReadyGuard<'_, Socket>) {
        let sock = guard.get_inner();
        match sock.take_error() {
            Ok(Some(e)) => warn!("clearing error on packet socket: {}", e),
            Ok(None) => {}
            Err(e) => warn!("SO_ERROR on packet socket: {}", e),
        }
        let mut empty: [MaybeUninit<u8>; 0] = [];
        if let Err(e) = sock.peek(&mut empty) {
            if e.kind() != io::ErrorKind::WouldBlock {
                debug!("peek on packet socket: {}", e);
            }
        }
        guard.clear_ready_matching(Ready::ERROR);
    }
}
