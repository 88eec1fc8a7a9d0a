//! Descriptors of a running translation session.

use crate::constants::MARK_UNSET;
use crate::error::{ClatError, Result};
use crate::privilege::Privileged;
use crate::ring::PacketRing;
use socket2::{Domain, Protocol, Socket, Type};
use std::fs::File;
use std::io;
use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::{debug, error};

// <linux/in6.h>
const IPV6_CHECKSUM: libc::c_int = 7;
const IPV6_JOIN_ANYCAST: libc::c_int = 27;
const IPV6_LEAVE_ANYCAST: libc::c_int = 28;

pub struct TunnelSession {
    /// Name of the IPv4-facing TUN device.
    pub device4: String,
    /// IPv4 ingress and egress.
    pub tun: AsyncFd<File>,
    /// IPv6 ingress.
    pub ring: PacketRing,
    /// IPv6 egress.
    pub raw6: Socket,
}

impl TunnelSession {
    /// Opens the uplink sockets and registers the TUN descriptor. Must run
    /// inside the runtime.
    pub fn open(privileged: &Privileged, device4: &str, tun: OwnedFd, mark: u32) -> Result<Self> {
        let raw6 = open_raw6(privileged, mark)?;
        let ring = PacketRing::create(privileged)?;
        Self::from_parts(device4, tun, ring, raw6)
    }

    pub fn from_parts(device4: &str, tun: OwnedFd, ring: PacketRing, raw6: Socket) -> Result<Self> {
        let tun = AsyncFd::with_interest(File::from(tun), Interest::READABLE | Interest::ERROR)
            .map_err(ClatError::socket("register tun"))?;
        Ok(Self {
            device4: device4.to_string(),
            tun,
            ring,
            raw6,
        })
    }

    /// Lets the uplink answer neighbor solicitations for `addr`.
    /// Failure is logged and otherwise ignored.
    pub fn join_anycast(&self, addr: Ipv6Addr, ifindex: u32) {
        if let Err(e) = anycast(&self.raw6, IPV6_JOIN_ANYCAST, addr, ifindex) {
            error!("adding anycast address {}: {}", addr, e);
        }
    }

    pub fn leave_anycast(&self, addr: Ipv6Addr, ifindex: u32) {
        if let Err(e) = anycast(&self.raw6, IPV6_LEAVE_ANYCAST, addr, ifindex) {
            debug!("removing anycast address {}: {}", addr, e);
        }
    }
}

/// Raw IPv6 egress socket. Packets carry complete headers and their
/// checksums are already final.
fn open_raw6(_privileged: &Privileged, mark: u32) -> Result<Socket> {
    let sock = Socket::new(
        Domain::IPV6,
        Type::RAW.nonblocking().cloexec(),
        Some(Protocol::from(libc::IPPROTO_RAW)),
    )
    .map_err(ClatError::socket("raw socket"))?;

    disable_checksum(&sock).map_err(ClatError::socket("disable raw socket checksum"))?;

    if mark != MARK_UNSET {
        sock.set_mark(mark).map_err(ClatError::socket("set mark on raw socket"))?;
    }
    Ok(sock)
}

fn disable_checksum(sock: &Socket) -> io::Result<()> {
    let off: libc::c_int = -1;
    let ret = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_IPV6,
            IPV6_CHECKSUM,
            &off as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn anycast(sock: &Socket, op: libc::c_int, addr: Ipv6Addr, ifindex: u32) -> io::Result<()> {
    let mreq = libc::ipv6_mreq {
        ipv6mr_multiaddr: libc::in6_addr { s6_addr: addr.octets() },
        ipv6mr_interface: ifindex as libc::c_uint,
    };
    let ret = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_IPV6,
            op,
            &mreq as *const libc::ipv6_mreq as *const libc::c_void,
            std::mem::size_of::<libc::ipv6_mreq>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::{SocketAddr, UdpSocket};
    use std::os::unix::net::UnixDatagram;

    /// A session over socketpairs. Returns the peers of the TUN, the packet
    /// socket and the raw socket.
    pub(crate) fn session_pair() -> (TunnelSession, UnixDatagram, UnixDatagram, UnixDatagram) {
        let (tun, tun_peer) = UnixDatagram::pair().unwrap();
        tun.set_nonblocking(true).unwrap();
        let (session, ring_peer, raw_peer) = session_with_tun(OwnedFd::from(tun));
        (session, tun_peer, ring_peer, raw_peer)
    }

    /// A session around a caller-supplied non-blocking TUN descriptor.
    pub(crate) fn session_with_tun(tun: OwnedFd) -> (TunnelSession, UnixDatagram, UnixDatagram) {
        let (ring, ring_peer) = UnixDatagram::pair().unwrap();
        let (raw, raw_peer) = UnixDatagram::pair().unwrap();
        for s in [&ring, &raw] {
            s.set_nonblocking(true).unwrap();
        }
        let ring = PacketRing::from_socket(Socket::from(OwnedFd::from(ring))).unwrap();
        let session = TunnelSession::from_parts("v4-test0", tun, ring, Socket::from(OwnedFd::from(raw))).unwrap();
        (session, ring_peer, raw_peer)
    }

    /// A non-blocking UDP socket connected to a loopback port nobody listens
    /// on, after one send. Returns the socket and the closed address.
    pub(crate) fn refused_udp() -> (UdpSocket, SocketAddr) {
        let closed = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.connect(closed).unwrap();
        sock.set_nonblocking(true).unwrap();
        sock.send(&[0]).unwrap();
        (sock, closed)
    }

    #[tokio::test]
    async fn test_from_parts_registers_tun() {
        let (session, tun_peer, _ring_peer, _raw_peer) = session_pair();
        assert_eq!(session.device4, "v4-test0");
        tun_peer.send(&[0, 0, 0x08, 0x00]).unwrap();
        let guard = session.tun.readable().await.unwrap();
        assert!(guard.ready().is_readable());
    }

    #[tokio::test]
    async fn test_anycast_failure_is_not_fatal() {
        let (session, _a, _b, _c) = session_pair();
        // A UNIX socket has no IPv6 options; both calls just log.
        session.join_anycast("2001:db8::1".parse().unwrap(), 1);
        session.leave_anycast("2001:db8::1".parse().unwrap(), 1);
        assert!(anycast(&session.raw6, IPV6_JOIN_ANYCAST, "2001:db8::1".parse().unwrap(), 1).is_err());
    }
}
