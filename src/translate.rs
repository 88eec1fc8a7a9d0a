//! Header translation between IPv4 and IPv6.
//!
//! The relay loop hands each packet to a [`Translator`] together with the
//! descriptor the result must be written to. [`Nat46`] is the stateless
//! translator used by the daemon: remote IPv4 addresses live inside the PLAT
//! /96, and the local side maps the synthetic IPv4 address to the synthetic
//! IPv6 address.

use crate::config::ClatConfig;
use crate::constants::ETH_P_IP;
use crate::tunhdr::prepend_tun_pi;
use bytes::BytesMut;
use ipnet::Ipv6Net;
use smoltcp::wire::{
    Icmpv4Message, Icmpv4Packet, Icmpv6Message, Icmpv6Packet, IpAddress, IpProtocol, Ipv4Address,
    Ipv4Packet, Ipv6Address, Ipv6Packet, TcpPacket, UdpPacket,
};
use socket2::{SockAddr, SockRef};
use std::fs::File;
use std::io::{self, Write};
use std::mem::ManuallyDrop;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd};
use tracing::{debug, warn};

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// IPv6 from the uplink towards the TUN device.
    ToIpv4,
    /// IPv4 from the TUN device towards the uplink.
    ToIpv6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    /// Transport checksums are recomputed for the new pseudo-header.
    Recompute,
    /// Transport payload is left untouched.
    Preserve,
}

/// The per-packet translation function. It must consume or drop the packet
/// and never block.
pub trait Translator {
    fn translate(&mut self, out: BorrowedFd<'_>, direction: Direction, packet: &[u8], checksum: ChecksumMode);
}

/// Why a packet was not translated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    Fragment,
    NotForUs,
    OutsidePlat,
    Unsupported(IpProtocol),
}

/// Stateless IPv4/IPv6 header translator.
#[derive(Debug, Clone)]
pub struct Nat46 {
    local4: Ipv4Addr,
    local6: Ipv6Addr,
    plat: Ipv6Net,
}

impl Nat46 {
    pub fn new(local4: Ipv4Addr, local6: Ipv6Addr, plat: Ipv6Net) -> Self {
        Self { local4, local6, plat }
    }

    pub fn from_config(config: &ClatConfig) -> Self {
        Self::new(config.ipv4_local, config.ipv6_local, config.plat_subnet)
    }

    /// Picks up a new synthetic IPv6 address after reconfiguration.
    pub fn set_local6(&mut self, local6: Ipv6Addr) {
        self.local6 = local6;
    }

    fn embed(&self, v4: Ipv4Addr) -> Ipv6Addr {
        let mut octets = self.plat.network().octets();
        octets[12..].copy_from_slice(&v4.octets());
        Ipv6Addr::from(octets)
    }

    fn extract(&self, v6: Ipv6Addr) -> Option<Ipv4Addr> {
        if !self.plat.contains(&v6) {
            return None;
        }
        let o = v6.octets();
        Some(Ipv4Addr::new(o[12], o[13], o[14], o[15]))
    }

    /// Translates an IPv4 packet from the TUN device into an IPv6 packet.
    pub fn ipv4_to_ipv6(&self, packet: &[u8], checksum: ChecksumMode) -> Result<(BytesMut, Ipv6Addr), DropReason> {
        let ip = Ipv4Packet::new_checked(packet).map_err(|_| DropReason::Malformed)?;
        if ip.more_frags() || ip.frag_offset() != 0 {
            return Err(DropReason::Fragment);
        }
        let src: Ipv4Addr = ip.src_addr().into();
        if src != self.local4 {
            return Err(DropReason::NotForUs);
        }
        let src6 = self.local6;
        let dst6 = self.embed(ip.dst_addr().into());

        let next_header = match ip.next_header() {
            IpProtocol::Icmp => IpProtocol::Icmpv6,
            p @ (IpProtocol::Tcp | IpProtocol::Udp) => p,
            other => return Err(DropReason::Unsupported(other)),
        };

        let payload = ip.payload();
        let mut buf = BytesMut::zeroed(IPV6_HEADER_LEN + payload.len());
        {
            let mut out = Ipv6Packet::new_unchecked(&mut buf[..]);
            out.set_version(6);
            out.set_traffic_class((ip.dscp() << 2) | ip.ecn());
            out.set_flow_label(0);
            out.set_payload_len(payload.len() as u16);
            out.set_next_header(next_header);
            out.set_hop_limit(ip.hop_limit());
            out.set_src_addr(Ipv6Address::from(src6));
            out.set_dst_addr(Ipv6Address::from(dst6));
            out.payload_mut().copy_from_slice(payload);
        }

        let src = IpAddress::Ipv6(Ipv6Address::from(src6));
        let dst = IpAddress::Ipv6(Ipv6Address::from(dst6));
        let l4 = &mut buf[IPV6_HEADER_LEN..];
        match next_header {
            IpProtocol::Icmpv6 => translate_icmp_to_icmpv6(l4, &src, &dst)?,
            IpProtocol::Udp => fix_udp(l4, &src, &dst, checksum)?,
            _ => fix_tcp(l4, &src, &dst, checksum)?,
        }
        Ok((buf, dst6))
    }

    /// Translates an IPv6 packet from the uplink into an IPv4 packet.
    pub fn ipv6_to_ipv4(&self, packet: &[u8], checksum: ChecksumMode) -> Result<BytesMut, DropReason> {
        let ip = Ipv6Packet::new_checked(packet).map_err(|_| DropReason::Malformed)?;
        let dst6: Ipv6Addr = ip.dst_addr().into();
        if dst6 != self.local6 {
            return Err(DropReason::NotForUs);
        }
        let src4 = self.extract(ip.src_addr().into()).ok_or(DropReason::OutsidePlat)?;

        let next_header = match ip.next_header() {
            IpProtocol::Icmpv6 => IpProtocol::Icmp,
            p @ (IpProtocol::Tcp | IpProtocol::Udp) => p,
            IpProtocol::Ipv6Frag => return Err(DropReason::Fragment),
            other => return Err(DropReason::Unsupported(other)),
        };

        let payload = ip.payload();
        let total_len = IPV4_HEADER_LEN + payload.len();
        if total_len > usize::from(u16::MAX) {
            return Err(DropReason::Malformed);
        }
        let mut buf = BytesMut::zeroed(total_len);
        {
            let mut out = Ipv4Packet::new_unchecked(&mut buf[..]);
            out.set_version(4);
            out.set_header_len(IPV4_HEADER_LEN as u8);
            out.set_dscp(ip.traffic_class() >> 2);
            out.set_ecn(ip.traffic_class() & 0x03);
            out.set_total_len(total_len as u16);
            out.set_ident(0);
            out.clear_flags();
            out.set_dont_frag(true);
            out.set_frag_offset(0);
            out.set_hop_limit(ip.hop_limit());
            out.set_next_header(next_header);
            out.set_src_addr(Ipv4Address::from(src4));
            out.set_dst_addr(Ipv4Address::from(self.local4));
            out.payload_mut().copy_from_slice(payload);
            out.fill_checksum();
        }

        let src = IpAddress::Ipv4(Ipv4Address::from(src4));
        let dst = IpAddress::Ipv4(Ipv4Address::from(self.local4));
        let l4 = &mut buf[IPV4_HEADER_LEN..];
        match next_header {
            IpProtocol::Icmp => translate_icmpv6_to_icmp(l4)?,
            IpProtocol::Udp => fix_udp(l4, &src, &dst, checksum)?,
            _ => fix_tcp(l4, &src, &dst, checksum)?,
        }
        Ok(buf)
    }
}

fn fix_tcp(l4: &mut [u8], src: &IpAddress, dst: &IpAddress, checksum: ChecksumMode) -> Result<(), DropReason> {
    let mut tcp = TcpPacket::new_checked(l4).map_err(|_| DropReason::Malformed)?;
    if checksum == ChecksumMode::Recompute {
        tcp.fill_checksum(src, dst);
    }
    Ok(())
}

fn fix_udp(l4: &mut [u8], src: &IpAddress, dst: &IpAddress, checksum: ChecksumMode) -> Result<(), DropReason> {
    let mut udp = UdpPacket::new_checked(l4).map_err(|_| DropReason::Malformed)?;
    // A zero IPv4 UDP checksum is not allowed over IPv6, so it is always filled.
    if checksum == ChecksumMode::Recompute || udp.checksum() == 0 {
        udp.fill_checksum(src, dst);
    }
    Ok(())
}

fn translate_icmp_to_icmpv6(l4: &mut [u8], src: &IpAddress, dst: &IpAddress) -> Result<(), DropReason> {
    let msg_type = Icmpv4Packet::new_checked(&*l4).map_err(|_| DropReason::Malformed)?.msg_type();
    let new_type = match msg_type {
        Icmpv4Message::EchoRequest => Icmpv6Message::EchoRequest,
        Icmpv4Message::EchoReply => Icmpv6Message::EchoReply,
        _ => return Err(DropReason::Unsupported(IpProtocol::Icmp)),
    };
    let mut icmp = Icmpv6Packet::new_checked(l4).map_err(|_| DropReason::Malformed)?;
    icmp.set_msg_type(new_type);
    icmp.set_msg_code(0);
    icmp.fill_checksum(src, dst);
    Ok(())
}

fn translate_icmpv6_to_icmp(l4: &mut [u8]) -> Result<(), DropReason> {
    let msg_type = Icmpv6Packet::new_checked(&*l4).map_err(|_| DropReason::Malformed)?.msg_type();
    let new_type = match msg_type {
        Icmpv6Message::EchoRequest => Icmpv4Message::EchoRequest,
        Icmpv6Message::EchoReply => Icmpv4Message::EchoReply,
        _ => return Err(DropReason::Unsupported(IpProtocol::Icmpv6)),
    };
    let mut icmp = Icmpv4Packet::new_checked(l4).map_err(|_| DropReason::Malformed)?;
    icmp.set_msg_type(new_type);
    icmp.set_msg_code(0);
    icmp.fill_checksum();
    Ok(())
}

/// Writes a whole frame to a non-socket descriptor such as the TUN device.
pub fn write_frame(out: BorrowedFd<'_>, frame: &[u8]) -> io::Result<usize> {
    // The descriptor stays owned by the caller.
    let file = ManuallyDrop::new(unsafe { File::from_raw_fd(out.as_raw_fd()) });
    (&*file).write(frame)
}

impl Translator for Nat46 {
    fn translate(&mut self, out: BorrowedFd<'_>, direction: Direction, packet: &[u8], checksum: ChecksumMode) {
        match direction {
            Direction::ToIpv6 => match self.ipv4_to_ipv6(packet, checksum) {
                Ok((pkt, dst)) => {
                    let dst = SockAddr::from(SocketAddrV6::new(dst, 0, 0, 0));
                    if let Err(e) = SockRef::from(&out).send_to(&pkt, &dst) {
                        if e.kind() != io::ErrorKind::WouldBlock {
                            warn!("sendto failed: {}", e);
                        }
                    }
                }
                Err(reason) => debug!("Dropping IPv4 packet: {:?}", reason),
            },
            Direction::ToIpv4 => match self.ipv6_to_ipv4(packet, checksum) {
                Ok(pkt) => {
                    let frame = prepend_tun_pi(ETH_P_IP, &pkt);
                    if let Err(e) = write_frame(out, &frame) {
                        if e.kind() != io::ErrorKind::WouldBlock {
                            warn!("write to tun failed: {}", e);
                        }
                    }
                }
                Err(reason) => debug!("Dropping IPv6 packet: {:?}", reason),
            },
        }
    }
}
