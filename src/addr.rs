//! Synthetic address selection.
//!
//! The IPv4 side picks a free host in the configured subnet. The IPv6 side
//! keeps the uplink's /64 and appends an interface identifier that is stable
//! for a given prefix on a given host, so restarts reuse the same address.

use crate::error::{ClatError, Result};
use crate::netif::{ipv6_prefix_equal, InterfaceAddrs};
use ipnet::Ipv4Net;
use sha2::{Digest, Sha256};
use socket2::{Domain, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use tracing::{debug, error, info};

/// Decides whether an IPv4 address is unused on this host.
pub trait AddressProbe {
    fn is_free(&self, addr: Ipv4Addr) -> bool;
}

/// Probes by connecting a UDP socket to the address. If the kernel picks the
/// very same address as our source, it is already assigned locally.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalAddressProbe;

impl AddressProbe for LocalAddressProbe {
    fn is_free(&self, addr: Ipv4Addr) -> bool {
        let sock = match Socket::new(Domain::IPV4, Type::DGRAM, None) {
            Ok(s) => s,
            Err(e) => {
                debug!("probe socket for {} failed: {}", addr, e);
                return false;
            }
        };
        let target = SocketAddr::V4(SocketAddrV4::new(addr, 53));
        if sock.connect(&target.into()).is_err() {
            return true;
        }
        let in_use = sock
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket_ipv4())
            .map_or(false, |local| *local.ip() == addr);
        !in_use
    }
}

impl<F: Fn(Ipv4Addr) -> bool> AddressProbe for F {
    fn is_free(&self, addr: Ipv4Addr) -> bool {
        self(addr)
    }
}

/// Chooses the synthetic IPv4 address.
///
/// An explicit literal must parse; it is not probed. Otherwise hosts of
/// `subnet` are walked starting at its configured address, skipping the
/// network and broadcast addresses, and the first free one wins.
///
/// Another daemon selecting at the same moment may pick the same address
/// before either assigns it. That only leaves IPv4 TCP state stale until both
/// interfaces go down, so it is tolerated.
pub fn allocate_ipv4(explicit: Option<&str>, subnet: Ipv4Net, probe: &impl AddressProbe) -> Result<Ipv4Addr> {
    if let Some(literal) = explicit {
        return literal
            .parse::<Ipv4Addr>()
            .map_err(|_| ClatError::InvalidIpv4(literal.to_string()));
    }

    let network = u32::from(subnet.network());
    let broadcast = u32::from(subnet.broadcast());
    let host_mask = !u32::from(subnet.netmask());
    let first = u32::from(subnet.addr()) & host_mask;

    // One full lap over the host part, then give up.
    let size = u64::from(host_mask) + 1;
    for step in 0..size {
        let host = (u64::from(first) + step) as u32 & host_mask;
        let candidate = network | host;
        if subnet.prefix_len() < 31 && (candidate == network || candidate == broadcast) {
            continue;
        }
        let candidate = Ipv4Addr::from(candidate);
        if probe.is_free(candidate) {
            return Ok(candidate);
        }
    }
    Err(ClatError::SubnetExhausted(subnet))
}

/// Source of the 64-bit interface identifier appended to the uplink prefix.
///
/// The identifier is a SHA-256 of the prefix, the uplink name and a per-host
/// secret, so the same network yields the same address across restarts while
/// different hosts on one /64 diverge.
#[derive(Debug, Clone)]
pub struct StableIid {
    secret: Vec<u8>,
}

impl StableIid {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }

    /// Uses `/etc/machine-id`, falling back to the hostname.
    pub fn from_host() -> Self {
        if let Ok(id) = std::fs::read_to_string("/etc/machine-id") {
            let id = id.trim();
            if !id.is_empty() {
                return Self::new(id.as_bytes());
            }
        }
        let host = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        Self::new(host.into_bytes())
    }

    pub fn generate(&self, prefix: &[u8; 8], uplink: &str) -> [u8; 8] {
        let mut hasher = Sha256::new();
        hasher.update(prefix);
        hasher.update(uplink.as_bytes());
        hasher.update(&self.secret);
        let digest = hasher.finalize();

        let mut iid = [0u8; 8];
        iid.copy_from_slice(&digest[..8]);
        // All-zero is the subnet-router anycast address.
        if iid == [0u8; 8] {
            iid[7] = 1;
        }
        iid
    }
}

/// Parses an explicit IPv6 literal.
pub fn ipv6_from_cmdline(literal: &str) -> Result<Ipv6Addr> {
    literal
        .parse()
        .map_err(|_| ClatError::InvalidIpv6(literal.to_string()))
}

/// Derives the synthetic IPv6 address from the uplink's current global address.
pub fn derive_ipv6(uplink: &str, addrs: &impl InterfaceAddrs, iid: &StableIid) -> Result<Ipv6Addr> {
    // TODO: check that the uplink prefix length is /64 once netif reports prefix lengths.
    let current = addrs.global_ipv6(uplink).ok_or_else(|| {
        error!("Unable to find an IPv6 address on interface {}", uplink);
        ClatError::NoIpv6Address(uplink.to_string())
    })?;

    let mut octets = current.octets();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&octets[..8]);
    octets[8..].copy_from_slice(&iid.generate(&prefix, uplink));
    Ok(Ipv6Addr::from(octets))
}

/// Whether the uplink's /64 differs from the one `current` was derived from.
/// A missing address counts as changed.
pub fn prefix_changed(uplink: &str, current: &Ipv6Addr, addrs: &impl InterfaceAddrs) -> bool {
    match addrs.global_ipv6(uplink) {
        None => {
            error!("Unable to find an IPv6 address on interface {}", uplink);
            true
        }
        Some(now) if !ipv6_prefix_equal(&now, current) => {
            info!("IPv6 prefix on {} changed: {} -> {}", uplink, current, now);
            true
        }
        Some(_) => false,
    }
}
