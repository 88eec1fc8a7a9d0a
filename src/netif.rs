//! Interface address and MTU discovery.

use std::io;
use std::net::Ipv6Addr;
use tracing::debug;

/// Read-only view of the host's interfaces.
pub trait InterfaceAddrs {
    /// First global IPv6 address currently assigned to `iface`, if any.
    fn global_ipv6(&self, iface: &str) -> Option<Ipv6Addr>;

    /// Current MTU of `iface`.
    fn mtu(&self, iface: &str) -> io::Result<u32>;

    /// Kernel interface index of `iface`.
    fn index(&self, iface: &str) -> io::Result<u32>;
}

/// [`InterfaceAddrs`] backed by `getifaddrs(3)` and sysfs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceAddrs for SystemInterfaces {
    fn global_ipv6(&self, iface: &str) -> Option<Ipv6Addr> {
        let addrs = match nix::ifaddrs::getifaddrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!("getifaddrs failed: {}", e);
                return None;
            }
        };
        addrs
            .filter(|ifa| ifa.interface_name == iface)
            .filter_map(|ifa| ifa.address.and_then(|a| a.as_sockaddr_in6().map(|s| s.ip())))
            .find(|ip| is_global_unicast(ip))
    }

    fn mtu(&self, iface: &str) -> io::Result<u32> {
        let raw = std::fs::read_to_string(format!("/sys/class/net/{}/mtu", iface))?;
        raw.trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn index(&self, iface: &str) -> io::Result<u32> {
        nix::net::if_::if_nametoindex(iface).map_err(io::Error::from)
    }
}

/// Addresses usable as a translation source: not link-local, loopback,
/// multicast or unspecified.
pub fn is_global_unicast(ip: &Ipv6Addr) -> bool {
    let link_local = (ip.segments()[0] & 0xffc0) == 0xfe80;
    !(ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() || link_local)
}

/// Whether `a` and `b` share the same /64.
pub fn ipv6_prefix_equal(a: &Ipv6Addr, b: &Ipv6Addr) -> bool {
    a.octets()[..8] == b.octets()[..8]
}
