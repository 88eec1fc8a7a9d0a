//! The IPv4-facing virtual interface.

use crate::error::{ClatError, Result};
use crate::privilege::Privileged;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use tracing::info;
use tun_rs::{DeviceBuilder, SyncDevice};

/// Interface primitives the configurator needs.
pub trait VirtualInterface {
    fn name(&self) -> &str;

    /// Assigns `addr/prefix_len`, optionally with a broadcast or peer address.
    fn add_address(&self, addr: Ipv4Addr, prefix_len: u8, broadcast: Option<Ipv4Addr>) -> io::Result<()>;

    /// Sets the MTU and marks the interface up.
    fn up(&self, mtu: u32) -> io::Result<()>;
}

/// A Linux TUN device that carries the `tun_pi` header on every frame.
pub struct TunDevice {
    name: String,
    dev: SyncDevice,
}

impl TunDevice {
    pub fn create(_privileged: &Privileged, name: &str) -> Result<Self> {
        let dev = DeviceBuilder::new()
            .name(name)
            .packet_information(true)
            .build_sync()
            .map_err(ClatError::interface("create tun"))?;
        let name = dev.name().unwrap_or_else(|_| name.to_string());
        info!("Created TUN device {}", name);
        Ok(Self { name, dev })
    }

    /// Duplicates the device descriptor for the relay loop and switches it to
    /// non-blocking mode.
    pub fn clone_fd(&self) -> Result<OwnedFd> {
        let fd = unsafe { BorrowedFd::borrow_raw(self.dev.as_raw_fd()) }
            .try_clone_to_owned()
            .map_err(ClatError::interface("dup tun"))?;
        set_nonblocking(&fd).map_err(ClatError::interface("tun O_NONBLOCK"))?;
        Ok(fd)
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl VirtualInterface for TunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_address(&self, addr: Ipv4Addr, prefix_len: u8, broadcast: Option<Ipv4Addr>) -> io::Result<()> {
        self.dev.set_network_address(addr, prefix_len, broadcast)
    }

    fn up(&self, mtu: u32) -> io::Result<()> {
        let mtu = u16::try_from(mtu).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.dev.set_mtu(mtu)?;
        self.dev.enabled(true)
    }
}
