//! Dropping root while keeping the capabilities the relay needs.
//!
//! The process starts with a [`Privileged`] marker. Everything that needs
//! full root (creating the TUN device, raw and packet sockets) borrows it.
//! [`Privileged::drop_privileges`] consumes the marker, and the marker can
//! only be claimed once, so after the drop no privileged constructor can be
//! called again. Configuration requires the [`Unprivileged`] marker instead.

use crate::constants::{AID_CLAT, AID_INET, AID_VPN};
use crate::error::{ClatError, Result};
use nix::errno::Errno;
use nix::unistd::{setgroups, setresgid, setresuid, Gid, Uid};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

static CLAIMED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Capability {
    NetAdmin = 12,
    NetRaw = 13,
    IpcLock = 14,
}

/// Capabilities kept after the drop: raw sockets, interface/anycast
/// configuration and locking the packet ring in memory.
pub const RETAINED_CAPABILITIES: [Capability; 3] =
    [Capability::NetAdmin, Capability::NetRaw, Capability::IpcLock];

/// Identity the daemon runs as after dropping root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Identity {
    pub fn clat() -> Self {
        Self {
            uid: AID_CLAT,
            gid: AID_CLAT,
            groups: vec![AID_INET, AID_VPN],
        }
    }
}

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapUserData {
    pub effective: u32,
    pub permitted: u32,
    pub inheritable: u32,
}

pub fn capability_mask(caps: &[Capability]) -> u64 {
    caps.iter().fold(0u64, |mask, cap| mask | (1u64 << *cap as u32))
}

/// Splits a mask into the two 32-bit words of the v3 capset ABI, with
/// permitted = effective = inheritable.
pub fn cap_data(mask: u64) -> [CapUserData; 2] {
    let lo = mask as u32;
    let hi = (mask >> 32) as u32;
    [
        CapUserData { effective: lo, permitted: lo, inheritable: lo },
        CapUserData { effective: hi, permitted: hi, inheritable: hi },
    ]
}

fn set_capability(mask: u64) -> Result<()> {
    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = cap_data(mask);
    let ret = unsafe { libc::syscall(libc::SYS_capset, &header as *const CapUserHeader, data.as_ptr()) };
    if ret < 0 {
        return Err(ClatError::Privilege {
            op: "capset",
            source: Errno::last(),
        });
    }
    Ok(())
}

/// Marker for the phase in which the process still holds full root.
#[derive(Debug)]
pub struct Privileged {
    _private: (),
}

/// Marker for the phase after the drop. There is no way back.
#[derive(Debug)]
pub struct Unprivileged {
    _private: (),
}

impl Privileged {
    /// Claims the privileged phase. Only the first call in a process
    /// succeeds.
    pub fn assume() -> Result<Self> {
        if CLAIMED.swap(true, Ordering::SeqCst) {
            return Err(ClatError::Privilege {
                op: "assume",
                source: Errno::EALREADY,
            });
        }
        Ok(Self { _private: () })
    }

    /// Switches to `identity`, keeping only [`RETAINED_CAPABILITIES`].
    /// Any failure leaves the process in an unknown state and must be fatal.
    pub fn drop_privileges(self, identity: &Identity) -> Result<Unprivileged> {
        let groups: Vec<Gid> = identity.groups.iter().map(|g| Gid::from_raw(*g)).collect();
        setgroups(&groups).map_err(|source| ClatError::Privilege { op: "setgroups", source })?;

        nix::sys::prctl::set_keepcaps(true)
            .map_err(|source| ClatError::Privilege { op: "prctl(PR_SET_KEEPCAPS)", source })?;

        let gid = Gid::from_raw(identity.gid);
        setresgid(gid, gid, gid).map_err(|source| ClatError::Privilege { op: "setresgid", source })?;
        let uid = Uid::from_raw(identity.uid);
        setresuid(uid, uid, uid).map_err(|source| ClatError::Privilege { op: "setresuid", source })?;

        set_capability(capability_mask(&RETAINED_CAPABILITIES))?;

        info!("Running as uid {} gid {}", identity.uid, identity.gid);
        Ok(Unprivileged { _private: () })
    }
}

#[cfg(test)]
impl Unprivileged {
    pub(crate) fn for_tests() -> Self {
        Self { _private: () }
    }
}
