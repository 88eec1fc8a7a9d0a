//! Kernel-side classifier for the IPv6 packet socket.
//!
//! The packet socket sees every IPv6 packet on the uplink, including ones the
//! kernel itself will deliver. A classic BPF program attached with
//! `SO_ATTACH_FILTER` drops everything not addressed to our synthetic IPv6
//! address before it is copied to user space.

use crate::constants::{ETH_P_IPV6, PACKETLEN};
use crate::error::{ClatError, Result};
use socket2::Socket;
use std::io;
use std::net::Ipv6Addr;
use std::os::fd::AsRawFd;
use tracing::error;

/// A single classic BPF instruction, laid out like the kernel `struct sock_filter`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BpfInsn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

const _: () = assert!(std::mem::size_of::<BpfInsn>() == std::mem::size_of::<libc::sock_filter>());

pub const BPF_LD: u16 = 0x00;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;
pub const BPF_W: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_K: u16 = 0x00;

/// Offset of the destination address in the IPv6 header.
pub const IPV6_DST_OFFSET: u32 = 24;

pub const FILTER_LEN: usize = 10;

fn stmt(code: u16, k: u32) -> BpfInsn {
    BpfInsn { code, jt: 0, jf: 0, k }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> BpfInsn {
    BpfInsn { code, jt, jf, k }
}

/// Builds the program accepting only packets whose IPv6 destination is `addr`.
///
/// ```text
///   [0] ld  [24]          ; dst word 0
///   [1] jeq #w0  0, 7     ; mismatch -> [9]
///   [2] ld  [28]
///   [3] jeq #w1  0, 5
///   [4] ld  [32]
///   [5] jeq #w2  0, 3
///   [6] ld  [36]
///   [7] jeq #w3  0, 1
///   [8] ret #PACKETLEN    ; accept
///   [9] ret #0            ; reject
/// ```
///
/// BPF word loads are big-endian, so each constant is the big-endian
/// value of four address bytes.
pub fn ipv6_destination_filter(addr: Ipv6Addr) -> [BpfInsn; FILTER_LEN] {
    let o = addr.octets();
    let word = |i: usize| u32::from_be_bytes([o[4 * i], o[4 * i + 1], o[4 * i + 2], o[4 * i + 3]]);

    let mut prog = [stmt(BPF_RET | BPF_K, 0); FILTER_LEN];
    for i in 0..4 {
        // Distance from the jump to the reject at [9].
        let reject = (7 - 2 * i) as u8;
        prog[2 * i] = stmt(BPF_LD | BPF_W | BPF_ABS, IPV6_DST_OFFSET + 4 * i as u32);
        prog[2 * i + 1] = jump(BPF_JMP | BPF_JEQ | BPF_K, word(i), 0, reject);
    }
    prog[8] = stmt(BPF_RET | BPF_K, PACKETLEN as u32);
    prog[9] = stmt(BPF_RET | BPF_K, 0);
    prog
}

/// Attaches `program` to `sock`, replacing any earlier filter.
pub fn attach_filter(sock: &Socket, program: &[BpfInsn]) -> io::Result<()> {
    let fprog = libc::sock_fprog {
        len: program.len() as libc::c_ushort,
        filter: program.as_ptr() as *mut libc::sock_filter,
    };
    let ret = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            &fprog as *const libc::sock_fprog as *const libc::c_void,
            std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Binds the packet socket to `ifindex` for IPv6, accepting frames for other
/// hosts too: the synthetic address is not assigned to the kernel's own stack.
pub fn bind_packet_socket(sock: &Socket, ifindex: u32) -> io::Result<()> {
    let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as libc::c_ushort;
    sll.sll_protocol = ETH_P_IPV6.to_be();
    sll.sll_ifindex = ifindex as libc::c_int;
    sll.sll_pkttype = libc::PACKET_OTHERHOST as libc::c_uchar;

    let ret = unsafe {
        libc::bind(
            sock.as_raw_fd(),
            &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Points the packet socket at `local` on the uplink with index `ifindex`.
///
/// Both failures are reported as recoverable errors; boot treats them as fatal.
pub fn install_ipv6_filter(sock: &Socket, local: Ipv6Addr, ifindex: io::Result<u32>) -> Result<()> {
    let program = ipv6_destination_filter(local);
    attach_filter(sock, &program).map_err(|e| {
        error!("attach packet filter failed: {}", e);
        ClatError::FilterAttach(e)
    })?;

    let ifindex = ifindex.map_err(|e| {
        error!("binding packet socket: {}", e);
        ClatError::FilterBind(e)
    })?;
    bind_packet_socket(sock, ifindex).map_err(|e| {
        error!("binding packet socket: {}", e);
        ClatError::FilterBind(e)
    })
}
