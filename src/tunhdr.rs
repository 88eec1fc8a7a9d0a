//! Linux TUN packet information header.
//!
//! The TUN device is opened without `IFF_NO_PI`, so every frame read from or
//! written to it starts with the 4-byte `struct tun_pi`: a `flags` word in
//! host byte order followed by the ethertype in network byte order.

use crate::constants::TUN_PI_SIZE;
use bytes::{BufMut, BytesMut};

/// Set by the kernel when the frame was truncated to fit the read buffer.
pub const TUN_PKT_STRIP: u16 = 0x0001;

/// Parsed `struct tun_pi`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TunPi {
    pub flags: u16,
    pub proto: u16,
}

impl TunPi {
    pub fn new(proto: u16) -> Self {
        Self { flags: 0, proto }
    }

    /// Parse a tun_pi header from the start of a frame.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < TUN_PI_SIZE {
            return None;
        }
        Some(Self {
            flags: u16::from_ne_bytes([buf[0], buf[1]]),
            proto: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }

    /// Serialize this header into the front of a buffer.
    pub fn write_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= TUN_PI_SIZE);
        buf[0..2].copy_from_slice(&self.flags.to_ne_bytes());
        buf[2..4].copy_from_slice(&self.proto.to_be_bytes());
    }
}

/// Returns the packet that follows the tun_pi header.
///
/// # Panics
/// Panics if the frame is shorter than the header.
pub fn strip_tun_pi(frame: &[u8]) -> &[u8] {
    &frame[TUN_PI_SIZE..]
}

/// Builds a TUN frame: tun_pi for `proto` followed by `packet`.
pub fn prepend_tun_pi(proto: u16, packet: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(TUN_PI_SIZE + packet.len());
    buf.put_u16_ne(0);
    buf.put_u16(proto);
    buf.put_slice(packet);
    buf
}
