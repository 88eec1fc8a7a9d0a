//! clatd - 464XLAT customer-side translator.
//!
//! Moves IPv4 traffic from a local TUN device over an IPv6-only uplink by
//! translating headers against a PLAT prefix.

pub mod addr;
pub mod config;
pub mod configure;
pub mod constants;
pub mod error;
pub mod filter;
pub mod iface;
pub mod netif;
pub mod privilege;
pub mod relay;
pub mod ring;
pub mod signal;
pub mod translate;
pub mod tunhdr;
pub mod tunnel;

pub use config::ClatConfig;
pub use error::{ClatError, Result};
pub use relay::{LoopExit, RelayLoop};
pub use translate::Nat46;
