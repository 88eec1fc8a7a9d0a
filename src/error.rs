use ipnet::Ipv4Net;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClatError {
    #[error("invalid IPv4 address {0}")]
    InvalidIpv4(String),

    #[error("invalid source address {0}")]
    InvalidIpv6(String),

    #[error("no free IPv4 address in {0}")]
    SubnetExhausted(Ipv4Net),

    #[error("unable to find an IPv6 address on interface {0}")]
    NoIpv6Address(String),

    #[error("read_config failed: {0}")]
    Config(String),

    #[error("{op} failed: {source}")]
    Interface {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} failed: {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("attach packet filter failed: {0}")]
    FilterAttach(#[source] std::io::Error),

    #[error("binding packet socket: {0}")]
    FilterBind(#[source] std::io::Error),

    #[error("{op} failed: {source}")]
    Privilege {
        op: &'static str,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(#[from] nix::errno::Errno),
}

impl ClatError {
    /// Errors that abandon the current configuration attempt without killing the process.
    ///
    /// A filter install can fail transiently while the uplink prefix is still settling;
    /// the relay loop's next prefix check retries it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ClatError::FilterAttach(_) | ClatError::FilterBind(_))
    }

    pub(crate) fn socket(op: &'static str) -> impl FnOnce(std::io::Error) -> ClatError {
        move |source| ClatError::Socket { op, source }
    }

    pub(crate) fn interface(op: &'static str) -> impl FnOnce(std::io::Error) -> ClatError {
        move |source| ClatError::Interface { op, source }
    }
}

pub type Result<T> = std::result::Result<T, ClatError>;
