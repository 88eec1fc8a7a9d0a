//! Interface configuration: the IPv4 side once at boot, the IPv6 side at boot
//! and after every uplink prefix change.

use crate::addr::{allocate_ipv4, derive_ipv6, ipv6_from_cmdline, AddressProbe, LocalAddressProbe, StableIid};
use crate::config::ClatConfig;
use crate::error::{ClatError, Result};
use crate::filter::install_ipv6_filter;
use crate::iface::VirtualInterface;
use crate::netif::{InterfaceAddrs, SystemInterfaces};
use crate::privilege::Unprivileged;
use crate::tunnel::TunnelSession;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use tracing::{error, info};

/// Values the configurator takes from the command line.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub config_path: PathBuf,
    pub uplink: String,
    pub plat_prefix: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub net_id: u32,
}

/// Host facilities consulted while configuring.
pub struct Environment<A, P> {
    pub addrs: A,
    pub probe: P,
    pub iid: StableIid,
}

impl Environment<SystemInterfaces, LocalAddressProbe> {
    pub fn system() -> Self {
        Self {
            addrs: SystemInterfaces,
            probe: LocalAddressProbe,
            iid: StableIid::from_host(),
        }
    }
}

/// Boot-time configuration, run after root has been dropped. Every error
/// returned here is fatal.
pub fn configure<A, P>(
    _unprivileged: &Unprivileged,
    opts: &Options,
    tunnel: &TunnelSession,
    iface: &impl VirtualInterface,
    env: &Environment<A, P>,
) -> Result<ClatConfig>
where
    A: InterfaceAddrs,
    P: AddressProbe,
{
    let mut config = ClatConfig::load(&opts.config_path, &opts.uplink, &opts.plat_prefix, opts.net_id)?;

    let uplink = config.uplink.clone();
    config.normalize_mtu(|| env.addrs.mtu(&uplink).map(|m| m as i32).unwrap_or(0));

    config.ipv4_local = allocate_ipv4(opts.ipv4.as_deref(), config.ipv4_local_subnet, &env.probe)?;
    info!("Using IPv4 address {} on {}", config.ipv4_local, iface.name());

    // Bringing the interface up tells observers the configuration is final,
    // so the address goes on first.
    iface
        .add_address(config.ipv4_local, 32, Some(config.ipv4_local))
        .map_err(ClatError::interface("if_address(4)"))?;
    iface.up(config.ipv4mtu()).map_err(ClatError::interface("if_up(4)"))?;

    configure_ipv6(&mut config, tunnel, opts.ipv6.as_deref(), env)?;
    Ok(config)
}

/// Picks the synthetic IPv6 address: the explicit literal if given,
/// otherwise one derived from the uplink prefix.
pub fn resolve_ipv6<A: InterfaceAddrs>(uplink: &str, explicit: Option<&str>, addrs: &A, iid: &StableIid) -> Result<Ipv6Addr> {
    match explicit {
        Some(literal) => ipv6_from_cmdline(literal),
        None => derive_ipv6(uplink, addrs, iid),
    }
}

/// Resolves the IPv6 address and starts translating for it.
///
/// Resolution errors are fatal. Anycast failures are only logged. A filter
/// failure returns a recoverable error and leaves `config.ipv6_local` at the
/// previous address, so the next prefix check fires again and retries.
pub fn configure_ipv6<A, P>(
    config: &mut ClatConfig,
    tunnel: &TunnelSession,
    explicit: Option<&str>,
    env: &Environment<A, P>,
) -> Result<()>
where
    A: InterfaceAddrs,
{
    let ipv6 = resolve_ipv6(&config.uplink, explicit, &env.addrs, &env.iid)?;
    info!("Using IPv6 address {} on {}", ipv6, config.uplink);

    let ifindex = env.addrs.index(&config.uplink);
    let anycast_index = match &ifindex {
        Ok(index) => {
            tunnel.join_anycast(ipv6, *index);
            Some(*index)
        }
        Err(e) => {
            error!("adding anycast address {}: {}", ipv6, e);
            None
        }
    };

    if let Err(e) = install_ipv6_filter(tunnel.ring.socket(), ipv6, ifindex) {
        if let Some(index) = anycast_index {
            tunnel.leave_anycast(ipv6, index);
        }
        return Err(e);
    }
    config.ipv6_local = ipv6;
    Ok(())
}

/// Moves translation to the uplink's new prefix.
pub fn reconfigure_ipv6<A, P>(
    config: &mut ClatConfig,
    tunnel: &TunnelSession,
    explicit: Option<&str>,
    env: &Environment<A, P>,
) -> Result<()>
where
    A: InterfaceAddrs,
{
    let old = config.ipv6_local;
    if !old.is_unspecified() {
        if let Ok(index) = env.addrs.index(&config.uplink) {
            tunnel.leave_anycast(old, index);
        }
    }
    configure_ipv6(config, tunnel, explicit, env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::tests::FakeInterfaces;
    use crate::relay::{LoopExit, RelayLoop};
    use crate::signal::RunningFlag;
    use crate::translate::Nat46;
    use crate::tunnel::tests::session_pair;
    use std::cell::RefCell;
    use std::io::Write;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio::time;

    #[derive(Default)]
    struct RecordingInterface {
        calls: RefCell<Vec<String>>,
        fail_up: bool,
    }

    impl VirtualInterface for RecordingInterface {
        fn name(&self) -> &str {
            "v4-wlan0"
        }

        fn add_address(&self, addr: Ipv4Addr, prefix_len: u8, _broadcast: Option<Ipv4Addr>) -> std::io::Result<()> {
            self.calls.borrow_mut().push(format!("address {}/{}", addr, prefix_len));
            Ok(())
        }

        fn up(&self, mtu: u32) -> std::io::Result<()> {
            self.calls.borrow_mut().push(format!("up {}", mtu));
            if self.fail_up {
                return Err(std::io::Error::from_raw_os_error(libc::EPERM));
            }
            Ok(())
        }
    }

    fn config_file(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    fn env(addrs: FakeInterfaces) -> Environment<FakeInterfaces, impl Fn(Ipv4Addr) -> bool> {
        Environment {
            addrs,
            probe: |a: Ipv4Addr| a != Ipv4Addr::new(192, 0, 0, 4),
            iid: StableIid::new(b"test-host".to_vec()),
        }
    }

    fn options(path: &std::path::Path) -> Options {
        Options {
            config_path: path.to_path_buf(),
            uplink: "wlan0".into(),
            plat_prefix: "64:ff9b::/96".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_address_is_assigned_before_up() {
        let file = config_file("mtu = 1500\n");
        let (session, _tun, _ring, _raw) = session_pair();
        let iface = RecordingInterface::default();
        let env = env(FakeInterfaces::with("wlan0", "2001:db8:1::1234"));

        // The packet socket in the test session cannot be bound, so the
        // filter step fails after everything else has been applied.
        let err = configure(&Unprivileged::for_tests(), &options(file.path()), &session, &iface, &env).unwrap_err();
        assert!(err.is_recoverable());

        let calls = iface.calls.borrow();
        assert_eq!(calls.as_slice(), ["address 192.0.0.5/32", "up 1472"]);
    }

    #[tokio::test]
    async fn test_up_failure_is_fatal() {
        let file = config_file("");
        let (session, _tun, _ring, _raw) = session_pair();
        let iface = RecordingInterface { fail_up: true, ..Default::default() };
        let env = env(FakeInterfaces::with("wlan0", "2001:db8:1::1234"));

        let err = configure(&Unprivileged::for_tests(), &options(file.path()), &session, &iface, &env).unwrap_err();
        assert!(matches!(err, ClatError::Interface { op: "if_up(4)", .. }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_missing_ipv6_is_fatal() {
        let file = config_file("");
        let (session, _tun, _ring, _raw) = session_pair();
        let iface = RecordingInterface::default();
        let env = env(FakeInterfaces::default());

        let err = configure(&Unprivileged::for_tests(), &options(file.path()), &session, &iface, &env).unwrap_err();
        assert!(matches!(err, ClatError::NoIpv6Address(_)));
        // IPv4 configuration already happened.
        assert_eq!(iface.calls.borrow().len(), 2);
    }

    #[tokio::test]
    async fn test_explicit_addresses() {
        let file = config_file("");
        let (session, _tun, _ring, _raw) = session_pair();
        let iface = RecordingInterface::default();
        let env = env(FakeInterfaces::default());
        let mut opts = options(file.path());
        opts.ipv4 = Some("192.0.0.6".into());
        opts.ipv6 = Some("2001:db8:5::64".into());

        let err = configure(&Unprivileged::for_tests(), &opts, &session, &iface, &env).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(iface.calls.borrow()[0], "address 192.0.0.6/32");

        opts.ipv4 = Some("192.0.0".into());
        let err = configure(&Unprivileged::for_tests(), &opts, &session, &iface, &env).unwrap_err();
        assert!(matches!(err, ClatError::InvalidIpv4(_)));
    }

    #[tokio::test]
    async fn test_failed_reconfigure_keeps_previous_address() {
        let (session, _tun, _ring, _raw) = session_pair();
        let env = env(FakeInterfaces::with("wlan0", "2001:db8:1::1"));
        let file = config_file("");
        let mut config = ClatConfig::load(file.path(), "wlan0", "64:ff9b::/96", 0).unwrap();
        let first = resolve_ipv6("wlan0", None, &env.addrs, &env.iid).unwrap();
        config.ipv6_local = first;

        env.addrs.set("wlan0", "2001:db8:2::1");
        let next = resolve_ipv6("wlan0", None, &env.addrs, &env.iid).unwrap();
        assert_eq!(next.segments()[..4], [0x2001, 0xdb8, 2, 0]);

        // The test session's packet socket cannot be bound.
        let err = reconfigure_ipv6(&mut config, &session, None, &env).unwrap_err();
        assert!(matches!(err, ClatError::FilterAttach(_) | ClatError::FilterBind(_)));
        assert!(err.is_recoverable());
        assert_eq!(config.ipv6_local, first);
    }

    #[tokio::test]
    async fn test_failed_reconfigure_is_retried_by_relay() {
        let (session, _tun, _ring, _raw) = session_pair();
        let env = env(FakeInterfaces::with("wlan0", "2001:db8:1::1"));
        let file = config_file("");
        let mut config = ClatConfig::load(file.path(), "wlan0", "64:ff9b::/96", 0).unwrap();
        config.ipv6_local = resolve_ipv6("wlan0", None, &env.addrs, &env.iid).unwrap();
        config.interface_poll = Duration::from_millis(1);
        config.idle_poll = Duration::from_millis(5);

        env.addrs.set("wlan0", "2001:db8:2::1");
        assert!(reconfigure_ipv6(&mut config, &session, None, &env).unwrap_err().is_recoverable());

        let mut translator = Nat46::from_config(&config);
        let exit = time::timeout(
            Duration::from_secs(5),
            RelayLoop::new(&session, &config, &mut translator, &env.addrs, RunningFlag::new()).run(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(exit, LoopExit::PrefixChanged);
    }

    #[test]
    fn test_resolve_prefers_explicit() {
        let addrs = FakeInterfaces::with("wlan0", "2001:db8:1::1");
        let iid = StableIid::new(b"h".to_vec());
        let explicit = resolve_ipv6("wlan0", Some("2001:db8:9::9"), &addrs, &iid).unwrap();
        assert_eq!(explicit, "2001:db8:9::9".parse::<Ipv6Addr>().unwrap());
        assert!(matches!(resolve_ipv6("wlan0", Some("nope"), &addrs, &iid), Err(ClatError::InvalidIpv6(_))));
    }
}
