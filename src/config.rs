//! Session configuration.
//!
//! Loaded once per configuration pass from a small TOML file plus the
//! command-line values, then handed by reference to every component. Nothing
//! here is global: the top-level control flow owns the one `ClatConfig`.

use crate::constants::{
    INTERFACE_POLL_FREQUENCY, MAXMTU, MIN_IPV6_MTU, MTU_DELTA, NO_TRAFFIC_INTERFACE_POLL_FREQUENCY,
};
use crate::error::{ClatError, Result};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::Deserialize;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// On-disk configuration file.
///
/// Non-positive MTU values mean "probe the uplink".
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default = "default_ipv4_subnet")]
    pub ipv4_local_subnet: Ipv4Addr,
    #[serde(default = "default_ipv4_prefixlen")]
    pub ipv4_local_prefixlen: u8,
    #[serde(default = "default_mtu")]
    pub mtu: i32,
    #[serde(default = "default_mtu")]
    pub ipv4mtu: i32,
    #[serde(default = "default_interface_poll")]
    pub interface_poll_secs: u64,
    #[serde(default = "default_idle_poll")]
    pub idle_poll_secs: u64,
}

fn default_ipv4_subnet() -> Ipv4Addr {
    Ipv4Addr::new(192, 0, 0, 4)
}

fn default_ipv4_prefixlen() -> u8 {
    29
}

fn default_mtu() -> i32 {
    -1
}

fn default_interface_poll() -> u64 {
    INTERFACE_POLL_FREQUENCY.as_secs()
}

fn default_idle_poll() -> u64 {
    NO_TRAFFIC_INTERFACE_POLL_FREQUENCY.as_secs()
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            ipv4_local_subnet: default_ipv4_subnet(),
            ipv4_local_prefixlen: default_ipv4_prefixlen(),
            mtu: default_mtu(),
            ipv4mtu: default_mtu(),
            interface_poll_secs: default_interface_poll(),
            idle_poll_secs: default_idle_poll(),
        }
    }
}

/// Configuration of one translation session.
#[derive(Debug, Clone)]
pub struct ClatConfig {
    /// Interface used to reach the IPv6 internet.
    pub uplink: String,
    /// PLAT /96 that remote IPv4 addresses are embedded in.
    pub plat_subnet: Ipv6Net,
    /// Configured host address and prefix length; allocation starts here.
    pub ipv4_local_subnet: Ipv4Net,
    /// The synthetic IPv4 address actually in use.
    pub ipv4_local: Ipv4Addr,
    /// The synthetic IPv6 address actually in use.
    pub ipv6_local: Ipv6Addr,
    /// Raw MTU values as configured; see [`ClatConfig::normalize_mtu`].
    pub mtu: i32,
    pub ipv4mtu: i32,
    pub net_id: u32,
    pub interface_poll: Duration,
    pub idle_poll: Duration,
}

impl ClatConfig {
    /// Reads the configuration file at `path` and combines it with the
    /// command-line values.
    pub fn load(path: &Path, uplink: &str, plat_prefix: &str, net_id: u32) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClatError::Config(format!("{}: {}", path.display(), e)))?;
        let file: FileConfig = toml::from_str(&content)
            .map_err(|e| ClatError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_file(file, uplink, plat_prefix, net_id)
    }

    pub fn from_file(file: FileConfig, uplink: &str, plat_prefix: &str, net_id: u32) -> Result<Self> {
        if uplink.is_empty() {
            return Err(ClatError::Config("uplink interface not set".into()));
        }
        // Addresses are iterated in host order, so tiny prefixes would mean huge scans.
        if !(16..=30).contains(&file.ipv4_local_prefixlen) {
            return Err(ClatError::Config(format!(
                "ipv4_local_prefixlen {} out of range 16..=30",
                file.ipv4_local_prefixlen
            )));
        }
        let ipv4_local_subnet = Ipv4Net::new(file.ipv4_local_subnet, file.ipv4_local_prefixlen)
            .map_err(|e| ClatError::Config(e.to_string()))?;

        if file.interface_poll_secs == 0 || file.idle_poll_secs == 0 {
            return Err(ClatError::Config("poll intervals must be positive".into()));
        }

        Ok(Self {
            uplink: uplink.to_string(),
            plat_subnet: parse_plat_prefix(plat_prefix)?,
            ipv4_local_subnet,
            ipv4_local: ipv4_local_subnet.addr(),
            ipv6_local: Ipv6Addr::UNSPECIFIED,
            mtu: file.mtu,
            ipv4mtu: file.ipv4mtu,
            net_id,
            interface_poll: Duration::from_secs(file.interface_poll_secs),
            idle_poll: Duration::from_secs(file.idle_poll_secs),
        })
    }

    /// Brings `mtu` and `ipv4mtu` inside their invariants. `probe` supplies the
    /// live uplink MTU and is consulted only when the configured value is not positive.
    pub fn normalize_mtu(&mut self, probe: impl FnOnce() -> i32) {
        let (mtu, ipv4mtu) = normalize_mtu(self.mtu, self.ipv4mtu, probe);
        self.mtu = mtu as i32;
        self.ipv4mtu = ipv4mtu as i32;
    }

    /// Normalized uplink MTU.
    pub fn mtu(&self) -> u32 {
        self.mtu.max(0) as u32
    }

    /// Normalized MTU of the IPv4-facing interface.
    pub fn ipv4mtu(&self) -> u32 {
        self.ipv4mtu.max(0) as u32
    }
}

/// Returns `(mtu, ipv4mtu)` with `MIN_IPV6_MTU <= mtu <= MAXMTU` and
/// `0 < ipv4mtu <= mtu - MTU_DELTA`.
pub fn normalize_mtu(mtu: i32, ipv4mtu: i32, probe: impl FnOnce() -> i32) -> (u32, u32) {
    let mut mtu = i64::from(mtu);
    if mtu <= 0 {
        mtu = i64::from(probe());
        warn!("ifmtu={}", mtu);
    }
    if mtu > i64::from(MAXMTU) {
        warn!("Max MTU is {}, requested {}", MAXMTU, mtu);
        mtu = i64::from(MAXMTU);
    }
    if mtu < i64::from(MIN_IPV6_MTU) {
        warn!("mtu too small = {}", mtu);
        mtu = i64::from(MIN_IPV6_MTU);
    }
    let mtu = mtu as u32;

    let ceiling = mtu - MTU_DELTA;
    let ipv4mtu = if ipv4mtu <= 0 || ipv4mtu as u32 > ceiling {
        warn!("ipv4mtu now set to = {}", ceiling);
        ceiling
    } else {
        ipv4mtu as u32
    };

    (mtu, ipv4mtu)
}

/// Parses a PLAT prefix. A bare address is taken as a /96, which is the only
/// length the translator embeds IPv4 addresses into.
pub fn parse_plat_prefix(s: &str) -> Result<Ipv6Net> {
    let net = match s.parse::<Ipv6Net>() {
        Ok(net) => net,
        Err(_) => {
            let addr: Ipv6Addr = s
                .parse()
                .map_err(|_| ClatError::Config(format!("invalid PLAT prefix {}", s)))?;
            Ipv6Net::new(addr, 96).map_err(|e| ClatError::Config(e.to_string()))?
        }
    };
    if net.prefix_len() != 96 {
        return Err(ClatError::Config(format!("PLAT prefix {} is not a /96", s)));
    }
    Ok(net.trunc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(toml_src: &str) -> FileConfig {
        toml::from_str(toml_src).unwrap()
    }

    #[test]
    fn test_defaults_when_file_is_empty() {
        let cfg = ClatConfig::from_file(file(""), "wlan0", "64:ff9b::/96", 0).unwrap();
        assert_eq!(cfg.ipv4_local_subnet, "192.0.0.4/29".parse::<Ipv4Net>().unwrap());
        assert_eq!(cfg.ipv4_local, Ipv4Addr::new(192, 0, 0, 4));
        assert_eq!(cfg.mtu, -1);
        assert_eq!(cfg.interface_poll, Duration::from_secs(30));
        assert_eq!(cfg.idle_poll, Duration::from_secs(90));
        assert_eq!(cfg.plat_subnet, "64:ff9b::/96".parse::<Ipv6Net>().unwrap());
    }

    #[test]
    fn test_file_values_override_defaults() {
        let src = r#"
            ipv4_local_subnet = "192.0.0.8"
            ipv4_local_prefixlen = 30
            mtu = 1500
            ipv4mtu = 1400
            interface_poll_secs = 5
        "#;
        let cfg = ClatConfig::from_file(file(src), "rmnet0", "64:ff9b::", 7).unwrap();
        assert_eq!(cfg.ipv4_local, Ipv4Addr::new(192, 0, 0, 8));
        assert_eq!(cfg.ipv4_local_subnet.prefix_len(), 30);
        assert_eq!(cfg.mtu, 1500);
        assert_eq!(cfg.ipv4mtu, 1400);
        assert_eq!(cfg.net_id, 7);
        assert_eq!(cfg.interface_poll, Duration::from_secs(5));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(toml::from_str::<FileConfig>("bogus = 1").is_err());
    }

    #[test]
    fn test_prefixlen_out_of_range() {
        let err = ClatConfig::from_file(file("ipv4_local_prefixlen = 31"), "wlan0", "64:ff9b::/96", 0)
            .unwrap_err();
        assert!(matches!(err, ClatError::Config(_)));
        let err = ClatConfig::from_file(file("ipv4_local_prefixlen = 8"), "wlan0", "64:ff9b::/96", 0)
            .unwrap_err();
        assert!(matches!(err, ClatError::Config(_)));
    }

    #[test]
    fn test_plat_prefix_must_be_96() {
        assert!(parse_plat_prefix("64:ff9b::/64").is_err());
        assert!(parse_plat_prefix("not-an-address").is_err());
        let net = parse_plat_prefix("2001:db8:64::1/96").unwrap();
        assert_eq!(net.addr(), "2001:db8:64::".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = ClatConfig::load(Path::new("/nonexistent/clatd.toml"), "wlan0", "64:ff9b::/96", 0)
            .unwrap_err();
        assert!(matches!(err, ClatError::Config(_)));
    }

    #[test]
    fn test_normalize_mtu_bounds() {
        for &(mtu, ipv4mtu) in &[
            (-1, -1),
            (0, 0),
            (1, 5000),
            (1279, 1200),
            (1280, 1252),
            (1500, 1472),
            (1500, 1473),
            (9000, 100),
            (65536, -3),
            (70000, 70000),
            (i32::MAX, i32::MAX),
        ] {
            let (m, m4) = normalize_mtu(mtu, ipv4mtu, || 1500);
            assert!((MIN_IPV6_MTU..=MAXMTU).contains(&m), "mtu {} -> {}", mtu, m);
            assert!(m4 > 0 && m4 <= m - MTU_DELTA, "ipv4mtu {} -> {}", ipv4mtu, m4);
        }
    }

    #[test]
    fn test_normalize_mtu_is_idempotent() {
        for &(mtu, ipv4mtu) in &[(-1, -1), (1000, 0), (1500, 1400), (80000, 80000), (1300, 1299)] {
            let once = normalize_mtu(mtu, ipv4mtu, || 1400);
            let twice = normalize_mtu(once.0 as i32, once.1 as i32, || panic!("probe not expected"));
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_normalize_mtu_probes_only_non_positive() {
        assert_eq!(normalize_mtu(-1, -1, || 1500), (1500, 1472));
        assert_eq!(normalize_mtu(0, 1000, || 9000), (9000, 1000));
        // Failed probe reports 0 and lands on the IPv6 floor.
        assert_eq!(normalize_mtu(-1, -1, || 0), (1280, 1252));
        assert_eq!(normalize_mtu(1400, -1, || panic!("probe not expected")), (1400, 1372));
    }

    #[test]
    fn test_normalize_mtu_clamps_high() {
        assert_eq!(normalize_mtu(100_000, -1, || 0), (MAXMTU, MAXMTU - MTU_DELTA));
    }

    #[test]
    fn test_config_normalize_updates_fields() {
        let mut cfg = ClatConfig::from_file(file("mtu = 1500\nipv4mtu = 2000"), "wlan0", "64:ff9b::/96", 0)
            .unwrap();
        cfg.normalize_mtu(|| 0);
        assert_eq!(cfg.mtu(), 1500);
        assert_eq!(cfg.ipv4mtu(), 1472);
    }
}
