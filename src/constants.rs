use std::time::Duration;

/// 40 bytes IPv6 header - 20 bytes IPv4 header + 8 bytes fragment header.
pub const MTU_DELTA: u32 = 28;

/// IPv6 minimum link MTU (RFC 8200). The uplink MTU is never configured below this.
pub const MIN_IPV6_MTU: u32 = 1280;

/// Largest MTU the translator will accept for the uplink-facing path.
pub const MAXMTU: u32 = 65536;

/// Size of the Linux `struct tun_pi` prepended to every TUN frame.
pub const TUN_PI_SIZE: usize = 4;

/// Read buffer size: one maximum-size packet plus the TUN header.
pub const PACKETLEN: usize = MAXMTU as usize + TUN_PI_SIZE;

/// Maximum number of packets to drain from the IPv6 packet socket per wakeup.
/// Bounds how long one direction can hold the loop before the other is serviced.
pub const BATCH_SIZE: usize = 64;

/// How often the uplink's IPv6 prefix is re-validated.
pub const INTERFACE_POLL_FREQUENCY: Duration = Duration::from_secs(30);

/// Readiness-wait timeout when no traffic arrives.
pub const NO_TRAFFIC_INTERFACE_POLL_FREQUENCY: Duration = Duration::from_secs(90);

/// Routing mark value meaning "do not set SO_MARK".
pub const MARK_UNSET: u32 = 0;

/// Network id meaning "use the default network".
pub const NETID_UNSET: u32 = 0;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/clatd.toml";

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86DD;

// Fixed identities the daemon runs as after dropping root.
pub const AID_CLAT: u32 = 1029;
pub const AID_VPN: u32 = 1016;
pub const AID_INET: u32 = 3003;
