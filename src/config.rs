use std::time::Duration;
use anyhow::bail;
use tracing::warn;

/// The highest port number a configured port range may reach
pub const PORT_MAX_RANGE: i32 = u16::MAX as i32;

/// Longest provider name that is accepted from the environment (including room for a
///  terminator in the wire representation used by the byte transport)
pub const PROV_NAME_MAX: usize = 64;

pub const ENV_PREFIX: &str = "RDM_NET_";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PortRange {
    pub low: i32,
    pub high: i32,
}

/// Process-wide configuration, built once at startup and shared between all RDM contexts as
///  an `Arc<RdmConfig>`.
///
/// Only part of this is used by connection management itself (protocol version, process id,
///  pool and index sizes, progress settings, tx / rx sizes). The remaining values are tunables
///  of the byte transport that are carried here so there is a single place to configure a
///  process.
#[derive(Debug, Clone)]
pub struct RdmConfig {
    /// The handshake protocol version proposed by the active side of a connection
    pub protocol_version: u8,
    /// Identifies this process in handshakes. It is used to disambiguate simultaneous
    ///  connection attempts and to detect a restarted peer.
    ///
    /// NB: This is *not* a security feature
    pub process_id: u32,

    pub prov_name: String,
    pub iface: Option<String>,
    pub ports: PortRange,

    pub tx_size: usize,
    pub rx_size: usize,
    /// `None` leaves the socket default alone
    pub nodelay: Option<bool>,
    pub staging_sbuf_size: usize,
    pub prefetch_rbuf_size: usize,
    /// lower threshold for zero copy transfers, `usize::MAX` disables zero copy
    pub zerocopy_size: usize,
    /// number of times the active socket set is polled before the full set is; 0 disables the
    ///  active set
    pub poll_fairness: u32,
    pub poll_cooldown: u32,

    pub disable_auto_progress: bool,
    pub auto_progress_interval: Duration,

    /// number of connection entries an RDM context can hold at the same time
    pub max_connections: usize,
    /// peer indices at or above this value cannot be stored in the indexed connection table
    pub max_peer_index: usize,
}

impl RdmConfig {
    pub fn new() -> RdmConfig {
        RdmConfig {
            protocol_version: 1,
            process_id: std::process::id(),
            prov_name: "net".to_string(),
            iface: None,
            ports: PortRange { low: 0, high: 0 },
            tx_size: 256,
            rx_size: 256,
            nodelay: None,
            staging_sbuf_size: 9000,
            prefetch_rbuf_size: 9000,
            zerocopy_size: usize::MAX,
            poll_fairness: 0,
            poll_cooldown: 0,
            disable_auto_progress: false,
            auto_progress_interval: Duration::from_millis(10),
            max_connections: 4096,
            max_peer_index: 1 << 20,
        }
    }

    pub fn from_env() -> RdmConfig {
        Self::from_lookup(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    /// Builds a config from defaults, overriding each parameter for which `lookup` returns a
    ///  value. Keys are passed without the `RDM_NET_` prefix.
    ///
    /// Values that can not be parsed are ignored with a warning, just like an invalid port range.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> RdmConfig {
        let mut result = RdmConfig::new();

        if let Some(name) = lookup("PROV_NAME") {
            if !name.is_empty() && name.len() < PROV_NAME_MAX {
                result.prov_name = name;
            }
        }
        result.iface = lookup("IFACE").filter(|s| !s.is_empty());

        let mut ports = result.ports;
        parse_into(&lookup, "PORT_HIGH_RANGE", &mut ports.high);
        parse_into(&lookup, "PORT_LOW_RANGE", &mut ports.low);
        result.ports = sanitize_port_range(ports);

        parse_into(&lookup, "TX_SIZE", &mut result.tx_size);
        parse_into(&lookup, "RX_SIZE", &mut result.rx_size);

        if let Some(raw) = lookup("NODELAY") {
            match parse_bool(&raw) {
                Some(b) => result.nodelay = Some(b),
                None => warn!("ignoring invalid boolean value for {}NODELAY: {:?}", ENV_PREFIX, raw),
            }
        }

        parse_into(&lookup, "STAGING_SBUF_SIZE", &mut result.staging_sbuf_size);
        parse_into(&lookup, "PREFETCH_RBUF_SIZE", &mut result.prefetch_rbuf_size);

        if let Some(raw) = lookup("ZEROCOPY_SIZE") {
            match raw.trim() {
                "-1" => result.zerocopy_size = usize::MAX,
                s => match s.parse() {
                    Ok(n) => result.zerocopy_size = n,
                    Err(_) => warn!("ignoring invalid value for {}ZEROCOPY_SIZE: {:?}", ENV_PREFIX, raw),
                }
            }
        }

        parse_into(&lookup, "POLL_FAIRNESS", &mut result.poll_fairness);
        parse_into(&lookup, "POLL_COOLDOWN", &mut result.poll_cooldown);

        if let Some(raw) = lookup("DISABLE_AUTO_PROGRESS") {
            match parse_bool(&raw) {
                Some(b) => result.disable_auto_progress = b,
                None => warn!("ignoring invalid boolean value for {}DISABLE_AUTO_PROGRESS: {:?}", ENV_PREFIX, raw),
            }
        }

        parse_into(&lookup, "MAX_CONNECTIONS", &mut result.max_connections);
        parse_into(&lookup, "MAX_PEER_INDEX", &mut result.max_peer_index);

        result
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.protocol_version == 0 {
            bail!("protocol version must be at least 1");
        }
        if self.max_connections == 0 {
            bail!("an RDM context needs room for at least one connection");
        }
        if self.max_peer_index == 0 {
            bail!("the maximum peer index must be positive");
        }
        if self.auto_progress_interval.is_zero() && !self.disable_auto_progress {
            bail!("auto progress interval must be positive");
        }
        if self.ports.low > self.ports.high {
            bail!("invalid port range {:?}", self.ports);
        }
        Ok(())
    }
}

impl Default for RdmConfig {
    fn default() -> Self {
        RdmConfig::new()
    }
}

fn parse_into<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!("ignoring invalid value for {}{}: {:?}", ENV_PREFIX, key, raw),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" => Some(true),
        "0" | "false" | "no" | "off" | "n" => Some(false),
        _ => None,
    }
}

/// The high end is capped at [PORT_MAX_RANGE]. A range that is negative or inverted after that
///  is dropped entirely, leaving port selection to the OS.
fn sanitize_port_range(ports: PortRange) -> PortRange {
    let high = ports.high.min(PORT_MAX_RANGE);
    let low = ports.low;

    if low < 0 || high < 0 || low > high {
        warn!("User provided port range invalid. Ignoring.");
        return PortRange { low: 0, high: 0 };
    }
    PortRange { low, high }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use rustc_hash::FxHashMap;
    use super::*;

    fn lookup_from(entries: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = entries.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<FxHashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RdmConfig::from_lookup(|_| None);
        assert_eq!(config.prov_name, "net");
        assert_eq!(config.tx_size, 256);
        assert_eq!(config.rx_size, 256);
        assert_eq!(config.staging_sbuf_size, 9000);
        assert_eq!(config.prefetch_rbuf_size, 9000);
        assert_eq!(config.zerocopy_size, usize::MAX);
        assert_eq!(config.ports, PortRange { low: 0, high: 0 });
        assert_eq!(config.nodelay, None);
        assert!(!config.disable_auto_progress);
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case::valid("1000", "2000", 1000, 2000)]
    #[case::high_clamped("1000", "70000", 1000, 65535)]
    #[case::inverted("2000", "1000", 0, 0)]
    #[case::negative_low("-5", "1000", 0, 0)]
    #[case::negative_high("0", "-1", 0, 0)]
    #[case::unparsable("abc", "1000", 0, 1000)]
    fn test_port_range(#[case] low: &str, #[case] high: &str, #[case] expected_low: i32, #[case] expected_high: i32) {
        let config = RdmConfig::from_lookup(lookup_from(&[("PORT_LOW_RANGE", low), ("PORT_HIGH_RANGE", high)]));
        assert_eq!(config.ports, PortRange { low: expected_low, high: expected_high });
    }

    #[rstest]
    #[case::custom("tcp-test", "tcp-test")]
    #[case::empty("", "net")]
    fn test_prov_name(#[case] raw: &str, #[case] expected: &str) {
        let config = RdmConfig::from_lookup(lookup_from(&[("PROV_NAME", raw)]));
        assert_eq!(config.prov_name, expected);
    }

    #[test]
    fn test_prov_name_too_long() {
        let name = "x".repeat(PROV_NAME_MAX);
        let config = RdmConfig::from_lookup(lookup_from(&[("PROV_NAME", name.as_str())]));
        assert_eq!(config.prov_name, "net");
    }

    #[rstest]
    #[case::disabled("-1", usize::MAX)]
    #[case::threshold("4096", 4096)]
    #[case::invalid("lots", usize::MAX)]
    fn test_zerocopy_size(#[case] raw: &str, #[case] expected: usize) {
        let config = RdmConfig::from_lookup(lookup_from(&[("ZEROCOPY_SIZE", raw)]));
        assert_eq!(config.zerocopy_size, expected);
    }

    #[test]
    fn test_overrides() {
        let config = RdmConfig::from_lookup(lookup_from(&[
            ("TX_SIZE", "512"),
            ("RX_SIZE", "1024"),
            ("NODELAY", "true"),
            ("POLL_FAIRNESS", "3"),
            ("POLL_COOLDOWN", "7"),
            ("DISABLE_AUTO_PROGRESS", "1"),
            ("IFACE", "eth0"),
            ("MAX_CONNECTIONS", "8"),
        ]));
        assert_eq!(config.tx_size, 512);
        assert_eq!(config.rx_size, 1024);
        assert_eq!(config.nodelay, Some(true));
        assert_eq!(config.poll_fairness, 3);
        assert_eq!(config.poll_cooldown, 7);
        assert!(config.disable_auto_progress);
        assert_eq!(config.iface.as_deref(), Some("eth0"));
        assert_eq!(config.max_connections, 8);
    }

    #[test]
    fn test_validate() {
        let mut config = RdmConfig::new();
        config.max_connections = 0;
        assert!(config.validate().is_err());

        let mut config = RdmConfig::new();
        config.protocol_version = 0;
        assert!(config.validate().is_err());
    }
}
