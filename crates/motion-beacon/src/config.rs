//! Broadcaster configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Configuration for a [`TcpBroadcaster`](crate::TcpBroadcaster).
///
/// The port is always OS-assigned (bind to port 0) so several broadcaster
/// instances on one host never collide; only the bind address and the accept
/// cadence are configurable.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Local address the listener binds to.
    pub bind_address: IpAddr,
    /// Pause between accept cycles.  At most one accept is ever in flight;
    /// the next cycle is armed only after the previous accept resolved.
    /// Tests shorten this; the production default polls once a second.
    pub accept_interval: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            accept_interval: Duration::from_millis(1000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_binds_all_interfaces() {
        let config = BroadcasterConfig::default();
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn test_default_accept_interval_is_one_second() {
        let config = BroadcasterConfig::default();
        assert_eq!(config.accept_interval, Duration::from_millis(1000));
    }
}
