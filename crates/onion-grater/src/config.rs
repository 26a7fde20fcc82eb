//! Runtime configuration for the proxy.
//!
//! A single immutable [`Config`] is built by the launcher and handed down to
//! the server and every session by reference. There is deliberately no
//! process-global state.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use ipnet::Ipv4Net;

/// Default port the proxy listens on.
pub const DEFAULT_LISTEN_PORT: u16 = 951;

/// TCP endpoint of the real controller.
pub const DEFAULT_CONTROLLER_ADDR: &str = "127.0.0.1:9052";

/// Default path of the controller's authentication cookie.
pub const DEFAULT_COOKIE_PATH: &str = "/run/tor/control.authcookie";

/// Directory scanned for `*.yml` policy files.
pub const DEFAULT_POLICY_DIR: &str = "/etc/onion-grater.d";

/// IPv4 network whose members share the loopback trust level for
/// stream-event scoping even though they identify as remote clients.
pub const DEFAULT_LOCAL_VETH_NETWORK: &str = "10.200.1.0/24";

/// Interval between controller liveness checks, realised by the session's
/// read timeout.
pub const CONTROLLER_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listener binds to.
    pub listen_addr: IpAddr,

    /// Port the listener binds to.
    pub listen_port: u16,

    /// TCP endpoint of the upstream controller.
    pub controller_addr: SocketAddr,

    /// Cookie file used to authenticate to the controller.
    pub cookie_path: PathBuf,

    /// Directory holding `*.yml` policy files.
    pub policy_dir: PathBuf,

    /// When set, global filtering is disabled: unmatched commands pass
    /// through unmodified and are logged instead of rejected.
    pub complain: bool,

    /// Verbose request and response logging.
    pub debug: bool,

    /// Clients inside this network keep `restrict-stream-events` honored.
    pub local_veth_network: Ipv4Net,

    /// Liveness check cadence. Tests shorten this.
    pub ping_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: DEFAULT_LISTEN_PORT,
            controller_addr: DEFAULT_CONTROLLER_ADDR
                .parse()
                .expect("default controller address is valid"),
            cookie_path: PathBuf::from(DEFAULT_COOKIE_PATH),
            policy_dir: PathBuf::from(DEFAULT_POLICY_DIR),
            complain: false,
            debug: false,
            local_veth_network: DEFAULT_LOCAL_VETH_NETWORK
                .parse()
                .expect("default local-veth network is valid"),
            ping_interval: CONTROLLER_PING_INTERVAL,
        }
    }
}

impl Config {
    /// Socket address the listener binds to.
    #[must_use]
    pub fn listen_socket(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }

    /// Whether a client at `ip` shares the loopback trust level for
    /// stream-event scoping.
    #[must_use]
    pub fn is_local_veth(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.local_veth_network.contains(&v4),
            IpAddr::V6(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen_port, 951);
        assert_eq!(config.controller_addr.port(), 9052);
        assert!(!config.complain);
    }

    #[test]
    fn test_local_veth_classification() {
        let config = Config::default();
        assert!(config.is_local_veth("10.200.1.7".parse().unwrap()));
        assert!(!config.is_local_veth("10.200.2.7".parse().unwrap()));
        assert!(!config.is_local_veth("::1".parse().unwrap()));
    }
}
