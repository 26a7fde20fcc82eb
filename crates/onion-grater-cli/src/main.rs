//! onion-grater - filtering proxy for the Tor control port
//!
//! This binary wires the library together: argument parsing, logging,
//! policy loading, and the accept loop. SIGINT stops the proxy with exit
//! code 0; startup failures (bad bind, unreadable policy directory) exit
//! non-zero.

mod cli;

use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cli::Cli;
use onion_grater::{server, Config, GraterError, PolicyStore, Result};

fn main() {
    let cli = Cli::parse();
    let debug = cli.debug || kernel_cmdline_debug();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" })),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(cli, debug) {
        error!("{}", e);
        eprintln!("onion-grater: {e}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run(cli: Cli, debug: bool) -> Result<()> {
    let listen_addr = resolve_listen_addr(&cli)?;
    let config = Arc::new(Config {
        listen_addr,
        listen_port: cli.listen_port,
        cookie_path: cli.control_cookie_path,
        complain: cli.complain,
        debug,
        ..Config::default()
    });

    let store = Arc::new(PolicyStore::load(&config.policy_dir)?);
    if store.is_empty() {
        info!(
            dir = %config.policy_dir.display(),
            "no policies loaded; every client gets an empty rule table"
        );
    }

    tokio::select! {
        result = server::run(Arc::clone(&config), store) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; shutting down");
            Ok(())
        }
    }
}

/// The bind address: the interface's primary IPv4 when --listen-interface
/// is given, otherwise --listen-address (literal IP or resolvable name).
fn resolve_listen_addr(cli: &Cli) -> Result<IpAddr> {
    if let Some(interface) = &cli.listen_interface {
        return interface_primary_ipv4(interface);
    }
    if let Ok(ip) = cli.listen_address.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = (cli.listen_address.as_str(), 0)
        .to_socket_addrs()
        .map_err(|source| GraterError::Bind {
            addr: cli.listen_address.clone(),
            source,
        })?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| GraterError::Bind {
            addr: cli.listen_address.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "name resolved to no addresses",
            ),
        })
}

/// First IPv4 address assigned to the named interface.
fn interface_primary_ipv4(name: &str) -> Result<IpAddr> {
    let addrs =
        nix::ifaddrs::getifaddrs().map_err(|_| GraterError::Interface(name.to_string()))?;
    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }
        if let Some(sockaddr) = ifaddr.address {
            if let Some(sin) = sockaddr.as_sockaddr_in() {
                return Ok(IpAddr::V4(sin.ip()));
            }
        }
    }
    Err(GraterError::Interface(name.to_string()))
}

/// The --debug default follows the kernel command line.
fn kernel_cmdline_debug() -> bool {
    std::fs::read_to_string("/proc/cmdline")
        .map(|cmdline| cmdline_has_debug(&cmdline))
        .unwrap_or(false)
}

fn cmdline_has_debug(cmdline: &str) -> bool {
    cmdline.split_whitespace().any(|word| word == "debug")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmdline_debug_word() {
        assert!(cmdline_has_debug("quiet splash debug"));
        assert!(cmdline_has_debug("debug"));
        assert!(!cmdline_has_debug("quiet splash"));
        assert!(!cmdline_has_debug("debugfs=on nodebug"));
    }

    #[test]
    fn test_resolve_literal_address() {
        let cli = Cli::parse_from(["onion-grater", "--listen-address", "127.0.0.2"]);
        assert_eq!(
            resolve_listen_addr(&cli).unwrap(),
            "127.0.0.2".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_resolve_localhost() {
        let cli = Cli::parse_from(["onion-grater"]);
        let addr = resolve_listen_addr(&cli).unwrap();
        assert!(addr.is_loopback());
    }

    #[test]
    fn test_resolve_loopback_interface() {
        let cli = Cli::parse_from(["onion-grater", "--listen-interface", "lo"]);
        let addr = resolve_listen_addr(&cli).unwrap();
        assert_eq!(addr, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_resolve_missing_interface_fails() {
        let cli = Cli::parse_from(["onion-grater", "--listen-interface", "does-not-exist0"]);
        assert!(matches!(
            resolve_listen_addr(&cli),
            Err(GraterError::Interface(_))
        ));
    }
}
