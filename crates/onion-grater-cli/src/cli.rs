//! CLI argument definitions for onion-grater
//!
//! Uses clap for argument parsing.

use clap::Parser;
use std::path::PathBuf;

use onion_grater::config::{DEFAULT_COOKIE_PATH, DEFAULT_LISTEN_PORT};

/// onion-grater - filtering proxy for the Tor control port
///
/// Sits between local applications and the Tor controller, authenticates
/// upstream on their behalf, and relays only the commands and events each
/// client's policy permits.
#[derive(Parser, Debug)]
#[command(name = "onion-grater")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Host to bind the listener to
    #[arg(long, default_value = "localhost")]
    pub listen_address: String,

    /// Port to bind the listener to
    #[arg(long, default_value_t = DEFAULT_LISTEN_PORT)]
    pub listen_port: u16,

    /// Bind to this interface's primary IPv4 address instead of
    /// --listen-address
    #[arg(long)]
    pub listen_interface: Option<String>,

    /// Cookie file for authenticating to the controller
    #[arg(long, default_value = DEFAULT_COOKIE_PATH)]
    pub control_cookie_path: PathBuf,

    /// Disable filtering: log unmatched requests and pass them through
    #[arg(long)]
    pub complain: bool,

    /// Verbose request and response logging (defaults on when the kernel
    /// command line contains "debug")
    #[arg(long)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["onion-grater"]);
        assert_eq!(cli.listen_address, "localhost");
        assert_eq!(cli.listen_port, 951);
        assert!(cli.listen_interface.is_none());
        assert_eq!(
            cli.control_cookie_path,
            PathBuf::from("/run/tor/control.authcookie")
        );
        assert!(!cli.complain);
        assert!(!cli.debug);
    }

    #[test]
    fn test_all_flags() {
        let cli = Cli::parse_from([
            "onion-grater",
            "--listen-address",
            "0.0.0.0",
            "--listen-port",
            "9051",
            "--listen-interface",
            "eth0",
            "--control-cookie-path",
            "/tmp/cookie",
            "--complain",
            "--debug",
        ]);
        assert_eq!(cli.listen_address, "0.0.0.0");
        assert_eq!(cli.listen_port, 9051);
        assert_eq!(cli.listen_interface.as_deref(), Some("eth0"));
        assert_eq!(cli.control_cookie_path, PathBuf::from("/tmp/cookie"));
        assert!(cli.complain);
        assert!(cli.debug);
    }

    #[test]
    fn test_invalid_port_rejected() {
        assert!(Cli::try_parse_from(["onion-grater", "--listen-port", "notaport"]).is_err());
    }
}
