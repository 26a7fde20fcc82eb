//! Error types for the onion-grater crate.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while filtering control-port traffic.
///
/// The variants map onto the failure classes the proxy distinguishes:
/// client-side problems keep the connection open, transport problems are
/// recovered once and then fatal to the session, configuration problems
/// abort the session before the client sees a single byte.
#[derive(Error, Debug)]
pub enum GraterError {
    #[error("listener bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("policy file {path}: {reason}")]
    PolicyParse { path: PathBuf, reason: String },

    #[error("invalid rule pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid replacement template {template:?}: {reason}")]
    Template { template: String, reason: String },

    #[error("{count} policies match client {client}; refusing session")]
    AmbiguousPolicy { client: String, count: usize },

    #[error("no local process owns the socket {addr}")]
    PeerNotFound { addr: String },

    #[error("interface {0} has no usable IPv4 address")]
    Interface(String),

    #[error("control cookie {path}: {source}")]
    Cookie {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("controller authentication failed: {0}")]
    Auth(String),

    #[error("controller connection lost: {0}")]
    Transport(String),

    #[error("malformed controller reply: {0}")]
    Protocol(String),

    #[error("client disconnected")]
    ClientDisconnect,

    #[error("rewrite of {line:?} failed: {reason}")]
    Rewrite { line: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, GraterError>;
