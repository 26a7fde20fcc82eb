//! Filtering proxy for the Tor control port.
//!
//! Unrestricted access to a Tor controller grants the holder substantial
//! power over the anonymity layer: enumerating circuits, opening streams,
//! reading configuration. This crate sits between cooperating local
//! applications and the real controller, authenticates upstream on their
//! behalf, identifies each client by OS-level attributes (AppArmor profile
//! and username for loopback peers, source IP for everyone else), and
//! relays only the commands, configuration accesses, and events the
//! client's policy permits — optionally rewriting arguments, responses,
//! and asynchronous events on the way through.
//!
//! The pieces:
//!
//! 1. **Policy** (`policy`, `rules`) - YAML policy files compiled once at
//!    startup into anchored-regex rule tables.
//! 2. **Identity** (`identity`) - loopback peer resolution via the
//!    kernel's TCP tables and `/proc/<pid>`.
//! 3. **Link** (`link`) - a resilient authenticated controller connection
//!    with event fan-out and one-shot reconnect recovery.
//! 4. **Session** (`session`, `server`) - the per-client protocol state
//!    machine tying the above together.

pub mod audit;
pub mod config;
pub mod error;
pub mod identity;
pub mod link;
pub mod policy;
pub mod rules;
pub mod server;
pub mod session;

pub use config::Config;
pub use error::{GraterError, Result};
pub use identity::ClientIdentity;
pub use policy::PolicyStore;
