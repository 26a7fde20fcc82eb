//! Audit logging for filtering decisions.
//!
//! Every dispatch decision is logged with structured fields via `tracing`
//! on a dedicated target so operators can select the audit stream
//! independently of diagnostic logs.

use tracing::{debug, info};

/// Log a command forwarded to the controller.
pub fn log_allowed(policy: &str, client: &str, verb: &str, rewritten: bool) {
    info!(
        target: "onion_grater::audit",
        policy = policy,
        client = client,
        verb = verb,
        rewritten = rewritten,
        decision = "allow",
        "command allowed"
    );
}

/// Log a command rejected with `510 Command filtered`.
pub fn log_filtered(policy: &str, client: &str, line: &str) {
    info!(
        target: "onion_grater::audit",
        policy = policy,
        client = client,
        line = line,
        decision = "filter",
        "command filtered"
    );
}

/// Log a command that only passed because global filtering is disabled.
pub fn log_complain(policy: &str, client: &str, line: &str) {
    info!(
        target: "onion_grater::audit",
        policy = policy,
        client = client,
        line = line,
        decision = "complain",
        "command passed through (filtering disabled)"
    );
}

/// Log an event withheld from the client.
pub fn log_event_dropped(client: &str, kind: &str, reason: &str) {
    debug!(
        target: "onion_grater::audit",
        client = client,
        kind = kind,
        reason = reason,
        decision = "drop",
        "event dropped"
    );
}
