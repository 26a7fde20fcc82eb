//! Per-client protocol driver.
//!
//! A session owns the client socket, the compiled rule tables for the
//! matched policy, and its own authenticated [`ControllerLink`]. The main
//! loop selects over three sources: the next client line, the session's
//! event channel, and a liveness tick. All writes to the client socket
//! happen from this loop, so synchronous responses and event deliveries
//! are serialised and multi-line payloads are never split.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audit;
use crate::config::Config;
use crate::error::{GraterError, Result};
use crate::identity::ClientIdentity;
use crate::link::{ControlEvent, ControllerLink, ListenerHandle};
use crate::rules::{self, CompiledArgRule, CompiledRules, PlaceholderContext};

/// Upper bound on one client request line.
const MAX_LINE_BYTES: usize = 10 * 1024;

/// Stream event statuses that establish ownership.
const STREAM_OPENING: [&str; 2] = ["NEW", "NEWRESOLVE"];

/// Stream event statuses that end a stream's life.
const STREAM_CLOSING: [&str; 2] = ["FAILED", "CLOSED"];

/// Whether the request loop continues after a handled line.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// One accepted client connection being filtered.
pub struct Session {
    config: Arc<Config>,
    identity: ClientIdentity,
    client_label: String,
    policy_name: String,
    rules: Arc<CompiledRules>,
    restrict_streams: bool,
    filtering: bool,
    reader: LineReader,
    writer: OwnedWriteHalf,
    link: ControllerLink,
    link_generation: u64,
    events_tx: mpsc::UnboundedSender<ControlEvent>,
    events_rx: mpsc::UnboundedReceiver<ControlEvent>,
    /// Event kinds the client asked for and was granted.
    subscribed: HashSet<String>,
    /// Subset of `subscribed` actually forwarded (suppressed kinds are
    /// acknowledged but never delivered).
    delivered: HashSet<String>,
    /// Listeners currently registered at the controller, one per kind.
    installed: HashMap<String, ListenerHandle>,
    /// Stream id -> circuit id, for streams proven to originate from this
    /// client.
    owned_streams: HashMap<String, String>,
    /// Circuit id -> most recent CIRC event payload (`650 CIRC ` stripped).
    circuits: HashMap<String, String>,
    ctx: PlaceholderContext,
}

impl Session {
    /// Bind a session to an accepted client connection.
    ///
    /// `restrict-stream-events` is only honored for loopback and
    /// local-veth clients; for anyone else it is forced off.
    pub fn new(
        stream: TcpStream,
        identity: ClientIdentity,
        policy_name: String,
        rules: Arc<CompiledRules>,
        link: ControllerLink,
        config: Arc<Config>,
    ) -> Self {
        let restrict_streams = rules.restrict_stream_events
            && (identity.is_loopback() || config.is_local_veth(identity.remote_addr.ip()));
        let ctx = PlaceholderContext {
            client_address: identity.remote_addr.ip().to_string(),
            client_port: identity.remote_addr.port().to_string(),
            server_address: identity.local_addr.ip().to_string(),
            server_port: identity.local_addr.port().to_string(),
        };
        let (read_half, write_half) = stream.into_split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link_generation = link.generation();
        Self {
            filtering: !config.complain,
            config,
            client_label: identity.to_string(),
            identity,
            policy_name,
            rules,
            restrict_streams,
            reader: LineReader::new(read_half),
            writer: write_half,
            link,
            link_generation,
            events_tx,
            events_rx,
            subscribed: HashSet::new(),
            delivered: HashSet::new(),
            installed: HashMap::new(),
            owned_streams: HashMap::new(),
            circuits: HashMap::new(),
            ctx,
        }
    }

    /// Drive the session to completion and tear down listeners.
    pub async fn run(mut self) -> Result<()> {
        info!(
            client = %self.client_label,
            policy = %self.policy_name,
            "session started"
        );
        let result = match self.install_tracking_listeners().await {
            Ok(()) => self.drive().await,
            Err(e) => Err(e),
        };
        self.teardown().await;
        result
    }

    /// While stream scoping is active the session watches STREAM and CIRC
    /// events for itself, independent of what the client subscribes to.
    async fn install_tracking_listeners(&mut self) -> Result<()> {
        if self.restrict_streams {
            self.ensure_installed("STREAM").await?;
            self.ensure_installed("CIRC").await?;
        }
        Ok(())
    }

    async fn drive(&mut self) -> Result<()> {
        let period = self.config.ping_interval;
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            enum Step {
                Client(ClientLine),
                Event(Option<ControlEvent>),
                Ping,
            }
            let step = tokio::select! {
                line = self.reader.next_line() => Step::Client(line?),
                event = self.events_rx.recv() => Step::Event(event),
                _ = ping.tick() => Step::Ping,
            };
            match step {
                Step::Client(ClientLine::Eof) => return Err(GraterError::ClientDisconnect),
                Step::Client(ClientLine::TooLong) => {
                    warn!(client = %self.client_label, "request line over {MAX_LINE_BYTES} bytes, skipped");
                }
                Step::Client(ClientLine::Line(bytes)) => {
                    if self.handle_client_line(bytes).await? == Flow::Quit {
                        return Ok(());
                    }
                }
                Step::Event(Some(event)) => self.handle_event(event).await?,
                Step::Event(None) => {}
                Step::Ping => self.check_controller().await?,
            }
        }
    }

    /// Liveness tick: reconnect a dead controller connection and re-install
    /// subscriptions after any recovery.
    async fn check_controller(&mut self) -> Result<()> {
        self.link.ensure_alive().await?;
        self.resync_subscriptions().await
    }

    /// After a link recovery the controller has forgotten every
    /// subscription; re-install the ones this session remembers.
    async fn resync_subscriptions(&mut self) -> Result<()> {
        if self.link.generation() == self.link_generation {
            return Ok(());
        }
        self.link_generation = self.link.generation();
        info!(client = %self.client_label, "re-installing event subscriptions after reconnect");
        self.installed.clear();
        self.install_tracking_listeners().await?;
        let delivered: Vec<String> = self.delivered.iter().cloned().collect();
        for name in delivered {
            self.ensure_installed(&name).await?;
        }
        Ok(())
    }

    async fn ensure_installed(&mut self, name: &str) -> Result<()> {
        if self.installed.contains_key(name) {
            return Ok(());
        }
        let handle = self.link.add_listener(name, self.events_tx.clone()).await?;
        self.installed.insert(name.to_string(), handle);
        Ok(())
    }

    async fn teardown(&mut self) {
        let handles: Vec<ListenerHandle> = self.installed.drain().map(|(_, h)| h).collect();
        for handle in handles {
            self.link.remove_listener(&handle).await;
        }
        debug!(client = %self.client_label, "session closed");
    }

    // ------------------------------------------------------------------
    // Client requests
    // ------------------------------------------------------------------

    async fn handle_client_line(&mut self, bytes: Vec<u8>) -> Result<Flow> {
        let Ok(text) = String::from_utf8(bytes) else {
            warn!(client = %self.client_label, "request is not valid UTF-8, skipped");
            return Ok(Flow::Continue);
        };
        let line = text.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(Flow::Continue);
        }
        debug!(client = %self.client_label, request = line, "client request");

        let (verb_raw, sep, args) = split_line(line);
        let verb = verb_raw.to_uppercase();
        match verb.as_str() {
            "PROTOCOLINFO" => {
                let version = self.link.server_version().to_string();
                self.write_raw(format!(
                    "250-PROTOCOLINFO 1\r\n250-AUTH METHODS=NULL\r\n250-VERSION Tor=\"{version}\"\r\n250 OK\r\n"
                ))
                .await?;
                Ok(Flow::Continue)
            }
            // The proxy authenticates on the client's behalf; these are
            // acknowledged without consulting the controller.
            "AUTHENTICATE" | "TAKEOWNERSHIP" | "RESETCONF" => {
                self.write_raw("250 OK\r\n").await?;
                Ok(Flow::Continue)
            }
            "QUIT" => {
                self.write_raw("250 closing connection\r\n").await?;
                Ok(Flow::Quit)
            }
            "SETEVENTS" => self.handle_setevents(args).await,
            _ => self.handle_command(&verb, verb_raw, sep, args, line).await,
        }
    }

    async fn handle_command(
        &mut self,
        verb: &str,
        verb_raw: &str,
        sep: &str,
        args: &str,
        line: &str,
    ) -> Result<Flow> {
        let rules = Arc::clone(&self.rules);
        let (rule, complain_pass) = match rules.lookup(verb, args) {
            Some(rule) => (rule, false),
            None if !self.filtering => (&*PASS_THROUGH_RULE, true),
            None => {
                audit::log_filtered(&self.policy_name, &self.client_label, line);
                self.write_raw("510 Command filtered\r\n").await?;
                return Ok(Flow::Continue);
            }
        };

        // Argument rewrite; the separator is kept verbatim so unchanged
        // lines round-trip byte-exact. A template failure here is a bug in
        // the rule set and fatal to the session.
        let outbound = match rule.rewrite_args(args, &self.ctx)? {
            Some(rewritten_args) => format!("{verb_raw}{sep}{rewritten_args}"),
            None => line.to_string(),
        };
        let rewritten = outbound != line;
        if complain_pass {
            audit::log_complain(&self.policy_name, &self.client_label, line);
        } else {
            audit::log_allowed(&self.policy_name, &self.client_label, verb, rewritten);
        }

        // Stream-scoped clients get a circuit list synthesised from their
        // own streams; the controller's answer is discarded.
        if self.restrict_streams && verb == "GETINFO" && args == "circuit-status" {
            let _ = self.link.request(&outbound).await?;
            self.resync_subscriptions().await?;
            let synthesised = self.synthesise_circuit_status();
            let lines = if rule.response_rewrites().is_empty() {
                synthesised
            } else {
                rules::rewrite_lines(&synthesised, rule.response_rewrites(), &self.ctx)?
            };
            let rendered = render_lines(&lines);
            debug!(client = %self.client_label, response = %rendered, "synthesised circuit-status");
            self.write_raw(rendered).await?;
            return Ok(Flow::Continue);
        }

        let reply = self.link.request(&outbound).await?;
        self.resync_subscriptions().await?;
        let rendered = if rule.response_rewrites().is_empty() {
            reply.render()
        } else {
            render_lines(&rules::rewrite_lines(
                &reply.lines,
                rule.response_rewrites(),
                &self.ctx,
            )?)
        };
        debug!(client = %self.client_label, response = %rendered, "controller response");
        self.write_raw(rendered).await?;
        Ok(Flow::Continue)
    }

    // ------------------------------------------------------------------
    // Event subscriptions
    // ------------------------------------------------------------------

    async fn handle_setevents(&mut self, args: &str) -> Result<Flow> {
        let rules = Arc::clone(&self.rules);
        let requested: Vec<String> = args
            .split_whitespace()
            .map(str::to_uppercase)
            .collect();

        if self.filtering {
            if let Some(denied) = requested
                .iter()
                .find(|name| !rules.allowed_events.contains_key(*name))
            {
                audit::log_filtered(
                    &self.policy_name,
                    &self.client_label,
                    &format!("SETEVENTS {denied}"),
                );
                self.write_raw("510 Command filtered\r\n").await?;
                return Ok(Flow::Continue);
            }
        }

        let desired: HashSet<String> = requested.into_iter().collect();
        let mut delivered = HashSet::new();
        for name in &desired {
            let suppressed = self.filtering
                && rules
                    .allowed_events
                    .get(name)
                    .is_some_and(|rule| rule.suppress);
            if !suppressed {
                delivered.insert(name.clone());
            }
        }
        self.subscribed = desired;
        self.delivered = delivered;

        self.reconcile_listeners().await?;
        debug!(
            client = %self.client_label,
            granted = self.subscribed.len(),
            forwarded = self.delivered.len(),
            "subscriptions updated"
        );
        self.write_raw("250 OK\r\n").await?;
        Ok(Flow::Continue)
    }

    /// Converge the installed listener set on what the session needs:
    /// every delivered subscription plus the internal tracking kinds.
    async fn reconcile_listeners(&mut self) -> Result<()> {
        let mut needed: HashSet<String> = self.delivered.clone();
        if self.restrict_streams {
            needed.insert("STREAM".to_string());
            needed.insert("CIRC".to_string());
        }

        let stale: Vec<String> = self
            .installed
            .keys()
            .filter(|name| !needed.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(handle) = self.installed.remove(&name) {
                self.link.remove_listener(&handle).await;
            }
        }
        for name in needed {
            self.ensure_installed(&name).await?;
        }
        self.resync_subscriptions().await
    }

    // ------------------------------------------------------------------
    // Event delivery
    // ------------------------------------------------------------------

    async fn handle_event(&mut self, event: ControlEvent) -> Result<()> {
        match event.kind.as_str() {
            "CIRC" => {
                self.track_circuit(&event);
                if self.delivered.contains("CIRC") {
                    self.forward_event(&event).await?;
                }
            }
            "STREAM" if self.restrict_streams => {
                if self.track_stream_ownership(&event) {
                    if self.delivered.contains("STREAM") {
                        self.forward_event(&event).await?;
                    }
                } else {
                    audit::log_event_dropped(
                        &self.client_label,
                        "STREAM",
                        "stream not owned by client",
                    );
                }
            }
            kind => {
                if self.delivered.contains(kind) {
                    self.forward_event(&event).await?;
                }
            }
        }
        Ok(())
    }

    /// Remember the latest CIRC payload per circuit for circuit-status
    /// synthesis.
    fn track_circuit(&mut self, event: &ControlEvent) {
        let Some(first) = event.lines.first() else {
            return;
        };
        let Some(payload) = first.strip_prefix("650 CIRC ") else {
            return;
        };
        let Some(circuit_id) = payload.split_whitespace().next() else {
            return;
        };
        self.circuits
            .insert(circuit_id.to_string(), payload.to_string());
    }

    /// Ownership gate for stream events. A stream becomes owned when it is
    /// first seen opening with a source address equal to the client's own
    /// socket; PID-based attribution is deliberately not used.
    fn track_stream_ownership(&mut self, event: &ControlEvent) -> bool {
        let Some(stream) = event.lines.first().and_then(|l| StreamEvent::parse(l)) else {
            debug!(client = %self.client_label, "unparseable STREAM event dropped");
            return false;
        };
        if self.owned_streams.contains_key(stream.id) {
            if STREAM_CLOSING.contains(&stream.status) {
                self.owned_streams.remove(stream.id);
            } else {
                self.owned_streams
                    .insert(stream.id.to_string(), stream.circuit.to_string());
            }
            return true;
        }
        if STREAM_OPENING.contains(&stream.status)
            && stream.source_addr == Some(self.identity.remote_addr)
        {
            self.owned_streams
                .insert(stream.id.to_string(), stream.circuit.to_string());
            return true;
        }
        false
    }

    async fn forward_event(&mut self, event: &ControlEvent) -> Result<()> {
        let rules = Arc::clone(&self.rules);
        let rewrites = rules
            .allowed_events
            .get(&event.kind)
            .map(|rule| rule.response.as_slice())
            .unwrap_or(&[]);
        let lines = if rewrites.is_empty() {
            event.lines.clone()
        } else {
            rules::rewrite_lines(&event.lines, rewrites, &self.ctx)?
        };
        // A rewrite may empty a payload out entirely; nothing is sent then.
        let lines: Vec<&String> = lines.iter().filter(|l| !l.is_empty()).collect();
        if lines.is_empty() {
            return Ok(());
        }
        let mut out = String::new();
        for line in lines {
            out.push_str(line);
            out.push_str("\r\n");
        }
        self.write_raw(out).await
    }

    /// Render `GETINFO circuit-status` from the circuits of this client's
    /// owned streams.
    fn synthesise_circuit_status(&self) -> Vec<String> {
        let mut circuit_ids: Vec<&String> = self.owned_streams.values().collect();
        circuit_ids.sort();
        circuit_ids.dedup();

        let body: Vec<String> = circuit_ids
            .iter()
            .filter_map(|id| self.circuits.get(*id))
            .cloned()
            .collect();
        if body.is_empty() {
            return vec!["250 OK".to_string()];
        }
        let mut lines = vec!["250+circuit-status=".to_string()];
        lines.extend(body);
        lines.push(".".to_string());
        lines.push("250 OK".to_string());
        lines
    }

    async fn write_raw(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        self.writer
            .write_all(data.as_ref())
            .await
            .map_err(|_| GraterError::ClientDisconnect)
    }
}

/// The complain-mode fallback: matches anything, rewrites nothing.
static PASS_THROUGH_RULE: std::sync::LazyLock<CompiledArgRule> =
    std::sync::LazyLock::new(CompiledArgRule::pass_through);

/// Split a request line into verb, separator whitespace, and argument
/// string, all verbatim slices of the input.
fn split_line(line: &str) -> (&str, &str, &str) {
    let verb_end = line
        .find(|c: char| c.is_ascii_whitespace())
        .unwrap_or(line.len());
    let (verb, rest) = line.split_at(verb_end);
    let args_start = rest.len() - rest.trim_start().len();
    let (sep, args) = rest.split_at(args_start);
    (verb, sep, args)
}

/// Join reply lines back into wire form.
fn render_lines(lines: &[String]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

/// Parsed fields of a `650 STREAM` event line.
struct StreamEvent<'a> {
    id: &'a str,
    status: &'a str,
    circuit: &'a str,
    source_addr: Option<SocketAddr>,
}

impl<'a> StreamEvent<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let payload = line.strip_prefix("650 STREAM ")?;
        let mut tokens = payload.split_whitespace();
        let id = tokens.next()?;
        let status = tokens.next()?;
        let circuit = tokens.next()?;
        let _target = tokens.next()?;
        let source_addr = tokens
            .filter_map(|t| t.strip_prefix("SOURCE_ADDR="))
            .find_map(|v| v.parse().ok());
        Some(Self {
            id,
            status,
            circuit,
            source_addr,
        })
    }
}

/// Cancel-safe bounded line reader over the client socket.
///
/// Bytes are only consumed from the underlying buffer once inspected, so a
/// cancelled read (the session loop selecting another branch) never loses
/// data. Lines over [`MAX_LINE_BYTES`] are discarded through their
/// terminating newline and reported as [`ClientLine::TooLong`].
struct LineReader {
    inner: BufReader<OwnedReadHalf>,
    pending: Vec<u8>,
    overflowing: bool,
}

enum ClientLine {
    /// A complete line including its newline terminator.
    Line(Vec<u8>),
    TooLong,
    Eof,
}

impl LineReader {
    fn new(read_half: OwnedReadHalf) -> Self {
        Self {
            inner: BufReader::new(read_half),
            pending: Vec::new(),
            overflowing: false,
        }
    }

    async fn next_line(&mut self) -> Result<ClientLine> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(ClientLine::Eof);
            }
            if let Some(pos) = available.iter().position(|&b| b == b'\n') {
                let overflowed =
                    self.overflowing || self.pending.len() + pos + 1 > MAX_LINE_BYTES;
                if overflowed {
                    self.inner.consume(pos + 1);
                    self.pending.clear();
                    self.overflowing = false;
                    return Ok(ClientLine::TooLong);
                }
                self.pending.extend_from_slice(&available[..=pos]);
                self.inner.consume(pos + 1);
                return Ok(ClientLine::Line(std::mem::take(&mut self.pending)));
            }
            let chunk_len = available.len();
            if !self.overflowing {
                self.pending.extend_from_slice(available);
                if self.pending.len() > MAX_LINE_BYTES {
                    self.pending.clear();
                    self.overflowing = true;
                }
            }
            self.inner.consume(chunk_len);
        }
    }
}
