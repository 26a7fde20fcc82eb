//! Resilient connection to the real controller.
//!
//! [`ControllerLink`] owns a single authenticated TCP connection. A reader
//! task splits the inbound stream into reply blocks and asynchronous `650`
//! events; replies are handed to the (single, serialised) requester, events
//! are fanned out to registered listener sinks.
//!
//! Failure handling: a request or listener registration that dies with the
//! transport triggers exactly one reconnect + re-authentication and one
//! retry; a second failure propagates. Listener registrations do not
//! survive a reconnect — the session re-installs the subscriptions it
//! remembers after observing the link's generation counter change.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{GraterError, Result};

/// Failed connection attempts before the 1-second backoff kicks in.
const BACKOFF_AFTER_ATTEMPTS: u32 = 3;

/// Backoff between connection attempts once it applies.
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// One complete reply block from the controller, line-per-entry without
/// the CRLF terminators. Data blocks (`+` replies) keep their payload and
/// `.` terminator lines verbatim, so rendering reproduces the wire bytes
/// exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<String>,
}

impl Reply {
    /// Status code of the final line.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.lines.last()?.get(..3)?.parse().ok()
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status() == Some(250)
    }

    /// Wire form: CRLF-terminated lines.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push_str("\r\n");
        }
        out
    }
}

/// An asynchronous event received from the controller.
#[derive(Debug, Clone)]
pub struct ControlEvent {
    /// Upper-cased event name (`STREAM`, `CIRC`, ...).
    pub kind: String,
    /// Raw event lines, CRLF stripped.
    pub lines: Vec<String>,
}

/// Receiving half given to the link for each subscription.
pub type EventSink = mpsc::UnboundedSender<ControlEvent>;

/// Handle for deregistering a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerHandle {
    name: String,
    id: u64,
}

impl ListenerHandle {
    /// Event name this handle subscribes to.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.name
    }
}

type Listeners = Arc<Mutex<HashMap<String, Vec<(u64, EventSink)>>>>;

/// The authenticated controller connection with recovery.
pub struct ControllerLink {
    addr: SocketAddr,
    cookie_path: PathBuf,
    server_version: String,
    conn: Connection,
    listeners: Listeners,
    next_listener: u64,
    generation: u64,
}

impl ControllerLink {
    /// Connect and authenticate, retrying transport failures until the
    /// controller accepts. The backoff starts at the fourth attempt.
    /// Non-transport failures (unreadable cookie, rejected authentication)
    /// propagate immediately.
    pub async fn connect(addr: SocketAddr, cookie_path: &Path) -> Result<Self> {
        let listeners: Listeners = Arc::new(Mutex::new(HashMap::new()));
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match Self::open(addr, cookie_path, Arc::clone(&listeners)).await {
                Ok((conn, server_version)) => {
                    return Ok(Self {
                        addr,
                        cookie_path: cookie_path.to_path_buf(),
                        server_version,
                        conn,
                        listeners,
                        next_listener: 0,
                        generation: 0,
                    });
                }
                Err(GraterError::Transport(reason)) => {
                    debug!("controller connection attempt {attempt} failed: {reason}");
                    if attempt >= BACKOFF_AFTER_ATTEMPTS {
                        tokio::time::sleep(CONNECT_BACKOFF).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// One connection + authentication attempt.
    async fn open(
        addr: SocketAddr,
        cookie_path: &Path,
        listeners: Listeners,
    ) -> Result<(Connection, String)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| GraterError::Transport(format!("connect {addr}: {e}")))?;
        let (read_half, write_half) = stream.into_split();

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let dead = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(reader_loop(
            BufReader::new(read_half),
            reply_tx,
            listeners,
            Arc::clone(&dead),
        ));
        let mut conn = Connection {
            writer: write_half,
            replies: reply_rx,
            reader,
            dead,
        };

        let server_version = authenticate(&mut conn, cookie_path).await?;
        Ok((conn, server_version))
    }

    /// Send one command and await its reply. A transport failure is
    /// recovered once (reconnect + re-authenticate) and the command
    /// retried exactly once.
    pub async fn request(&mut self, line: &str) -> Result<Reply> {
        match self.conn.request(line).await {
            Err(GraterError::Transport(reason)) => {
                warn!("controller request failed ({reason}); reconnecting");
                self.reconnect().await?;
                self.conn.request(line).await
            }
            other => other,
        }
    }

    /// Whether the transport is still usable.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.conn.dead.load(Ordering::SeqCst)
    }

    /// Reconnect if the transport has died. Used by the liveness tick.
    pub async fn ensure_alive(&mut self) -> Result<()> {
        if self.is_alive() {
            return Ok(());
        }
        warn!("controller connection stale; reconnecting");
        self.reconnect().await
    }

    /// Replace the connection with a freshly authenticated one.
    ///
    /// Listener registrations are forgotten: subscription intent lives
    /// with the session, which re-installs after seeing the generation
    /// counter change.
    async fn reconnect(&mut self) -> Result<()> {
        self.listeners
            .lock()
            .expect("listener registry lock")
            .clear();
        let (conn, server_version) =
            Self::open(self.addr, &self.cookie_path, Arc::clone(&self.listeners)).await?;
        self.conn = conn;
        self.server_version = server_version;
        self.generation += 1;
        debug!(generation = self.generation, "controller connection re-established");
        Ok(())
    }

    /// Monotonic reconnect counter.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Version string the controller reported during authentication.
    #[must_use]
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Register a sink for an event kind. The controller-side `SETEVENTS`
    /// is only re-issued when the set of registered kinds changes.
    pub async fn add_listener(&mut self, event: &str, sink: EventSink) -> Result<ListenerHandle> {
        let name = event.to_uppercase();
        self.next_listener += 1;
        let handle = ListenerHandle {
            name: name.clone(),
            id: self.next_listener,
        };

        let newly_registered = {
            let mut listeners = self.listeners.lock().expect("listener registry lock");
            let sinks = listeners.entry(name).or_default();
            sinks.push((handle.id, sink));
            sinks.len() == 1
        };
        if newly_registered {
            if let Err(e) = self.sync_events().await {
                let mut listeners = self.listeners.lock().expect("listener registry lock");
                if let Some(sinks) = listeners.get_mut(&handle.name) {
                    sinks.retain(|(id, _)| *id != handle.id);
                    if sinks.is_empty() {
                        listeners.remove(&handle.name);
                    }
                }
                return Err(e);
            }
        }
        Ok(handle)
    }

    /// Deregister a listener. Idempotent on transport failure: the local
    /// registration is removed either way and the controller converges on
    /// the next `SETEVENTS`.
    pub async fn remove_listener(&mut self, handle: &ListenerHandle) {
        let emptied = {
            let mut listeners = self.listeners.lock().expect("listener registry lock");
            match listeners.get_mut(&handle.name) {
                Some(sinks) => {
                    sinks.retain(|(id, _)| *id != handle.id);
                    let emptied = sinks.is_empty();
                    if emptied {
                        listeners.remove(&handle.name);
                    }
                    emptied
                }
                None => false,
            }
        };
        if emptied {
            if let Err(e) = self.sync_events().await {
                warn!("deregistering {} listener: {e}", handle.name);
            }
        }
    }

    /// Issue `SETEVENTS` with the union of registered event kinds.
    async fn sync_events(&mut self) -> Result<()> {
        let mut names: Vec<String> = {
            let listeners = self.listeners.lock().expect("listener registry lock");
            listeners.keys().cloned().collect()
        };
        names.sort();
        let line = if names.is_empty() {
            "SETEVENTS".to_string()
        } else {
            format!("SETEVENTS {}", names.join(" "))
        };
        let reply = self.request(&line).await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(GraterError::Protocol(format!(
                "controller rejected {line:?}: {}",
                reply.lines.last().map(String::as_str).unwrap_or("")
            )))
        }
    }
}

/// One live connection: writer half plus the reader task feeding replies.
#[derive(Debug)]
struct Connection {
    writer: OwnedWriteHalf,
    replies: mpsc::UnboundedReceiver<Reply>,
    reader: JoinHandle<()>,
    dead: Arc<AtomicBool>,
}

impl Connection {
    async fn request(&mut self, line: &str) -> Result<Reply> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(GraterError::Transport("connection closed".to_string()));
        }
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .map_err(|e| GraterError::Transport(e.to_string()))?;
        self.replies
            .recv()
            .await
            .ok_or_else(|| GraterError::Transport("controller closed the connection".to_string()))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Authenticate with the cookie-file protocol. `PROTOCOLINFO` doubles as
/// the source of the controller's version string.
async fn authenticate(conn: &mut Connection, cookie_path: &Path) -> Result<String> {
    let reply = conn.request("PROTOCOLINFO 1").await?;
    if !reply.is_ok() {
        return Err(GraterError::Auth(format!(
            "PROTOCOLINFO failed: {}",
            reply.lines.last().map(String::as_str).unwrap_or("")
        )));
    }
    let version = protocolinfo_version(&reply).unwrap_or_default();

    let cookie = tokio::fs::read(cookie_path)
        .await
        .map_err(|source| GraterError::Cookie {
            path: cookie_path.to_path_buf(),
            source,
        })?;
    let reply = conn
        .request(&format!("AUTHENTICATE {}", hex::encode(cookie)))
        .await?;
    if !reply.is_ok() {
        return Err(GraterError::Auth(
            reply
                .lines
                .last()
                .map(String::as_str)
                .unwrap_or("empty reply")
                .to_string(),
        ));
    }
    Ok(version)
}

/// Extract the quoted version from a `250-VERSION Tor="..."` line.
fn protocolinfo_version(reply: &Reply) -> Option<String> {
    for line in &reply.lines {
        let rest = line.get(4..)?;
        if let Some(tail) = rest.strip_prefix("VERSION Tor=\"") {
            return tail.split('"').next().map(str::to_string);
        }
    }
    None
}

/// Read reply blocks and events until the transport dies.
async fn reader_loop(
    mut reader: BufReader<OwnedReadHalf>,
    replies: mpsc::UnboundedSender<Reply>,
    listeners: Listeners,
    dead: Arc<AtomicBool>,
) {
    loop {
        match read_block(&mut reader).await {
            Ok(Some(block)) => {
                let code = block
                    .lines
                    .first()
                    .and_then(|l| l.get(..3))
                    .and_then(|c| c.parse::<u16>().ok());
                if code.is_some_and(|c| (600..700).contains(&c)) {
                    dispatch_event(block, &listeners);
                } else if replies.send(block).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("controller closed the connection");
                break;
            }
            Err(e) => {
                debug!("controller read error: {e}");
                break;
            }
        }
    }
    dead.store(true, Ordering::SeqCst);
}

/// Fan an event block out to the sinks registered for its kind. Sinks
/// whose receiver is gone are pruned.
fn dispatch_event(block: Reply, listeners: &Listeners) {
    let Some(first) = block.lines.first() else {
        return;
    };
    let kind = first
        .get(4..)
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap_or("")
        .to_uppercase();
    let event = ControlEvent {
        kind: kind.clone(),
        lines: block.lines,
    };

    let mut listeners = listeners.lock().expect("listener registry lock");
    if let Some(sinks) = listeners.get_mut(&kind) {
        sinks.retain(|(_, sink)| sink.send(event.clone()).is_ok());
        if sinks.is_empty() {
            listeners.remove(&kind);
        }
    }
}

/// Read one complete reply block: `-` continuation lines, `+` data blocks
/// kept verbatim through their `.` terminator, ended by the final
/// space-separated status line. `None` on a clean EOF between blocks.
async fn read_block<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Reply>> {
    let mut lines: Vec<String> = Vec::new();
    loop {
        let Some(line) = read_crlf_line(reader).await? else {
            return if lines.is_empty() {
                Ok(None)
            } else {
                Err(GraterError::Protocol("EOF inside a reply".to_string()))
            };
        };
        if line.len() < 4 || !line.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
            return Err(GraterError::Protocol(format!("bad reply line {line:?}")));
        }
        let sep = line.as_bytes()[3];
        lines.push(line);
        match sep {
            b'-' => {}
            b'+' => loop {
                let Some(data_line) = read_crlf_line(reader).await? else {
                    return Err(GraterError::Protocol("EOF inside a data block".to_string()));
                };
                let done = data_line == ".";
                lines.push(data_line);
                if done {
                    break;
                }
            },
            b' ' => return Ok(Some(Reply { lines })),
            other => {
                return Err(GraterError::Protocol(format!(
                    "bad reply separator {:?}",
                    other as char
                )))
            }
        }
    }
}

/// One line, CRLF stripped; `None` on EOF.
async fn read_crlf_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let n = reader
        .read_until(b'\n', &mut buf)
        .await
        .map_err(|e| GraterError::Transport(e.to_string()))?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}
