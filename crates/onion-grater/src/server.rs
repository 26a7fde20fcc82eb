//! TCP listener and per-connection session dispatch.
//!
//! The server accepts connections, resolves each client's identity,
//! selects its policy, opens a controller connection on its behalf, and
//! runs one [`Session`] task per client. Identification failures and
//! ambiguous policy matches abort the connection before the client sees a
//! single byte.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{GraterError, Result};
use crate::identity;
use crate::link::ControllerLink;
use crate::policy::PolicyStore;
use crate::rules::CompiledRules;
use crate::session::Session;

/// Accept connections until the task is cancelled (process shutdown).
pub async fn run(config: Arc<Config>, store: Arc<PolicyStore>) -> Result<()> {
    let listener = bind(&config)?;
    info!(
        addr = %config.listen_socket(),
        policies = store.len(),
        complain = config.complain,
        "listening"
    );
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("accepted connection from {peer}");
                let config = Arc::clone(&config);
                let store = Arc::clone(&store);
                tokio::spawn(handle_connection(stream, config, store));
            }
            Err(e) => warn!("accept failed: {e}"),
        }
    }
}

/// Bind the listening socket with address reuse, so restarts across
/// `TIME_WAIT` succeed.
fn bind(config: &Config) -> Result<TcpListener> {
    let addr = config.listen_socket();
    let bind_err = |source: std::io::Error| GraterError::Bind {
        addr: addr.to_string(),
        source,
    };
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    socket.listen(128).map_err(bind_err)
}

async fn handle_connection(stream: TcpStream, config: Arc<Config>, store: Arc<PolicyStore>) {
    let (local_addr, remote_addr) = match (stream.local_addr(), stream.peer_addr()) {
        (Ok(local), Ok(remote)) => (local, remote),
        _ => return,
    };

    // The /proc walk is synchronous filesystem work.
    let identity =
        match tokio::task::spawn_blocking(move || identity::resolve(local_addr, remote_addr))
            .await
        {
            Ok(Ok(identity)) => identity,
            Ok(Err(e)) => {
                // Client died during the handshake; drop without a response.
                debug!("dropping connection from {remote_addr}: {e}");
                return;
            }
            Err(e) => {
                error!("identity task failed for {remote_addr}: {e}");
                return;
            }
        };

    let (policy_name, rules) = match store.select(&identity) {
        Ok(Some(policy)) => (policy.name.clone(), policy.rules()),
        Ok(None) => {
            info!(client = %identity, "no policy matches; all commands will be filtered");
            ("<none>".to_string(), Arc::new(CompiledRules::empty()))
        }
        Err(e) => {
            // Configuration error; abort silently, operators see the log.
            error!(client = %identity, "refusing session: {e}");
            return;
        }
    };

    let link = match ControllerLink::connect(config.controller_addr, &config.cookie_path).await {
        Ok(link) => link,
        Err(e) => {
            error!(client = %identity, "controller unavailable: {e}");
            return;
        }
    };

    let label = identity.to_string();
    let session = Session::new(stream, identity, policy_name, rules, link, config);
    match session.run().await {
        Ok(()) => debug!(client = %label, "session ended"),
        Err(GraterError::ClientDisconnect) => debug!(client = %label, "client disconnected"),
        Err(e) => warn!(client = %label, "session failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_enables_address_reuse() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        let config = Config {
            listen_port: 0,
            ..Config::default()
        };
        let first = bind(&config).unwrap();
        let bound = first.local_addr().unwrap();
        drop(first);
        // Rebinding the same port immediately must succeed.
        let again = bind(&Config {
            listen_port: bound.port(),
            ..Config::default()
        });
        assert!(again.is_ok());
    }

    #[test]
    fn test_bind_error_is_reported() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        let config = Config {
            // Binding a non-local address fails.
            listen_addr: "192.0.2.1".parse().unwrap(),
            listen_port: 0,
            ..Config::default()
        };
        let err = bind(&config).unwrap_err();
        assert!(matches!(err, GraterError::Bind { .. }));
    }
}
