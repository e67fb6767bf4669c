//! The connecting side of a link.
//!
//! A [`Peer`] dials hubs by address, authenticates under its configured
//! name, and keeps one session per hub name. With `auto_reconnect` on,
//! hubs it connected to are redialled after the session drops.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::PeerConfig;
use crate::crypto::PublicKey;
use crate::endpoint::Endpoint;
use crate::error::NetworkError;
use crate::handshake::{self, ConnectRequest};
use crate::message::InboundMessage;
use crate::reconnect::{self, Dialer, ReconnectBook, ReconnectTarget};
use crate::rpc::RpcHandler;
use crate::session::SessionInfo;

/// Identity a peer presents to every hub.
struct Credentials {
    name: String,
    secret: String,
}

pub struct Peer {
    config: PeerConfig,
    endpoint: Arc<Endpoint>,
    credentials: Arc<Credentials>,
    book: Arc<ReconnectBook>,
}

impl Peer {
    pub fn new(config: PeerConfig) -> Self {
        let endpoint = Endpoint::new(
            config.name.clone(),
            config.encryption,
            config.timings.clone(),
            config.report_handler_errors,
        );
        let credentials = Arc::new(Credentials {
            name: config.name.clone(),
            secret: config.secret.clone(),
        });
        let book = Arc::new(ReconnectBook::new(
            config.reconnect_whitelist.clone(),
            config.timings.backoff_step,
            config.timings.backoff_max,
        ));
        Self {
            config,
            endpoint,
            credentials,
            book,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.endpoint.is_running()
    }

    /// The peer's public key, if encryption is enabled.
    pub fn public_key(&self) -> Option<PublicKey> {
        self.endpoint.keys.as_ref().map(|k| k.public_key())
    }

    /// Start heartbeats, the RPC responder and, if enabled, the reconnect
    /// supervisor. Starting a running peer is a no-op.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.is_running() {
            return Ok(());
        }
        self.endpoint.start();

        if self.config.auto_reconnect {
            let book = Arc::clone(&self.book);
            let endpoint = Arc::clone(&self.endpoint);
            let dialer = self.dialer();
            let shutdown = self.endpoint.subscribe_shutdown();
            tokio::spawn(async move {
                reconnect::supervise(book, endpoint, dialer, shutdown).await;
            });
        }

        info!(
            "Peer '{}' started (encryption: {}, auto-reconnect: {})",
            self.config.name, self.config.encryption, self.config.auto_reconnect
        );
        Ok(())
    }

    /// Close every session and stop background tasks. Remembered hubs are
    /// kept, so a restarted peer resumes reconnecting to them.
    pub async fn stop(&mut self) {
        self.endpoint.stop().await;
        info!("Peer '{}' stopped", self.config.name);
    }

    /// Connect and authenticate to the hub at `address:port`, registering
    /// the session under `hub_name`.
    pub async fn connect(
        &self,
        hub_name: &str,
        address: &str,
        port: u16,
        password: &str,
    ) -> Result<(), NetworkError> {
        let target = ReconnectTarget {
            name: hub_name.to_string(),
            address: address.to_string(),
            port,
            password: password.to_string(),
        };
        dial(&self.endpoint, &self.credentials, target.clone()).await?;

        if self.config.auto_reconnect {
            self.book.remember(target);
        }
        Ok(())
    }

    fn dialer(&self) -> Dialer {
        let endpoint = Arc::clone(&self.endpoint);
        let credentials = Arc::clone(&self.credentials);
        Arc::new(move |target| {
            let endpoint = Arc::clone(&endpoint);
            let credentials = Arc::clone(&credentials);
            async move { dial(&endpoint, &credentials, target).await }.boxed()
        })
    }

    pub async fn send(&self, hub: &str, payload: &Value) -> Result<(), NetworkError> {
        self.endpoint.send(hub, payload).await
    }

    /// Invoke `operation` on `hub` and wait up to `timeout` for the result.
    pub async fn call(
        &self,
        hub: &str,
        operation: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, NetworkError> {
        self.endpoint.call(hub, operation, payload, timeout).await
    }

    pub fn register_handler(&self, operation: impl Into<String>, handler: RpcHandler) {
        self.endpoint.register_handler(operation, handler);
    }

    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.endpoint.set_disconnect_callback(Arc::new(callback));
    }

    pub async fn recv(&self) -> Option<InboundMessage> {
        self.endpoint.recv().await
    }

    pub fn try_recv(&self) -> Option<InboundMessage> {
        self.endpoint.try_recv()
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.endpoint.registry.names().into_iter().collect()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.endpoint.sessions()
    }

    /// Close the session with `hub`. The hub stays remembered, so the
    /// supervisor will dial it again.
    pub async fn disconnect(&self, hub: &str) -> Result<(), NetworkError> {
        self.endpoint.disconnect(hub).await
    }

    /// Stop reconnecting to `hub`.
    pub fn forget(&self, hub: &str) -> bool {
        self.book.forget(hub)
    }

    /// Current backoff before the next reconnect attempt to `hub`, or `None`
    /// if the hub is not remembered. Zero while the link is healthy.
    pub fn reconnect_delay(&self, hub: &str) -> Option<Duration> {
        self.book.delay(hub)
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.endpoint.halt();
    }
}

/// TCP connect plus handshake, bounded by `connection_timeout`, then
/// register the session.
async fn dial(
    endpoint: &Arc<Endpoint>,
    credentials: &Credentials,
    target: ReconnectTarget,
) -> Result<(), NetworkError> {
    endpoint.ensure_running()?;
    if endpoint.registry.contains(&target.name) {
        return Err(NetworkError::AlreadyConnected(target.name));
    }

    let timeout = endpoint.timings.connection_timeout;
    let request = ConnectRequest {
        keys: endpoint.keys.as_ref(),
        name: &credentials.name,
        secret: &credentials.secret,
        password: &target.password,
        max_frame_len: endpoint.timings.max_frame_len,
    };
    let attempt = async {
        let stream = TcpStream::connect((target.address.as_str(), target.port))
            .await
            .map_err(|e| {
                NetworkError::Transport(format!(
                    "Cannot reach {}:{}: {e}",
                    target.address, target.port
                ))
            })?;
        let remote = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let link = handshake::connect(reader, writer, &request).await?;
        Ok::<_, NetworkError>((remote, link))
    };

    let (remote, link) = tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| {
            NetworkError::Transport(format!(
                "Connecting to {}:{} timed out after {timeout:?}",
                target.address, target.port
            ))
        })??;

    debug!("Handshake with '{}' at {remote} complete", target.name);
    endpoint.establish(target.name, remote, link).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
