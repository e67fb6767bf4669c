//! The accepting side of a link.
//!
//! A [`Hub`] listens on TCP, runs the handshake for each inbound
//! connection, and keeps one session per authenticated peer name. Failed
//! handshakes count against the remote address; an address that fails
//! `failure_threshold` times is refused at accept from then on.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::access::AccessControl;
use crate::config::HubConfig;
use crate::credentials::{CredentialStore, CredentialTable};
use crate::crypto::PublicKey;
use crate::endpoint::Endpoint;
use crate::error::NetworkError;
use crate::handshake::{self, AcceptPolicy};
use crate::liveness::{self, HandshakeTracker};
use crate::message::InboundMessage;
use crate::rpc::RpcHandler;
use crate::session::SessionInfo;

/// State shared by the accept loop and its handshake tasks.
struct AcceptContext {
    endpoint: Arc<Endpoint>,
    access: Arc<AccessControl>,
    credentials: Option<Arc<dyn CredentialStore>>,
    handshakes: Arc<HandshakeTracker>,
    password: String,
}

pub struct Hub {
    config: HubConfig,
    endpoint: Arc<Endpoint>,
    access: Arc<AccessControl>,
    credentials: Option<Arc<dyn CredentialStore>>,
    handshakes: Arc<HandshakeTracker>,
    local_addr: Option<SocketAddr>,
}

impl Hub {
    /// Build a hub from its config. Generates the keypair when encryption
    /// is enabled and loads `credentials_file` if one is configured.
    pub fn new(config: HubConfig) -> Result<Self, NetworkError> {
        let credentials = match &config.credentials_file {
            Some(path) => {
                let table = CredentialTable::load(path)?;
                info!("Loaded {} credential(s) from {}", table.len(), path.display());
                Some(Arc::new(table) as Arc<dyn CredentialStore>)
            }
            None => None,
        };

        let endpoint = Endpoint::new(
            config.name.clone(),
            config.encryption,
            config.timings.clone(),
            config.report_handler_errors,
        );
        let access = Arc::new(AccessControl::new(
            config.failure_threshold,
            config.blacklist.iter().copied(),
        ));
        let handshakes = Arc::new(HandshakeTracker::new(config.timings.handshake_grace));

        Ok(Self {
            config,
            endpoint,
            access,
            credentials,
            handshakes,
            local_addr: None,
        })
    }

    /// Use `store` for per-user login checks instead of the configured file.
    pub fn with_credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.endpoint.is_running()
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The hub's public key, if encryption is enabled.
    pub fn public_key(&self) -> Option<PublicKey> {
        self.endpoint.keys.as_ref().map(|k| k.public_key())
    }

    /// Bind the listener and start accepting. Returns the bound address.
    /// Starting a running hub is a no-op.
    pub async fn start(&mut self) -> Result<SocketAddr, NetworkError> {
        if self.is_running()
            && let Some(addr) = self.local_addr
        {
            return Ok(addr);
        }

        let bind = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| NetworkError::Transport(format!("Cannot bind {bind}: {e}")))?;
        let addr = listener.local_addr()?;
        self.local_addr = Some(addr);

        self.endpoint.start();

        let context = Arc::new(AcceptContext {
            endpoint: Arc::clone(&self.endpoint),
            access: Arc::clone(&self.access),
            credentials: self.credentials.clone(),
            handshakes: Arc::clone(&self.handshakes),
            password: self.config.password.clone(),
        });
        let shutdown = self.endpoint.subscribe_shutdown();
        tokio::spawn(async move {
            accept_loop(listener, context, shutdown).await;
        });

        let tracker = Arc::clone(&self.handshakes);
        let reap_interval = self.config.timings.reap_interval;
        let shutdown = self.endpoint.subscribe_shutdown();
        tokio::spawn(async move {
            liveness::reaper_loop(tracker, reap_interval, shutdown).await;
        });

        info!(
            "Hub '{}' listening on {addr} (encryption: {})",
            self.config.name, self.config.encryption
        );
        Ok(addr)
    }

    /// Stop accepting, abort pending handshakes and close every session.
    pub async fn stop(&mut self) {
        self.endpoint.stop().await;
        self.handshakes.abort_all();
        info!("Hub '{}' stopped", self.config.name);
    }

    pub async fn send(&self, peer: &str, payload: &Value) -> Result<(), NetworkError> {
        self.endpoint.send(peer, payload).await
    }

    /// Invoke `operation` on `peer` and wait up to `timeout` for the result.
    pub async fn call(
        &self,
        peer: &str,
        operation: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, NetworkError> {
        self.endpoint.call(peer, operation, payload, timeout).await
    }

    pub fn register_handler(&self, operation: impl Into<String>, handler: RpcHandler) {
        self.endpoint.register_handler(operation, handler);
    }

    /// Called with the peer name whenever an established session is lost.
    /// Panics inside the callback are caught and logged.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.endpoint.set_disconnect_callback(Arc::new(callback));
    }

    /// Next application message, waiting if none is queued.
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

    /// Close the session with `peer`.
    pub async fn disconnect(&self, peer: &str) -> Result<(), NetworkError> {
        self.endpoint.disconnect(peer).await
    }

    pub fn failure_count(&self, ip: IpAddr) -> u32 {
        self.access.failure_count(ip)
    }

    pub fn is_blacklisted(&self, ip: IpAddr) -> bool {
        self.access.is_banned(ip)
    }

    pub fn blacklist(&self) -> Vec<IpAddr> {
        self.access.banned()
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.endpoint.halt();
        self.handshakes.abort_all();
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<AcceptContext>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    if context.access.is_banned(remote.ip()) {
                        warn!("Refusing blacklisted address {remote}");
                        drop(stream);
                    } else {
                        spawn_handshake(&context, stream, remote);
                    }
                }
                Err(e) => error!("TCP accept failed: {e}"),
            },
            _ = shutdown.recv() => {
                info!("Hub '{}' accept loop shutting down", context.endpoint.name);
                break;
            }
        }
    }
}

fn spawn_handshake(context: &Arc<AcceptContext>, stream: TcpStream, remote: SocketAddr) {
    let id = context.endpoint.next_id();
    context.handshakes.begin(id);

    let task_context = Arc::clone(context);
    let task = tokio::spawn(async move {
        handle_connection(&task_context, stream, remote).await;
        task_context.handshakes.finish(id);
    });
    context.handshakes.attach(id, task.abort_handle());
}

async fn handle_connection(context: &AcceptContext, stream: TcpStream, remote: SocketAddr) {
    debug!("Accepted connection from {remote}");
    let (reader, writer) = stream.into_split();
    let endpoint = &context.endpoint;
    let policy = AcceptPolicy {
        keys: endpoint.keys.as_ref(),
        password: &context.password,
        credentials: context.credentials.clone(),
        registry: &endpoint.registry,
        max_frame_len: endpoint.timings.max_frame_len,
    };

    match handshake::accept(reader, writer, remote, &policy).await {
        Ok(accepted) => {
            let name = accepted.name.clone();
            if let Err(e) = endpoint.establish(accepted.name, remote, accepted.link).await {
                warn!("Could not register '{name}' from {remote}: {e}");
            }
        }
        Err(e) => match e.reject_reason() {
            Some(reason) if reason.counts_as_failure() => {
                let count = context.access.record_failure(remote.ip());
                debug!("Failed handshake #{count} from {}", remote.ip());
            }
            Some(_) => {}
            None => debug!("Handshake with {remote} aborted: {e}"),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
