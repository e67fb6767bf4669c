//! Shared core of a hub or peer.
//!
//! An [`Endpoint`] owns the session registry, the pending-call table, the
//! handler table, the application inbox and the disconnect callback. The
//! [`Hub`](crate::Hub) and [`Peer`](crate::Peer) facades add the accept
//! and connect paths on top.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Semaphore, broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::Timings;
use crate::crypto::KeyPair;
use crate::dispatcher;
use crate::error::NetworkError;
use crate::handshake::HandshakeState;
use crate::liveness;
use crate::message::{self, Inbound, InboundMessage};
use crate::rpc::{self, HandlerTable, PendingCalls, RpcHandler, RpcRequest};
use crate::security::Negotiated;
use crate::session::{Session, SessionInfo, SessionRegistry};

/// Invoked with the peer name whenever an established session is lost.
pub type DisconnectCallback = Arc<dyn Fn(&str) + Send + Sync>;

pub(crate) struct Endpoint {
    pub(crate) name: String,
    pub(crate) registry: SessionRegistry,
    pub(crate) pending: PendingCalls,
    pub(crate) handlers: HandlerTable,
    pub(crate) keys: Option<Arc<KeyPair>>,
    pub(crate) timings: Timings,
    report_handler_errors: bool,
    inbox_tx: mpsc::UnboundedSender<InboundMessage>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    requests_tx: Mutex<Option<mpsc::Sender<RpcRequest>>>,
    on_disconnect: RwLock<Option<DisconnectCallback>>,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
    next_id: AtomicU64,
}

impl Endpoint {
    pub(crate) fn new(
        name: impl Into<String>,
        encryption: bool,
        timings: Timings,
        report_handler_errors: bool,
    ) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(8);
        Arc::new(Self {
            name: name.into(),
            registry: SessionRegistry::new(),
            pending: PendingCalls::new(),
            handlers: HandlerTable::new(),
            keys: encryption.then(|| Arc::new(KeyPair::generate())),
            timings,
            report_handler_errors,
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            requests_tx: Mutex::new(None),
            on_disconnect: RwLock::new(None),
            shutdown_tx,
            running: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_running(&self) -> Result<(), NetworkError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(NetworkError::NotRunning)
        }
    }

    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start the heartbeat sender and the RPC responder.
    pub(crate) fn start(self: &Arc<Self>) {
        let (requests_tx, requests_rx) = mpsc::channel(self.request_limit());
        *self.requests_tx.lock() = Some(requests_tx);
        self.running.store(true, Ordering::Release);

        let endpoint = Arc::clone(self);
        let shutdown = self.subscribe_shutdown();
        tokio::spawn(async move {
            liveness::heartbeat_loop(endpoint, shutdown).await;
        });

        let endpoint = Arc::clone(self);
        let shutdown = self.subscribe_shutdown();
        tokio::spawn(async move {
            endpoint.responder_loop(requests_rx, shutdown).await;
        });
    }

    /// Stop background tasks and close every session. The disconnect
    /// callback does not fire for sessions closed here.
    pub(crate) async fn stop(&self) {
        self.halt();
        let sessions = self.registry.drain();
        futures::future::join_all(sessions.iter().map(|session| {
            debug!("Closing session '{}'", session.name());
            session.close()
        }))
        .await;
    }

    /// Signal every background task to exit. Dispatchers drop their read
    /// halves; sessions close once the endpoint itself is dropped.
    pub(crate) fn halt(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.requests_tx.lock().take();
            let _ = self.shutdown_tx.send(());
        }
    }

    /// Register a handshaken connection and start its dispatcher.
    pub(crate) async fn establish(
        self: &Arc<Self>,
        name: String,
        addr: SocketAddr,
        link: Negotiated<OwnedReadHalf, OwnedWriteHalf>,
    ) -> Result<(), NetworkError> {
        let Negotiated {
            reader,
            writer,
            peer_key,
        } = link;
        let session = Arc::new(Session::new(
            self.next_id(),
            name,
            addr,
            peer_key,
            writer,
            self.timings.write_timeout,
        ));

        if !self.registry.put(Arc::clone(&session)) {
            session.close().await;
            return Err(NetworkError::AlreadyConnected(session.name().to_string()));
        }
        // Subscribe before checking the flag so a concurrent halt is either
        // seen here or delivered to the dispatcher.
        let shutdown = self.subscribe_shutdown();
        if !self.is_running() {
            self.registry.remove_if(session.name(), session.id());
            session.close().await;
            return Err(NetworkError::NotRunning);
        }
        session.mark_established();
        info!(
            endpoint = %self.name,
            peer = %session.name(),
            %addr,
            encrypted = session.is_encrypted(),
            state = %HandshakeState::Established,
            "Session established"
        );

        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher::run(endpoint, session, reader, shutdown).await;
        });
        Ok(())
    }

    /// Remove `session` if it is still registered, close it and fire the
    /// disconnect callback. Later calls for the same session do nothing.
    pub(crate) async fn teardown(&self, session: &Arc<Session>, cause: Option<&NetworkError>) {
        if self.registry.remove_if(session.name(), session.id()).is_none() {
            return;
        }
        session.close().await;
        match cause {
            Some(e) => info!(endpoint = %self.name, peer = %session.name(), "Session lost: {e}"),
            None => info!(endpoint = %self.name, peer = %session.name(), "Session closed"),
        }
        self.notify_disconnect(session.name());
    }

    fn notify_disconnect(&self, name: &str) {
        let Some(callback) = self.on_disconnect.read().clone() else {
            return;
        };
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(name))).is_err() {
            error!(endpoint = %self.name, "Disconnect callback panicked for '{name}'");
        }
    }

    pub(crate) fn set_disconnect_callback(&self, callback: DisconnectCallback) {
        *self.on_disconnect.write() = Some(callback);
    }

    pub(crate) fn register_handler(&self, operation: impl Into<String>, handler: RpcHandler) {
        self.handlers.register(operation, handler);
    }

    /// Route one decoded frame from session `from`.
    pub(crate) fn dispatch(&self, from: &str, value: Value) {
        match Inbound::classify(value) {
            Inbound::Heartbeat => {
                tracing::trace!(peer = %from, "Heartbeat received");
            }
            Inbound::Request {
                fingerprint,
                operation,
                payload,
            } => {
                let request = RpcRequest {
                    peer: from.to_string(),
                    fingerprint,
                    operation,
                    payload,
                };
                let queued = match self.requests_tx.lock().as_ref() {
                    Some(tx) => tx.try_send(request),
                    None => {
                        debug!(peer = %from, "Responder stopped, dropping RPC request");
                        return;
                    }
                };
                match queued {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(request)) => warn!(
                        endpoint = %self.name,
                        peer = %from,
                        "RPC queue full, dropping '{}'",
                        request.operation
                    ),
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(peer = %from, "Responder stopped, dropping RPC request");
                    }
                }
            }
            Inbound::Response {
                fingerprint,
                result,
            } => {
                self.pending.deliver(&fingerprint, result);
            }
            Inbound::Message(payload) => {
                let _ = self.inbox_tx.send(InboundMessage {
                    from: from.to_string(),
                    payload,
                });
            }
        }
    }

    /// Send a value to the named session.
    pub(crate) async fn send(&self, name: &str, value: &Value) -> Result<(), NetworkError> {
        self.ensure_running()?;
        let session = self
            .registry
            .get(name)
            .ok_or_else(|| NetworkError::PeerNotFound(name.to_string()))?;

        if let Err(e) = session.send(value).await {
            warn!(endpoint = %self.name, peer = %name, "Send failed: {e}");
            self.teardown(&session, Some(&e)).await;
            return Err(e);
        }
        Ok(())
    }

    /// Issue an RPC and wait up to `timeout` for its correlated response.
    pub(crate) async fn call(
        &self,
        name: &str,
        operation: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, NetworkError> {
        let fingerprint = rpc::new_fingerprint();
        let rx = self.pending.register(&fingerprint);

        let frame = message::request(&fingerprint, operation, payload);
        if let Err(e) = self.send(name, &frame).await {
            self.pending.abandon(&fingerprint);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(NetworkError::Remote {
                operation: operation.to_string(),
                message,
            }),
            Ok(Err(_)) => Err(NetworkError::Transport(format!(
                "RPC '{operation}' abandoned before completion"
            ))),
            Err(_) => {
                self.pending.abandon(&fingerprint);
                debug!(endpoint = %self.name, peer = %name, "RPC '{operation}' timed out");
                Err(NetworkError::Timeout {
                    operation: operation.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Explicitly close the named session.
    pub(crate) async fn disconnect(&self, name: &str) -> Result<(), NetworkError> {
        let session = self
            .registry
            .get(name)
            .ok_or_else(|| NetworkError::PeerNotFound(name.to_string()))?;
        self.teardown(&session, None).await;
        Ok(())
    }

    pub(crate) async fn recv(&self) -> Option<InboundMessage> {
        self.inbox_rx.lock().await.recv().await
    }

    pub(crate) fn try_recv(&self) -> Option<InboundMessage> {
        self.inbox_rx.try_lock().ok()?.try_recv().ok()
    }

    pub(crate) fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.infos()
    }

    fn request_limit(&self) -> usize {
        self.timings.max_inflight_requests.max(1)
    }

    /// Serve inbound RPC requests. Each handler runs in its own task so a
    /// slow operation does not hold up the others; at most
    /// `max_inflight_requests` run at once.
    async fn responder_loop(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<RpcRequest>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let slots = Arc::new(Semaphore::new(self.request_limit()));
        loop {
            let request = tokio::select! {
                Some(request) = requests.recv() => request,
                _ = shutdown.recv() => break,
            };
            let permit = tokio::select! {
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.recv() => break,
            };

            let endpoint = Arc::clone(&self);
            tokio::spawn(async move {
                endpoint.respond(request).await;
                drop(permit);
            });
        }
        debug!(endpoint = %self.name, "Responder loop shutting down");
    }

    async fn respond(&self, request: RpcRequest) {
        let RpcRequest {
            peer,
            fingerprint,
            operation,
            payload,
        } = request;
        let handler = self.handlers.resolve(&operation);

        let outcome = match AssertUnwindSafe(handler(payload)).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => {
                warn!(endpoint = %self.name, %peer, "RPC handler '{operation}' failed: {message}");
                Err(message)
            }
            Err(_) => {
                error!(endpoint = %self.name, %peer, "RPC handler '{operation}' panicked");
                Err(format!("handler '{operation}' panicked"))
            }
        };

        if outcome.is_err() && !self.report_handler_errors {
            return;
        }
        let frame = message::response(&fingerprint, outcome);
        if let Err(e) = self.send(&peer, &frame).await {
            debug!(endpoint = %self.name, %peer, "Could not deliver RPC response: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn endpoint() -> Arc<Endpoint> {
        Endpoint::new("test", false, Timings::default(), false)
    }

    #[tokio::test]
    async fn test_not_running_rejects_send() {
        let ep = endpoint();
        let err = ep.send("anyone", &json!(1)).await.unwrap_err();
        assert!(matches!(err, NetworkError::NotRunning));
    }

    #[tokio::test]
    async fn test_unknown_peer_is_lookup_error() {
        let ep = endpoint();
        ep.start();
        let err = ep.send("ghost", &json!(1)).await.unwrap_err();
        assert!(matches!(err, NetworkError::PeerNotFound(name) if name == "ghost"));

        let err = ep
            .call("ghost", "op", json!(null), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::PeerNotFound(_)));
        assert!(ep.pending.is_empty());
        ep.stop().await;
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_kind() {
        let ep = endpoint();
        ep.start();

        ep.dispatch("alice", message::heartbeat());
        assert!(ep.try_recv().is_none());

        ep.dispatch("alice", json!({"hello": "world"}));
        let msg = ep.try_recv().unwrap();
        assert_eq!(msg.from, "alice");
        assert_eq!(msg.payload, json!({"hello": "world"}));

        let rx = ep.pending.register("fp-1");
        ep.dispatch("alice", message::response("fp-1", Ok(json!(7))));
        assert_eq!(rx.await.unwrap(), Ok(json!(7)));
        assert!(ep.try_recv().is_none());

        // No waiter: silently dropped.
        ep.dispatch("alice", message::response("fp-unknown", Ok(json!(0))));
        assert!(ep.try_recv().is_none());
        ep.stop().await;
    }

    fn busy_handler(
        running: Arc<AtomicU64>,
        peak: Arc<AtomicU64>,
        done: Arc<AtomicU64>,
    ) -> RpcHandler {
        rpc::handler(move |_| {
            let (running, peak, done) = (running.clone(), peak.clone(), done.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
    }

    fn limited_endpoint(limit: usize) -> Arc<Endpoint> {
        let timings = Timings {
            max_inflight_requests: limit,
            ..Timings::default()
        };
        Endpoint::new("test", false, timings, false)
    }

    #[tokio::test]
    async fn test_inflight_handlers_are_capped() {
        let ep = limited_endpoint(2);
        let (running, peak, done) = (
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
        );
        ep.register_handler("work", busy_handler(running, peak.clone(), done.clone()));
        ep.start();

        for round in 0..10 {
            for i in 0..2 {
                let fp = format!("fp-{round}-{i}");
                ep.dispatch("caller", message::request(&fp, "work", Value::Null));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert!(done.load(Ordering::SeqCst) > 2);
        ep.stop().await;
    }

    #[tokio::test]
    async fn test_request_flood_is_dropped_when_queue_full() {
        let ep = limited_endpoint(2);
        let (running, peak, done) = (
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
        );
        ep.register_handler("work", busy_handler(running, peak, done.clone()));
        ep.start();

        // The responder cannot run between these on the current-thread
        // runtime, so only the queue's capacity is accepted.
        for i in 0..50 {
            ep.dispatch("caller", message::request(&format!("fp-{i}"), "work", Value::Null));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(done.load(Ordering::SeqCst), 2);
        ep.stop().await;
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let ep = endpoint();
        ep.set_disconnect_callback(Arc::new(|_| panic!("callback exploded")));
        ep.notify_disconnect("alice");
    }

    #[test]
    fn test_callback_receives_name() {
        let ep = endpoint();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ep.set_disconnect_callback(Arc::new(move |name| sink.lock().push(name.to_string())));
        ep.notify_disconnect("bob");
        assert_eq!(*seen.lock(), vec!["bob".to_string()]);
    }
}
