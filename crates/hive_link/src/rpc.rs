//! RPC correlation: pending calls keyed by fingerprint and the handler table.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Result carried back to a waiting caller: the handler's value, or the
/// error message of an error-tagged response.
pub type RpcOutcome = Result<Value, String>;

/// An RPC handler: takes the request payload, returns the result.
pub type RpcHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, RpcOutcome> + Send + Sync>;

/// Wrap an async closure as an [`RpcHandler`].
pub fn handler<F, Fut>(f: F) -> RpcHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcOutcome> + Send + 'static,
{
    Arc::new(move |payload| f(payload).boxed())
}

/// A fresh fingerprint. UUID v4, never reused.
pub fn new_fingerprint() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// An inbound request routed from a dispatcher to the responder.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    /// Session the request arrived on; the response goes back there.
    pub peer: String,
    pub fingerprint: String,
    pub operation: String,
    pub payload: Value,
}

/// Outstanding outbound calls waiting for their response.
#[derive(Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<String, oneshot::Sender<RpcOutcome>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `fingerprint`.
    pub fn register(&self, fingerprint: &str) -> oneshot::Receiver<RpcOutcome> {
        let (tx, rx) = oneshot::channel();
        let previous = self.calls.lock().insert(fingerprint.to_string(), tx);
        debug_assert!(previous.is_none(), "fingerprint reused: {fingerprint}");
        rx
    }

    /// Complete the call for `fingerprint`. Returns `false` when nobody is
    /// waiting (timed out, or never issued).
    pub fn deliver(&self, fingerprint: &str, outcome: RpcOutcome) -> bool {
        let Some(tx) = self.calls.lock().remove(fingerprint) else {
            trace!("Dropping response for unknown fingerprint {fingerprint}");
            return false;
        };
        tx.send(outcome).is_ok()
    }

    /// Forget a call whose caller stopped waiting.
    pub fn abandon(&self, fingerprint: &str) {
        self.calls.lock().remove(fingerprint);
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

/// Operation name to handler. Entries are only ever added or replaced.
pub struct HandlerTable {
    handlers: RwLock<HashMap<String, RpcHandler>>,
    default_handler: RpcHandler,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            default_handler: echo_handler(),
        }
    }

    pub fn register(&self, operation: impl Into<String>, handler: RpcHandler) {
        let operation = operation.into();
        debug!("Registering RPC handler for '{operation}'");
        self.handlers.write().insert(operation, handler);
    }

    pub fn has_handler(&self, operation: &str) -> bool {
        self.handlers.read().contains_key(operation)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// The handler for `operation`, falling back to the echo handler.
    pub fn resolve(&self, operation: &str) -> RpcHandler {
        self.handlers
            .read()
            .get(operation)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default_handler))
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Fallback for unregistered operations: `["default", payload]`.
pub fn echo_handler() -> RpcHandler {
    handler(|payload| async move { Ok(json!(["default", payload])) })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
