//! Session registry: live, established connections keyed by peer name.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Notify;
use tracing::debug;

use crate::crypto::PublicKey;
use crate::error::NetworkError;
use crate::security::SecureWriter;

/// Connection state for one named counterpart.
///
/// The socket's write half lives here behind an async mutex so that sends,
/// RPC traffic and heartbeats from different tasks never interleave. The
/// read half is owned by the session's dispatcher task.
pub struct Session {
    id: u64,
    name: String,
    addr: SocketAddr,
    peer_key: Option<PublicKey>,
    encrypted: bool,
    established: AtomicBool,
    connected_at: DateTime<Utc>,
    write_timeout: Duration,
    writer: tokio::sync::Mutex<SecureWriter<OwnedWriteHalf>>,
    closed: Notify,
}

impl Session {
    pub fn new(
        id: u64,
        name: impl Into<String>,
        addr: SocketAddr,
        peer_key: Option<PublicKey>,
        writer: SecureWriter<OwnedWriteHalf>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            addr,
            peer_key,
            encrypted: writer.is_encrypted(),
            established: AtomicBool::new(false),
            connected_at: Utc::now(),
            write_timeout,
            writer: tokio::sync::Mutex::new(writer),
            closed: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_key(&self) -> Option<PublicKey> {
        self.peer_key
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    pub(crate) fn mark_established(&self) {
        self.established.store(true, Ordering::Release);
    }

    /// Write one value. Holds the session's write lock for the whole frame.
    ///
    /// Waiting for the lock and writing together are bounded by the write
    /// timeout. On expiry the frame may be half written, so the session is
    /// marked closed and the dispatcher tears it down.
    pub async fn send(&self, value: &Value) -> Result<(), NetworkError> {
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.send(value).await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => {
                self.closed.notify_one();
                Err(NetworkError::Transport(format!(
                    "Write to '{}' timed out after {:?}",
                    self.name, self.write_timeout
                )))
            }
        }
    }

    /// Shut the socket's write side and wake the dispatcher so it stops
    /// reading. Gives up on the shutdown if a stalled write keeps the lock
    /// past the write timeout; the socket then closes when the session drops.
    pub(crate) async fn close(&self) {
        self.closed.notify_one();
        let shutdown = async {
            self.writer.lock().await.shutdown().await;
        };
        if tokio::time::timeout(self.write_timeout, shutdown).await.is_err() {
            debug!("Writer for '{}' busy, skipping shutdown", self.name);
        }
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub(crate) async fn closed(&self) {
        self.closed.notified().await;
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            name: self.name.clone(),
            addr: self.addr,
            encrypted: self.encrypted,
            connected_at: self.connected_at,
        }
    }
}

/// Serializable snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub addr: SocketAddr,
    pub encrypted: bool,
    pub connected_at: DateTime<Utc>,
}

/// Registry of all live sessions. Every operation takes the same lock.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session unless its name is taken. Returns whether it was
    /// inserted.
    pub fn put(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(session.name()) {
            return false;
        }
        sessions.insert(session.name().to_string(), session);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sessions.lock().contains_key(name)
    }

    /// Remove a session by name. Removing an absent name is a no-op.
    pub fn remove(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.lock().remove(name)
    }

    /// Remove the session only if it is still the generation `id`, so a
    /// stale teardown never evicts a newer session with the same name.
    pub fn remove_if(&self, name: &str, id: u64) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        match sessions.get(name) {
            Some(session) if session.id() == id => sessions.remove(name),
            _ => None,
        }
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Established sessions, for heartbeat fan-out.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.is_established())
            .cloned()
            .collect()
    }

    pub fn infos(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions.lock().values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().drain().map(|(_, s)| s).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn make_session(id: u64, name: &str) -> (Arc<Session>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, remote) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();
        let session = Session::new(
            id,
            name,
            remote,
            None,
            SecureWriter::plain(write),
            Duration::from_secs(5),
        );
        (Arc::new(session), client)
    }

    #[tokio::test]
    async fn test_registry_put_and_get() {
        let registry = SessionRegistry::new();
        let (session, _client) = make_session(1, "alpha").await;

        assert!(registry.put(session));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("alpha").is_some());
        assert!(registry.get("Alpha").is_none());
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicate_name() {
        let registry = SessionRegistry::new();
        let (first, _c1) = make_session(1, "alice").await;
        let (second, _c2) = make_session(2, "alice").await;

        assert!(registry.put(first));
        assert!(!registry.put(second));
        assert_eq!(registry.get("alice").unwrap().id(), 1);
    }

    #[tokio::test]
    async fn test_registry_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let (session, _client) = make_session(1, "beta").await;
        registry.put(session);

        assert!(registry.remove("beta").is_some());
        assert!(registry.remove("beta").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_if_checks_generation() {
        let registry = SessionRegistry::new();
        let (session, _client) = make_session(7, "gamma").await;
        registry.put(session);

        assert!(registry.remove_if("gamma", 6).is_none());
        assert!(registry.contains("gamma"));
        assert!(registry.remove_if("gamma", 7).is_some());
        assert!(!registry.contains("gamma"));
    }

    #[tokio::test]
    async fn test_snapshot_only_established() {
        let registry = SessionRegistry::new();
        let (a, _c1) = make_session(1, "delta").await;
        let (b, _c2) = make_session(2, "epsilon").await;
        a.mark_established();
        registry.put(a);
        registry.put(b);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name(), "delta");
        assert_eq!(
            registry.names().into_iter().collect::<Vec<_>>(),
            vec!["delta".to_string(), "epsilon".to_string()]
        );
    }

    #[tokio::test]
    async fn test_infos_and_drain() {
        let registry = SessionRegistry::new();
        let (a, _c1) = make_session(1, "zeta").await;
        let (b, _c2) = make_session(2, "eta").await;
        registry.put(a);
        registry.put(b);

        let infos = registry.infos();
        assert_eq!(infos[0].name, "eta");
        assert!(!infos[0].encrypted);

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_send_to_stalled_reader_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, remote) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();
        let session = Session::new(
            1,
            "stalled",
            remote,
            None,
            SecureWriter::plain(write),
            Duration::from_millis(200),
        );

        // Far more than the socket buffers hold; nobody reads the client.
        let big = serde_json::json!("x".repeat(32 * 1024 * 1024));
        let started = std::time::Instant::now();
        let err = session.send(&big).await.unwrap_err();
        assert!(matches!(err, NetworkError::Transport(_)));
        assert!(started.elapsed() < Duration::from_secs(3));

        // Closing does not hang either, and the close signal is pending.
        tokio::time::timeout(Duration::from_secs(3), session.close())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), session.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_session_send_reaches_socket() {
        let (session, client) = make_session(1, "theta").await;
        session.send(&serde_json::json!("ping")).await.unwrap();

        let (read, _write) = client.into_split();
        let mut reader = crate::security::SecureReader::plain(read, 1024);
        assert_eq!(reader.recv().await.unwrap(), serde_json::json!("ping"));
    }
}
