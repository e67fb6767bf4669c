//! Heartbeats and the unauthenticated-connection reaper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::message;

/// Send a heartbeat to every established session every
/// `heartbeat_interval` until shutdown.
pub(crate) async fn heartbeat_loop(endpoint: Arc<Endpoint>, mut shutdown: broadcast::Receiver<()>) {
    let interval = endpoint.timings.heartbeat_interval;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                send_heartbeats(&endpoint).await;
            }
            _ = shutdown.recv() => {
                debug!(endpoint = %endpoint.name, "Heartbeat loop shutting down");
                break;
            }
        }
    }
}

/// One heartbeat round, sent to all sessions at once. A failed send tears
/// down that session only. Returns the number of sessions that were reached.
pub(crate) async fn send_heartbeats(endpoint: &Endpoint) -> usize {
    let beat = message::heartbeat();
    let sends = endpoint.registry.snapshot().into_iter().map(|session| {
        let beat = &beat;
        async move {
            match session.send(beat).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(endpoint = %endpoint.name, peer = %session.name(), "Heartbeat failed: {e}");
                    endpoint.teardown(&session, Some(&e)).await;
                    false
                }
            }
        }
    });
    join_all(sends).await.into_iter().filter(|reached| *reached).count()
}

struct Pending {
    since: Instant,
    task: Option<AbortHandle>,
}

/// Connections still in the handshake, keyed by connection id.
pub struct HandshakeTracker {
    grace: Duration,
    pending: Mutex<HashMap<u64, Pending>>,
}

impl HandshakeTracker {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Start the clock for connection `id`.
    pub fn begin(&self, id: u64) {
        self.pending.lock().insert(
            id,
            Pending {
                since: Instant::now(),
                task: None,
            },
        );
    }

    /// Attach the handshake task. Ignored if the handshake already finished.
    pub fn attach(&self, id: u64, task: AbortHandle) {
        if let Some(entry) = self.pending.lock().get_mut(&id) {
            entry.task = Some(task);
        }
    }

    /// The handshake for `id` finished, successfully or not.
    pub fn finish(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Abort every handshake older than the grace period. Returns how many
    /// were reaped.
    pub fn reap(&self) -> usize {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let expired: Vec<u64> = pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.since) >= self.grace)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(Pending {
                task: Some(task), ..
            }) = pending.remove(id)
            {
                task.abort();
            }
        }
        expired.len()
    }

    /// Abort every tracked handshake.
    pub fn abort_all(&self) {
        for (_, p) in self.pending.lock().drain() {
            if let Some(task) = p.task {
                task.abort();
            }
        }
    }
}

pub(crate) async fn reaper_loop(
    tracker: Arc<HandshakeTracker>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let reaped = tracker.reap();
                if reaped > 0 {
                    info!("Reaped {reaped} connection(s) that never completed the handshake");
                }
            }
            _ = shutdown.recv() => {
                debug!("Reaper loop shutting down");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::config::{DEFAULT_MAX_FRAME_LEN, Timings};
    use crate::security::{Negotiated, SecureReader, SecureWriter};

    /// Establish a plain session called `name` and return the far end.
    async fn attach(endpoint: &Arc<Endpoint>, name: &str) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server, remote) = server.unwrap();
        let (sr, sw) = server.into_split();
        let link = Negotiated {
            reader: SecureReader::plain(sr, DEFAULT_MAX_FRAME_LEN),
            writer: SecureWriter::plain(sw),
            peer_key: None,
        };
        endpoint.establish(name.into(), remote, link).await.unwrap();
        client.unwrap()
    }

    #[tokio::test]
    async fn test_reap_aborts_stale_handshake() {
        let tracker = HandshakeTracker::new(Duration::ZERO);
        tracker.begin(1);
        let task = tokio::spawn(std::future::pending::<()>());
        tracker.attach(1, task.abort_handle());

        assert_eq!(tracker.reap(), 1);
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_fresh_handshake_survives() {
        let tracker = HandshakeTracker::new(Duration::from_secs(60));
        tracker.begin(7);
        let task = tokio::spawn(std::future::pending::<()>());
        tracker.attach(7, task.abort_handle());

        assert_eq!(tracker.reap(), 0);
        assert_eq!(tracker.len(), 1);
        assert!(!task.is_finished());
        tracker.abort_all();
    }

    #[tokio::test]
    async fn test_finished_handshake_is_forgotten() {
        let tracker = HandshakeTracker::new(Duration::ZERO);
        tracker.begin(3);
        tracker.finish(3);
        let task = tokio::spawn(async {});
        tracker.attach(3, task.abort_handle());
        assert!(tracker.is_empty());
        assert_eq!(tracker.reap(), 0);
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_hold_up_heartbeats() {
        let timings = Timings {
            write_timeout: Duration::from_secs(2),
            ..Timings::default()
        };
        let endpoint = Endpoint::new("hub", false, timings, false);
        endpoint.start();
        let _slow_far = attach(&endpoint, "slow").await;
        let (fast_read, _fast_write) = attach(&endpoint, "fast").await.into_split();

        // Wedge the slow session's writer with a frame nobody drains.
        let wedged = Arc::clone(&endpoint);
        let big = serde_json::json!("x".repeat(32 * 1024 * 1024));
        let stuck = tokio::spawn(async move { wedged.send("slow", &big).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let round = tokio::spawn({
            let endpoint = Arc::clone(&endpoint);
            async move { send_heartbeats(&endpoint).await }
        });

        // The fast peer hears its heartbeat well before the slow write gives up.
        let mut fast = SecureReader::plain(fast_read, DEFAULT_MAX_FRAME_LEN);
        let beat = tokio::time::timeout(Duration::from_secs(1), fast.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(beat, message::heartbeat());

        let reached = tokio::time::timeout(Duration::from_secs(3), round)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reached, 1);
        assert!(stuck.await.unwrap().is_err());
        assert!(!endpoint.registry.contains("slow"));
        assert!(endpoint.registry.contains("fast"));

        tokio::time::timeout(Duration::from_secs(3), endpoint.stop())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_heartbeats_skip_when_no_sessions() {
        let endpoint = Endpoint::new("solo", false, Timings::default(), false);
        assert_eq!(send_heartbeats(&endpoint).await, 0);
    }
}
