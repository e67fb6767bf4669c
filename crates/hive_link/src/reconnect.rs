//! Automatic reconnection for the peer side.
//!
//! Every hub the peer connected to successfully is remembered. A periodic
//! supervisor looks for remembered hubs with no live session and starts a
//! bounded retry for each, with linear backoff. At most one retry runs per
//! hub at any time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::NetworkError;
use crate::session::SessionRegistry;

/// Linear backoff: each failure adds `step`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    delay: Duration,
    step: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(step: Duration, max: Duration) -> Self {
        Self {
            delay: Duration::ZERO,
            step,
            max,
        }
    }

    /// Delay before the next attempt.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn on_failure(&mut self) -> Duration {
        self.delay = (self.delay + self.step).min(self.max);
        self.delay
    }

    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }
}

/// Where and how to reach a hub again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectTarget {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub password: String,
}

/// Re-establishes the session for a target.
pub type Dialer =
    Arc<dyn Fn(ReconnectTarget) -> BoxFuture<'static, Result<(), NetworkError>> + Send + Sync>;

struct Descriptor {
    target: ReconnectTarget,
    backoff: Backoff,
    retry_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Remembered hubs and their backoff state.
pub struct ReconnectBook {
    entries: Mutex<HashMap<String, Descriptor>>,
    whitelist: Option<HashSet<String>>,
    step: Duration,
    max: Duration,
}

impl ReconnectBook {
    pub fn new(whitelist: Option<Vec<String>>, step: Duration, max: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            whitelist: whitelist.map(|names| names.into_iter().collect()),
            step,
            max,
        }
    }

    /// Remember `target`, unless a whitelist excludes it. Existing backoff
    /// state for the same hub is reset.
    pub fn remember(&self, target: ReconnectTarget) -> bool {
        let allowed = self
            .whitelist
            .as_ref()
            .is_none_or(|names| names.contains(&target.name));
        if !allowed {
            debug!("Not remembering '{}' for reconnection: not whitelisted", target.name);
            return false;
        }
        let mut entries = self.entries.lock();
        match entries.get_mut(&target.name) {
            Some(existing) => {
                existing.target = target;
                existing.backoff.reset();
            }
            None => {
                entries.insert(
                    target.name.clone(),
                    Descriptor {
                        target,
                        backoff: Backoff::new(self.step, self.max),
                        retry_lock: Arc::new(tokio::sync::Mutex::new(())),
                    },
                );
            }
        }
        true
    }

    pub fn forget(&self, name: &str) -> bool {
        self.entries.lock().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    /// Remembered hubs with no session in `registry`.
    pub fn due(&self, registry: &SessionRegistry) -> Vec<String> {
        let mut due: Vec<String> = self
            .entries
            .lock()
            .keys()
            .filter(|name| !registry.contains(name))
            .cloned()
            .collect();
        due.sort();
        due
    }

    pub fn delay(&self, name: &str) -> Option<Duration> {
        self.entries.lock().get(name).map(|d| d.backoff.delay())
    }

    fn entry(&self, name: &str) -> Option<(ReconnectTarget, Arc<tokio::sync::Mutex<()>>)> {
        self.entries
            .lock()
            .get(name)
            .map(|d| (d.target.clone(), Arc::clone(&d.retry_lock)))
    }

    fn on_failure(&self, name: &str) -> Duration {
        self.entries
            .lock()
            .get_mut(name)
            .map(|d| d.backoff.on_failure())
            .unwrap_or_default()
    }

    fn reset(&self, name: &str) {
        if let Some(d) = self.entries.lock().get_mut(name) {
            d.backoff.reset();
        }
    }
}

/// Retry one hub up to `timings.max_retries` times. Returns immediately if
/// another retry for the same hub is in flight.
pub(crate) async fn retry(
    book: Arc<ReconnectBook>,
    endpoint: Arc<Endpoint>,
    name: String,
    dialer: Dialer,
) {
    let Some((target, lock)) = book.entry(&name) else {
        return;
    };
    let Ok(_guard) = lock.try_lock_owned() else {
        debug!("Reconnect to '{name}' already in progress");
        return;
    };

    let max_retries = endpoint.timings.max_retries;
    for attempt in 1..=max_retries {
        if endpoint.registry.contains(&name) {
            book.reset(&name);
            return;
        }
        let delay = book.delay(&name).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match dialer(target.clone()).await {
            Ok(()) | Err(NetworkError::AlreadyConnected(_)) => {
                info!(endpoint = %endpoint.name, "Reconnected to '{name}' on attempt {attempt}");
                book.reset(&name);
                return;
            }
            Err(NetworkError::NotRunning) => return,
            Err(e) => {
                let next = book.on_failure(&name);
                warn!(
                    endpoint = %endpoint.name,
                    "Reconnect attempt {attempt}/{max_retries} to '{name}' failed: {e}; next delay {next:?}"
                );
            }
        }
    }
    warn!(endpoint = %endpoint.name, "Giving up on '{name}' until the next reconnect cycle");
}

/// Every `reconnect_interval`, start a retry for each remembered hub that
/// has no live session.
pub(crate) async fn supervise(
    book: Arc<ReconnectBook>,
    endpoint: Arc<Endpoint>,
    dialer: Dialer,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval = endpoint.timings.reconnect_interval;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                for name in book.due(&endpoint.registry) {
                    tokio::spawn(retry(
                        Arc::clone(&book),
                        Arc::clone(&endpoint),
                        name,
                        Arc::clone(&dialer),
                    ));
                }
            }
            _ = shutdown.recv() => {
                debug!(endpoint = %endpoint.name, "Reconnect supervisor shutting down");
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
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::FutureExt;

    use super::*;
    use crate::config::Timings;

    fn target(name: &str) -> ReconnectTarget {
        ReconnectTarget {
            name: name.into(),
            address: "127.0.0.1".into(),
            port: 9,
            password: String::new(),
        }
    }

    fn counting_dialer(attempts: Arc<AtomicU32>, succeed_on: u32) -> Dialer {
        Arc::new(move |_| {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n >= succeed_on {
                    Ok(())
                } else {
                    Err(NetworkError::Transport("refused".into()))
                }
            }
            .boxed()
        })
    }

    fn fast_endpoint(max_retries: u32) -> Arc<Endpoint> {
        let timings = Timings {
            max_retries,
            ..Timings::default()
        };
        Endpoint::new("peer", false, timings, false)
    }

    #[test]
    fn test_backoff_is_linear_and_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(5));
        assert_eq!(backoff.delay(), Duration::ZERO);
        assert_eq!(backoff.on_failure(), Duration::from_secs(2));
        assert_eq!(backoff.on_failure(), Duration::from_secs(4));
        assert_eq!(backoff.on_failure(), Duration::from_secs(5));
        backoff.reset();
        assert_eq!(backoff.delay(), Duration::ZERO);
    }

    #[test]
    fn test_whitelist_filters_remembered_hubs() {
        let book = ReconnectBook::new(
            Some(vec!["main".into()]),
            Duration::from_secs(2),
            Duration::from_secs(30),
        );
        assert!(book.remember(target("main")));
        assert!(!book.remember(target("other")));
        assert!(book.contains("main"));
        assert!(!book.contains("other"));
    }

    #[test]
    fn test_due_skips_connected() {
        let book = ReconnectBook::new(None, Duration::ZERO, Duration::ZERO);
        book.remember(target("b"));
        book.remember(target("a"));
        let registry = SessionRegistry::new();
        assert_eq!(book.due(&registry), vec!["a".to_string(), "b".to_string()]);
        assert!(book.forget("a"));
        assert_eq!(book.due(&registry), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_retry_stops_at_first_success() {
        let book = Arc::new(ReconnectBook::new(None, Duration::ZERO, Duration::ZERO));
        book.remember(target("hub"));
        let attempts = Arc::new(AtomicU32::new(0));

        retry(
            Arc::clone(&book),
            fast_endpoint(5),
            "hub".into(),
            counting_dialer(Arc::clone(&attempts), 3),
        )
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(book.delay("hub"), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max() {
        let book = Arc::new(ReconnectBook::new(
            None,
            Duration::from_millis(1),
            Duration::from_millis(2),
        ));
        book.remember(target("hub"));
        let attempts = Arc::new(AtomicU32::new(0));

        retry(
            Arc::clone(&book),
            fast_endpoint(4),
            "hub".into(),
            counting_dialer(Arc::clone(&attempts), u32::MAX),
        )
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(book.delay("hub"), Some(Duration::from_millis(2)));
    }

    #[tokio::test]
    async fn test_concurrent_retries_collapse() {
        let book = Arc::new(ReconnectBook::new(None, Duration::ZERO, Duration::ZERO));
        book.remember(target("hub"));
        let attempts = Arc::new(AtomicU32::new(0));
        let slow_attempts = Arc::clone(&attempts);
        let dialer: Dialer = Arc::new(move |_| {
            slow_attempts.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            }
            .boxed()
        });
        let endpoint = fast_endpoint(5);

        tokio::join!(
            retry(Arc::clone(&book), Arc::clone(&endpoint), "hub".into(), Arc::clone(&dialer)),
            retry(Arc::clone(&book), Arc::clone(&endpoint), "hub".into(), Arc::clone(&dialer)),
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
