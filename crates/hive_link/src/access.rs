//! Per-address handshake failure counting and the blacklist.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use parking_lot::Mutex;
use tracing::warn;

#[derive(Default)]
struct AccessState {
    failures: HashMap<IpAddr, u32>,
    banned: HashSet<IpAddr>,
}

/// Tracks failed handshakes per remote address. An address reaching the
/// threshold is banned for the lifetime of the hub.
pub struct AccessControl {
    threshold: u32,
    state: Mutex<AccessState>,
}

impl AccessControl {
    pub fn new(threshold: u32, seed: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            threshold: threshold.max(1),
            state: Mutex::new(AccessState {
                failures: HashMap::new(),
                banned: seed.into_iter().collect(),
            }),
        }
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.state.lock().banned.contains(&ip)
    }

    /// Count one failure for `ip` and return the new total.
    pub fn record_failure(&self, ip: IpAddr) -> u32 {
        let mut state = self.state.lock();
        let count = state.failures.entry(ip).or_insert(0);
        *count += 1;
        let count = *count;
        if count >= self.threshold && state.banned.insert(ip) {
            warn!("Blacklisting {ip} after {count} failed handshakes");
        }
        count
    }

    pub fn failure_count(&self, ip: IpAddr) -> u32 {
        self.state.lock().failures.get(&ip).copied().unwrap_or(0)
    }

    pub fn ban(&self, ip: IpAddr) {
        self.state.lock().banned.insert(ip);
    }

    pub fn banned(&self) -> Vec<IpAddr> {
        let mut banned: Vec<IpAddr> = self.state.lock().banned.iter().copied().collect();
        banned.sort();
        banned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_threshold_bans() {
        let access = AccessControl::new(3, []);
        let addr = ip("192.168.1.50");

        assert_eq!(access.record_failure(addr), 1);
        assert_eq!(access.record_failure(addr), 2);
        assert!(!access.is_banned(addr));
        assert_eq!(access.record_failure(addr), 3);
        assert!(access.is_banned(addr));
    }

    #[test]
    fn test_addresses_are_independent() {
        let access = AccessControl::new(2, []);
        access.record_failure(ip("10.0.0.1"));
        access.record_failure(ip("10.0.0.1"));
        access.record_failure(ip("10.0.0.2"));

        assert!(access.is_banned(ip("10.0.0.1")));
        assert!(!access.is_banned(ip("10.0.0.2")));
        assert_eq!(access.failure_count(ip("10.0.0.2")), 1);
        assert_eq!(access.failure_count(ip("10.0.0.3")), 0);
    }

    #[test]
    fn test_seeded_blacklist() {
        let access = AccessControl::new(3, [ip("::1")]);
        assert!(access.is_banned(ip("::1")));
        access.ban(ip("1.2.3.4"));
        assert_eq!(access.banned().len(), 2);
    }
}
