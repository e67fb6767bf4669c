//! Configuration for hubs and peers.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Default cap on a single frame's payload (64 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Timers and limits shared by hubs and peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Interval between heartbeats to every established session.
    #[serde(with = "duration_ms_serde")]
    pub heartbeat_interval: Duration,

    /// How often the handshake reaper scans pending handshakes.
    #[serde(with = "duration_ms_serde")]
    pub reap_interval: Duration,

    /// How long an accepted socket may stay in the handshake.
    #[serde(with = "duration_ms_serde")]
    pub handshake_grace: Duration,

    /// Upper bound on TCP connect plus handshake for outbound connections.
    #[serde(with = "duration_ms_serde")]
    pub connection_timeout: Duration,

    /// How often the reconnection supervisor wakes up.
    #[serde(with = "duration_ms_serde")]
    pub reconnect_interval: Duration,

    /// Backoff added after each failed reconnection attempt.
    #[serde(with = "duration_ms_serde")]
    pub backoff_step: Duration,

    /// Maximum backoff between reconnection attempts.
    #[serde(with = "duration_ms_serde")]
    pub backoff_max: Duration,

    /// Reconnection attempts per supervisor wake-up.
    pub max_retries: u32,

    /// Largest accepted frame payload in bytes.
    pub max_frame_len: usize,

    /// Upper bound on writing one frame, including waiting for the
    /// session's write lock. A peer that stops reading is dropped after it.
    #[serde(with = "duration_ms_serde")]
    pub write_timeout: Duration,

    /// RPC handlers allowed to run at once. Also the capacity of the
    /// request queue; requests arriving while it is full are dropped.
    pub max_inflight_requests: usize,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reap_interval: Duration::from_secs(10),
            handshake_grace: Duration::from_secs(15),
            connection_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(30),
            backoff_step: Duration::from_secs(2),
            backoff_max: Duration::from_secs(30),
            max_retries: 5,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            write_timeout: Duration::from_secs(10),
            max_inflight_requests: 256,
        }
    }
}

/// Configuration for a [`Hub`](crate::Hub).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Name used in logs.
    pub name: String,
    /// Address to bind the listener on.
    pub bind_address: String,
    /// Port to bind. `0` picks any free port.
    pub port: u16,
    /// Shared password every peer must present.
    pub password: String,
    /// Negotiate transport encryption when the peer asks for it.
    pub encryption: bool,
    /// Addresses rejected from the start.
    pub blacklist: Vec<IpAddr>,
    /// Failed handshakes after which an address is blacklisted.
    pub failure_threshold: u32,
    /// Optional JSON credential table (see [`CredentialTable`](crate::credentials::CredentialTable)).
    pub credentials_file: Option<PathBuf>,
    /// Send an error-tagged response when an RPC handler fails, instead of
    /// letting the caller time out.
    pub report_handler_errors: bool,
    pub timings: Timings,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            name: "hub".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: 9480,
            password: String::new(),
            encryption: true,
            blacklist: Vec::new(),
            failure_threshold: 3,
            credentials_file: None,
            report_handler_errors: false,
            timings: Timings::default(),
        }
    }
}

impl HubConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        save_json(self, path, "config")
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        load_json(path).unwrap_or_default()
    }
}

/// Configuration for a [`Peer`](crate::Peer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Name presented to hubs. Must be unique per hub.
    pub name: String,
    /// Login secret checked against the hub's credential table.
    pub secret: String,
    /// Reconnect to remembered hubs after a session drops.
    pub auto_reconnect: bool,
    /// Restrict reconnection to these hub names.
    pub reconnect_whitelist: Option<Vec<String>>,
    /// Ask hubs for transport encryption.
    pub encryption: bool,
    /// See [`HubConfig::report_handler_errors`].
    pub report_handler_errors: bool,
    pub timings: Timings,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: "peer".to_string(),
            secret: String::new(),
            auto_reconnect: true,
            reconnect_whitelist: None,
            encryption: true,
            report_handler_errors: false,
            timings: Timings::default(),
        }
    }
}

impl PeerConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        save_json(self, path, "config")
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        load_json(path).unwrap_or_default()
    }
}

pub(crate) fn save_json<T: Serialize>(value: &T, path: &Path, what: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("Failed to create directory: {e}"))?;
    }
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| format!("Failed to serialize {what}: {e}"))?;
    std::fs::write(path, json).map_err(|e| format!("Failed to write {what} file: {e}"))
}

pub(crate) fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }
    match std::fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str::<T>(&data) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Corrupt file {}, using defaults: {e}", path.display());
                None
            }
        },
        Err(e) => {
            tracing::warn!("Cannot read {}, using defaults: {e}", path.display());
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
