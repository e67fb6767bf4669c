//! Hive Link: hub/peer messaging over TCP.
//!
//! A process runs a [`Hub`] that accepts many named peers, a [`Peer`] that
//! connects out to one or more hubs, or both. Each link gets an
//! authenticated handshake, optional transport encryption, heartbeats,
//! automatic reconnection on the peer side, and correlated RPC on top of a
//! plain message stream.
//!
//! # Architecture
//!
//! - **Framing**: 14-byte ASCII decimal length header, then a JSON payload.
//! - **Security**: X25519 + AES-256-GCM sealing, negotiated per connection;
//!   either side may opt out.
//! - **Handshake**: shared password, then an optional per-user Argon2 login,
//!   with failed attempts counted toward a per-address blacklist.
//! - **Sessions**: one per remote name, each read by its own dispatcher task.
//! - **RPC**: `["REQUEST", fingerprint, op, payload]` answered by
//!   `["RESPONSE", fingerprint, result]`, matched by fingerprint.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use hive_link::{Hub, HubConfig, Peer, PeerConfig};
//!
//! # async fn example() -> Result<(), hive_link::NetworkError> {
//! let mut hub = Hub::new(HubConfig {
//!     name: "main".into(),
//!     port: 0,
//!     password: "hunter2".into(),
//!     ..HubConfig::default()
//! })?;
//! let addr = hub.start().await?;
//!
//! let mut peer = Peer::new(PeerConfig {
//!     name: "worker-1".into(),
//!     ..PeerConfig::default()
//! });
//! peer.start().await?;
//! peer.connect("main", "127.0.0.1", addr.port(), "hunter2").await?;
//!
//! peer.send("main", &serde_json::json!({"status": "ready"})).await?;
//! let echoed = peer
//!     .call("main", "ping", serde_json::json!(1), Duration::from_secs(5))
//!     .await?;
//! assert_eq!(echoed, serde_json::json!(["default", 1]));
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod config;
pub mod credentials;
pub mod crypto;
mod dispatcher;
mod endpoint;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod hub;
pub mod liveness;
pub mod logging;
pub mod message;
pub mod peer;
pub mod reconnect;
pub mod rpc;
pub mod security;
pub mod session;

pub use config::{HubConfig, PeerConfig, Timings};
pub use credentials::{CredentialStore, CredentialTable};
pub use crypto::{KeyPair, PublicKey};
pub use endpoint::DisconnectCallback;
pub use error::{NetworkError, RejectReason};
pub use hub::Hub;
pub use message::InboundMessage;
pub use peer::Peer;
pub use rpc::{RpcHandler, RpcOutcome, handler};
pub use session::SessionInfo;
