//! Handshake and authentication state machine.
//!
//! ```text
//! Accepted -> KeyExchanged -> CredentialsReceived -> PasswordVerified
//!          -> LoginVerified -> Established
//!    \______________________________________________________ Rejected
//! ```
//!
//! Both roles are written against any `AsyncRead`/`AsyncWrite` pair so the
//! sequence can be driven over in-memory pipes as well as TCP halves. The
//! hub performs the blacklist check before calling [`accept`] and the
//! registration step after it returns.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::credentials::CredentialStore;
use crate::crypto::KeyPair;
use crate::error::{NetworkError, RejectReason};
use crate::message::ACK_YES;
use crate::security::{self, Negotiated, SecureWriter};
use crate::session::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Accepted,
    KeyExchanged,
    CredentialsReceived,
    PasswordVerified,
    LoginVerified,
    Established,
    Rejected,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the accepting side checks a connection against.
pub struct AcceptPolicy<'a> {
    pub keys: Option<&'a Arc<KeyPair>>,
    pub password: &'a str,
    pub credentials: Option<Arc<dyn CredentialStore>>,
    pub registry: &'a SessionRegistry,
    pub max_frame_len: usize,
}

/// What the connecting side presents.
pub struct ConnectRequest<'a> {
    pub keys: Option<&'a Arc<KeyPair>>,
    pub name: &'a str,
    pub secret: &'a str,
    pub password: &'a str,
    pub max_frame_len: usize,
}

/// A connection that passed every accept-side check.
pub struct AcceptedPeer<R, W> {
    pub name: String,
    pub link: Negotiated<R, W>,
}

struct Tracker {
    remote: SocketAddr,
    state: HandshakeState,
}

impl Tracker {
    fn advance(&mut self, next: HandshakeState) {
        debug!(remote = %self.remote, from = %self.state, to = %next, "Handshake advanced");
        self.state = next;
    }
}

async fn reject<W>(
    tracker: &mut Tracker,
    writer: &mut SecureWriter<W>,
    reason: RejectReason,
) -> NetworkError
where
    W: AsyncWrite + Unpin,
{
    warn!(remote = %tracker.remote, at = %tracker.state, "Rejecting handshake: {reason}");
    tracker.advance(HandshakeState::Rejected);
    if let Err(e) = writer.send(&json!(reason.ack())).await {
        debug!(remote = %tracker.remote, "Could not deliver rejection: {e}");
    }
    writer.shutdown().await;
    NetworkError::Rejected(reason)
}

fn parse_credentials(value: Value) -> Option<(String, String)> {
    match value.as_array().map(Vec::as_slice) {
        Some([Value::String(name), Value::String(secret)]) if !name.is_empty() => {
            Some((name.clone(), secret.clone()))
        }
        _ => None,
    }
}

/// Run the accept-side handshake up to `LoginVerified`.
pub async fn accept<R, W>(
    reader: R,
    writer: W,
    remote: SocketAddr,
    policy: &AcceptPolicy<'_>,
) -> Result<AcceptedPeer<R, W>, NetworkError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut tracker = Tracker {
        remote,
        state: HandshakeState::Accepted,
    };

    let mut link =
        security::negotiate_accept(reader, writer, policy.keys, policy.max_frame_len).await?;
    tracker.advance(HandshakeState::KeyExchanged);

    let Some((name, secret)) = parse_credentials(link.reader.recv().await?) else {
        return Err(reject(&mut tracker, &mut link.writer, RejectReason::Malformed).await);
    };
    tracker.advance(HandshakeState::CredentialsReceived);
    let duplicate = policy.registry.contains(&name);

    // The password frame is read even for a duplicate name, so closing
    // afterwards does not reset the connection before the rejection is read.
    let password = link.reader.recv().await?;
    if duplicate {
        return Err(reject(&mut tracker, &mut link.writer, RejectReason::DuplicateName).await);
    }
    if password.as_str() != Some(policy.password) {
        return Err(reject(&mut tracker, &mut link.writer, RejectReason::BadPassword).await);
    }
    link.writer.send(&json!(ACK_YES)).await?;
    tracker.advance(HandshakeState::PasswordVerified);

    if let Some(store) = &policy.credentials {
        let store = Arc::clone(store);
        let (user, candidate) = (name.clone(), secret);
        let verified = tokio::task::spawn_blocking(move || store.verify(&user, &candidate))
            .await
            .unwrap_or(false);
        if !verified {
            return Err(reject(&mut tracker, &mut link.writer, RejectReason::BadLogin).await);
        }
    }
    link.writer.send(&json!(ACK_YES)).await?;
    tracker.advance(HandshakeState::LoginVerified);

    Ok(AcceptedPeer { name, link })
}

async fn expect_ack<R>(
    reader: &mut security::SecureReader<R>,
    step: &str,
) -> Result<(), NetworkError>
where
    R: AsyncRead + Unpin,
{
    let ack = reader.recv().await?;
    match ack.as_str() {
        Some(ACK_YES) => Ok(()),
        Some(reason) => Err(NetworkError::HandshakeRejected(reason.to_string())),
        None => Err(NetworkError::HandshakeRejected(format!(
            "unexpected {step} acknowledgement {ack}"
        ))),
    }
}

/// Run the connect-side handshake. On success the returned link is ready
/// for steady-state traffic.
pub async fn connect<R, W>(
    reader: R,
    writer: W,
    request: &ConnectRequest<'_>,
) -> Result<Negotiated<R, W>, NetworkError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut link =
        security::negotiate_connect(reader, writer, request.keys, request.max_frame_len).await?;

    link.writer
        .send(&json!([request.name, request.secret]))
        .await?;
    link.writer.send(&json!(request.password)).await?;

    expect_ack(&mut link.reader, "password").await?;
    expect_ack(&mut link.reader, "login").await?;
    Ok(link)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
