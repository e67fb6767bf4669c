//! Transport security negotiation and the encrypted frame channel.
//!
//! Key exchange frames travel in the clear. Afterwards every value passes
//! through [`SecureWriter`] / [`SecureReader`], which seal with the peer's
//! public key and open with our own keypair when the session is encrypted,
//! and pass bytes through otherwise. The encryption flag is set at
//! construction and never changes.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::crypto::{KeyPair, PublicKey};
use crate::error::{NetworkError, RejectReason};
use crate::frame;
use crate::message::{self, NOT_ENCRYPTION};

/// Outbound half of a session: serialize, optionally seal, frame.
pub struct SecureWriter<W> {
    inner: W,
    peer_key: Option<PublicKey>,
}

impl<W: AsyncWrite + Unpin> SecureWriter<W> {
    pub fn plain(inner: W) -> Self {
        Self {
            inner,
            peer_key: None,
        }
    }

    pub fn encrypted(inner: W, peer_key: PublicKey) -> Self {
        Self {
            inner,
            peer_key: Some(peer_key),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.peer_key.is_some()
    }

    pub async fn send(&mut self, value: &Value) -> Result<(), NetworkError> {
        let bytes = message::encode_value(value)?;
        let bytes = match &self.peer_key {
            Some(key) => key.seal(&bytes)?,
            None => bytes,
        };
        frame::write_frame(&mut self.inner, &bytes).await
    }

    /// Shut down the write direction of the socket.
    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// Inbound half of a session: unframe, optionally open, deserialize.
pub struct SecureReader<R> {
    inner: R,
    keys: Option<Arc<KeyPair>>,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> SecureReader<R> {
    pub fn plain(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            keys: None,
            max_frame_len,
        }
    }

    pub fn encrypted(inner: R, keys: Arc<KeyPair>, max_frame_len: usize) -> Self {
        Self {
            inner,
            keys: Some(keys),
            max_frame_len,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.keys.is_some()
    }

    pub async fn recv(&mut self) -> Result<Value, NetworkError> {
        let bytes = frame::read_frame(&mut self.inner, self.max_frame_len).await?;
        let bytes = match &self.keys {
            Some(keys) => keys.open(&bytes)?,
            None => bytes,
        };
        message::decode_value(&bytes)
    }
}

/// A negotiated reader/writer pair plus the peer key, if any.
pub struct Negotiated<R, W> {
    pub reader: SecureReader<R>,
    pub writer: SecureWriter<W>,
    pub peer_key: Option<PublicKey>,
}

impl<R, W> Negotiated<R, W> {
    pub fn is_encrypted(&self) -> bool {
        self.peer_key.is_some()
    }
}

fn offer(keys: Option<&Arc<KeyPair>>) -> Value {
    match keys {
        Some(keys) => Value::String(keys.public_key().to_hex()),
        None => Value::String(NOT_ENCRYPTION.to_string()),
    }
}

/// Parse a key-exchange value: `None` for the opt-out sentinel.
fn parse_offer(value: &Value) -> Result<Option<PublicKey>, NetworkError> {
    match value.as_str() {
        Some(NOT_ENCRYPTION) => Ok(None),
        Some(hex) => PublicKey::from_hex(hex).map(Some),
        None => Err(NetworkError::Rejected(RejectReason::Malformed)),
    }
}

fn assemble<R, W>(
    reader: R,
    writer: W,
    keys: Option<&Arc<KeyPair>>,
    peer_key: Option<PublicKey>,
    max_frame_len: usize,
) -> Negotiated<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match (keys, peer_key) {
        (Some(keys), Some(peer_key)) => Negotiated {
            reader: SecureReader::encrypted(reader, Arc::clone(keys), max_frame_len),
            writer: SecureWriter::encrypted(writer, peer_key),
            peer_key: Some(peer_key),
        },
        _ => Negotiated {
            reader: SecureReader::plain(reader, max_frame_len),
            writer: SecureWriter::plain(writer),
            peer_key: None,
        },
    }
}

/// Accepting side: read the connector's offer, reply with ours (or the
/// opt-out sentinel when local policy disables encryption).
pub async fn negotiate_accept<R, W>(
    reader: R,
    writer: W,
    keys: Option<&Arc<KeyPair>>,
    max_frame_len: usize,
) -> Result<Negotiated<R, W>, NetworkError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut plain_reader = SecureReader::plain(reader, max_frame_len);
    let mut plain_writer = SecureWriter::plain(writer);

    let their_offer = parse_offer(&plain_reader.recv().await?)?;
    plain_writer.send(&offer(keys)).await?;

    let peer_key = if keys.is_some() { their_offer } else { None };
    Ok(assemble(
        plain_reader.inner,
        plain_writer.inner,
        keys,
        peer_key,
        max_frame_len,
    ))
}

/// Connecting side: send our offer first, then read the acceptor's reply.
pub async fn negotiate_connect<R, W>(
    reader: R,
    writer: W,
    keys: Option<&Arc<KeyPair>>,
    max_frame_len: usize,
) -> Result<Negotiated<R, W>, NetworkError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut plain_reader = SecureReader::plain(reader, max_frame_len);
    let mut plain_writer = SecureWriter::plain(writer);

    plain_writer.send(&offer(keys)).await?;
    let their_reply = parse_offer(&plain_reader.recv().await?)?;

    let peer_key = if keys.is_some() { their_reply } else { None };
    Ok(assemble(
        plain_reader.inner,
        plain_writer.inner,
        keys,
        peer_key,
        max_frame_len,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MAX_FRAME_LEN;
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type Half = Negotiated<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    async fn negotiate_pair(
        acceptor_keys: Option<Arc<KeyPair>>,
        connector_keys: Option<Arc<KeyPair>>,
    ) -> (Half, Half) {
        let (a, b) = tokio::io::duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);

        let accept = tokio::spawn(async move {
            negotiate_accept(ar, aw, acceptor_keys.as_ref(), DEFAULT_MAX_FRAME_LEN)
                .await
                .unwrap()
        });
        let connect = negotiate_connect(br, bw, connector_keys.as_ref(), DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        (accept.await.unwrap(), connect)
    }

    #[tokio::test]
    async fn test_both_opt_in_exchange_keys() {
        let hub_keys = Arc::new(KeyPair::generate());
        let peer_keys = Arc::new(KeyPair::generate());
        let (mut hub, mut peer) =
            negotiate_pair(Some(hub_keys.clone()), Some(peer_keys.clone())).await;

        assert!(hub.is_encrypted() && peer.is_encrypted());
        assert_eq!(hub.peer_key, Some(peer_keys.public_key()));
        assert_eq!(peer.peer_key, Some(hub_keys.public_key()));

        peer.writer.send(&json!(["hello", 1])).await.unwrap();
        assert_eq!(hub.reader.recv().await.unwrap(), json!(["hello", 1]));
        hub.writer.send(&json!("back")).await.unwrap();
        assert_eq!(peer.reader.recv().await.unwrap(), json!("back"));
    }

    #[tokio::test]
    async fn test_acceptor_opt_out_wins() {
        let peer_keys = Arc::new(KeyPair::generate());
        let (hub, peer) = negotiate_pair(None, Some(peer_keys)).await;
        assert!(!hub.is_encrypted());
        assert!(!peer.is_encrypted());
        assert!(!peer.writer.is_encrypted());
        assert!(!peer.reader.is_encrypted());
    }

    #[tokio::test]
    async fn test_connector_opt_out_wins() {
        let hub_keys = Arc::new(KeyPair::generate());
        let (mut hub, mut peer) = negotiate_pair(Some(hub_keys), None).await;
        assert!(!hub.is_encrypted());
        assert!(!peer.is_encrypted());

        peer.writer.send(&json!({"plain": true})).await.unwrap();
        assert_eq!(hub.reader.recv().await.unwrap(), json!({"plain": true}));
    }

    #[tokio::test]
    async fn test_both_opt_out() {
        let (hub, peer) = negotiate_pair(None, None).await;
        assert!(!hub.is_encrypted());
        assert!(!peer.is_encrypted());
    }

    #[tokio::test]
    async fn test_encrypted_frames_are_opaque_on_the_wire() {
        let keys = Arc::new(KeyPair::generate());
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = SecureWriter::encrypted(a, keys.public_key());
        writer.send(&json!("secret-marker")).await.unwrap();

        let mut raw = SecureReader::plain(b, DEFAULT_MAX_FRAME_LEN);
        // Ciphertext is not valid JSON.
        assert!(raw.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_offer_rejected() {
        let (a, b) = tokio::io::duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let (_br, bw) = tokio::io::split(b);

        let mut raw = SecureWriter::plain(bw);
        raw.send(&json!(12345)).await.unwrap();

        let keys = Arc::new(KeyPair::generate());
        let result = negotiate_accept(ar, aw, Some(&keys), DEFAULT_MAX_FRAME_LEN).await;
        assert!(matches!(
            result.err().and_then(|e| e.reject_reason()),
            Some(RejectReason::Malformed)
        ));
    }
}
