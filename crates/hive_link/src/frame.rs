//! Length-prefixed framing over a byte stream.
//!
//! ```text
//! +-------------------------------+-------------------+
//! | Length (14 ASCII decimal B)   | Payload (N bytes) |
//! +-------------------------------+-------------------+
//! ```
//!
//! Writers zero-pad the length. Readers also tolerate surrounding ASCII
//! whitespace in the header.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetworkError;

/// Width of the ASCII length header.
pub const HEADER_LEN: usize = 14;

/// Largest length representable in the header.
pub const MAX_HEADER_VALUE: u64 = 99_999_999_999_999;

/// Encode a payload length as a fixed-width header.
pub fn encode_header(len: usize) -> Result<[u8; HEADER_LEN], NetworkError> {
    if len as u64 > MAX_HEADER_VALUE {
        return Err(NetworkError::Frame(format!(
            "payload of {len} bytes does not fit a {HEADER_LEN}-digit header"
        )));
    }
    let text = format!("{len:0width$}", width = HEADER_LEN);
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(text.as_bytes());
    Ok(header)
}

/// Parse a fixed-width header back into a payload length.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<usize, NetworkError> {
    let text = std::str::from_utf8(header)
        .map_err(|_| NetworkError::Frame("header is not ASCII".to_string()))?;
    let trimmed = text.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NetworkError::Frame(format!("invalid length header {text:?}")));
    }
    trimmed
        .parse::<usize>()
        .map_err(|e| NetworkError::Frame(format!("invalid length header {text:?}: {e}")))
}

/// Write one frame. Header and payload go out in a single write.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    let header = encode_header(payload.len())?;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, rejecting payloads larger than `max_len`.
///
/// Short reads are expected on stream sockets; `read_exact` keeps reading
/// until the header and then the whole payload have arrived.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = parse_header(&header)?;
    if len > max_len {
        return Err(NetworkError::Frame(format!(
            "frame of {len} bytes exceeds limit of {max_len}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
