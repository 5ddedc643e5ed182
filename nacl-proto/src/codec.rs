//! Length-prefixed frame codec over any `Read`/`Write` stream.
//!
//! Each frame is: `[u32 big-endian length][postcard payload]`.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

/// Maximum allowed frame payload (1 MiB).
pub const MAX_FRAME: u32 = 1024 * 1024;

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Serializes `msg` into a complete frame (header + payload).
pub fn frame(msg: &impl Serialize) -> io::Result<Vec<u8>> {
    let payload =
        postcard::to_allocvec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len <= MAX_FRAME)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds 1 MiB limit"))?;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Parses a frame header, rejecting oversized payloads.
pub fn payload_len(header: [u8; HEADER_LEN]) -> io::Result<usize> {
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 1 MiB limit",
        ));
    }
    Ok(len as usize)
}

/// Decodes a frame payload (without header).
pub fn from_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> io::Result<T> {
    postcard::from_bytes(payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Encodes `msg` as a length-prefixed postcard frame and writes it to `w`.
pub fn encode<W: Write>(w: &mut W, msg: &impl Serialize) -> io::Result<()> {
    w.write_all(&frame(msg)?)?;
    w.flush()
}

/// Reads a length-prefixed postcard frame from `r` and decodes it.
pub fn decode<T: for<'de> Deserialize<'de>>(r: &mut impl Read) -> io::Result<T> {
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header)?;
    let mut payload = vec![0u8; payload_len(header)?];
    r.read_exact(&mut payload)?;
    from_payload(&payload)
}

/// Async counterparts of [`encode`] / [`decode`] for tokio streams.
#[cfg(feature = "tokio")]
mod nonblocking {
    use std::io;

    use serde::{Deserialize, Serialize};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    use super::{HEADER_LEN, frame, from_payload, payload_len};

    /// Writes one frame to `w`. The caller decides when to flush.
    pub async fn send<W>(w: &mut W, msg: &impl Serialize) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_all(&frame(msg)?).await
    }

    /// Reads one frame from `r` and decodes it.
    pub async fn recv<T, R>(r: &mut R) -> io::Result<T>
    where
        T: for<'de> Deserialize<'de>,
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        r.read_exact(&mut header).await?;
        let mut payload = vec![0u8; payload_len(header)?];
        r.read_exact(&mut payload).await?;
        from_payload(&payload)
    }
}

#[cfg(feature = "tokio")]
pub use nonblocking::{recv, send};
