//! Frame-level encode/decode of PostgreSQL v3 messages.
//!
//! Two frame shapes exist on the wire:
//! - startup family (first client message only): `[i32 length][i32 code][payload]`
//! - regular: `[u8 type][i32 length][payload of length-4 bytes]`
//!
//! The length field always covers itself but never the type byte.

use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// EOF in the middle of a frame.
    #[error("short read: connection closed mid-frame")]
    ShortRead,

    /// Length field below the protocol minimum or above the configured ceiling.
    #[error("bad frame length: {0}")]
    BadLength(usize),

    /// Startup parameters contained the same key twice.
    #[error("duplicate startup parameter: {0}")]
    DuplicateParameter(String),

    /// Structurally invalid payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn map_mid_frame(err: std::io::Error) -> CodecError {
    if err.kind() == ErrorKind::UnexpectedEof {
        CodecError::ShortRead
    } else {
        CodecError::Io(err)
    }
}

/// Startup frames have no type byte, so any EOF is mid-frame.
pub(crate) fn map_startup_eof(err: std::io::Error) -> CodecError {
    map_mid_frame(err)
}

/// Read exactly one regular frame.
///
/// Returns `Ok(None)` on a clean EOF before the type byte; EOF anywhere
/// later in the frame is a `ShortRead`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<Option<(u8, Vec<u8>)>, CodecError> {
    let mut tag = [0u8; 1];
    match reader.read_exact(&mut tag).await {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(CodecError::Io(err)),
    }

    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(map_mid_frame)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 4 || len > max_len {
        return Err(CodecError::BadLength(len));
    }

    let mut payload = vec![0u8; len - 4];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(map_mid_frame)?;

    Ok(Some((tag[0], payload)))
}

/// Assemble a regular frame from its type byte and payload.
pub fn encode_frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(tag);
    frame.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Build a simple-query (`Q`) frame carrying `sql` as NUL-terminated text.
pub fn encode_simple_query(sql: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(sql.len() + 1);
    payload.extend_from_slice(sql.as_bytes());
    payload.push(0);
    encode_frame(b'Q', &payload)
}

/// Read a NUL-terminated string starting at `offset`; returns the string
/// and the offset just past its terminator.
pub fn read_cstr(payload: &[u8], offset: usize) -> Result<(String, usize), CodecError> {
    let rest = payload
        .get(offset..)
        .ok_or_else(|| CodecError::Protocol("string offset out of bounds".into()))?;
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| CodecError::Protocol("unterminated string".into()))?;
    let text = String::from_utf8_lossy(&rest[..end]).into_owned();
    Ok((text, offset + end + 1))
}

pub fn read_i16(payload: &[u8], offset: usize) -> Result<(i16, usize), CodecError> {
    let bytes = payload
        .get(offset..offset + 2)
        .ok_or_else(|| CodecError::Protocol("truncated i16".into()))?;
    Ok((i16::from_be_bytes([bytes[0], bytes[1]]), offset + 2))
}

pub fn read_i32(payload: &[u8], offset: usize) -> Result<(i32, usize), CodecError> {
    let bytes = payload
        .get(offset..offset + 4)
        .ok_or_else(|| CodecError::Protocol("truncated i32".into()))?;
    Ok((
        i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        offset + 4,
    ))
}
