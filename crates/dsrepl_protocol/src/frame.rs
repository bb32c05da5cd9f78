//! Frame envelope and I/O helpers.

use crate::error::{SessionError, SessionResult};
use crate::messages::ReplMessage;
use bytes::{BufMut, Bytes, BytesMut};
use dsrepl_core::compute_crc32;
use std::io::{self, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"DSRP";

/// Largest accepted payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEADER_SIZE: usize = 9;
const CRC_SIZE: usize = 4;

/// Encodes `message` into a complete frame.
///
/// # Errors
///
/// Returns an error if the payload cannot be encoded or is too large.
pub fn encode_frame(message: &ReplMessage) -> SessionResult<Bytes> {
    let payload = message.encode_payload()?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(SessionError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    buf.put_slice(&FRAME_MAGIC);
    buf.put_u8(message.type_code());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    let crc = compute_crc32(&buf[FRAME_MAGIC.len()..]);
    buf.put_u32_le(crc);
    Ok(buf.freeze())
}

/// Decodes one frame from the front of `buf`.
///
/// Returns the message and the number of bytes consumed, or `None` if
/// `buf` does not yet hold a complete frame.
///
/// # Errors
///
/// Returns an error for a bad header, a checksum mismatch or an
/// undecodable payload.
pub fn decode_frame(buf: &[u8]) -> SessionResult<Option<(ReplMessage, usize)>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&buf[..HEADER_SIZE]);
    let (_, len) = parse_header(&header)?;

    let total = HEADER_SIZE + len + CRC_SIZE;
    if buf.len() < total {
        return Ok(None);
    }
    let payload = &buf[HEADER_SIZE..HEADER_SIZE + len];
    let mut crc = [0u8; CRC_SIZE];
    crc.copy_from_slice(&buf[HEADER_SIZE + len..total]);
    let message = finish_frame(&header, payload, crc)?;
    Ok(Some((message, total)))
}

fn parse_header(header: &[u8; HEADER_SIZE]) -> SessionResult<(u8, usize)> {
    if header[0..4] != FRAME_MAGIC {
        return Err(SessionError::malformed("bad magic"));
    }
    let len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(SessionError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok((header[4], len))
}

/// Verifies the checksum, which covers type, length and payload, then
/// decodes the payload.
fn finish_frame(
    header: &[u8; HEADER_SIZE],
    payload: &[u8],
    crc: [u8; CRC_SIZE],
) -> SessionResult<ReplMessage> {
    let mut covered = Vec::with_capacity(HEADER_SIZE - FRAME_MAGIC.len() + payload.len());
    covered.extend_from_slice(&header[FRAME_MAGIC.len()..]);
    covered.extend_from_slice(payload);

    let expected = u32::from_le_bytes(crc);
    let actual = compute_crc32(&covered);
    if expected != actual {
        return Err(SessionError::ChecksumMismatch { expected, actual });
    }
    ReplMessage::decode(header[4], payload)
}

/// Writes `message` as one frame.
///
/// # Errors
///
/// Returns an error if encoding or the write fails.
pub fn write_frame<W: Write>(writer: &mut W, message: &ReplMessage) -> SessionResult<()> {
    let frame = encode_frame(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame.
///
/// Returns `None` if the stream ends cleanly before a new frame starts.
///
/// # Errors
///
/// Returns an error if the stream ends inside a frame or the frame is bad.
pub fn read_frame<R: Read>(reader: &mut R) -> SessionResult<Option<ReplMessage>> {
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(truncated()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    let (_, len) = parse_header(&header)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let mut crc = [0u8; CRC_SIZE];
    reader.read_exact(&mut crc)?;
    finish_frame(&header, &payload, crc).map(Some)
}

/// Async form of [`write_frame`].
///
/// # Errors
///
/// Returns an error if encoding or the write fails.
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ReplMessage,
) -> SessionResult<()> {
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Async form of [`read_frame`].
///
/// # Errors
///
/// Returns an error if the stream ends inside a frame or the frame is bad.
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> SessionResult<Option<ReplMessage>> {
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        match reader.read(&mut header[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => return Err(truncated()),
            n => filled += n,
        }
    }
    let (_, len) = parse_header(&header)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let mut crc = [0u8; CRC_SIZE];
    reader.read_exact(&mut crc).await?;
    finish_frame(&header, &payload, crc).map(Some)
}

fn truncated() -> SessionError {
    SessionError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "stream ended inside a frame header",
    ))
}
