//! Record envelope and the trait for records stored in a log.
//!
//! Every record on disk is wrapped as:
//!
//! ```text
//! | magic "DSCL" (4) | version (2) | length (4) | payload (length) | crc32 (4) |
//! ```
//!
//! The CRC covers the payload. An envelope cut short by the end of the file
//! is a torn write and marks the end of the log; anything else that fails
//! to parse is corruption.

use crate::checksum::compute_crc32;
use crate::error::{ChangelogError, ChangelogResult};
use dsrepl_storage::StorageBackend;
use std::fmt;
use std::path::Path;

/// Magic bytes opening every changelog record.
pub const RECORD_MAGIC: [u8; 4] = *b"DSCL";

/// Current record format version.
pub const RECORD_VERSION: u16 = 1;

pub(crate) const HEADER_SIZE: usize = 10;
pub(crate) const CRC_SIZE: usize = 4;

/// Largest payload a record may carry.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// A record that can live in a [`super::Log`].
///
/// Logs are ordered by [`LogRecord::Key`]. The key's `Display` form names
/// sealed segment files and must sort like the key itself;
/// [`LogRecord::parse_key`] reverses it.
pub trait LogRecord: Sized + Send + 'static {
    /// Ordering key.
    type Key: Ord + Copy + fmt::Debug + fmt::Display + Send + Sync + 'static;

    /// Key of this record.
    fn key(&self) -> Self::Key;

    /// Serializes the record body.
    ///
    /// # Errors
    ///
    /// Returns [`ChangelogError::Codec`] if the record cannot be encoded.
    fn encode_payload(&self) -> ChangelogResult<Vec<u8>>;

    /// Deserializes a record body.
    ///
    /// # Errors
    ///
    /// Returns [`ChangelogError::Codec`] if the bytes are not a record.
    fn decode_payload(bytes: &[u8]) -> ChangelogResult<Self>;

    /// Parses a key from its `Display` form.
    fn parse_key(token: &str) -> Option<Self::Key>;
}

/// Wraps a payload in a record envelope.
///
/// # Errors
///
/// Returns [`ChangelogError::RecordTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD_SIZE`].
pub fn encode_envelope(payload: &[u8]) -> ChangelogResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ChangelogError::RecordTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    out.extend_from_slice(&RECORD_MAGIC);
    out.extend_from_slice(&RECORD_VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&compute_crc32(payload).to_le_bytes());
    Ok(out)
}

/// Result of reading one envelope.
#[derive(Debug, PartialEq, Eq)]
pub enum EnvelopeRead {
    /// A complete, checksummed record.
    Record {
        /// Record payload.
        payload: Vec<u8>,
        /// Offset of the following envelope.
        next_offset: u64,
    },
    /// The bytes stop in the middle of an envelope.
    Truncated,
    /// `offset` is exactly the end of the data.
    End,
}

/// Reads the envelope at `offset`, looking no further than `limit`.
///
/// `path` is only used in error messages.
///
/// # Errors
///
/// Returns an error on bad magic, unknown version, oversized length,
/// checksum mismatch, or storage failure.
pub fn decode_envelope(
    backend: &dyn StorageBackend,
    offset: u64,
    limit: u64,
    path: &Path,
) -> ChangelogResult<EnvelopeRead> {
    if offset >= limit {
        return Ok(EnvelopeRead::End);
    }
    if offset + HEADER_SIZE as u64 > limit {
        return Ok(EnvelopeRead::Truncated);
    }

    let header = backend.read_at(offset, HEADER_SIZE)?;
    if header[0..4] != RECORD_MAGIC {
        return Err(ChangelogError::corrupted(path, offset, "bad record magic"));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != RECORD_VERSION {
        return Err(ChangelogError::corrupted(
            path,
            offset,
            format!("unsupported record version {version}"),
        ));
    }
    let len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(ChangelogError::corrupted(
            path,
            offset,
            format!("record length {len} exceeds limit"),
        ));
    }

    let body_start = offset + HEADER_SIZE as u64;
    let end = body_start + (len + CRC_SIZE) as u64;
    if end > limit {
        return Ok(EnvelopeRead::Truncated);
    }

    let mut body = backend.read_at(body_start, len + CRC_SIZE)?;
    let crc_bytes = body.split_off(len);
    let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let actual = compute_crc32(&body);
    if expected != actual {
        return Err(ChangelogError::ChecksumMismatch {
            path: path.to_path_buf(),
            offset,
            expected,
            actual,
        });
    }

    Ok(EnvelopeRead::Record {
        payload: body,
        next_offset: end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsrepl_storage::InMemoryBackend;

    fn path() -> &'static Path {
        Path::new("test.log")
    }

    #[test]
    fn reads_consecutive_records() {
        let mut backend = InMemoryBackend::new();
        backend.append(&encode_envelope(b"one").unwrap()).unwrap();
        backend.append(&encode_envelope(b"two").unwrap()).unwrap();
        let limit = backend.size().unwrap();

        let EnvelopeRead::Record {
            payload,
            next_offset,
        } = decode_envelope(&backend, 0, limit, path()).unwrap()
        else {
            panic!("expected a record");
        };
        assert_eq!(payload, b"one");

        let second = decode_envelope(&backend, next_offset, limit, path()).unwrap();
        let EnvelopeRead::Record { payload, next_offset } = second else {
            panic!("expected a record");
        };
        assert_eq!(payload, b"two");
        assert_eq!(
            decode_envelope(&backend, next_offset, limit, path()).unwrap(),
            EnvelopeRead::End
        );
    }

    #[test]
    fn torn_tail_is_truncation_not_error() {
        let full = encode_envelope(b"payload").unwrap();
        for cut in [3, HEADER_SIZE, full.len() - 1] {
            let backend = InMemoryBackend::with_data(full[..cut].to_vec());
            assert_eq!(
                decode_envelope(&backend, 0, cut as u64, path()).unwrap(),
                EnvelopeRead::Truncated
            );
        }
    }

    #[test]
    fn flipped_payload_byte_fails_checksum() {
        let mut bytes = encode_envelope(b"payload").unwrap();
        bytes[HEADER_SIZE + 2] ^= 0x40;
        let len = bytes.len() as u64;
        let backend = InMemoryBackend::with_data(bytes);
        let err = decode_envelope(&backend, 0, len, path()).unwrap_err();
        assert!(matches!(err, ChangelogError::ChecksumMismatch { .. }));
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut bytes = encode_envelope(b"x").unwrap();
        bytes[0] = b'X';
        let len = bytes.len() as u64;
        let backend = InMemoryBackend::with_data(bytes);
        let err = decode_envelope(&backend, 0, len, path()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn limit_hides_bytes_beyond_it() {
        let mut backend = InMemoryBackend::new();
        let envelope = encode_envelope(b"abc").unwrap();
        backend.append(&envelope).unwrap();
        backend.append(&envelope).unwrap();
        let first_len = envelope.len() as u64;

        let read = decode_envelope(&backend, first_len, first_len, path()).unwrap();
        assert_eq!(read, EnvelopeRead::End);
    }
}
