//! Encoding of [`RestoreSpanEntry`] payloads for transport to the restore workers.
//!
//! Each encoded entry is framed with a format identifier and a crc32 checksum of the payload so
//! that a worker can reject bytes that were not produced by a compatible encoder.

use crate::RestoreSpanEntry;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use std::fmt::Debug;
use std::io::Cursor;
use std::mem::size_of;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid restore entry identifier")]
    InvalidIdentifier,

    #[error("restore entry frame truncated: {len} bytes")]
    Truncated { len: usize },

    #[error("crc32 checksum mismatch")]
    Crc32Mismatch,

    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The first bytes of every encoded entry, identifying the frame and its version.
const ENTRY_TYPE_IDENTIFIER: &[u8] = b"rse.0001";

const CHECKSUM_LEN: usize = size_of::<u32>();

/// Turns an entry into the bytes carried on an output row.
pub trait EntryEncoder: Debug + Send + Sync {
    fn encode(&self, entry: &RestoreSpanEntry) -> Result<Bytes>;
}

/// The default [`EntryEncoder`]: a checksummed JSON frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChecksummedJsonEncoder;

impl EntryEncoder for ChecksummedJsonEncoder {
    fn encode(&self, entry: &RestoreSpanEntry) -> Result<Bytes> {
        encode_entry(entry).map(Bytes::from)
    }
}

pub fn encode_entry(entry: &RestoreSpanEntry) -> Result<Vec<u8>> {
    let data = serde_json::to_vec(entry)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data);
    let checksum = hasher.finalize();

    let mut buf = Vec::with_capacity(ENTRY_TYPE_IDENTIFIER.len() + CHECKSUM_LEN + data.len());
    buf.extend_from_slice(ENTRY_TYPE_IDENTIFIER);
    buf.extend_from_slice(&checksum.to_be_bytes());
    buf.extend_from_slice(&data);

    Ok(buf)
}

pub fn decode_entry(b: &[u8]) -> Result<RestoreSpanEntry> {
    let pos = ENTRY_TYPE_IDENTIFIER.len();
    if b.len() < pos + CHECKSUM_LEN {
        return Err(Error::Truncated { len: b.len() });
    }

    if &b[..pos] != ENTRY_TYPE_IDENTIFIER {
        return Err(Error::InvalidIdentifier);
    }

    let mut cursor = Cursor::new(&b[pos..pos + CHECKSUM_LEN]);
    let crc32_checksum = cursor.read_u32::<BigEndian>()?;

    let data = &b[pos + CHECKSUM_LEN..];
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    if hasher.finalize() != crc32_checksum {
        return Err(Error::Crc32Mismatch);
    }

    Ok(serde_json::from_slice(data)?)
}
