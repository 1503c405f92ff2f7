//! Wire encoding for offsets, versions and chunks.
//!
//! Every integer on the wire is an unsigned 32-bit little-endian value.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;
use thiserror::Error;

use super::constants::{CHUNK_HEADER_SIZE, CHUNK_SIZE, U32_VALUE_SIZE};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("Expected {expected} bytes, got {actual}")]
    BadLength { expected: usize, actual: usize },
    #[error("Chunk too large: {len} bytes, maximum {max}")]
    ChunkTooLarge { len: usize, max: usize },
}

/// Encode a u32 value (offset or version).
pub fn encode_u32(value: u32) -> [u8; U32_VALUE_SIZE] {
    let mut buf = [0u8; U32_VALUE_SIZE];
    LittleEndian::write_u32(&mut buf, value);
    buf
}

/// Decode a u32 value. The input must be exactly four bytes.
pub fn decode_u32(data: &[u8]) -> Result<u32, WireError> {
    if data.len() != U32_VALUE_SIZE {
        return Err(WireError::BadLength {
            expected: U32_VALUE_SIZE,
            actual: data.len(),
        });
    }
    Ok(LittleEndian::read_u32(data))
}

/// One unit of firmware data plus its offset header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u32,
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn new(offset: u32, payload: Vec<u8>) -> Result<Self, WireError> {
        if payload.len() > CHUNK_SIZE {
            return Err(WireError::ChunkTooLarge {
                len: payload.len(),
                max: CHUNK_SIZE,
            });
        }
        Ok(Self { offset, payload })
    }

    /// Total encoded length.
    pub fn wire_len(&self) -> usize {
        CHUNK_HEADER_SIZE + self.payload.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());
        buf.extend_from_slice(&encode_u32(self.offset));
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < CHUNK_HEADER_SIZE {
            return Err(WireError::BadLength {
                expected: CHUNK_HEADER_SIZE,
                actual: data.len(),
            });
        }
        if data.len() > CHUNK_HEADER_SIZE + CHUNK_SIZE {
            return Err(WireError::ChunkTooLarge {
                len: data.len() - CHUNK_HEADER_SIZE,
                max: CHUNK_SIZE,
            });
        }
        let mut cursor = Cursor::new(data);
        let offset = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| WireError::BadLength {
                expected: CHUNK_HEADER_SIZE,
                actual: data.len(),
            })?;
        Ok(Self {
            offset,
            payload: data[CHUNK_HEADER_SIZE..].to_vec(),
        })
    }
}
