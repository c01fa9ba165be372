//! Offset-addressed chunk of bytes awaiting commit.

use crate::coalesce::error::CoalesceError;
use bytes::Bytes;

/// A byte range produced by one download segment.
///
/// The packet owns its buffer until the writer task commits it; `length` may be
/// shorter than the buffer when a producer hands over a pooled or over-sized
/// allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    offset: u64,
    bytes: Bytes,
    length: u32,
}

impl Packet {
    /// Packet covering the whole of `bytes`
    pub fn new(offset: u64, bytes: impl Into<Bytes>) -> Result<Self, CoalesceError> {
        let bytes = bytes.into();
        let length = bytes.len() as u64;
        Self::with_length(offset, bytes, length)
    }

    /// Packet covering the first `length` bytes of `bytes`
    pub fn with_length(
        offset: u64,
        bytes: impl Into<Bytes>,
        length: u64,
    ) -> Result<Self, CoalesceError> {
        let bytes = bytes.into();
        let capacity = bytes.len() as u64;
        if length > capacity || length > u64::from(u32::MAX) {
            return Err(CoalesceError::InvalidPacket { length, capacity });
        }
        Ok(Packet {
            offset,
            bytes,
            length: length as u32,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u32 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// First offset past the end of this packet
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(u64::from(self.length))
    }

    /// The bytes to commit (`bytes[0..length]`)
    pub fn payload(&self) -> &[u8] {
        &self.bytes[..self.length as usize]
    }
}
