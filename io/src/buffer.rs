//! Byte arena and cursor used by the binary codec.
//!
//! Encoding writes little-endian fields into a growable arena that tracks a
//! logical occupied size separately from its allocated capacity; decoding
//! walks a borrowed slice with a bounds-checked cursor. Consumers only ever
//! see offsets and lengths, never addresses.

use thiserror::Error;

use crate::version::VersionError;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error("read of {len} bytes at offset {offset} exceeds the buffer ({buf} bytes)")]
    OutOfBounds {
        offset: usize,
        len: usize,
        buf: usize,
    },
    #[error("unknown element kind tag {0}")]
    UnknownElementTag(i64),
    #[error("length field `{field}` is negative ({value})")]
    NegativeLength { field: &'static str, value: i64 },
    #[error("block reference `{field}` = {value} points outside the buffer ({buf} bytes)")]
    BadRef {
        field: &'static str,
        value: i64,
        buf: usize,
    },
    #[error("name block at offset {offset} is not valid utf-8")]
    BadName { offset: usize },
    #[error("{names} stored names for {elements} elements")]
    NameCountMismatch { names: i64, elements: i64 },
    #[error("state block claims {claimed} occupied bytes but {actual} are present")]
    OccupiedMismatch { claimed: i64, actual: usize },
    #[error("scalar field `{field}` disagrees with the decoded blocks")]
    Inconsistent { field: &'static str },
    #[error("failed to read binary file")]
    Io(#[from] std::io::Error),
}

/// Growable little-endian write buffer.
///
/// `alloc` hands out offsets into a zero-filled region that may be written
/// afterwards with the `put_*` methods, so fixed headers can be laid out
/// before the values of their reference slots are known. `into_bytes`
/// shrinks to the exact occupied size, nothing beyond the logical size ever
/// leaves the arena.
#[derive(Debug, Default)]
pub struct ByteArena {
    data: Vec<u8>,
    used: usize,
}

impl ByteArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            used: 0,
        }
    }

    /// logical occupied size, as opposed to the allocated capacity
    pub fn used(&self) -> usize {
        self.used
    }

    /// reserve `len` zeroed bytes at the tail, returning their offset
    pub fn alloc(&mut self, len: usize) -> usize {
        let offset = self.used;
        self.used += len;
        if self.used > self.data.len() {
            // grow geometrically so repeated block appends stay cheap
            let grown = self.used.max(self.data.len() * 2);
            self.data.resize(grown, 0);
        }
        offset
    }

    pub fn put_i64(&mut self, offset: usize, value: i64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn put_f64(&mut self, offset: usize, value: f64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// append a single i64 at the tail
    pub fn push_i64(&mut self, value: i64) {
        let offset = self.alloc(8);
        self.put_i64(offset, value);
    }

    pub fn push_f64(&mut self, value: f64) {
        let offset = self.alloc(8);
        self.put_f64(offset, value);
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let offset = self.alloc(bytes.len());
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.used]
    }

    pub fn slot(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.data[offset..offset + len]
    }

    /// drop all free capacity and hand out the occupied bytes
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.data.truncate(self.used);
        self.data.shrink_to_fit();
        self.data
    }
}

/// Bounds-checked sequential reader over an encoded buffer.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// reposition the cursor to a block reference read from a fixed slot
    pub fn seek(&mut self, field: &'static str, offset: i64) -> Result<(), DecodeError> {
        if offset < 0 || offset as usize > self.buf.len() {
            return Err(DecodeError::BadRef {
                field,
                value: offset,
                buf: self.buf.len(),
            });
        }
        self.pos = offset as usize;
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.pos + len > self.buf.len() {
            return Err(DecodeError::OutOfBounds {
                offset: self.pos,
                len,
                buf: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn i64(&mut self) -> Result<i64, DecodeError> {
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(i64::from_le_bytes(bytes))
    }

    pub fn f64(&mut self) -> Result<f64, DecodeError> {
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(f64::from_le_bytes(bytes))
    }

    /// read a non-negative count field, e.g. an array or name length
    pub fn count(&mut self, field: &'static str) -> Result<usize, DecodeError> {
        let value = self.i64()?;
        if value < 0 {
            return Err(DecodeError::NegativeLength { field, value });
        }
        Ok(value as usize)
    }

    pub fn i64_array(&mut self, len: usize) -> Result<Vec<i64>, DecodeError> {
        (0..len).map(|_| self.i64()).collect()
    }

    pub fn f64_array(&mut self, len: usize) -> Result<Vec<f64>, DecodeError> {
        (0..len).map(|_| self.f64()).collect()
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.take(len)
    }
}
