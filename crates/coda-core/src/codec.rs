//! Big-endian record builder and parser.
//!
//! Every record the engine puts on the wire is built field by field with
//! exact widths — u8, u16, u32, raw byte runs — and no alignment padding.
//! The peer is bit-for-bit unforgiving, so there is no "roughly right"
//! here: a builder writes exactly what it is told, a reader fails loudly
//! the moment a record runs short or a field violates its constraint.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failure while interpreting record bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("short read: needed {needed} bytes, {remaining} remaining")]
    ShortRead { needed: usize, remaining: usize },

    #[error("malformed field: {0}")]
    Malformed(&'static str),
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Append-only record builder over a growable buffer.
///
/// Supports back-patching: a length field can be written as a placeholder
/// and patched once the total size is known.
#[derive(Debug, Default)]
pub struct PacketBuilder {
    buf: BytesMut,
}

impl PacketBuilder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32(value);
        self
    }

    pub fn put_slice(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Overwrite two bytes at `offset` with `value`, big-endian.
    ///
    /// Panics if `offset + 2` exceeds the bytes written so far — patching
    /// a field that was never emitted is a programming error, not a
    /// runtime condition.
    pub fn patch_u16(&mut self, offset: usize, value: u16) -> &mut Self {
        self.buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Cursor over a received record.
///
/// All multi-byte reads are big-endian. Reading past the end yields
/// [`CodecError::ShortRead`] with the exact shortfall.
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::ShortRead {
                needed: n,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.take(n)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Everything not yet consumed.
    pub fn rest(self) -> &'a [u8] {
        self.buf
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
