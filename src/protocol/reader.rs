//! Bounds-checked cursor over untrusted wire bytes

use thiserror::Error;

/// Wire decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before a field was complete
    #[error("Truncated input: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes the field required
        needed: usize,
        /// Bytes left in the input
        available: usize,
    },

    /// A length field does not fit in memory
    #[error("Length field out of range: {0}")]
    LengthOverflow(u64),

    /// The outer frame type is not one we know
    #[error("Unknown frame type: {0:#04x}")]
    UnknownType(u8),

    /// A declared length disagrees with the bytes actually present
    #[error("Length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch {
        /// Length claimed by the sender
        declared: u64,
        /// Length observed
        actual: u64,
    },

    /// Empty payload where a type byte was required
    #[error("Empty frame")]
    Empty,

    /// A lookup reply names a different user than the one requested
    #[error("Lookup reply for a different uid")]
    UidMismatch,

    /// A public key field could not be decoded
    #[error("Malformed public key")]
    BadPublicKey,
}

/// Result type for wire decoding
pub type WireResult<T> = Result<T, WireError>;

/// Cursor that hands out sub-slices and never reads past the end
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Start reading at the beginning of `buf`
    pub fn new(buf: &'a [u8]) -> Self {
        WireReader { buf, pos: 0 }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Read a single byte
    pub fn read_u8(&mut self) -> WireResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Read a big-endian u64
    pub fn read_be64(&mut self) -> WireResult<u64> {
        Ok(u64::from_be_bytes(self.read_array::<8>()?))
    }

    /// Read a big-endian u64 that is about to be used as a length
    pub fn read_len(&mut self) -> WireResult<usize> {
        let len = self.read_be64()?;
        usize::try_from(len).map_err(|_| WireError::LengthOverflow(len))
    }

    /// Read exactly `len` bytes
    pub fn read_bytes(&mut self, len: usize) -> WireResult<&'a [u8]> {
        let available = self.remaining();
        if len > available {
            return Err(WireError::Truncated {
                needed: len,
                available,
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Read a fixed-size array
    pub fn read_array<const N: usize>(&mut self) -> WireResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Consume and return everything left
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}
