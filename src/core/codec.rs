//! Binary codec for the wire protocol and the chain file
//!
//! Every persisted or transmitted entity goes through [`BinaryBuffer`]:
//! - integers are fixed-width little-endian regardless of host byte order
//! - strings and byte vectors carry a `u32` byte-length prefix
//! - lists carry a `u32` element count followed by each element
//!
//! Reads never panic. A short buffer, a declared length larger than what is
//! left, or an offset overflow all surface as [`CodecError`].

use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Malformed or truncated input. Always recoverable: the caller drops the data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unexpected end of buffer: need {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },
    #[error("Declared length {declared} exceeds remaining {remaining} bytes")]
    LengthOverflow { declared: u64, remaining: usize },
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,
    #[error("Invalid boolean byte: {0}")]
    InvalidBool(u8),
    #[error("{0} trailing bytes after decoded value")]
    TrailingBytes(usize),
}

// =============================================================================
// Encode / Decode
// =============================================================================

/// Types that can be appended to a [`BinaryBuffer`].
pub trait Encode {
    fn encode(&self, buf: &mut BinaryBuffer);
}

/// Types that can be read back from a [`BinaryBuffer`].
pub trait Decode: Sized {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError>;
}

/// Serialize a value into a fresh byte vector
pub fn encode_to_vec<T: Encode + ?Sized>(value: &T) -> Vec<u8> {
    let mut buf = BinaryBuffer::new();
    value.encode(&mut buf);
    buf.into_bytes()
}

/// Deserialize a value that must occupy the whole slice
pub fn decode_exact<T: Decode>(bytes: &[u8]) -> Result<T, CodecError> {
    let mut buf = BinaryBuffer::from_bytes(bytes.to_vec());
    let value = T::decode(&mut buf)?;
    if buf.remaining() > 0 {
        return Err(CodecError::TrailingBytes(buf.remaining()));
    }
    Ok(value)
}

// =============================================================================
// Buffer
// =============================================================================

/// Growable byte buffer with an independent read cursor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryBuffer {
    buffer: Vec<u8>,
    read_offset: usize,
}

impl BinaryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            read_offset: 0,
        }
    }

    /// Wrap existing bytes for reading
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            buffer: bytes,
            read_offset: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes not yet consumed by reads
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.read_offset
    }

    pub fn read_offset(&self) -> usize {
        self.read_offset
    }

    /// Ensure room for `additional` bytes, growing capacity by 1.5x
    fn grow_for(&mut self, additional: usize) {
        let needed = self.buffer.len().saturating_add(additional);
        let capacity = self.buffer.capacity();
        if needed <= capacity {
            return;
        }
        let grown = capacity.saturating_add(capacity / 2);
        let target = needed.max(grown);
        self.buffer.reserve_exact(target - self.buffer.len());
    }

    // -------------------------------------------------------------------------
    // Writing
    // -------------------------------------------------------------------------

    pub fn write<T: Encode + ?Sized>(&mut self, value: &T) {
        value.encode(self);
    }

    /// Append bytes without any prefix
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.grow_for(bytes.len());
        self.buffer.extend_from_slice(bytes);
    }

    /// Append a `u32` element count or byte length.
    ///
    /// Sizes above `u32::MAX` cannot be framed: debug builds panic, release
    /// builds clamp so the reader fails on the short payload instead of
    /// decoding a wrapped length.
    pub fn write_size(&mut self, size: usize) {
        debug_assert!(
            u32::try_from(size).is_ok(),
            "size {} does not fit a u32 prefix",
            size
        );
        let size = u32::try_from(size).unwrap_or(u32::MAX);
        self.write_raw(&size.to_le_bytes());
    }

    /// Append a length-prefixed byte vector
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_size(bytes.len());
        self.write_raw(bytes);
    }

    /// Overwrite bytes at an absolute position (used to patch a count prefix)
    pub fn patch(&mut self, position: usize, bytes: &[u8]) -> Result<(), CodecError> {
        let end = position
            .checked_add(bytes.len())
            .filter(|end| *end <= self.buffer.len())
            .ok_or(CodecError::UnexpectedEnd {
                needed: bytes.len(),
                remaining: self.buffer.len().saturating_sub(position),
            })?;
        self.buffer[position..end].copy_from_slice(bytes);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reading
    // -------------------------------------------------------------------------

    pub fn read<T: Decode>(&mut self) -> Result<T, CodecError> {
        T::decode(self)
    }

    /// Consume exactly `len` bytes
    pub fn read_raw(&mut self, len: usize) -> Result<&[u8], CodecError> {
        let remaining = self.remaining();
        let end = self
            .read_offset
            .checked_add(len)
            .filter(|_| len <= remaining)
            .ok_or(CodecError::UnexpectedEnd {
                needed: len,
                remaining,
            })?;
        let start = self.read_offset;
        self.read_offset = end;
        Ok(&self.buffer[start..end])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_raw(N)?);
        Ok(out)
    }

    /// Read a `u32` count/length and check it against the unread bytes.
    ///
    /// Every element of every list in the protocol takes at least one byte, so
    /// a count larger than the remainder can never be satisfied.
    pub fn read_size(&mut self) -> Result<usize, CodecError> {
        let declared = u32::from_le_bytes(self.read_array::<4>()?);
        let remaining = self.remaining();
        if declared as u64 > remaining as u64 {
            return Err(CodecError::LengthOverflow {
                declared: declared as u64,
                remaining,
            });
        }
        Ok(declared as usize)
    }

    /// Read a length-prefixed byte vector
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_size()?;
        Ok(self.read_raw(len)?.to_vec())
    }
}

// =============================================================================
// Primitive impls
// =============================================================================

macro_rules! impl_codec_int {
    ($($ty:ty),*) => {
        $(
            impl Encode for $ty {
                fn encode(&self, buf: &mut BinaryBuffer) {
                    buf.write_raw(&self.to_le_bytes());
                }
            }

            impl Decode for $ty {
                fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
                    Ok(<$ty>::from_le_bytes(buf.read_array()?))
                }
            }
        )*
    };
}

impl_codec_int!(u8, u16, u32, u64, i32, i64);

impl Encode for bool {
    fn encode(&self, buf: &mut BinaryBuffer) {
        buf.write_raw(&[*self as u8]);
    }
}

impl Decode for bool {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        match u8::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }
}

impl Encode for str {
    fn encode(&self, buf: &mut BinaryBuffer) {
        buf.write_bytes(self.as_bytes());
    }
}

impl Encode for String {
    fn encode(&self, buf: &mut BinaryBuffer) {
        self.as_str().encode(buf);
    }
}

impl Decode for String {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        let bytes = buf.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, buf: &mut BinaryBuffer) {
        buf.write_size(self.len());
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, buf: &mut BinaryBuffer) {
        self.as_slice().encode(buf);
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        let count = buf.read_size()?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }
}
