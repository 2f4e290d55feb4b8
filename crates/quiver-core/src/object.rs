//! Binary object record format
//!
//! # Record Structure
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────────
//! 0x00     4       u32 LE      Magic: 0x5A45524F ("ZERO")
//! 0x04     2       u16 LE      Version (1)
//! 0x06     2       u16 LE      Flags (0)
//! 0x08     4       u32 LE      Property count
//! 0x0C     4       u32 LE      Vector offset (0 = no vector)
//! 0x10     ...                 Properties: [u32 LE length][bytes] ...
//!          0..15               Zero padding to a 16-byte boundary
//!          4       u32 LE      D: vector dimension
//!          D*4     [f32 LE]    Vector data
//! ```
//!
//! Property strings are written back to back; their offsets are returned by
//! [`ObjectWriter::write_string`] and must be tracked by the caller. The
//! property count is informational only, there is no offset table.
//!
//! Vectors are read without copying: [`ObjectReader::vector`] reinterprets
//! the record bytes as `&[f32]` after a bounds and alignment check, which is
//! only meaningful on little-endian hosts. The vector offset is 16-byte
//! aligned relative to the record start, so a zero-copy view also needs the
//! record itself to start at a 4-byte aligned address. Records sliced out of
//! a file or buffer at an unaligned position fail that check with
//! [`ObjectError::Misaligned`]; [`ObjectReader::vector_cow`] decodes them
//! into an owned copy instead.

use std::borrow::Cow;
use std::ops::{Deref, Range};

use thiserror::Error;

use crate::buffer::{Buffer, HeapBuffer};
use crate::pool::BufferPool;

#[cfg(target_endian = "big")]
compile_error!("the object format is read in place and requires a little-endian target");

/// Magic number identifying an object record: "ZERO" in ASCII.
pub const OBJECT_MAGIC: u32 = 0x5A45_524F;

/// Header size in bytes: 4 (magic) + 2 (version) + 2 (flags) + 4 (count) + 4 (offset)
pub const HEADER_SIZE: usize = 16;

/// Alignment of the vector section relative to the record start.
pub const VECTOR_ALIGNMENT: usize = 16;

pub const FORMAT_VERSION: u16 = 1;

const F32_SIZE: usize = std::mem::size_of::<f32>();

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectError {
    #[error("Buffer too small for header: {0} bytes")]
    TooSmall(usize),

    #[error("Invalid magic number: {found:#010X} (expected 0x5A45524F)")]
    InvalidMagic { found: u32 },

    #[error("Vector section out of bounds: offset {offset}, dimension {dimension}, buffer length {len}")]
    VectorOutOfBounds {
        offset: usize,
        dimension: usize,
        len: usize,
    },

    #[error("String out of bounds at offset {offset} (buffer length {len})")]
    StringOutOfBounds { offset: usize, len: usize },

    /// The float payload at record offset `offset` does not sit at a 4-byte
    /// aligned address, either because the offset is not a multiple of 4 or
    /// because the record starts at an unaligned address.
    #[error("Vector data at record offset {offset} is not 4-byte aligned in memory")]
    Misaligned { offset: usize },

    #[error("String at offset {offset} is not valid UTF-8")]
    InvalidUtf8 { offset: usize },
}

/// Parsed fixed-size record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub property_count: u32,
    pub vector_offset: u32,
}

impl ObjectHeader {
    pub fn new(property_count: u32) -> Self {
        Self {
            magic: OBJECT_MAGIC,
            version: FORMAT_VERSION,
            flags: 0,
            property_count,
            vector_offset: 0,
        }
    }

    /// Parse the header from the first 16 bytes of a record
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ObjectError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ObjectError::TooSmall(bytes.len()));
        }

        let magic = read_u32(bytes, 0);
        if magic != OBJECT_MAGIC {
            return Err(ObjectError::InvalidMagic { found: magic });
        }

        Ok(Self {
            magic,
            version: u16::from_le_bytes([bytes[4], bytes[5]]),
            flags: u16::from_le_bytes([bytes[6], bytes[7]]),
            property_count: read_u32(bytes, 8),
            vector_offset: read_u32(bytes, 12),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..12].copy_from_slice(&self.property_count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.vector_offset.to_le_bytes());
        buf
    }

    #[inline]
    pub fn has_vector(&self) -> bool {
        self.vector_offset != 0
    }
}

#[inline(always)]
fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Reinterpret `bytes` as floats; `None` when the start address is not
/// float-aligned. An empty payload is always viewable.
#[inline]
fn as_floats(bytes: &[u8]) -> Option<&[f32]> {
    if bytes.is_empty() {
        return Some(&[]);
    }
    bytemuck::try_cast_slice(bytes).ok()
}

/// Encoder for object records.
///
/// Call [`write_header`](Self::write_header) first; strings and the vector
/// follow in any order. Writing before the header panics.
#[derive(Debug, Clone, Default)]
pub struct ObjectWriter {
    buf: Vec<u8>,
}

impl ObjectWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Start a new record with the given property count.
    ///
    /// Anything written before is discarded.
    pub fn write_header(&mut self, property_count: u32) {
        self.buf.clear();
        self.buf.extend_from_slice(&ObjectHeader::new(property_count).to_bytes());
    }

    /// Append a length-prefixed string; returns the offset it was written at.
    #[track_caller]
    pub fn write_string(&mut self, s: &str) -> usize {
        self.assert_header();
        let len = u32::try_from(s.len()).expect("string longer than u32::MAX bytes");
        let offset = self.buf.len();
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(s.as_bytes());
        offset
    }

    /// Pad to the next 16-byte boundary, record it as the vector offset and
    /// append the dimension followed by the little-endian floats.
    #[track_caller]
    pub fn write_vector(&mut self, vector: &[f32]) {
        self.assert_header();
        let dimension = u32::try_from(vector.len()).expect("vector longer than u32::MAX elements");

        let padding = (VECTOR_ALIGNMENT - self.buf.len() % VECTOR_ALIGNMENT) % VECTOR_ALIGNMENT;
        self.buf.reserve(padding + F32_SIZE + vector.len() * F32_SIZE);
        self.buf.resize(self.buf.len() + padding, 0);

        let vector_offset =
            u32::try_from(self.buf.len()).expect("record longer than u32::MAX bytes");
        self.buf[12..16].copy_from_slice(&vector_offset.to_le_bytes());

        self.buf.extend_from_slice(&dimension.to_le_bytes());
        for &val in vector {
            self.buf.extend_from_slice(&val.to_le_bytes());
        }
    }

    /// The encoded record so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Copy the record into a pooled buffer of exactly `len()` bytes.
    pub fn to_pooled(&self, pool: &BufferPool) -> HeapBuffer {
        let mut buf = pool.get(self.buf.len());
        match buf.bytes_mut() {
            Some(dst) => dst.copy_from_slice(&self.buf),
            None => unreachable!("freshly acquired buffer has a single owner"),
        }
        buf
    }

    #[track_caller]
    fn assert_header(&self) {
        assert!(
            self.buf.len() >= HEADER_SIZE,
            "write_header must be called before writing record contents"
        );
    }
}

/// Decoder over a buffer holding one object record.
///
/// Construction validates the magic number; the header is parsed once.
pub struct ObjectReader<B: Buffer> {
    buf: B,
    header: ObjectHeader,
}

impl<B: Buffer> ObjectReader<B> {
    pub fn new(buf: B) -> Result<Self, ObjectError> {
        let header = ObjectHeader::from_bytes(buf.as_bytes())?;
        Ok(Self { buf, header })
    }

    #[inline]
    pub fn header(&self) -> ObjectHeader {
        self.header
    }

    /// Zero-copy view of the vector, or `None` when the record has none.
    ///
    /// The view borrows from this reader and cannot outlive its buffer.
    pub fn vector(&self) -> Result<Option<&[f32]>, ObjectError> {
        let Some(range) = self.vector_range()? else {
            return Ok(None);
        };
        let start = range.start;
        as_floats(&self.buf.as_bytes()[range])
            .map(Some)
            .ok_or(ObjectError::Misaligned { offset: start })
    }

    /// The vector, borrowed when the payload is float-aligned in memory and
    /// decoded into an owned copy otherwise.
    ///
    /// Bounds are checked exactly as in [`vector`](Self::vector).
    pub fn vector_cow(&self) -> Result<Option<Cow<'_, [f32]>>, ObjectError> {
        let Some(range) = self.vector_range()? else {
            return Ok(None);
        };
        let bytes = &self.buf.as_bytes()[range];
        let vector = match as_floats(bytes) {
            Some(floats) => Cow::Borrowed(floats),
            None => Cow::Owned(
                bytes
                    .chunks_exact(F32_SIZE)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            ),
        };
        Ok(Some(vector))
    }

    /// Owned zero-copy vector that keeps the buffer retained.
    pub fn into_vector(self) -> Result<Option<VectorRef<B>>, ObjectError> {
        let Some(range) = self.vector_range()? else {
            return Ok(None);
        };
        let view = self.buf.slice(range.start, range.end);
        VectorRef::new(view, range.start).map(Some)
    }

    /// Decode the length-prefixed string at a caller-tracked offset.
    pub fn string_at(&self, offset: usize) -> Result<String, ObjectError> {
        let data = self.buf.as_bytes();
        let len = data.len();
        let out_of_bounds = ObjectError::StringOutOfBounds { offset, len };

        let start = offset
            .checked_add(4)
            .filter(|&start| start <= len)
            .ok_or(out_of_bounds.clone())?;
        let str_len = read_u32(data, offset) as usize;
        let end = start
            .checked_add(str_len)
            .filter(|&end| end <= len)
            .ok_or(out_of_bounds)?;

        std::str::from_utf8(&data[start..end])
            .map(str::to_owned)
            .map_err(|_| ObjectError::InvalidUtf8 { offset })
    }

    #[inline]
    pub fn buffer(&self) -> &B {
        &self.buf
    }

    pub fn into_buffer(self) -> B {
        self.buf
    }

    /// Byte range of the float payload, bounds-checked against the buffer.
    fn vector_range(&self) -> Result<Option<Range<usize>>, ObjectError> {
        if !self.header.has_vector() {
            return Ok(None);
        }

        let data = self.buf.as_bytes();
        let len = data.len();
        let offset = self.header.vector_offset as usize;

        let data_start = offset
            .checked_add(4)
            .filter(|&start| start <= len)
            .ok_or(ObjectError::VectorOutOfBounds {
                offset,
                dimension: 0,
                len,
            })?;
        let dimension = read_u32(data, offset) as usize;
        let data_end = dimension
            .checked_mul(F32_SIZE)
            .and_then(|n| data_start.checked_add(n))
            .filter(|&end| end <= len)
            .ok_or(ObjectError::VectorOutOfBounds {
                offset,
                dimension,
                len,
            })?;

        Ok(Some(data_start..data_end))
    }
}

impl<B: Buffer> std::fmt::Debug for ObjectReader<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader")
            .field("header", &self.header)
            .field("len", &self.buf.len())
            .finish()
    }
}

/// A vector view that owns a retained slice of its record buffer.
///
/// Derefs to `[f32]` without copying; the bytes stay alive until this is
/// dropped.
pub struct VectorRef<B: Buffer> {
    buf: B,
}

impl<B: Buffer> VectorRef<B> {
    fn new(buf: B, offset: usize) -> Result<Self, ObjectError> {
        as_floats(buf.as_bytes()).ok_or(ObjectError::Misaligned { offset })?;
        Ok(Self { buf })
    }

    /// The retained slice holding the float bytes.
    pub fn buffer(&self) -> &B {
        &self.buf
    }
}

impl<B: Buffer> Deref for VectorRef<B> {
    type Target = [f32];

    #[inline]
    fn deref(&self) -> &[f32] {
        // Length and alignment were validated in `new`.
        as_floats(self.buf.as_bytes()).unwrap_or(&[])
    }
}

impl<B: Buffer> std::fmt::Debug for VectorRef<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
