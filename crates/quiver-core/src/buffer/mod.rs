//! Reference-counted byte buffers
//!
//! A buffer handle is an owned view over a shared allocation. Every handle
//! derived from the same allocation (retained copies and sub-slices alike)
//! shares a single counter, so the allocation is reclaimed exactly once,
//! when the last view is dropped.
//!
//! ```text
//!   allocation ──┬── handle (ref 1)
//!                ├── retain()      (ref 2)
//!                └── slice(a, b)   (ref 3)   same bytes, no copy
//! ```
//!
//! `release` consumes the handle, so a double release does not compile.
//! Bounds misuse (`slice` past the end, `set_len` past capacity) panics.

mod heap;
mod mmap;

pub use heap::{HeapBuffer, BLOCK_ALIGN};
pub use mmap::MmapBuffer;

pub(crate) use heap::{Block, Recycler};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Region out of bounds: offset {offset} + length {len} exceeds file size {file_size}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        file_size: u64,
    },
}

/// Capability set shared by every buffer variant.
pub trait Buffer: Send + Sync + Sized {
    /// The `len()` valid bytes of this view.
    fn as_bytes(&self) -> &[u8];

    /// Start of the view, for zero-copy reinterpretation.
    ///
    /// The pointer is only valid while this handle is alive.
    #[inline]
    fn as_ptr(&self) -> *const u8 {
        self.as_bytes().as_ptr()
    }

    fn len(&self) -> usize;

    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;

    /// Zero-copy view over `[start, end)` sharing this buffer's counter.
    ///
    /// # Panics
    ///
    /// Panics unless `start <= end <= self.len()`.
    fn slice(&self, start: usize, end: usize) -> Self;

    /// New handle to the same view; increments the shared counter.
    fn retain(&self) -> Self;

    /// Drop this handle. At zero references the allocation is reclaimed.
    #[inline]
    fn release(self) {
        drop(self);
    }

    /// Number of live handles sharing the underlying allocation.
    fn ref_count(&self) -> usize;
}

#[inline]
#[track_caller]
pub(crate) fn check_slice_bounds(start: usize, end: usize, len: usize) {
    if start > end || end > len {
        panic!("slice bounds out of range [{start}:{end}] with length {len}");
    }
}

/// Either buffer variant behind one handle type.
pub enum AnyBuffer {
    Heap(HeapBuffer),
    Mmap(MmapBuffer),
}

impl AnyBuffer {
    pub fn as_heap(&self) -> Option<&HeapBuffer> {
        match self {
            AnyBuffer::Heap(buf) => Some(buf),
            AnyBuffer::Mmap(_) => None,
        }
    }

    pub fn as_mmap(&self) -> Option<&MmapBuffer> {
        match self {
            AnyBuffer::Mmap(buf) => Some(buf),
            AnyBuffer::Heap(_) => None,
        }
    }
}

impl Buffer for AnyBuffer {
    #[inline]
    fn as_bytes(&self) -> &[u8] {
        match self {
            AnyBuffer::Heap(buf) => buf.as_bytes(),
            AnyBuffer::Mmap(buf) => buf.as_bytes(),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        match self {
            AnyBuffer::Heap(buf) => buf.len(),
            AnyBuffer::Mmap(buf) => buf.len(),
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        match self {
            AnyBuffer::Heap(buf) => buf.capacity(),
            AnyBuffer::Mmap(buf) => buf.capacity(),
        }
    }

    #[track_caller]
    fn slice(&self, start: usize, end: usize) -> Self {
        match self {
            AnyBuffer::Heap(buf) => AnyBuffer::Heap(buf.slice(start, end)),
            AnyBuffer::Mmap(buf) => AnyBuffer::Mmap(buf.slice(start, end)),
        }
    }

    fn retain(&self) -> Self {
        match self {
            AnyBuffer::Heap(buf) => AnyBuffer::Heap(buf.retain()),
            AnyBuffer::Mmap(buf) => AnyBuffer::Mmap(buf.retain()),
        }
    }

    fn ref_count(&self) -> usize {
        match self {
            AnyBuffer::Heap(buf) => buf.ref_count(),
            AnyBuffer::Mmap(buf) => buf.ref_count(),
        }
    }
}

impl Clone for AnyBuffer {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl From<HeapBuffer> for AnyBuffer {
    fn from(buf: HeapBuffer) -> Self {
        AnyBuffer::Heap(buf)
    }
}

impl From<MmapBuffer> for AnyBuffer {
    fn from(buf: MmapBuffer) -> Self {
        AnyBuffer::Mmap(buf)
    }
}

impl std::fmt::Debug for AnyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnyBuffer::Heap(buf) => buf.fmt(f),
            AnyBuffer::Mmap(buf) => buf.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_buffer_shares_counter_with_variant() {
        let heap = HeapBuffer::new(32);
        let any: AnyBuffer = heap.retain().into();
        assert_eq!(heap.ref_count(), 2);

        let view = any.slice(4, 8);
        assert_eq!(heap.ref_count(), 3);
        assert_eq!(view.len(), 4);
        assert!(view.as_heap().is_some());
        assert!(view.as_mmap().is_none());

        drop(any);
        view.release();
        assert_eq!(heap.ref_count(), 1);
    }

    #[test]
    #[should_panic(expected = "slice bounds out of range")]
    fn test_any_buffer_slice_out_of_range() {
        let any: AnyBuffer = HeapBuffer::new(8).into();
        let _ = any.slice(2, 9);
    }

    #[test]
    fn test_clone_is_retain() {
        let any: AnyBuffer = HeapBuffer::new(8).into();
        let copy = any.clone();
        assert_eq!(any.ref_count(), 2);
        assert_eq!(copy.as_ptr(), any.as_ptr());
    }
}
