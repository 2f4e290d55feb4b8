//! Heap-backed buffers
//!
//! Memory comes in 64-byte aligned [`Block`]s so that any 16-byte aligned
//! offset inside a record is also aligned for `f32` and SIMD loads.
//!
//! # Safety
//!
//! A `HeapBuffer` reads its bytes through a raw pointer into a block owned
//! by an `Arc<Allocation>`. The block outlives every handle because each
//! handle holds a strong reference, and `offset + len <= block capacity`
//! holds for every view.

use std::alloc::{self, Layout};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use super::{check_slice_bounds, Buffer};

/// Alignment of every heap block.
pub const BLOCK_ALIGN: usize = 64;

/// Owned, aligned, zero-initialised heap region. Frees itself on drop.
pub(crate) struct Block {
    ptr: NonNull<u8>,
    cap: usize,
}

// SAFETY: a Block is a plain owned allocation with no thread affinity.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    pub(crate) fn zeroed(cap: usize) -> Self {
        if cap == 0 {
            return Self {
                ptr: dangling_aligned(),
                cap: 0,
            };
        }
        let layout = Self::layout(cap);
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self { ptr, cap }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn layout(cap: usize) -> Layout {
        Layout::from_size_align(cap, BLOCK_ALIGN).expect("block capacity overflows isize")
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if self.cap != 0 {
            // SAFETY: allocated in `zeroed` with the same layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), Self::layout(self.cap)) }
        }
    }
}

fn dangling_aligned() -> NonNull<u8> {
    // SAFETY: BLOCK_ALIGN is non-zero; never dereferenced for zero-length views.
    unsafe { NonNull::new_unchecked(BLOCK_ALIGN as *mut u8) }
}

/// Return path for blocks whose last handle was dropped.
pub(crate) trait Recycler: Send + Sync {
    fn reclaim(&self, block: Block);
}

/// One per underlying block; its `Arc` strong count is the shared ref-count.
struct Allocation {
    block: ManuallyDrop<Block>,
    /// Non-owning: a dropped pool must not be kept alive by its buffers.
    recycler: Option<Weak<dyn Recycler>>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        // SAFETY: `block` is never touched again after this point.
        let block = unsafe { ManuallyDrop::take(&mut self.block) };
        match self.recycler.as_ref().and_then(Weak::upgrade) {
            Some(pool) => pool.reclaim(block),
            None => drop(block),
        }
    }
}

/// A buffer backed by a heap block, optionally owned by a [`BufferPool`].
///
/// [`BufferPool`]: crate::pool::BufferPool
pub struct HeapBuffer {
    alloc: Arc<Allocation>,
    offset: usize,
    len: usize,
    cap: usize,
}

impl HeapBuffer {
    /// Pool-less, zero-filled buffer with `len == capacity == size`.
    pub fn new(size: usize) -> Self {
        Self::from_block(Block::zeroed(size), size, None)
    }

    pub(crate) fn from_block(
        block: Block,
        len: usize,
        recycler: Option<Weak<dyn Recycler>>,
    ) -> Self {
        let cap = block.capacity();
        assert!(len <= cap, "length {len} exceeds capacity {cap}");
        Self {
            alloc: Arc::new(Allocation {
                block: ManuallyDrop::new(block),
                recycler,
            }),
            offset: 0,
            len,
            cap,
        }
    }

    /// Set the logical length of this view.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds `capacity()`.
    #[track_caller]
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.cap,
            "length {} exceeds capacity {}",
            len,
            self.cap
        );
        self.len = len;
    }

    /// Whether the memory returns to a pool when the last handle drops.
    pub fn is_pooled(&self) -> bool {
        self.alloc.recycler.is_some()
    }

    /// Mutable bytes, available only while this is the sole handle.
    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        if Arc::get_mut(&mut self.alloc).is_none() {
            return None;
        }
        // SAFETY: no other handle to the allocation exists.
        Some(unsafe { self.bytes_mut_unchecked() })
    }

    /// Mutable bytes even while other views of the allocation are alive.
    ///
    /// # Safety
    ///
    /// No other handle may read or write an overlapping range while the
    /// returned slice is alive (in particular, not from another thread).
    pub unsafe fn bytes_mut_unchecked(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.data_ptr(), self.len)
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: offset <= block capacity by construction.
        unsafe { self.alloc.block.as_ptr().add(self.offset) }
    }
}

impl Buffer for HeapBuffer {
    #[inline]
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: offset + len <= block capacity; the block lives as long as `alloc`.
        unsafe { std::slice::from_raw_parts(self.data_ptr(), self.len) }
    }

    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.cap
    }

    #[track_caller]
    fn slice(&self, start: usize, end: usize) -> Self {
        check_slice_bounds(start, end, self.len);
        Self {
            alloc: Arc::clone(&self.alloc),
            offset: self.offset + start,
            len: end - start,
            cap: end - start,
        }
    }

    fn retain(&self) -> Self {
        Self {
            alloc: Arc::clone(&self.alloc),
            offset: self.offset,
            len: self.len,
            cap: self.cap,
        }
    }

    #[inline]
    fn ref_count(&self) -> usize {
        Arc::strong_count(&self.alloc)
    }
}

impl Clone for HeapBuffer {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl fmt::Debug for HeapBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBuffer")
            .field("len", &self.len)
            .field("capacity", &self.cap)
            .field("offset", &self.offset)
            .field("refs", &self.ref_count())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}
