//! Memory-mapped file buffers
//!
//! The mapping and the open file handle live in one shared `Mapping`; every
//! slice and retained handle holds the same `Arc`, so both are closed
//! exactly once, when the last view is dropped.
//!
//! # Safety
//!
//! Memory mapping is inherently unsafe: if the file is truncated while
//! mapped, reads may fault (SIGBUS). Files must not be modified while a
//! buffer over them is alive.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};

use super::{check_slice_bounds, Buffer, BufferError};

struct Mapping {
    /// `None` for zero-length regions, which cannot be mapped.
    map: Option<Mmap>,
    _file: File,
    path: PathBuf,
}

impl Drop for Mapping {
    fn drop(&mut self) {
        tracing::debug!(path = ?self.path, "closing mmap region");
    }
}

/// A read-only buffer over a region of a memory-mapped file.
pub struct MmapBuffer {
    mapping: Arc<Mapping>,
    offset: usize,
    len: usize,
    file_offset: u64,
}

impl MmapBuffer {
    /// Map `[offset, offset + len)` of `path`.
    ///
    /// Fails with [`BufferError::OutOfBounds`] if the region extends past
    /// the end of the file.
    pub fn open<P: AsRef<Path>>(path: P, offset: u64, len: usize) -> Result<Self, BufferError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();

        let in_bounds = offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= file_size);
        if !in_bounds {
            return Err(BufferError::OutOfBounds {
                offset,
                len,
                file_size,
            });
        }

        let map = if len == 0 {
            None
        } else {
            // SAFETY: see module docs; the region was bounds-checked above.
            Some(unsafe { MmapOptions::new().offset(offset).len(len).map(&file)? })
        };

        tracing::debug!(path = ?path, offset, len, "opened mmap region");

        Ok(Self {
            mapping: Arc::new(Mapping {
                map,
                _file: file,
                path: path.to_path_buf(),
            }),
            offset: 0,
            len,
            file_offset: offset,
        })
    }

    /// Map an entire file.
    pub fn open_whole<P: AsRef<Path>>(path: P) -> Result<Self, BufferError> {
        let len = std::fs::metadata(path.as_ref())?.len();
        let len = usize::try_from(len).map_err(|_| BufferError::OutOfBounds {
            offset: 0,
            len: usize::MAX,
            file_size: len,
        })?;
        Self::open(path, 0, len)
    }

    /// Byte offset of this view within the file.
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    pub fn path(&self) -> &Path {
        &self.mapping.path
    }
}

impl Buffer for MmapBuffer {
    #[inline]
    fn as_bytes(&self) -> &[u8] {
        match &self.mapping.map {
            Some(map) => &map[self.offset..self.offset + self.len],
            None => &[],
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.len
    }

    #[track_caller]
    fn slice(&self, start: usize, end: usize) -> Self {
        check_slice_bounds(start, end, self.len);
        Self {
            mapping: Arc::clone(&self.mapping),
            offset: self.offset + start,
            len: end - start,
            file_offset: self.file_offset + start as u64,
        }
    }

    fn retain(&self) -> Self {
        Self {
            mapping: Arc::clone(&self.mapping),
            offset: self.offset,
            len: self.len,
            file_offset: self.file_offset,
        }
    }

    #[inline]
    fn ref_count(&self) -> usize {
        Arc::strong_count(&self.mapping)
    }
}

impl Clone for MmapBuffer {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl fmt::Debug for MmapBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmapBuffer")
            .field("path", &self.mapping.path)
            .field("file_offset", &self.file_offset)
            .field("len", &self.len)
            .field("refs", &self.ref_count())
            .finish()
    }
}
