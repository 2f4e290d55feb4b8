//! In-memory object store
//!
//! Maps object ids to retained record buffers. Records are validated on the
//! way in; lookups hand out retained handles, never copies.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::buffer::{AnyBuffer, Buffer};
use crate::object::{ObjectError, ObjectReader, ObjectWriter, VectorRef};
use crate::pool::BufferPool;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid object format: {0}")]
    InvalidObject(#[from] ObjectError),

    #[error("Object not found: {0}")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub object_count: usize,
    pub total_bytes: usize,
    pub average_size: usize,
    pub largest_object: usize,
    /// 0 when the store is empty.
    pub smallest_object: usize,
}

/// Thread-safe map of object id to record buffer.
///
/// The store holds one reference to every buffer it contains and drops it
/// on overwrite, delete or clear.
pub struct ObjectStore {
    objects: RwLock<HashMap<Uuid, AnyBuffer>>,
    pool: BufferPool,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::with_pool(BufferPool::new())
    }

    pub fn with_pool(pool: BufferPool) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            pool,
        }
    }

    /// Store a record under `id`, taking ownership of the handle.
    ///
    /// The header and the vector section are validated first; on failure the
    /// map is untouched. A record whose vector cannot be viewed in place,
    /// such as one starting at an unaligned address, is rejected with
    /// [`ObjectError::Misaligned`]. An existing record under the same id is
    /// released.
    pub fn put(&self, id: Uuid, buf: impl Into<AnyBuffer>) -> Result<(), StoreError> {
        let reader = ObjectReader::new(buf.into())?;
        reader.vector()?;
        let buf = reader.into_buffer();
        let len = buf.len();

        let previous = self.objects.write().insert(id, buf);
        if let Some(old) = previous {
            tracing::debug!(%id, old_len = old.len(), new_len = len, "replaced object");
            old.release();
        }
        Ok(())
    }

    /// Copy an encoded record into a pooled buffer and store it.
    pub fn put_encoded(&self, id: Uuid, writer: &ObjectWriter) -> Result<(), StoreError> {
        self.put(id, writer.to_pooled(&self.pool))
    }

    /// Retained handle to the record; the caller owns the extra reference.
    pub fn get(&self, id: Uuid) -> Result<AnyBuffer, StoreError> {
        self.objects
            .read()
            .get(&id)
            .map(Buffer::retain)
            .ok_or(StoreError::NotFound(id))
    }

    pub fn get_reader(&self, id: Uuid) -> Result<ObjectReader<AnyBuffer>, StoreError> {
        let buf = self.get(id)?;
        Ok(ObjectReader::new(buf)?)
    }

    /// Zero-copy vector of the record, kept alive by the returned view.
    ///
    /// `Ok(None)` when the record has no vector section.
    pub fn get_vector(&self, id: Uuid) -> Result<Option<VectorRef<AnyBuffer>>, StoreError> {
        Ok(self.get_reader(id)?.into_vector()?)
    }

    pub fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let removed = self.objects.write().remove(&id);
        match removed {
            Some(buf) => {
                tracing::debug!(%id, len = buf.len(), "deleted object");
                buf.release();
                Ok(())
            }
            None => Err(StoreError::NotFound(id)),
        }
    }

    pub fn exists(&self, id: Uuid) -> bool {
        self.objects.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Release every record.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.objects.write());
        tracing::debug!(count = drained.len(), "cleared object store");
        // Buffers are released outside the lock; pooled blocks may be
        // reclaimed here.
        drop(drained);
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn stats(&self) -> StoreStats {
        let objects = self.objects.read();
        let count = objects.len();
        if count == 0 {
            return StoreStats::default();
        }

        let mut stats = StoreStats {
            object_count: count,
            smallest_object: usize::MAX,
            ..StoreStats::default()
        };
        for buf in objects.values() {
            let size = buf.len();
            stats.total_bytes += size;
            stats.largest_object = stats.largest_object.max(size);
            stats.smallest_object = stats.smallest_object.min(size);
        }
        stats.average_size = stats.total_bytes / count;
        stats
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("objects", &self.len())
            .field("pool", &self.pool)
            .finish()
    }
}
