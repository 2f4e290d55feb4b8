//! Size-bucketed buffer pool
//!
//! A request is rounded up to the smallest size class that fits it. Each
//! class keeps its own idle list behind its own lock, so traffic on
//! different classes never contends. Buffers hold only a `Weak` reference
//! back to the pool and return their block automatically when the last
//! handle is dropped.
//!
//! ```text
//! get(3000) ──► [1K] [4K]* [16K] ... [16M]   ──► HeapBuffer { len: 3000, cap: 4096 }
//! get(20M)  ──► larger than every class       ──► ad hoc 32M block, not pooled
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::buffer::{Block, HeapBuffer, Recycler};

/// Default size classes: 1 KiB to 16 MiB.
pub const DEFAULT_BUCKET_SIZES: [usize; 8] = [
    1024,             // 1 KiB
    4 * 1024,         // 4 KiB
    16 * 1024,        // 16 KiB
    64 * 1024,        // 64 KiB
    256 * 1024,       // 256 KiB
    1024 * 1024,      // 1 MiB
    4 * 1024 * 1024,  // 4 MiB
    16 * 1024 * 1024, // 16 MiB
];

/// Default number of idle blocks retained per class.
pub const DEFAULT_MAX_IDLE_PER_BUCKET: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Size classes; sorted and de-duplicated on construction.
    pub bucket_sizes: Vec<usize>,
    /// Idle blocks kept per class; surplus returns are freed.
    pub max_idle_per_bucket: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            bucket_sizes: DEFAULT_BUCKET_SIZES.to_vec(),
            max_idle_per_bucket: DEFAULT_MAX_IDLE_PER_BUCKET,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketStats {
    pub size: usize,
    /// Blocks freshly allocated for this class.
    pub allocated: usize,
    /// Requests served from the idle list.
    pub reused: usize,
    /// Buffers of this class currently checked out.
    pub in_use: usize,
    /// Blocks currently idle.
    pub idle: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub buckets: Vec<BucketStats>,
    /// Requests larger than every class.
    pub oversized: usize,
}

struct Bucket {
    size: usize,
    idle: Mutex<Vec<Block>>,
    allocated: AtomicUsize,
    reused: AtomicUsize,
    in_use: AtomicUsize,
}

impl Bucket {
    fn new(size: usize) -> Self {
        Self {
            size,
            idle: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        }
    }

    fn acquire(&self) -> Block {
        let reused = self.idle.lock().pop();
        let block = match reused {
            Some(block) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(size = self.size, "reusing pooled block");
                block
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Block::zeroed(self.size)
            }
        };
        self.in_use.fetch_add(1, Ordering::Relaxed);
        block
    }

    fn snapshot(&self) -> BucketStats {
        BucketStats {
            size: self.size,
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            in_use: self.in_use.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
        }
    }
}

struct PoolInner {
    /// Ascending by `size`.
    buckets: Vec<Bucket>,
    max_idle: usize,
    oversized: AtomicUsize,
}

impl PoolInner {
    /// Index of the smallest class that fits `size`.
    fn bucket_for(&self, size: usize) -> Option<usize> {
        let idx = self.buckets.partition_point(|b| b.size < size);
        (idx < self.buckets.len()).then_some(idx)
    }

    /// Capacity for a request larger than every class: a multiple of the
    /// largest class.
    fn oversized_capacity(&self, size: usize) -> usize {
        match self.buckets.last() {
            Some(largest) => largest.size.saturating_mul(size / largest.size + 1),
            None => size,
        }
    }
}

impl Recycler for PoolInner {
    fn reclaim(&self, block: Block) {
        let Ok(idx) = self
            .buckets
            .binary_search_by_key(&block.capacity(), |b| b.size)
        else {
            // No matching class: the block is freed.
            return;
        };
        let bucket = &self.buckets[idx];
        let _ = bucket
            .in_use
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
        let mut idle = bucket.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(block);
        }
    }
}

/// Pool of reusable [`HeapBuffer`]s. Cloning shares the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    /// Pool with the default 1 KiB..16 MiB classes.
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    /// Pool with custom size classes and the default idle limit.
    pub fn with_sizes(sizes: &[usize]) -> Self {
        Self::with_config(PoolConfig {
            bucket_sizes: sizes.to_vec(),
            ..PoolConfig::default()
        })
    }

    pub fn with_config(config: PoolConfig) -> Self {
        let mut sizes = config.bucket_sizes;
        sizes.retain(|&s| s > 0);
        sizes.sort_unstable();
        sizes.dedup();

        Self {
            inner: Arc::new(PoolInner {
                buckets: sizes.into_iter().map(Bucket::new).collect(),
                max_idle: config.max_idle_per_bucket,
                oversized: AtomicUsize::new(0),
            }),
        }
    }

    /// Buffer with `len() == size` and `capacity() >= size`, ref-count 1.
    ///
    /// Never fails; falls back to a fresh allocation when the class is empty
    /// or `size` exceeds the largest class. Recycled memory is not zeroed.
    pub fn get(&self, size: usize) -> HeapBuffer {
        match self.inner.bucket_for(size) {
            Some(idx) => {
                let block = self.inner.buckets[idx].acquire();
                let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
                let weak: Weak<dyn Recycler> = weak;
                HeapBuffer::from_block(block, size, Some(weak))
            }
            None => {
                self.inner.oversized.fetch_add(1, Ordering::Relaxed);
                let capacity = self.inner.oversized_capacity(size);
                tracing::debug!(size, capacity, "allocating oversized buffer outside the pool");
                HeapBuffer::from_block(Block::zeroed(capacity), size, None)
            }
        }
    }

    /// Give back a handle.
    ///
    /// The block re-enters its class only once this was the last handle to
    /// it; buffers whose capacity matches no class are freed.
    pub fn put(&self, buffer: HeapBuffer) {
        drop(buffer);
    }

    /// The configured size classes, ascending.
    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.inner.buckets.iter().map(|b| b.size).collect()
    }

    /// The size class a request of `size` bytes is served from, or `None`
    /// when it exceeds every class.
    pub fn bucket_size_for(&self, size: usize) -> Option<usize> {
        self.inner
            .bucket_for(size)
            .map(|idx| self.inner.buckets[idx].size)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            buckets: self.inner.buckets.iter().map(Bucket::snapshot).collect(),
            oversized: self.inner.oversized.load(Ordering::Relaxed),
        }
    }

    /// Free every idle block; returns the number of bytes released.
    pub fn shrink(&self) -> usize {
        let freed: usize = self
            .inner
            .buckets
            .iter()
            .map(|bucket| {
                let drained = std::mem::take(&mut *bucket.idle.lock());
                drained.len() * bucket.size
            })
            .sum();
        tracing::debug!(freed, "shrunk buffer pool");
        freed
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("bucket_sizes", &self.bucket_sizes())
            .field("max_idle_per_bucket", &self.inner.max_idle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn test_get_rounds_up_to_bucket() {
        let pool = BufferPool::new();
        let buf = pool.get(3000);

        assert_eq!(buf.len(), 3000);
        assert_eq!(buf.capacity(), 4096);
        assert_eq!(buf.ref_count(), 1);
        assert!(buf.is_pooled());
    }

    #[test]
    fn test_get_multiple_sizes() {
        let pool = BufferPool::new();
        for (request, expected_cap) in [
            (1, 1024),
            (1024, 1024),
            (1025, 4096),
            (65536, 65536),
            (MIB + 1, 4 * MIB),
            (16 * MIB, 16 * MIB),
        ] {
            let buf = pool.get(request);
            assert_eq!(buf.len(), request);
            assert_eq!(buf.capacity(), expected_cap, "request {request}");
        }
    }

    #[test]
    fn test_zero_size_request() {
        let pool = BufferPool::new();
        let buf = pool.get(0);
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.capacity(), 1024);
    }

    #[test]
    fn test_release_returns_block_for_reuse() {
        let pool = BufferPool::with_sizes(&[1024]);
        let mut buf = pool.get(100);
        buf.bytes_mut().unwrap()[0] = 0xAB;
        let first_ptr = buf.as_ptr();
        buf.release();

        let stats = pool.stats();
        assert_eq!(stats.buckets[0].idle, 1);
        assert_eq!(stats.buckets[0].in_use, 0);

        let again = pool.get(200);
        assert_eq!(again.as_ptr(), first_ptr);
        assert_eq!(again.len(), 200);
        assert_eq!(again.ref_count(), 1);
        assert_eq!(pool.stats().buckets[0].reused, 1);
    }

    #[test]
    fn test_larger_than_every_bucket() {
        let pool = BufferPool::new();
        let buf = pool.get(20 * MIB);

        assert_eq!(buf.len(), 20 * MIB);
        assert!(buf.capacity() >= 20 * MIB);
        assert_eq!(buf.capacity() % (16 * MIB), 0);
        assert!(!buf.is_pooled());
        assert_eq!(pool.stats().oversized, 1);

        // Not pooled: nothing goes idle on release.
        buf.release();
        assert!(pool.stats().buckets.iter().all(|b| b.idle == 0));
    }

    #[test]
    fn test_live_references_prevent_return() {
        let pool = BufferPool::with_sizes(&[1024]);
        let buf = pool.get(10);
        let view = buf.slice(0, 5);

        pool.put(buf);
        assert_eq!(pool.stats().buckets[0].idle, 0);
        assert_eq!(pool.stats().buckets[0].in_use, 1);

        view.release();
        assert_eq!(pool.stats().buckets[0].idle, 1);
        assert_eq!(pool.stats().buckets[0].in_use, 0);
    }

    #[test]
    fn test_custom_sizes_sorted_and_deduped() {
        let pool = BufferPool::with_sizes(&[4096, 0, 512, 4096, 2048]);
        assert_eq!(pool.bucket_sizes(), vec![512, 2048, 4096]);
        assert_eq!(pool.bucket_size_for(600), Some(2048));
        assert_eq!(pool.bucket_size_for(4097), None);

        let buf = pool.get(5000);
        assert_eq!(buf.capacity(), 8192);
    }

    #[test]
    fn test_no_buckets_allocates_exact() {
        let pool = BufferPool::with_sizes(&[]);
        let buf = pool.get(123);
        assert_eq!(buf.len(), 123);
        assert_eq!(buf.capacity(), 123);
    }

    #[test]
    fn test_idle_limit() {
        let pool = BufferPool::with_config(PoolConfig {
            bucket_sizes: vec![64],
            max_idle_per_bucket: 2,
        });
        let held: Vec<_> = (0..5).map(|_| pool.get(64)).collect();
        drop(held);

        let stats = pool.stats();
        assert_eq!(stats.buckets[0].allocated, 5);
        assert_eq!(stats.buckets[0].idle, 2);
    }

    #[test]
    fn test_shrink_frees_idle_blocks() {
        let pool = BufferPool::with_sizes(&[1024, 4096]);
        drop(pool.get(10));
        drop(pool.get(2000));

        assert_eq!(pool.shrink(), 1024 + 4096);
        assert!(pool.stats().buckets.iter().all(|b| b.idle == 0));
    }

    #[test]
    fn test_buffer_outlives_pool() {
        let pool = BufferPool::new();
        let buf = pool.get(100);
        drop(pool);
        assert_eq!(buf.len(), 100);
        // The pool is gone; release frees the block.
        buf.release();
    }

    #[test]
    fn test_concurrent_get_put() {
        let pool = BufferPool::new();
        std::thread::scope(|s| {
            for t in 0..8 {
                let pool = pool.clone();
                s.spawn(move || {
                    for i in 0..200 {
                        let size = 512 + (t * 997 + i * 131) % 70_000;
                        let mut buf = pool.get(size);
                        assert_eq!(buf.len(), size);
                        buf.bytes_mut().unwrap().fill(t as u8);
                        buf.release();
                    }
                });
            }
        });
        assert!(pool.stats().buckets.iter().all(|b| b.in_use == 0));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: PoolConfig = serde_json::from_str(r#"{"max_idle_per_bucket": 4}"#).unwrap();
        assert_eq!(config.bucket_sizes, DEFAULT_BUCKET_SIZES.to_vec());
        assert_eq!(config.max_idle_per_bucket, 4);
    }
}
