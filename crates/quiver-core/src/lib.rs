//! Quiver Core – zero-copy buffers, object records and vector search primitives
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        ObjectStore (id → record)   VectorIndex (scan)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │     Object codec (16-byte header · strings · f32 vector)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │   BufferPool (size classes)   ·   SIMD kernels (dispatch)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │      Buffer: HeapBuffer · MmapBuffer (shared ref-count)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod buffer;
pub mod index;
pub mod object;
pub mod pool;
pub mod simd;
pub mod store;

pub use buffer::{AnyBuffer, Buffer, BufferError, HeapBuffer, MmapBuffer};
pub use index::{IndexError, Metric, SearchHit, VectorIndex};
pub use object::{ObjectError, ObjectHeader, ObjectReader, ObjectWriter, VectorRef};
pub use pool::{BufferPool, PoolConfig, PoolStats};
pub use simd::{dot_product, l2_distance, l2_distance_squared};
pub use store::{ObjectStore, StoreError, StoreStats};
