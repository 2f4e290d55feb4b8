//! Quiver-DB: a zero-copy object and vector memory layer
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │               JSON object requests (ingest)                 │
//! │          encode · store · index · fetch · search            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          ObjectStore  +  VectorIndex (linear scan)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │       Pooled / mmap buffers with shared ref-counting        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod ingest;

pub use quiver_core::{buffer, index, object, pool, simd, store};

pub use ingest::{Ingestor, ObjectRequest, ObjectResponse};
pub use quiver_core::{
    AnyBuffer, Buffer, BufferPool, HeapBuffer, Metric, MmapBuffer, ObjectReader, ObjectStore,
    ObjectWriter, SearchHit, VectorIndex,
};
