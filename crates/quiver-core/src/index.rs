//! Linear-scan vector index
//!
//! Vectors of one fixed dimension live back to back in an append-only
//! `Vec<f32>`. Each id maps to the byte offset of its slot, and each offset
//! maps back to its id.
//!
//! ```text
//! data:  [ v0 ........ | v1 ........ | v2 (deleted) | v3 ........ ]
//!          offset 0      offset 4·dim  offset 8·dim   offset 12·dim
//! ```
//!
//! Deleting only drops the map entries; the slot stays allocated until the
//! index is dropped. Search holds the read lock for the whole scan.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::simd;

const F32_SIZE: usize = std::mem::size_of::<f32>();

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Vector already exists: {0}")]
    Duplicate(Uuid),

    #[error("Vector not found: {0}")]
    NotFound(Uuid),
}

/// Similarity score used by [`VectorIndex::search`]. Higher is more similar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Raw dot product. Equals cosine similarity for unit vectors.
    #[default]
    DotProduct,
    /// Negated L2 distance.
    Euclidean,
}

impl Metric {
    #[inline]
    pub fn score(self, query: &[f32], vector: &[f32]) -> f32 {
        match self {
            Metric::DotProduct => simd::dot_product(query, vector),
            Metric::Euclidean => -simd::l2_distance(query, vector),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: Uuid,
    pub score: f32,
}

/// Ranking order: higher score first, then lower id.
struct Ranked(SearchHit);

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .score
            .total_cmp(&other.0.score)
            .then_with(|| other.0.id.cmp(&self.0.id))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

#[derive(Default)]
struct Slots {
    data: Vec<f32>,
    /// Byte offsets into `data`.
    id_to_offset: HashMap<Uuid, usize>,
    offset_to_id: HashMap<usize, Uuid>,
}

pub struct VectorIndex {
    dim: usize,
    metric: Metric,
    inner: RwLock<Slots>,
}

impl VectorIndex {
    /// # Panics
    ///
    /// Panics if `dim` is 0.
    pub fn new(dim: usize) -> Self {
        Self::with_metric(dim, Metric::default())
    }

    pub fn with_metric(dim: usize, metric: Metric) -> Self {
        assert!(dim > 0, "vector dimension must be positive");
        Self {
            dim,
            metric,
            inner: RwLock::new(Slots::default()),
        }
    }

    pub fn add_vector(&self, id: Uuid, vector: &[f32]) -> Result<(), IndexError> {
        self.check_dimension(vector)?;

        let mut slots = self.inner.write();
        if slots.id_to_offset.contains_key(&id) {
            return Err(IndexError::Duplicate(id));
        }

        let offset = slots.data.len() * F32_SIZE;
        slots.data.extend_from_slice(vector);
        slots.id_to_offset.insert(id, offset);
        slots.offset_to_id.insert(offset, id);
        Ok(())
    }

    /// Zero-copy view of a stored vector. Holds the read lock while alive.
    pub fn get_vector(&self, id: Uuid) -> Result<MappedRwLockReadGuard<'_, [f32]>, IndexError> {
        let slots = self.inner.read();
        let offset = *slots.id_to_offset.get(&id).ok_or(IndexError::NotFound(id))?;
        let start = offset / F32_SIZE;
        let end = start + self.dim;
        Ok(RwLockReadGuard::map(slots, |s| &s.data[start..end]))
    }

    /// Top `k` live vectors by descending score; ties go to the lower id.
    ///
    /// `k` is clamped to the number of live vectors.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, IndexError> {
        self.check_dimension(query)?;

        let slots = self.inner.read();
        let k = k.min(slots.id_to_offset.len());
        if k == 0 {
            return Ok(Vec::new());
        }

        // Min-heap of the best `k` so far; the root is the weakest hit.
        let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(k + 1);
        for (&id, &offset) in &slots.id_to_offset {
            let start = offset / F32_SIZE;
            let score = self.metric.score(query, &slots.data[start..start + self.dim]);
            heap.push(Reverse(Ranked(SearchHit { id, score })));
            if heap.len() > k {
                heap.pop();
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(Ranked(hit))| hit)
            .collect())
    }

    /// Remove the entry for `id`. The slot is not reclaimed.
    pub fn delete(&self, id: Uuid) -> Result<(), IndexError> {
        let mut slots = self.inner.write();
        let offset = slots.id_to_offset.remove(&id).ok_or(IndexError::NotFound(id))?;
        slots.offset_to_id.remove(&offset);
        Ok(())
    }

    /// Number of live vectors.
    pub fn len(&self) -> usize {
        self.inner.read().id_to_offset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner.read().id_to_offset.contains_key(&id)
    }

    /// Slots ever appended, deleted ones included.
    pub fn allocated_slots(&self) -> usize {
        self.inner.read().data.len() / self.dim
    }

    /// Bytes held by the backing array.
    pub fn memory_bytes(&self) -> usize {
        self.inner.read().data.capacity() * F32_SIZE
    }

    /// Id stored at a byte offset, if that slot is live.
    pub fn id_at_offset(&self, offset: usize) -> Option<Uuid> {
        self.inner.read().offset_to_id.get(&offset).copied()
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn metric(&self) -> Metric {
        self.metric
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dim", &self.dim)
            .field("metric", &self.metric)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn test_add_and_get() {
        let index = VectorIndex::new(3);
        index.add_vector(id(1), &[1.0, 2.0, 3.0]).unwrap();
        index.add_vector(id(2), &[4.0, 5.0, 6.0]).unwrap();

        assert_eq!(&*index.get_vector(id(2)).unwrap(), &[4.0, 5.0, 6.0]);
        assert_eq!(index.len(), 2);
        assert_eq!(index.id_at_offset(12), Some(id(2)));
    }

    #[test]
    fn test_dimension_mismatch() {
        let index = VectorIndex::new(3);
        assert_eq!(
            index.add_vector(id(1), &[1.0, 2.0]),
            Err(IndexError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        );
        assert!(index.is_empty());
        assert!(matches!(
            index.search(&[1.0; 4], 1),
            Err(IndexError::DimensionMismatch { actual: 4, .. })
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let index = VectorIndex::new(2);
        index.add_vector(id(1), &[1.0, 0.0]).unwrap();
        assert_eq!(
            index.add_vector(id(1), &[0.0, 1.0]),
            Err(IndexError::Duplicate(id(1)))
        );
        assert_eq!(&*index.get_vector(id(1)).unwrap(), &[1.0, 0.0]);
    }

    #[test]
    fn test_search_top_k_with_ties() {
        let index = VectorIndex::new(3);
        let (a, b, c, d) = (id(0xA), id(0xB), id(0xC), id(0xD));
        index.add_vector(a, &[1.0, 0.0, 0.0]).unwrap();
        index.add_vector(b, &[0.0, 1.0, 0.0]).unwrap();
        index.add_vector(c, &[0.0, 0.0, 1.0]).unwrap();
        index.add_vector(d, &[1.0, 1.0, 0.0]).unwrap();

        let hits = index.search(&[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0], SearchHit { id: a, score: 1.0 });
        assert_eq!(hits[1], SearchHit { id: d, score: 1.0 });

        let all = index.search(&[1.0, 0.0, 0.0], 10).unwrap();
        let ids: Vec<_> = all.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![a, d, b, c]);
        assert_eq!(all[2].score, 0.0);
    }

    #[test]
    fn test_search_empty_or_zero_k() {
        let index = VectorIndex::new(2);
        assert!(index.search(&[1.0, 1.0], 5).unwrap().is_empty());

        index.add_vector(id(1), &[1.0, 1.0]).unwrap();
        assert!(index.search(&[1.0, 1.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_delete_keeps_slot() {
        let index = VectorIndex::new(2);
        index.add_vector(id(1), &[1.0, 0.0]).unwrap();
        index.add_vector(id(2), &[0.0, 1.0]).unwrap();

        index.delete(id(1)).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.allocated_slots(), 2);
        assert!(!index.contains(id(1)));
        assert_eq!(index.id_at_offset(0), None);
        assert_eq!(index.get_vector(id(1)).unwrap_err(), IndexError::NotFound(id(1)));
        assert_eq!(index.delete(id(1)), Err(IndexError::NotFound(id(1))));

        let hits = index.search(&[1.0, 0.0], 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id(2));

        // Re-adding appends a fresh slot.
        index.add_vector(id(1), &[2.0, 2.0]).unwrap();
        assert_eq!(index.allocated_slots(), 3);
        assert_eq!(index.id_at_offset(16), Some(id(1)));
    }

    #[test]
    fn test_euclidean_metric() {
        let index = VectorIndex::with_metric(2, Metric::Euclidean);
        index.add_vector(id(1), &[0.0, 0.0]).unwrap();
        index.add_vector(id(2), &[3.0, 4.0]).unwrap();
        index.add_vector(id(3), &[10.0, 10.0]).unwrap();

        let hits = index.search(&[3.0, 3.0], 2).unwrap();
        assert_eq!(hits[0].id, id(2));
        assert!((hits[0].score + 1.0).abs() < 1e-6);
        assert_eq!(hits[1].id, id(1));
    }

    #[test]
    fn test_nan_scores_do_not_panic() {
        let index = VectorIndex::new(1);
        index.add_vector(id(1), &[f32::NAN]).unwrap();
        index.add_vector(id(2), &[1.0]).unwrap();
        let hits = index.search(&[1.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_metric_serde() {
        let metric: Metric = serde_json::from_str("\"euclidean\"").unwrap();
        assert_eq!(metric, Metric::Euclidean);
        assert_eq!(Metric::default(), Metric::DotProduct);
    }

    #[test]
    #[should_panic(expected = "dimension must be positive")]
    fn test_zero_dimension_panics() {
        let _ = VectorIndex::new(0);
    }

    #[test]
    fn test_concurrent_add_and_search() {
        let index = Arc::new(VectorIndex::new(8));
        std::thread::scope(|s| {
            for t in 0..4u128 {
                let index = Arc::clone(&index);
                s.spawn(move || {
                    for i in 0..100u128 {
                        let vector = [(t * 100 + i) as f32; 8];
                        index.add_vector(id(t * 1000 + i), &vector).unwrap();
                        let hits = index.search(&vector, 3).unwrap();
                        assert!(!hits.is_empty());
                    }
                });
            }
        });
        assert_eq!(index.len(), 400);
    }
}
