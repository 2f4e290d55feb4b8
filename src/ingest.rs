//! JSON object requests to binary records
//!
//! Turns a JSON object request into an encoded record, stores it in an
//! [`ObjectStore`] and registers its vector in a [`VectorIndex`]. Property
//! offsets are kept beside the store because the record format carries no
//! offset table.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use quiver_core::buffer::Buffer;
use quiver_core::index::{IndexError, Metric, SearchHit, VectorIndex};
use quiver_core::object::{ObjectError, ObjectReader, ObjectWriter};
use quiver_core::pool::BufferPool;
use quiver_core::store::{ObjectStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result count used when a search asks for 0 hits.
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Object format error: {0}")]
    Object(#[from] ObjectError),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRequest {
    pub id: Uuid,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectResponse {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub vector: Vec<f32>,
    #[serde(default)]
    pub limit: usize,
}

/// Record offsets of one key/value property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyOffsets {
    pub key: usize,
    pub value: usize,
}

#[derive(Debug)]
pub struct EncodedObject {
    pub writer: ObjectWriter,
    pub property_offsets: Vec<PropertyOffsets>,
}

/// Encode the header, then every property as key and value strings in key
/// order, then the vector when it is non-empty.
pub fn encode_request(request: &ObjectRequest) -> EncodedObject {
    let mut writer = ObjectWriter::new(4096);
    let property_count =
        u32::try_from(request.properties.len()).expect("more than u32::MAX properties");
    writer.write_header(property_count);

    let property_offsets = request
        .properties
        .iter()
        .map(|(key, value)| PropertyOffsets {
            key: writer.write_string(key),
            value: writer.write_string(value),
        })
        .collect();

    if !request.vector.is_empty() {
        writer.write_vector(&request.vector);
    }

    EncodedObject {
        writer,
        property_offsets,
    }
}

pub fn decode_properties<B: Buffer>(
    reader: &ObjectReader<B>,
    offsets: &[PropertyOffsets],
) -> Result<BTreeMap<String, String>, ObjectError> {
    offsets
        .iter()
        .map(|o| -> Result<_, ObjectError> {
            Ok((reader.string_at(o.key)?, reader.string_at(o.value)?))
        })
        .collect()
}

/// An object store and a vector index kept in step.
///
/// Writers hold the `offsets` write lock across the store and index updates,
/// so a record, its property offsets and its index entry always change
/// together. Lock order is `offsets`, then store or index.
pub struct Ingestor {
    store: ObjectStore,
    index: VectorIndex,
    offsets: RwLock<HashMap<Uuid, Vec<PropertyOffsets>>>,
}

impl Ingestor {
    /// # Panics
    ///
    /// Panics if `dim` is 0.
    pub fn new(dim: usize, metric: Metric) -> Self {
        Self::with_pool(dim, metric, BufferPool::new())
    }

    pub fn with_pool(dim: usize, metric: Metric, pool: BufferPool) -> Self {
        Self {
            store: ObjectStore::with_pool(pool),
            index: VectorIndex::with_metric(dim, metric),
            offsets: RwLock::new(HashMap::new()),
        }
    }

    /// Store the object and index its vector.
    ///
    /// Re-ingesting an id replaces both its record and its index entry. A
    /// request whose vector has the wrong dimension is rejected before
    /// anything is stored.
    pub fn ingest(&self, request: &ObjectRequest) -> Result<(), IngestError> {
        let dim = self.index.dimension();
        if !request.vector.is_empty() && request.vector.len() != dim {
            return Err(IndexError::DimensionMismatch {
                expected: dim,
                actual: request.vector.len(),
            }
            .into());
        }

        let EncodedObject {
            writer,
            property_offsets,
        } = encode_request(request);

        let mut offsets = self.offsets.write();
        self.store.put_encoded(request.id, &writer)?;
        offsets.insert(request.id, property_offsets);

        if self.index.delete(request.id).is_ok() {
            tracing::debug!(id = %request.id, "replacing indexed vector");
        }
        if !request.vector.is_empty() {
            self.index.add_vector(request.id, &request.vector)?;
        }
        drop(offsets);

        tracing::debug!(
            id = %request.id,
            bytes = writer.len(),
            properties = request.properties.len(),
            "ingested object"
        );
        Ok(())
    }

    /// Parse a JSON object request and ingest it; returns its id.
    pub fn ingest_json(&self, body: &[u8]) -> Result<Uuid, IngestError> {
        let request: ObjectRequest = serde_json::from_slice(body)?;
        self.ingest(&request)?;
        Ok(request.id)
    }

    /// Decode a stored object back into its request shape.
    pub fn fetch(&self, id: Uuid) -> Result<ObjectResponse, IngestError> {
        let offsets = self.offsets.read();
        let reader = self.store.get_reader(id)?;
        let vector = reader.vector()?.map(<[f32]>::to_vec).unwrap_or_default();
        let properties = match offsets.get(&id) {
            Some(offsets) => decode_properties(&reader, offsets)?,
            None => BTreeMap::new(),
        };
        Ok(ObjectResponse {
            id,
            properties,
            vector,
        })
    }

    /// Delete from the store; the index entry goes too if there is one.
    pub fn remove(&self, id: Uuid) -> Result<(), IngestError> {
        let mut offsets = self.offsets.write();
        self.store.delete(id)?;
        offsets.remove(&id);
        // Objects without a vector were never indexed.
        let _ = self.index.delete(id);
        Ok(())
    }

    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<SearchHit>, IngestError> {
        let limit = if limit == 0 { DEFAULT_SEARCH_LIMIT } else { limit };
        Ok(self.index.search(query, limit)?)
    }

    pub fn search_json(&self, body: &[u8]) -> Result<Vec<SearchHit>, IngestError> {
        let request: SearchRequest = serde_json::from_slice(body)?;
        self.search(&request.vector, request.limit)
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }
}
