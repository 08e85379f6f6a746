//! In-process store implementations
//!
//! Used for embedding, local development and tests. A single write lock
//! guards each mutation, which gives the same per-document atomicity a remote
//! store offers.

use super::{
    apply_increments, merge_fields, BlobStore, Document, DocumentStore, Filter, IncrementOutcome,
    OnceKey, Query, StoreError,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

type Collection = BTreeMap<String, Document>;

/// Document store backed by process memory.
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    fn not_found(collection: &str, id: &str) -> StoreError {
        StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        let guard = self.collections.read();
        let docs = guard
            .get(collection)
            .map(|c| c.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(query.apply(docs))
    }

    async fn create(&self, collection: &str, id: &str, fields: Document) -> Result<(), StoreError> {
        let mut guard = self.collections.write();
        let docs = guard.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            return Err(StoreError::AlreadyExists {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        docs.insert(id.to_string(), fields);
        Ok(())
    }

    async fn put(&self, collection: &str, id: &str, fields: Document) -> Result<(), StoreError> {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, fields: Document) -> Result<(), StoreError> {
        let mut guard = self.collections.write();
        let doc = guard
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| Self::not_found(collection, id))?;
        merge_fields(doc, fields);
        Ok(())
    }

    async fn update_if(
        &self,
        collection: &str,
        id: &str,
        precondition: &[Filter],
        fields: Document,
    ) -> Result<bool, StoreError> {
        let mut guard = self.collections.write();
        let doc = guard
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| Self::not_found(collection, id))?;
        if !precondition.iter().all(|f| f.matches(doc)) {
            return Ok(false);
        }
        merge_fields(doc, fields);
        Ok(true)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .collections
            .write()
            .get_mut(collection)
            .map(|c| c.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn atomic_increment(
        &self,
        collection: &str,
        id: &str,
        deltas: &[(&str, i64)],
        once: Option<OnceKey<'_>>,
    ) -> Result<IncrementOutcome, StoreError> {
        let mut guard = self.collections.write();
        let doc = guard
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| Self::not_found(collection, id))?;

        // Work on a copy so a corrupt counter leaves the document untouched
        let mut next = doc.clone();
        if !apply_increments(&mut next, deltas, once)? {
            return Ok(IncrementOutcome::Duplicate);
        }
        *doc = next.clone();
        Ok(IncrementOutcome::Applied(next))
    }
}

/// Blob store backed by process memory.
pub struct MemoryBlobStore {
    base_url: String,
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            blobs: DashMap::new(),
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.blobs.contains_key(path)
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs.get(path).map(|b| b.value().clone())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String, StoreError> {
        self.blobs.insert(path.to_string(), bytes);
        Ok(path.to_string())
    }

    async fn url(&self, path: &str) -> Result<String, StoreError> {
        if !self.blobs.contains_key(path) {
            return Err(StoreError::NotFound {
                collection: "blobs".to_string(),
                id: path.to_string(),
            });
        }
        Ok(format!("{}/{}", self.base_url, path))
    }

    async fn delete(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.blobs.remove(path).is_some())
    }

    async fn list_under(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut paths: Vec<String> = self
            .blobs
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        paths.sort();
        Ok(paths)
    }
}
