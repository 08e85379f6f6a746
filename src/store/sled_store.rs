//! Sled-backed document store
//!
//! One sled tree per collection, documents stored as JSON. Every mutation is
//! an optimistic read/compare-and-swap loop on a single key, which is the
//! only atomicity the layers above rely on. Sled work runs on the blocking
//! pool.

use super::{
    apply_increments, merge_fields, Document, DocumentStore, Filter, IncrementOutcome, OnceKey,
    Query, StoreError,
};
use async_trait::async_trait;
use std::path::Path;

pub struct SledDocumentStore {
    db: sled::Db,
}

impl SledDocumentStore {
    /// Open (or create) a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Store that is removed when dropped
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// Run sled work on the blocking pool; sled calls may hit the disk
    async fn blocking<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(sled::Db) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db))
            .await
            .map_err(|e| StoreError::Unavailable(format!("sled task failed: {}", e)))?
    }
}

fn decode(bytes: &[u8]) -> Result<Document, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn encode(doc: &Document) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(doc)?)
}

/// Read-modify-write one document. `f` returns whether to write and the
/// value handed back to the caller; it may run more than once on contention.
fn modify<R, F>(db: &sled::Db, collection: &str, id: &str, mut f: F) -> Result<R, StoreError>
where
    F: FnMut(&mut Document) -> Result<(bool, R), StoreError>,
{
    let tree = db.open_tree(collection)?;
    loop {
        let current = tree.get(id)?.ok_or_else(|| StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })?;

        let mut doc = decode(&current)?;
        let (write, out) = f(&mut doc)?;
        if !write {
            return Ok(out);
        }

        let next = encode(&doc)?;
        match tree.compare_and_swap(id, Some(current), Some(next))? {
            Ok(()) => return Ok(out),
            Err(_) => {
                tracing::trace!("CAS contention on {}/{}, retrying", collection, id);
                continue;
            }
        }
    }
}

#[async_trait]
impl DocumentStore for SledDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.blocking(move |db| {
            db.open_tree(&collection)?
                .get(&id)?
                .map(|bytes| decode(&bytes))
                .transpose()
        })
        .await
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        let collection = collection.to_string();
        let docs = self
            .blocking(move |db| {
                let mut docs = Vec::new();
                for item in db.open_tree(&collection)?.iter() {
                    let (_key, value) = item?;
                    docs.push(decode(&value)?);
                }
                Ok(docs)
            })
            .await?;
        Ok(query.apply(docs))
    }

    async fn create(&self, collection: &str, id: &str, fields: Document) -> Result<(), StoreError> {
        let bytes = encode(&fields)?;
        let (collection, id) = (collection.to_string(), id.to_string());
        self.blocking(move |db| {
            match db
                .open_tree(&collection)?
                .compare_and_swap(&id, None as Option<&[u8]>, Some(bytes))?
            {
                Ok(()) => Ok(()),
                Err(_) => Err(StoreError::AlreadyExists { collection, id }),
            }
        })
        .await
    }

    async fn put(&self, collection: &str, id: &str, fields: Document) -> Result<(), StoreError> {
        let bytes = encode(&fields)?;
        let (collection, id) = (collection.to_string(), id.to_string());
        self.blocking(move |db| {
            db.open_tree(&collection)?.insert(id.as_bytes(), bytes)?;
            Ok(())
        })
        .await
    }

    async fn update(&self, collection: &str, id: &str, fields: Document) -> Result<(), StoreError> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.blocking(move |db| {
            modify(&db, &collection, &id, |doc| {
                merge_fields(doc, fields.clone());
                Ok((true, ()))
            })
        })
        .await
    }

    async fn update_if(
        &self,
        collection: &str,
        id: &str,
        precondition: &[Filter],
        fields: Document,
    ) -> Result<bool, StoreError> {
        let (collection, id) = (collection.to_string(), id.to_string());
        let precondition = precondition.to_vec();
        self.blocking(move |db| {
            modify(&db, &collection, &id, |doc| {
                if !precondition.iter().all(|f| f.matches(doc)) {
                    return Ok((false, false));
                }
                merge_fields(doc, fields.clone());
                Ok((true, true))
            })
        })
        .await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.blocking(move |db| Ok(db.open_tree(&collection)?.remove(&id)?.is_some()))
            .await
    }

    async fn atomic_increment(
        &self,
        collection: &str,
        id: &str,
        deltas: &[(&str, i64)],
        once: Option<OnceKey<'_>>,
    ) -> Result<IncrementOutcome, StoreError> {
        let (collection, id) = (collection.to_string(), id.to_string());
        let deltas: Vec<(String, i64)> = deltas.iter().map(|(f, d)| (f.to_string(), *d)).collect();
        let once = once.map(|o| (o.key.to_string(), o.retain_ms));

        self.blocking(move |db| {
            let deltas: Vec<(&str, i64)> = deltas.iter().map(|(f, d)| (f.as_str(), *d)).collect();
            let once = once.as_ref().map(|(key, retain_ms)| OnceKey {
                key: key.as_str(),
                retain_ms: *retain_ms,
            });
            modify(&db, &collection, &id, |doc| {
                if apply_increments(doc, &deltas, once)? {
                    Ok((true, IncrementOutcome::Applied(doc.clone())))
                } else {
                    Ok((false, IncrementOutcome::Duplicate))
                }
            })
        })
        .await
    }
}
