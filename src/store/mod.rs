//! Store Module - Collaborator contracts for document and blob storage
//!
//! Everything above this module treats storage as a remote, schemaless
//! document store with single-document atomicity only. No operation here
//! spans more than one document.

mod fs_blob;
mod memory;
mod query;
mod sled_store;

pub use fs_blob::FsBlobStore;
pub use memory::{MemoryBlobStore, MemoryDocumentStore};
pub use query::{field_at, set_field, Direction, Filter, FilterOp, Query};
pub use sled_store::SledDocumentStore;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A schemaless document: a JSON object keyed by field name.
pub type Document = serde_json::Map<String, Value>;

/// Reserved field mapping recently applied idempotency keys to the time
/// (epoch millis) they were applied.
pub const APPLIED_OPS_FIELD: &str = "_applied_ops";

/// Idempotency key for an increment, remembered on the document for
/// `retain_ms` after it was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnceKey<'a> {
    pub key: &'a str,
    pub retain_ms: i64,
}

impl<'a> OnceKey<'a> {
    pub fn new(key: &'a str, retain: chrono::Duration) -> Self {
        Self {
            key,
            retain_ms: retain.num_milliseconds(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Document already exists: {collection}/{id}")]
    AlreadyExists { collection: String, id: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt document: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result of an atomic increment.
#[derive(Debug, Clone, PartialEq)]
pub enum IncrementOutcome {
    /// Deltas were applied; carries the document as written.
    Applied(Document),
    /// The idempotency key had already been applied; nothing changed.
    Duplicate,
}

/// Remote document store with per-document atomicity.
///
/// Queries may lag behind writes on some backends. Callers that need
/// read-your-write must re-read by id with [`DocumentStore::get`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Create a document. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, collection: &str, id: &str, fields: Document) -> Result<(), StoreError>;

    /// Create or replace a document.
    async fn put(&self, collection: &str, id: &str, fields: Document) -> Result<(), StoreError>;

    /// Merge fields into an existing document. Dotted keys address nested fields.
    async fn update(&self, collection: &str, id: &str, fields: Document) -> Result<(), StoreError>;

    /// Merge fields only if every filter in `precondition` matches the current
    /// document. Returns whether the write happened.
    async fn update_if(
        &self,
        collection: &str,
        id: &str,
        precondition: &[Filter],
        fields: Document,
    ) -> Result<bool, StoreError>;

    /// Delete a document. Returns whether it existed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError>;

    /// Atomically add `deltas` to integer fields of one document.
    ///
    /// Counters never fall below zero. With `once`, the key is recorded in the
    /// same write and a replay within its retention returns
    /// [`IncrementOutcome::Duplicate`].
    async fn atomic_increment(
        &self,
        collection: &str,
        id: &str,
        deltas: &[(&str, i64)],
        once: Option<OnceKey<'_>>,
    ) -> Result<IncrementOutcome, StoreError>;
}

/// Object storage for media blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String, StoreError>;

    async fn url(&self, path: &str) -> Result<String, StoreError>;

    async fn delete(&self, path: &str) -> Result<bool, StoreError>;

    async fn list_under(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Collection naming shared by every component.
pub mod collections {
    /// Account documents (plan, usage counters, family cross-reference).
    pub const USERS: &str = "users";

    /// Global memory mirror, for cross-owner queries.
    pub const GLOBAL_MEMORIES: &str = "memories";

    /// Family membership records across all family units.
    pub const FAMILY_MEMBERS: &str = "family_members";

    pub const COMMISSION_LEDGER: &str = "commission_ledger";

    /// One document per usage commit, keyed `{account}:{idempotency key}`.
    pub const QUOTA_COMMITS: &str = "quota_commits";

    /// Owner-scoped memory collection, authoritative for per-user reads.
    pub fn owner_memories(owner_id: &str) -> String {
        format!("users/{}/memories", owner_id)
    }

    pub fn owner_folders(owner_id: &str) -> String {
        format!("users/{}/folders", owner_id)
    }
}

/// Convert a typed record into a document.
pub fn to_document<T: Serialize>(value: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Serialization(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

/// Convert a document back into a typed record. Reserved fields are ignored.
pub fn from_document<T: DeserializeOwned>(mut doc: Document) -> Result<T, StoreError> {
    doc.remove(APPLIED_OPS_FIELD);
    serde_json::from_value(Value::Object(doc)).map_err(|e| StoreError::Corrupt(e.to_string()))
}

/// Build a document from `(field, value)` pairs.
pub fn fields<I, K>(pairs: I) -> Document
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Merge `fields` into `doc`, honouring dotted paths.
pub(crate) fn merge_fields(doc: &mut Document, fields: Document) {
    for (path, value) in fields {
        set_field(doc, &path, value);
    }
}

/// Apply increments to a document in place. Shared by every backend so the
/// clamping and idempotency rules are identical.
///
/// Returns `false` when the key was already recorded.
pub(crate) fn apply_increments(
    doc: &mut Document,
    deltas: &[(&str, i64)],
    once: Option<OnceKey<'_>>,
) -> Result<bool, StoreError> {
    apply_increments_at(doc, deltas, once, chrono::Utc::now().timestamp_millis())
}

pub(crate) fn apply_increments_at(
    doc: &mut Document,
    deltas: &[(&str, i64)],
    once: Option<OnceKey<'_>>,
    now_ms: i64,
) -> Result<bool, StoreError> {
    let mut applied = match doc.get(APPLIED_OPS_FIELD) {
        Some(Value::Object(keys)) => keys.clone(),
        _ => Document::new(),
    };

    if let Some(once) = once {
        if applied.contains_key(once.key) {
            return Ok(false);
        }
    }

    for (path, delta) in deltas {
        let current = match field_at(doc, path) {
            None | Some(Value::Null) => 0,
            Some(v) => v.as_i64().ok_or_else(|| {
                StoreError::Corrupt(format!("field {} is not an integer counter", path))
            })?,
        };
        let next = current.saturating_add(*delta).max(0);
        set_field(doc, path, Value::from(next));
    }

    if let Some(once) = once {
        applied.retain(|_, at| {
            at.as_i64()
                .map_or(false, |at| now_ms.saturating_sub(at) <= once.retain_ms)
        });
        applied.insert(once.key.to_string(), Value::from(now_ms));
        doc.insert(APPLIED_OPS_FIELD.to_string(), Value::Object(applied));
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_increments_clamp_at_zero() {
        let mut d = doc(json!({ "usage": { "files": 2 } }));
        assert!(apply_increments(&mut d, &[("usage.files", -5)], None).unwrap());
        assert_eq!(field_at(&d, "usage.files"), Some(&json!(0)));
    }

    #[test]
    fn test_increments_missing_field_starts_at_zero() {
        let mut d = Document::new();
        apply_increments(&mut d, &[("usage.bytes", 10), ("usage.files", 1)], None).unwrap();
        assert_eq!(field_at(&d, "usage.bytes"), Some(&json!(10)));
        assert_eq!(field_at(&d, "usage.files"), Some(&json!(1)));
    }

    fn once(key: &str) -> Option<OnceKey<'_>> {
        Some(OnceKey::new(key, chrono::Duration::hours(1)))
    }

    #[test]
    fn test_once_key_blocks_replay() {
        let mut d = Document::new();
        assert!(apply_increments(&mut d, &[("n", 1)], once("op-1")).unwrap());
        assert!(!apply_increments(&mut d, &[("n", 1)], once("op-1")).unwrap());
        assert!(apply_increments(&mut d, &[("n", 1)], once("op-2")).unwrap());
        assert_eq!(field_at(&d, "n"), Some(&json!(2)));
    }

    #[test]
    fn test_keys_are_not_evicted_by_volume() {
        let mut d = Document::new();
        apply_increments_at(&mut d, &[("n", 1)], once("first"), 1_000).unwrap();
        for i in 0..1_000 {
            apply_increments_at(&mut d, &[("n", 1)], once(&format!("op-{}", i)), 2_000).unwrap();
        }
        assert!(!apply_increments_at(&mut d, &[("n", 1)], once("first"), 3_000).unwrap());
        assert_eq!(field_at(&d, "n"), Some(&json!(1_001)));
    }

    #[test]
    fn test_keys_expire_after_retention() {
        let hour = 3_600_000;
        let mut d = Document::new();
        apply_increments_at(&mut d, &[("n", 1)], once("old"), 0).unwrap();
        apply_increments_at(&mut d, &[("n", 1)], once("recent"), hour / 2).unwrap();
        apply_increments_at(&mut d, &[("n", 1)], once("now"), hour + 1).unwrap();

        let kept = d[APPLIED_OPS_FIELD].as_object().unwrap();
        assert!(!kept.contains_key("old"));
        assert!(kept.contains_key("recent"));
        assert!(kept.contains_key("now"));
    }

    #[test]
    fn test_non_integer_counter_is_corrupt() {
        let mut d = doc(json!({ "n": "three" }));
        let err = apply_increments(&mut d, &[("n", 1)], None).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn test_from_document_drops_reserved_fields() {
        #[derive(serde::Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Counter {
            n: i64,
        }

        let mut d = Document::new();
        apply_increments(&mut d, &[("n", 3)], once("k")).unwrap();
        let counter: Counter = from_document(d).unwrap();
        assert_eq!(counter.n, 3);
    }
}
