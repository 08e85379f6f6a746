//! Memory library - upload, delete and move paths
//!
//! Upload order: authorize, store the blob, write the owner-scoped record,
//! mirror it globally, then commit usage. The usage commit is last so the
//! counter never covers a memory that does not exist. Retrying an upload with
//! the same `MemoryUpload` resumes instead of duplicating.
//!
//! Delete order: tombstone the record, delete the blob and the mirror, release
//! usage, then remove the record. A tombstoned memory is gone for readers and
//! repeating the delete finishes the remaining steps.

use super::{interrupted, FolderManager, MemoryType};
use crate::crypto::ContentHash;
use crate::quota::{QuotaGovernor, QuotaOperation, Usage};
use crate::store::{
    collections, fields, from_document, to_document, BlobStore, Direction, DocumentStore, Filter,
    Query, StoreError,
};
use crate::{EntityKind, KeepsakeError, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Memory record, identical in the owner-scoped collection and the mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub owner_id: String,
    /// Weak reference; a dangling id means root
    #[serde(default)]
    pub folder_id: Option<String>,
    pub memory_type: MemoryType,
    pub filename: String,
    pub storage_path: String,
    pub size_bytes: u64,
    /// blake3 of the blob, hex
    pub content_hash: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Set when a delete starts
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MemoryRecord {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// A finished capture ready to be recorded
#[derive(Debug, Clone)]
pub struct MemoryUpload {
    /// Assigned once; reusing the upload reuses the id
    pub id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub folder_id: Option<String>,
}

impl MemoryUpload {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            filename: filename.into(),
            bytes,
            folder_id: None,
        }
    }

    pub fn in_folder(mut self, folder_id: impl Into<String>) -> Self {
        self.folder_id = Some(folder_id.into());
        self
    }
}

pub struct MemoryLibrary {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    quota: Arc<QuotaGovernor>,
    folders: Arc<FolderManager>,
}

impl MemoryLibrary {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        quota: Arc<QuotaGovernor>,
        folders: Arc<FolderManager>,
    ) -> Self {
        Self {
            store,
            blobs,
            quota,
            folders,
        }
    }

    /// Record a completed upload
    pub async fn record_upload(&self, owner_id: &str, upload: MemoryUpload) -> Result<MemoryRecord> {
        let owned = collections::owner_memories(owner_id);
        let commit_key = format!("upload:{}", upload.id);
        let size_bytes = upload.bytes.len() as u64;
        let operation = QuotaOperation::Upload { bytes: size_bytes };

        // A retry after the records landed only owes the usage commit
        if let Some(doc) = self.store.get(&owned, &upload.id).await? {
            let record: MemoryRecord = from_document(doc)?;
            if !record.is_live() {
                return Err(KeepsakeError::not_found(EntityKind::Memory, &upload.id));
            }
            tracing::debug!("Upload {} already recorded, resuming at commit", upload.id);
            return self.commit_upload(owner_id, record, &commit_key).await;
        }

        validate_filename(&upload.filename)?;
        if let Some(folder_id) = &upload.folder_id {
            self.folders.get_folder(owner_id, folder_id).await?;
        }
        self.quota.authorize(owner_id, operation).await?.into_result()?;

        let storage_path = format!(
            "users/{}/memories/{}/{}",
            owner_id, upload.id, upload.filename
        );
        let content_hash = ContentHash::hash(&upload.bytes).to_hex();
        let storage_path = self.blobs.put(&storage_path, upload.bytes).await?;

        let record = MemoryRecord {
            id: upload.id,
            owner_id: owner_id.to_string(),
            folder_id: upload.folder_id,
            memory_type: MemoryType::from_filename(&upload.filename),
            filename: upload.filename,
            storage_path,
            size_bytes,
            content_hash,
            created_at: Utc::now(),
            deleted_at: None,
        };
        let doc = to_document(&record)?;

        if let Err(e) = self.store.put(&owned, &record.id, doc.clone()).await {
            // Nothing references the blob yet
            if let Err(cleanup) = self.blobs.delete(&record.storage_path).await {
                tracing::warn!("Orphaned blob {}: {}", record.storage_path, cleanup);
            }
            return Err(e.into());
        }

        if let Err(e) = self.store.put(collections::GLOBAL_MEMORIES, &record.id, doc).await {
            tracing::warn!("Global mirror of memory {} not written: {}", record.id, e);
        }

        if let Some(folder_id) = &record.folder_id {
            self.folders.adjust_file_count(owner_id, folder_id, 1).await;
        }

        tracing::info!(
            "Recorded {} {} ({} bytes) for {}",
            record.memory_type,
            record.id,
            record.size_bytes,
            owner_id
        );

        self.commit_upload(owner_id, record, &commit_key).await
    }

    /// Delete a memory and its blob, then release its usage
    pub async fn delete_memory(&self, owner_id: &str, memory_id: &str) -> Result<MemoryRecord> {
        let owned = collections::owner_memories(owner_id);
        let record = self.memory_record(owner_id, memory_id).await?;

        if record.is_live() {
            let tombstoned = self
                .store
                .update_if(
                    &owned,
                    memory_id,
                    &[Filter::is_null("deleted_at")],
                    fields([("deleted_at", json!(Utc::now().timestamp_millis()))]),
                )
                .await
                .map_err(|e| memory_error(e, memory_id))?;
            // Only the call that tombstoned adjusts the cached count
            if tombstoned {
                if let Some(folder_id) = &record.folder_id {
                    self.folders.adjust_file_count(owner_id, folder_id, -1).await;
                }
            }
        } else {
            tracing::debug!("Memory {} already tombstoned, resuming delete", memory_id);
        }

        if let Err(e) = self.blobs.delete(&record.storage_path).await {
            return Err(interrupted(
                &["tombstone record"],
                &["delete blob", "release usage", "delete record"],
                e.into(),
            ));
        }

        if let Err(e) = self.store.delete(collections::GLOBAL_MEMORIES, memory_id).await {
            tracing::warn!("Global mirror of memory {} not deleted: {}", memory_id, e);
        }

        let key = format!("delete:{}", memory_id);
        let release = QuotaOperation::DeleteFile {
            bytes: record.size_bytes,
        };
        if let Err(e) = self.quota.commit(owner_id, release, &key).await {
            let remaining = format!("release usage ({})", key);
            return Err(interrupted(
                &["tombstone record", "delete blob"],
                &[remaining.as_str(), "delete record"],
                e,
            ));
        }

        if let Err(e) = self.store.delete(&owned, memory_id).await {
            return Err(interrupted(
                &["tombstone record", "delete blob", "release usage"],
                &["delete record"],
                e.into(),
            ));
        }

        tracing::info!("Deleted memory {} of {}", memory_id, owner_id);
        Ok(record)
    }

    /// Move a memory into a live folder, or to the root with `None`
    pub async fn move_memory(
        &self,
        owner_id: &str,
        memory_id: &str,
        folder_id: Option<&str>,
    ) -> Result<MemoryRecord> {
        let mut record = self.get_memory(owner_id, memory_id).await?;
        if let Some(target) = folder_id {
            self.folders.get_folder(owner_id, target).await?;
        }
        if record.folder_id.as_deref() == folder_id {
            return Ok(record);
        }

        let change = fields([("folder_id", json!(folder_id))]);
        self.store
            .update(&collections::owner_memories(owner_id), memory_id, change.clone())
            .await
            .map_err(|e| memory_error(e, memory_id))?;

        if let Err(e) = self
            .store
            .update(collections::GLOBAL_MEMORIES, memory_id, change)
            .await
        {
            tracing::warn!("Global mirror of memory {} not moved: {}", memory_id, e);
        }

        if let Some(previous) = &record.folder_id {
            self.folders.adjust_file_count(owner_id, previous, -1).await;
        }
        if let Some(target) = folder_id {
            self.folders.adjust_file_count(owner_id, target, 1).await;
        }

        tracing::debug!("Moved memory {} to {:?}", memory_id, folder_id);
        record.folder_id = folder_id.map(str::to_owned);
        Ok(record)
    }

    /// Memories in a folder, newest first. `None` lists the root, which also
    /// holds anything whose folder is missing or tombstoned.
    pub async fn list_memories(&self, owner_id: &str, folder_id: Option<&str>) -> Result<Vec<MemoryRecord>> {
        let owned = collections::owner_memories(owner_id);
        let newest_first = Query::new()
            .filter(Filter::is_null("deleted_at"))
            .order_by("created_at", Direction::Descending);

        let records = match folder_id {
            Some(folder_id) => {
                self.folders.get_folder(owner_id, folder_id).await?;
                self.records(
                    &owned,
                    &newest_first.filter(Filter::eq("folder_id", folder_id)),
                )
                .await?
            }
            None => {
                let live = self.folders.live_folder_ids(owner_id).await?;
                self.records(&owned, &newest_first)
                    .await?
                    .into_iter()
                    .filter(|m| m.folder_id.as_ref().map_or(true, |f| !live.contains(f)))
                    .collect()
            }
        };
        Ok(records)
    }

    /// Owner-scoped record, read by id
    pub async fn get_memory(&self, owner_id: &str, memory_id: &str) -> Result<MemoryRecord> {
        let record = self.memory_record(owner_id, memory_id).await?;
        if !record.is_live() {
            return Err(KeepsakeError::not_found(EntityKind::Memory, memory_id));
        }
        Ok(record)
    }

    /// Record by id, tombstoned or not
    async fn memory_record(&self, owner_id: &str, memory_id: &str) -> Result<MemoryRecord> {
        let doc = self
            .store
            .get(&collections::owner_memories(owner_id), memory_id)
            .await?
            .ok_or_else(|| KeepsakeError::not_found(EntityKind::Memory, memory_id))?;
        Ok(from_document(doc)?)
    }

    /// Retrieval URL of a memory's blob
    pub async fn memory_url(&self, owner_id: &str, memory_id: &str) -> Result<String> {
        let record = self.get_memory(owner_id, memory_id).await?;
        Ok(self.blobs.url(&record.storage_path).await?)
    }

    /// Usage recomputed from live records, for reconciliation against the
    /// committed counters
    pub async fn measure_usage(&self, owner_id: &str) -> Result<Usage> {
        let live = Query::new().filter(Filter::is_null("deleted_at"));
        let records = self
            .records(&collections::owner_memories(owner_id), &live)
            .await?;
        let folders = self.folders.live_folder_ids(owner_id).await?;

        Ok(Usage {
            storage_used_bytes: records.iter().map(|m| m.size_bytes).sum(),
            files_uploaded: records.len() as u64,
            folders_used: folders.len() as u64,
        })
    }

    async fn commit_upload(&self, owner_id: &str, record: MemoryRecord, key: &str) -> Result<MemoryRecord> {
        let operation = QuotaOperation::Upload {
            bytes: record.size_bytes,
        };
        if let Err(e) = self.quota.commit(owner_id, operation, key).await {
            let remaining = format!("commit usage ({})", key);
            return Err(interrupted(
                &["store blob", "write record"],
                &[remaining.as_str()],
                e,
            ));
        }
        Ok(record)
    }

    async fn records(&self, collection: &str, query: &Query) -> Result<Vec<MemoryRecord>> {
        self.store
            .query(collection, query)
            .await?
            .into_iter()
            .map(|doc| from_document(doc).map_err(Into::into))
            .collect()
    }
}

fn memory_error(e: StoreError, memory_id: &str) -> KeepsakeError {
    match e {
        StoreError::NotFound { .. } => KeepsakeError::not_found(EntityKind::Memory, memory_id),
        other => other.into(),
    }
}

fn validate_filename(filename: &str) -> Result<()> {
    let bad = filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(['/', '\\']);
    if bad {
        return Err(KeepsakeError::InvalidArgument(format!(
            "invalid filename: {:?}",
            filename
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::NewFolder;
    use crate::quota::{Plan, QuotaDimension};
    use crate::testing::{harness, Harness, StoreOp};

    const MIB: u64 = 1024 * 1024;

    async fn owner(h: &Harness, plan: Plan) {
        h.core.accounts.register("u1", plan, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_writes_blob_both_copies_and_usage() {
        let h = harness();
        owner(&h, Plan::Free).await;

        let record = h
            .core
            .memories
            .record_upload("u1", MemoryUpload::new("beach.jpg", vec![9; 128]))
            .await
            .unwrap();

        assert_eq!(record.memory_type, MemoryType::Image);
        assert_eq!(record.storage_path, format!("users/u1/memories/{}/beach.jpg", record.id));
        assert_eq!(h.blobs.read(&record.storage_path), Some(vec![9; 128]));
        assert!(ContentHash::from_hex(&record.content_hash).unwrap().verify(&[9; 128]));

        let mirror: MemoryRecord = from_document(
            h.store
                .get(collections::GLOBAL_MEMORIES, &record.id)
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(mirror, record);

        let usage = h.core.quota.usage("u1").await.unwrap();
        assert_eq!(usage.storage_used_bytes, 128);
        assert_eq!(usage.files_uploaded, 1);

        let url = h.core.memories.memory_url("u1", &record.id).await.unwrap();
        assert_eq!(url, format!("memory://blobs/{}", record.storage_path));
    }

    #[tokio::test]
    async fn test_upload_over_quota_stores_nothing() {
        let h = harness();
        owner(&h, Plan::Free).await;
        h.core
            .quota
            .commit("u1", QuotaOperation::Upload { bytes: 1024 * MIB - 10 }, "seed")
            .await
            .unwrap();

        let err = h
            .core
            .memories
            .record_upload("u1", MemoryUpload::new("big.mov", vec![0; 11]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KeepsakeError::QuotaExceeded {
                dimension: QuotaDimension::Storage,
                ..
            }
        ));
        assert!(h.blobs.list_under("users/u1/").await.unwrap().is_empty());
        assert!(h.core.memories.list_memories("u1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_commit_failure_then_retry_counts_once() {
        let h = harness();
        owner(&h, Plan::Free).await;
        let upload = MemoryUpload::new("clip.mp4", vec![1; 50]);

        h.store.fail(StoreOp::Increment, collections::USERS, 1);
        let err = h.core.memories.record_upload("u1", upload.clone()).await.unwrap_err();
        assert!(matches!(err, KeepsakeError::PartialFailure { .. }));
        assert_eq!(h.core.quota.usage("u1").await.unwrap().storage_used_bytes, 0);

        h.core.memories.record_upload("u1", upload.clone()).await.unwrap();
        h.core.memories.record_upload("u1", upload).await.unwrap();

        let usage = h.core.quota.usage("u1").await.unwrap();
        assert_eq!(usage.storage_used_bytes, 50);
        assert_eq!(usage.files_uploaded, 1);
        assert_eq!(h.core.memories.list_memories("u1", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_record_write_removes_blob() {
        let h = harness();
        owner(&h, Plan::Free).await;

        h.store.fail(StoreOp::Put, &collections::owner_memories("u1"), 1);
        let err = h
            .core
            .memories
            .record_upload("u1", MemoryUpload::new("a.png", vec![1; 5]))
            .await
            .unwrap_err();
        assert!(matches!(err, KeepsakeError::Store(_)));
        assert!(h.blobs.list_under("users/u1/").await.unwrap().is_empty());
        assert_eq!(h.core.quota.usage("u1").await.unwrap(), Usage::default());
    }

    #[tokio::test]
    async fn test_mirror_failure_is_not_fatal() {
        let h = harness();
        owner(&h, Plan::Free).await;

        h.store.fail(StoreOp::Put, collections::GLOBAL_MEMORIES, 1);
        let record = h
            .core
            .memories
            .record_upload("u1", MemoryUpload::new("a.png", vec![1; 5]))
            .await
            .unwrap();
        assert!(h.store.get(collections::GLOBAL_MEMORIES, &record.id).await.unwrap().is_none());
        assert_eq!(h.core.quota.usage("u1").await.unwrap().files_uploaded, 1);
    }

    #[tokio::test]
    async fn test_upload_into_missing_folder_rejected() {
        let h = harness();
        owner(&h, Plan::Free).await;
        let err = h
            .core
            .memories
            .record_upload("u1", MemoryUpload::new("a.png", vec![1]).in_folder("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KeepsakeError::NotFound {
                entity: EntityKind::Folder,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_bad_filenames_rejected() {
        let h = harness();
        owner(&h, Plan::Free).await;
        for name in ["", "..", "a/b.jpg", "a\\b.jpg"] {
            let err = h
                .core
                .memories
                .record_upload("u1", MemoryUpload::new(name, vec![1]))
                .await
                .unwrap_err();
            assert!(matches!(err, KeepsakeError::InvalidArgument(_)), "{:?}", name);
        }
    }

    #[tokio::test]
    async fn test_delete_memory_releases_everything() {
        let h = harness();
        owner(&h, Plan::Free).await;
        let folder = h.core.folders.create_folder("u1", NewFolder::new("F")).await.unwrap();
        let record = h
            .core
            .memories
            .record_upload("u1", MemoryUpload::new("a.png", vec![1; 30]).in_folder(&folder.id))
            .await
            .unwrap();

        h.core.memories.delete_memory("u1", &record.id).await.unwrap();

        assert!(!h.blobs.contains(&record.storage_path));
        assert!(h.store.get(collections::GLOBAL_MEMORIES, &record.id).await.unwrap().is_none());
        assert!(matches!(
            h.core.memories.get_memory("u1", &record.id).await,
            Err(KeepsakeError::NotFound { .. })
        ));
        let usage = h.core.quota.usage("u1").await.unwrap();
        assert_eq!(usage.storage_used_bytes, 0);
        assert_eq!(usage.files_uploaded, 0);
        assert_eq!(h.core.folders.list_folders("u1").await.unwrap()[0].file_count, 0);
    }

    #[tokio::test]
    async fn test_interrupted_delete_resumes() {
        let h = harness();
        owner(&h, Plan::Free).await;
        let record = h
            .core
            .memories
            .record_upload("u1", MemoryUpload::new("a.png", vec![1; 30]))
            .await
            .unwrap();

        h.store.fail(StoreOp::Delete, &collections::owner_memories("u1"), 1);
        let err = h.core.memories.delete_memory("u1", &record.id).await.unwrap_err();
        assert!(matches!(err, KeepsakeError::PartialFailure { .. }));
        assert_eq!(h.core.quota.usage("u1").await.unwrap().storage_used_bytes, 0);
        assert!(h.core.memories.list_memories("u1", None).await.unwrap().is_empty());

        h.core.memories.delete_memory("u1", &record.id).await.unwrap();
        let owned = collections::owner_memories("u1");
        assert!(h.store.get(&owned, &record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_with_failed_release_resumes() {
        let h = harness();
        owner(&h, Plan::Free).await;
        let folder = h.core.folders.create_folder("u1", NewFolder::new("F")).await.unwrap();
        let record = h
            .core
            .memories
            .record_upload("u1", MemoryUpload::new("a.png", vec![1; 100]).in_folder(&folder.id))
            .await
            .unwrap();

        h.store.fail(StoreOp::Increment, collections::USERS, 1);
        let err = h.core.memories.delete_memory("u1", &record.id).await.unwrap_err();
        match err {
            KeepsakeError::PartialFailure {
                remaining_steps, ..
            } => assert_eq!(remaining_steps.len(), 2),
            other => panic!("unexpected error: {}", other),
        }

        // Gone for readers, usage still owed
        assert!(matches!(
            h.core.memories.get_memory("u1", &record.id).await,
            Err(KeepsakeError::NotFound { .. })
        ));
        assert_eq!(h.core.quota.usage("u1").await.unwrap().storage_used_bytes, 100);

        h.core.memories.delete_memory("u1", &record.id).await.unwrap();
        h.core.memories.delete_memory("u1", &record.id).await.unwrap_err();

        let usage = h.core.quota.usage("u1").await.unwrap();
        assert_eq!(usage.storage_used_bytes, 0);
        assert_eq!(usage.files_uploaded, 0);
        assert_eq!(h.core.memories.measure_usage("u1").await.unwrap(), usage);
        assert_eq!(h.core.folders.get_folder("u1", &folder.id).await.unwrap().file_count, 0);
        assert!(h
            .store
            .get(&collections::owner_memories("u1"), &record.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_move_memory_updates_both_copies() {
        let h = harness();
        owner(&h, Plan::Free).await;
        let a = h.core.folders.create_folder("u1", NewFolder::new("A")).await.unwrap();
        let b = h.core.folders.create_folder("u1", NewFolder::new("B")).await.unwrap();
        let record = h
            .core
            .memories
            .record_upload("u1", MemoryUpload::new("a.png", vec![1]).in_folder(&a.id))
            .await
            .unwrap();

        let moved = h.core.memories.move_memory("u1", &record.id, Some(&b.id)).await.unwrap();
        assert_eq!(moved.folder_id.as_deref(), Some(b.id.as_str()));

        let mirror = h.store.get(collections::GLOBAL_MEMORIES, &record.id).await.unwrap().unwrap();
        assert_eq!(mirror["folder_id"], json!(b.id));
        assert_eq!(h.core.memories.list_memories("u1", Some(&b.id)).await.unwrap().len(), 1);
        assert!(h.core.memories.list_memories("u1", Some(&a.id)).await.unwrap().is_empty());

        assert_eq!(h.core.folders.get_folder("u1", &a.id).await.unwrap().file_count, 0);
        assert_eq!(h.core.folders.get_folder("u1", &b.id).await.unwrap().file_count, 1);

        h.core.memories.move_memory("u1", &record.id, None).await.unwrap();
        assert_eq!(h.core.memories.list_memories("u1", None).await.unwrap().len(), 1);

        assert!(matches!(
            h.core.memories.move_memory("u1", &record.id, Some("ghost")).await,
            Err(KeepsakeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_dangling_folder_reads_as_root() {
        let h = harness();
        owner(&h, Plan::Free).await;
        let record = h
            .core
            .memories
            .record_upload("u1", MemoryUpload::new("a.png", vec![1]))
            .await
            .unwrap();

        // A child left behind by an interrupted folder deletion
        h.store
            .update(
                &collections::owner_memories("u1"),
                &record.id,
                fields([("folder_id", json!("deleted-folder"))]),
            )
            .await
            .unwrap();

        let root = h.core.memories.list_memories("u1", None).await.unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].id, record.id);
    }

    #[tokio::test]
    async fn test_storage_usage_matches_live_records() {
        let h = harness();
        owner(&h, Plan::Premium).await;
        let folder = h.core.folders.create_folder("u1", NewFolder::new("F")).await.unwrap();

        let mut ids = Vec::new();
        for i in 0..12usize {
            let mut upload = MemoryUpload::new(format!("m{}.jpg", i), vec![0; 100 + i]);
            if i % 2 == 0 {
                upload = upload.in_folder(&folder.id);
            }
            ids.push(h.core.memories.record_upload("u1", upload).await.unwrap().id);
        }
        for id in ids.iter().step_by(3) {
            h.core.memories.delete_memory("u1", id).await.unwrap();
        }
        h.core.folders.delete_folder("u1", &folder.id).await.unwrap();

        let measured = h.core.memories.measure_usage("u1").await.unwrap();
        let committed = h.core.quota.usage("u1").await.unwrap();
        assert_eq!(measured, committed);
        assert_eq!(measured.files_uploaded, 8);
    }
}
