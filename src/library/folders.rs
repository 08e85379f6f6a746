//! Folder Hierarchy Manager
//!
//! Deletion never cascades. Children are moved to the root first, then the
//! folder is tombstoned, its quota released, and finally the document removed.
//! Any interruption leaves a state that readers already interpret correctly,
//! and re-invoking `delete_folder` picks up where the last attempt stopped.

use super::{interrupted, MemoryRecord};
use crate::quota::{QuotaGovernor, QuotaOperation};
use crate::store::{
    collections, fields, from_document, to_document, Direction, DocumentStore, Filter, Query,
    StoreError,
};
use crate::{EntityKind, KeepsakeConfig, KeepsakeError, Result};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

const DEFAULT_COLOR: &str = "#8E8E93";
const MAX_NAME_LEN: usize = 100;

/// Folder document in `users/{owner}/folders`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    /// None = root
    #[serde(default)]
    pub parent_id: Option<String>,
    pub color: String,
    /// Cached aggregate; may drift after interrupted reassignments
    #[serde(default)]
    pub file_count: u64,
    #[serde(default)]
    pub thumbnail_ref: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Set once every child has been moved out; the folder is gone for readers
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Folder {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct NewFolder {
    /// Assigned once; reusing the request reuses the id
    pub id: String,
    pub name: String,
    pub color: Option<String>,
    pub parent_id: Option<String>,
}

impl NewFolder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            color: None,
            parent_id: None,
        }
    }

    pub fn color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// Outcome of moving a folder's children to the root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassignReport {
    pub memories_moved: usize,
    pub folders_moved: usize,
    /// Children still pointing at the folder after the last pass
    pub failed: Vec<String>,
}

impl ReassignReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderDeletion {
    pub folder_id: String,
    pub memories_moved: usize,
    pub folders_moved: usize,
}

#[derive(Debug, Clone, Copy)]
enum Child {
    Memory,
    Folder,
}

pub struct FolderManager {
    store: Arc<dyn DocumentStore>,
    quota: Arc<QuotaGovernor>,
    concurrency: usize,
    attempts: u32,
}

impl FolderManager {
    pub fn new(store: Arc<dyn DocumentStore>, quota: Arc<QuotaGovernor>, config: &KeepsakeConfig) -> Self {
        Self {
            store,
            quota,
            concurrency: config.reassign_concurrency.max(1),
            attempts: config.reassign_attempts.max(1),
        }
    }

    /// Create a folder, subject to the owner's folder quota. Retrying with the
    /// same `NewFolder` resumes instead of creating a second folder.
    pub async fn create_folder(&self, owner_id: &str, new_folder: NewFolder) -> Result<Folder> {
        let collection = collections::owner_folders(owner_id);
        if let Some(existing) = self.resumable_folder(owner_id, &new_folder.id).await? {
            return self.commit_folder(owner_id, existing).await;
        }

        let name = validate_name(&new_folder.name)?;
        if let Some(parent_id) = &new_folder.parent_id {
            self.get_folder(owner_id, parent_id).await?;
        }

        self.quota
            .authorize(owner_id, QuotaOperation::CreateFolder)
            .await?
            .into_result()?;

        let folder = Folder {
            id: new_folder.id,
            owner_id: owner_id.to_string(),
            name,
            parent_id: new_folder.parent_id,
            color: new_folder.color.unwrap_or_else(|| DEFAULT_COLOR.to_string()),
            file_count: 0,
            thumbnail_ref: None,
            created_at: Utc::now(),
            deleted_at: None,
        };

        match self
            .store
            .create(&collection, &folder.id, to_document(&folder)?)
            .await
        {
            Ok(()) => {
                tracing::info!("Created folder {} ({}) for {}", folder.id, folder.name, owner_id)
            }
            // A concurrent retry of the same request got there first
            Err(StoreError::AlreadyExists { .. }) => {
                let existing = self
                    .resumable_folder(owner_id, &folder.id)
                    .await?
                    .ok_or_else(|| KeepsakeError::not_found(EntityKind::Folder, &folder.id))?;
                return self.commit_folder(owner_id, existing).await;
            }
            Err(e) => return Err(e.into()),
        }

        self.commit_folder(owner_id, folder).await
    }

    /// A folder already written under this id, if the request is being retried
    async fn resumable_folder(&self, owner_id: &str, folder_id: &str) -> Result<Option<Folder>> {
        let Some(doc) = self
            .store
            .get(&collections::owner_folders(owner_id), folder_id)
            .await?
        else {
            return Ok(None);
        };
        let folder: Folder = from_document(doc)?;
        if !folder.is_live() {
            return Err(KeepsakeError::not_found(EntityKind::Folder, folder_id));
        }
        tracing::debug!("Folder {} already written, resuming at commit", folder_id);
        Ok(Some(folder))
    }

    async fn commit_folder(&self, owner_id: &str, folder: Folder) -> Result<Folder> {
        let key = format!("folder-create:{}", folder.id);
        if let Err(e) = self.quota.commit(owner_id, QuotaOperation::CreateFolder, &key).await {
            let remaining = format!("commit usage ({})", key);
            return Err(interrupted(&["write folder"], &[remaining.as_str()], e));
        }
        Ok(folder)
    }

    /// Delete a folder, moving its memories and subfolders to the root.
    ///
    /// Returns `PartialFailure` when some children could not be moved; the
    /// folder then stays visible and the call can simply be repeated.
    pub async fn delete_folder(&self, owner_id: &str, folder_id: &str) -> Result<FolderDeletion> {
        let collection = collections::owner_folders(owner_id);
        let folder = self.folder_record(owner_id, folder_id).await?;

        let mut report = self.reassign_children(owner_id, folder_id).await?;
        if !report.is_complete() {
            let done = format!(
                "reassign {} children",
                report.memories_moved + report.folders_moved
            );
            let left = format!("reassign {} children", report.failed.len());
            tracing::warn!(
                "Folder {} kept: {} children still attached after {} passes",
                folder_id,
                report.failed.len(),
                self.attempts
            );
            return Err(KeepsakeError::partial(
                [done],
                [left.as_str(), "tombstone folder", "release folder quota", "delete folder"],
            ));
        }

        if folder.is_live() {
            let tombstone = self
                .store
                .update_if(
                    &collection,
                    folder_id,
                    &[Filter::is_null("deleted_at")],
                    fields([("deleted_at", json!(Utc::now().timestamp_millis()))]),
                )
                .await
                .map_err(|e| folder_error(e, folder_id));
            if let Err(e) = tombstone {
                return Err(interrupted(
                    &["reassign children"],
                    &["tombstone folder", "release folder quota", "delete folder"],
                    e,
                ));
            }
            tracing::info!("Tombstoned folder {} of {}", folder_id, owner_id);
        }

        // Catch uploads that resolved the folder just before the tombstone
        match self.reassign_children(owner_id, folder_id).await {
            Ok(sweep) => {
                report.memories_moved += sweep.memories_moved;
                report.folders_moved += sweep.folders_moved;
                if !sweep.is_complete() {
                    tracing::warn!(
                        "{} late children of folder {} will read as root",
                        sweep.failed.len(),
                        folder_id
                    );
                }
            }
            Err(e) => tracing::warn!("Sweep of tombstoned folder {} failed: {}", folder_id, e),
        }

        let key = format!("folder-delete:{}", folder_id);
        if let Err(e) = self.quota.commit(owner_id, QuotaOperation::DeleteFolder, &key).await {
            return Err(interrupted(
                &["reassign children", "tombstone folder"],
                &["release folder quota", "delete folder"],
                e,
            ));
        }

        if let Err(e) = self.store.delete(&collection, folder_id).await {
            return Err(interrupted(
                &["reassign children", "tombstone folder", "release folder quota"],
                &["delete folder"],
                e.into(),
            ));
        }

        tracing::info!(
            "Deleted folder {} of {} ({} memories and {} folders moved to root)",
            folder_id,
            owner_id,
            report.memories_moved,
            report.folders_moved
        );

        Ok(FolderDeletion {
            folder_id: folder_id.to_string(),
            memories_moved: report.memories_moved,
            folders_moved: report.folders_moved,
        })
    }

    /// Move every memory and subfolder of `folder_id` to the root.
    ///
    /// Children are detached with bounded concurrency; failures are retried on
    /// later passes. Each detach is conditional on the child still pointing at
    /// this folder, so a concurrent move elsewhere is never overwritten.
    pub async fn reassign_children(&self, owner_id: &str, folder_id: &str) -> Result<ReassignReport> {
        let mut report = ReassignReport::default();

        for pass in 1..=self.attempts {
            let memories = self
                .child_ids(&collections::owner_memories(owner_id), "folder_id", folder_id)
                .await?;
            let subfolders = self
                .child_ids(&collections::owner_folders(owner_id), "parent_id", folder_id)
                .await?;

            let targets = memories
                .into_iter()
                .map(|id| (Child::Memory, id))
                .chain(subfolders.into_iter().map(|id| (Child::Folder, id)));

            let results: Vec<(Child, String, Result<bool>)> = stream::iter(targets)
                .map(move |(kind, id)| async move {
                    let outcome = self.detach(owner_id, folder_id, kind, &id).await;
                    (kind, id, outcome)
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            report.failed.clear();
            for (kind, id, outcome) in results {
                match outcome {
                    Ok(true) => match kind {
                        Child::Memory => report.memories_moved += 1,
                        Child::Folder => report.folders_moved += 1,
                    },
                    // Moved elsewhere or deleted in the meantime
                    Ok(false) => {}
                    Err(e) => {
                        tracing::debug!("Could not detach {} from folder {}: {}", id, folder_id, e);
                        report.failed.push(id);
                    }
                }
            }

            if report.is_complete() {
                break;
            }
            tracing::warn!(
                "Pass {} left {} children attached to folder {}",
                pass,
                report.failed.len(),
                folder_id
            );
        }

        Ok(report)
    }

    /// A live folder with `file_count` and `thumbnail_ref` recomputed from
    /// its children instead of the cached values
    pub async fn get_folder_with_stats(&self, owner_id: &str, folder_id: &str) -> Result<Folder> {
        let mut folder = self.get_folder(owner_id, folder_id).await?;

        let children = self
            .store
            .query(
                &collections::owner_memories(owner_id),
                &Query::new()
                    .filter(Filter::eq("folder_id", folder_id))
                    .filter(Filter::is_null("deleted_at"))
                    .order_by("created_at", Direction::Descending),
            )
            .await?
            .into_iter()
            .map(from_document::<MemoryRecord>)
            .collect::<std::result::Result<Vec<_>, StoreError>>()?;

        let file_count = children.len() as u64;
        let thumbnail_ref = children
            .iter()
            .find(|m| m.memory_type.is_visual())
            .map(|m| m.storage_path.clone());

        if file_count != folder.file_count || thumbnail_ref != folder.thumbnail_ref {
            tracing::debug!(
                "Folder {} cache drifted: {} cached, {} counted",
                folder_id,
                folder.file_count,
                file_count
            );
            let refresh = fields([
                ("file_count", json!(file_count)),
                ("thumbnail_ref", json!(thumbnail_ref)),
            ]);
            if let Err(e) = self
                .store
                .update(&collections::owner_folders(owner_id), folder_id, refresh)
                .await
            {
                tracing::debug!("Could not refresh cache of folder {}: {}", folder_id, e);
            }
        }

        folder.file_count = file_count;
        folder.thumbnail_ref = thumbnail_ref;
        Ok(folder)
    }

    /// Live folders, oldest first, with cached aggregates
    pub async fn list_folders(&self, owner_id: &str) -> Result<Vec<Folder>> {
        let docs = self
            .store
            .query(
                &collections::owner_folders(owner_id),
                &Query::new()
                    .filter(Filter::is_null("deleted_at"))
                    .order_by("created_at", Direction::Ascending),
            )
            .await?;
        docs.into_iter()
            .map(|doc| from_document(doc).map_err(Into::into))
            .collect()
    }

    pub async fn rename_folder(
        &self,
        owner_id: &str,
        folder_id: &str,
        name: &str,
        color: Option<&str>,
    ) -> Result<Folder> {
        let name = validate_name(name)?;
        let mut folder = self.get_folder(owner_id, folder_id).await?;

        let mut changes = fields([("name", json!(name))]);
        if let Some(color) = color {
            changes.insert("color".to_string(), json!(color));
        }

        let renamed = self
            .store
            .update_if(
                &collections::owner_folders(owner_id),
                folder_id,
                &[Filter::is_null("deleted_at")],
                changes,
            )
            .await
            .map_err(|e| folder_error(e, folder_id))?;
        if !renamed {
            return Err(KeepsakeError::not_found(EntityKind::Folder, folder_id));
        }

        folder.name = name;
        if let Some(color) = color {
            folder.color = color.to_string();
        }
        Ok(folder)
    }

    /// A live folder; tombstoned folders read as absent
    pub async fn get_folder(&self, owner_id: &str, folder_id: &str) -> Result<Folder> {
        let folder = self.folder_record(owner_id, folder_id).await?;
        if !folder.is_live() {
            return Err(KeepsakeError::not_found(EntityKind::Folder, folder_id));
        }
        Ok(folder)
    }

    pub(crate) async fn live_folder_ids(&self, owner_id: &str) -> Result<HashSet<String>> {
        Ok(self
            .list_folders(owner_id)
            .await?
            .into_iter()
            .map(|f| f.id)
            .collect())
    }

    /// Best-effort update of the cached file count
    pub(crate) async fn adjust_file_count(&self, owner_id: &str, folder_id: &str, delta: i64) {
        if let Err(e) = self
            .store
            .atomic_increment(
                &collections::owner_folders(owner_id),
                folder_id,
                &[("file_count", delta)],
                None,
            )
            .await
        {
            tracing::debug!("Cached count of folder {} not updated: {}", folder_id, e);
        }
    }

    async fn folder_record(&self, owner_id: &str, folder_id: &str) -> Result<Folder> {
        let doc = self
            .store
            .get(&collections::owner_folders(owner_id), folder_id)
            .await?
            .ok_or_else(|| KeepsakeError::not_found(EntityKind::Folder, folder_id))?;
        Ok(from_document(doc)?)
    }

    async fn child_ids(&self, collection: &str, field: &str, folder_id: &str) -> Result<Vec<String>> {
        let docs = self
            .store
            .query(collection, &Query::new().filter(Filter::eq(field, folder_id)))
            .await?;
        Ok(docs
            .iter()
            .filter_map(|doc| doc.get("id").and_then(Value::as_str).map(str::to_owned))
            .collect())
    }

    async fn detach(&self, owner_id: &str, folder_id: &str, kind: Child, id: &str) -> Result<bool> {
        let (collection, field) = match kind {
            Child::Memory => (collections::owner_memories(owner_id), "folder_id"),
            Child::Folder => (collections::owner_folders(owner_id), "parent_id"),
        };

        let moved = match self
            .store
            .update_if(
                &collection,
                id,
                &[Filter::eq(field, folder_id)],
                fields([(field, Value::Null)]),
            )
            .await
        {
            Ok(moved) => moved,
            Err(StoreError::NotFound { .. }) => false,
            Err(e) => return Err(e.into()),
        };

        if moved && matches!(kind, Child::Memory) {
            if let Err(e) = self
                .store
                .update(
                    collections::GLOBAL_MEMORIES,
                    id,
                    fields([("folder_id", Value::Null)]),
                )
                .await
            {
                tracing::warn!(
                    "Global mirror of memory {} still points at folder {}: {}",
                    id,
                    folder_id,
                    e
                );
            }
        }
        Ok(moved)
    }
}

fn folder_error(e: StoreError, folder_id: &str) -> KeepsakeError {
    match e {
        StoreError::NotFound { .. } => KeepsakeError::not_found(EntityKind::Folder, folder_id),
        other => other.into(),
    }
}

fn validate_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(KeepsakeError::InvalidArgument("folder name cannot be empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(KeepsakeError::InvalidArgument(format!(
            "folder name longer than {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(name.to_string())
}
