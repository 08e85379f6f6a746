//! Keepsake Core - Resource quota and shared-access governance
//!
//! This crate is the business-invariant layer that sits in front of a
//! document/object store for the Keepsake media archive: per-plan quotas with
//! atomic counters, folder/memory referential consistency across a dual-write
//! model, the family-sharing invitation and role state machine, and the
//! commission ledger.
//!
//! The store offers single-document atomicity only. Every multi-document
//! operation is a sequence of idempotent, independently retryable steps.

pub mod crypto;
pub mod family;
pub mod ledger;
pub mod library;
pub mod quota;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

use family::{FamilyAccess, FamilyRole, InviteNotifier, LogNotifier};
use ledger::{CommissionLedger, Money};
use library::{FolderManager, MemoryLibrary};
use quota::{AccountDirectory, QuotaDimension, QuotaGovernor};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use store::{BlobStore, DocumentStore, FsBlobStore, MemoryBlobStore, MemoryDocumentStore, SledDocumentStore};
use thiserror::Error;

/// Kinds of entity named in `NotFound` errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Account,
    Folder,
    Memory,
    FamilyMember,
    LedgerEntry,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Account => "Account",
            EntityKind::Folder => "Folder",
            EntityKind::Memory => "Memory",
            EntityKind::FamilyMember => "Family member",
            EntityKind::LedgerEntry => "Ledger entry",
        };
        f.write_str(name)
    }
}

/// Main error type for Keepsake operations
#[derive(Error, Debug)]
pub enum KeepsakeError {
    #[error("Quota exceeded for {dimension}: limit {limit}, used {used}")]
    QuotaExceeded {
        dimension: QuotaDimension,
        limit: u64,
        used: u64,
    },

    #[error("{email} is already a member or has a pending invite")]
    DuplicateMember { email: String },

    #[error("Invite token is invalid or has expired")]
    InvalidOrExpiredInvite,

    #[error("Unauthorized: requires the {required_role} role")]
    Unauthorized { required_role: FamilyRole },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityKind, id: String },

    #[error(
        "Partial failure: completed [{}], remaining [{}]",
        .completed_steps.join(", "),
        .remaining_steps.join(", ")
    )]
    PartialFailure {
        completed_steps: Vec<String>,
        remaining_steps: Vec<String>,
    },

    #[error("Usage commit {idempotency_key} was interrupted too long ago to retry; reconcile usage")]
    StaleCommit { idempotency_key: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),
}

impl KeepsakeError {
    pub(crate) fn not_found(entity: EntityKind, id: impl Into<String>) -> Self {
        KeepsakeError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn partial<C, R>(completed: C, remaining: R) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        KeepsakeError::PartialFailure {
            completed_steps: completed.into_iter().map(Into::into).collect(),
            remaining_steps: remaining.into_iter().map(Into::into).collect(),
        }
    }
}

pub type Result<T> = std::result::Result<T, KeepsakeError>;

/// Core configuration
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct KeepsakeConfig {
    /// Days a pending invite token stays redeemable (None = never expires)
    pub invite_ttl_days: Option<u32>,

    /// Children reassigned in parallel when a folder is deleted
    pub reassign_concurrency: usize,

    /// Passes over failed children before a folder deletion gives up
    pub reassign_attempts: u32,

    /// Hours an interrupted usage commit can still be retried
    pub commit_retry_window_hours: u32,

    /// Yearly commission at or above which a 1099-K is required
    pub tax_report_threshold: Money,

    /// Base URL handed out by the in-memory blob store
    pub blob_base_url: String,
}

impl Default for KeepsakeConfig {
    fn default() -> Self {
        Self {
            invite_ttl_days: Some(14),
            reassign_concurrency: 8,
            reassign_attempts: 3,
            commit_retry_window_hours: quota::DEFAULT_RETRY_WINDOW_HOURS,
            tax_report_threshold: Money::from_cents(60_000), // $600.00
            blob_base_url: "memory://blobs".to_string(),
        }
    }
}

impl KeepsakeConfig {
    /// Parse a JSON config; missing fields fall back to defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| KeepsakeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| KeepsakeError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reassign_concurrency == 0 {
            return Err(KeepsakeError::Config(
                "reassign_concurrency must be at least 1".into(),
            ));
        }
        if self.reassign_attempts == 0 {
            return Err(KeepsakeError::Config(
                "reassign_attempts must be at least 1".into(),
            ));
        }
        if self.commit_retry_window_hours == 0 {
            return Err(KeepsakeError::Config(
                "commit_retry_window_hours must be at least 1".into(),
            ));
        }
        if self.tax_report_threshold.cents() < 0 {
            return Err(KeepsakeError::Config(
                "tax_report_threshold cannot be negative".into(),
            ));
        }
        Ok(())
    }
}

/// All governance components wired to one set of collaborators
pub struct KeepsakeCore {
    pub config: KeepsakeConfig,
    pub accounts: AccountDirectory,
    pub quota: Arc<QuotaGovernor>,
    pub folders: Arc<FolderManager>,
    pub memories: MemoryLibrary,
    pub family: FamilyAccess,
    pub ledger: CommissionLedger,
}

impl KeepsakeCore {
    /// Wire the components to the given collaborators
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        notifier: Arc<dyn InviteNotifier>,
        config: KeepsakeConfig,
    ) -> Result<Self> {
        config.validate()?;

        let accounts = AccountDirectory::new(store.clone());
        let quota = Arc::new(
            QuotaGovernor::new(store.clone(), Arc::new(accounts.clone())).with_retry_window(
                chrono::Duration::hours(i64::from(config.commit_retry_window_hours)),
            ),
        );
        let folders = Arc::new(FolderManager::new(store.clone(), quota.clone(), &config));
        let memories = MemoryLibrary::new(store.clone(), blobs, quota.clone(), folders.clone());
        let family = FamilyAccess::new(store.clone(), accounts.clone(), notifier, &config);
        let ledger = CommissionLedger::new(store, &config);

        tracing::info!("Keepsake core initialized");

        Ok(Self {
            config,
            accounts,
            quota,
            folders,
            memories,
            family,
            ledger,
        })
    }

    /// Everything in process memory, invites logged instead of sent
    pub fn in_memory(config: KeepsakeConfig) -> Result<Self> {
        let blobs = Arc::new(MemoryBlobStore::new(config.blob_base_url.clone()));
        Self::new(
            Arc::new(MemoryDocumentStore::new()),
            blobs,
            Arc::new(LogNotifier),
            config,
        )
    }

    /// Documents in a sled database under `data_path/db`, blobs under
    /// `data_path/blobs`
    pub fn open(data_path: impl AsRef<Path>, config: KeepsakeConfig) -> Result<Self> {
        let data_path = data_path.as_ref();
        let store = SledDocumentStore::open(data_path.join("db"))?;
        let blobs = FsBlobStore::new(data_path.join("blobs"));
        Self::new(Arc::new(store), Arc::new(blobs), Arc::new(LogNotifier), config)
    }
}
