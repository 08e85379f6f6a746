//! Quota Governor - Plan-derived limits and the single writer of usage counters
//!
//! Callers `authorize` before a mutating operation and `commit` after it
//! succeeds. `commit` is an atomic increment keyed by an idempotency key, so a
//! caller that lost the acknowledgement can retry without double counting.
//! Completed blob writes are never rolled back here; drift is corrected by an
//! external reconciliation pass.
//!
//! Every key gets its own commit document, claimed before the increment and
//! sealed after it. The account document only remembers keys for the retry
//! window, which covers the gap between claim and seal.

mod account;
mod plan;

pub use account::{Account, AccountDirectory, FamilyLink, PlanDirectory, Usage};
pub use plan::{Plan, PlanLimits, QuotaDimension};

use crate::store::{
    collections, fields, from_document, to_document, DocumentStore, IncrementOutcome, OnceKey,
    StoreError,
};
use crate::{KeepsakeError, Result};
use account::{account_error, FILES_UPLOADED_FIELD, FOLDERS_USED_FIELD, STORAGE_USED_FIELD};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Default time an unsealed commit may be retried
pub const DEFAULT_RETRY_WINDOW_HOURS: u32 = 72;

/// Operation kinds the governor meters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaOperation {
    Upload { bytes: u64 },
    DeleteFile { bytes: u64 },
    CreateFolder,
    DeleteFolder,
}

impl QuotaOperation {
    fn deltas(self) -> Result<Vec<(&'static str, i64)>> {
        let signed = |bytes: u64| {
            i64::try_from(bytes).map_err(|_| {
                KeepsakeError::InvalidArgument(format!("{} bytes exceeds counter range", bytes))
            })
        };

        Ok(match self {
            QuotaOperation::Upload { bytes } => {
                vec![(STORAGE_USED_FIELD, signed(bytes)?), (FILES_UPLOADED_FIELD, 1)]
            }
            QuotaOperation::DeleteFile { bytes } => {
                vec![(STORAGE_USED_FIELD, -signed(bytes)?), (FILES_UPLOADED_FIELD, -1)]
            }
            QuotaOperation::CreateFolder => vec![(FOLDERS_USED_FIELD, 1)],
            QuotaOperation::DeleteFolder => vec![(FOLDERS_USED_FIELD, -1)],
        })
    }
}

/// Result of a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allow,
    Deny {
        dimension: QuotaDimension,
        limit: u64,
        used: u64,
    },
}

impl QuotaDecision {
    /// Evaluate an operation against limits and current usage
    pub fn evaluate(limits: &PlanLimits, usage: &Usage, operation: QuotaOperation) -> Self {
        let check = |dimension: QuotaDimension, used: u64, delta: u64| {
            let limit = limits.limit_for(dimension);
            match used.checked_add(delta) {
                Some(total) if total <= limit => None,
                _ => Some(QuotaDecision::Deny {
                    dimension,
                    limit,
                    used,
                }),
            }
        };

        let denial = match operation {
            QuotaOperation::Upload { bytes } => check(
                QuotaDimension::Storage,
                usage.storage_used_bytes,
                bytes,
            )
            .or_else(|| check(QuotaDimension::Files, usage.files_uploaded, 1)),
            QuotaOperation::CreateFolder => {
                check(QuotaDimension::Folders, usage.folders_used, 1)
            }
            // Releasing capacity is always allowed
            QuotaOperation::DeleteFile { .. } | QuotaOperation::DeleteFolder => None,
        };

        denial.unwrap_or(QuotaDecision::Allow)
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allow)
    }

    /// Turn a denial into the caller-facing `QuotaExceeded` error
    pub fn into_result(self) -> Result<()> {
        match self {
            QuotaDecision::Allow => Ok(()),
            QuotaDecision::Deny {
                dimension,
                limit,
                used,
            } => Err(KeepsakeError::QuotaExceeded {
                dimension,
                limit,
                used,
            }),
        }
    }
}

/// Whether a commit changed the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    AlreadyApplied,
}

/// Claim on one idempotency key
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitRecord {
    account_id: String,
    idempotency_key: String,
    sealed: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    claimed_at: DateTime<Utc>,
}

/// User quota summary for UI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSummary {
    pub plan: Plan,
    pub usage: Usage,
    pub limits: PlanLimits,
    pub bytes_available: u64,
    pub files_remaining: u64,
    pub folders_remaining: u64,
    pub usage_percentage: f64,
}

/// Quota Governor - authorizes operations and commits usage
pub struct QuotaGovernor {
    store: Arc<dyn DocumentStore>,
    plans: Arc<dyn PlanDirectory>,
    retry_window: Duration,
}

impl QuotaGovernor {
    pub fn new(store: Arc<dyn DocumentStore>, plans: Arc<dyn PlanDirectory>) -> Self {
        Self {
            store,
            plans,
            retry_window: Duration::hours(i64::from(DEFAULT_RETRY_WINDOW_HOURS)),
        }
    }

    /// How long an interrupted commit can be retried before it needs
    /// reconciliation
    pub fn with_retry_window(mut self, retry_window: Duration) -> Self {
        self.retry_window = retry_window;
        self
    }

    /// Check an operation against the account's plan and latest usage
    pub async fn authorize(&self, account_id: &str, operation: QuotaOperation) -> Result<QuotaDecision> {
        let plan = self.plans.plan_of(account_id).await?;
        let usage = self.usage(account_id).await?;
        let decision = QuotaDecision::evaluate(&plan.limits(), &usage, operation);

        match decision {
            QuotaDecision::Allow => {
                tracing::debug!("Quota allows {:?} for {}", operation, account_id)
            }
            QuotaDecision::Deny {
                dimension,
                limit,
                used,
            } => tracing::info!(
                "Quota denies {:?} for {}: {} limit {}, used {}",
                operation,
                account_id,
                dimension,
                limit,
                used
            ),
        }
        Ok(decision)
    }

    /// Apply the usage change of a completed operation, at most once per key
    pub async fn commit(
        &self,
        account_id: &str,
        operation: QuotaOperation,
        idempotency_key: &str,
    ) -> Result<CommitOutcome> {
        if idempotency_key.is_empty() {
            return Err(KeepsakeError::InvalidArgument(
                "idempotency key cannot be empty".into(),
            ));
        }
        let deltas = operation.deltas()?;
        let record_id = format!("{}:{}", account_id, idempotency_key);

        if self.claim(account_id, idempotency_key, &record_id).await? {
            tracing::debug!(
                "Commit {} for {} already applied",
                idempotency_key,
                account_id
            );
            return Ok(CommitOutcome::AlreadyApplied);
        }

        let once = OnceKey::new(idempotency_key, self.retry_window);
        let outcome = self
            .store
            .atomic_increment(collections::USERS, account_id, &deltas, Some(once))
            .await
            .map_err(|e| account_error(e, account_id))?;

        self.store
            .update(
                collections::QUOTA_COMMITS,
                &record_id,
                fields([("sealed", json!(true))]),
            )
            .await?;

        match outcome {
            IncrementOutcome::Applied(_) => {
                tracing::debug!(
                    "Committed {:?} for {} ({})",
                    operation,
                    account_id,
                    idempotency_key
                );
                Ok(CommitOutcome::Applied)
            }
            IncrementOutcome::Duplicate => {
                tracing::debug!(
                    "Commit {} for {} already applied",
                    idempotency_key,
                    account_id
                );
                Ok(CommitOutcome::AlreadyApplied)
            }
        }
    }

    /// Claim the commit document for a key. Returns true when the key is
    /// already sealed.
    async fn claim(&self, account_id: &str, idempotency_key: &str, record_id: &str) -> Result<bool> {
        let record = CommitRecord {
            account_id: account_id.to_string(),
            idempotency_key: idempotency_key.to_string(),
            sealed: false,
            claimed_at: Utc::now(),
        };

        match self
            .store
            .create(collections::QUOTA_COMMITS, record_id, to_document(&record)?)
            .await
        {
            Ok(()) => return Ok(false),
            Err(StoreError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let doc = self
            .store
            .get(collections::QUOTA_COMMITS, record_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                collection: collections::QUOTA_COMMITS.to_string(),
                id: record_id.to_string(),
            })?;
        let existing: CommitRecord = from_document(doc)?;

        if existing.sealed {
            return Ok(true);
        }
        // Past the window the account may have forgotten the key, so the
        // increment can no longer be retried safely
        if Utc::now() - existing.claimed_at > self.retry_window {
            tracing::warn!(
                "Commit {} for {} was interrupted at {} and is past its retry window",
                idempotency_key,
                account_id,
                existing.claimed_at
            );
            return Err(KeepsakeError::StaleCommit {
                idempotency_key: idempotency_key.to_string(),
            });
        }
        Ok(false)
    }

    /// Latest usage, read by id
    pub async fn usage(&self, account_id: &str) -> Result<Usage> {
        let doc = self
            .store
            .get(collections::USERS, account_id)
            .await?
            .ok_or_else(|| KeepsakeError::not_found(crate::EntityKind::Account, account_id))?;
        let account: Account = crate::store::from_document(doc)?;
        Ok(account.usage)
    }

    /// Get user's quota summary
    pub async fn summary(&self, account_id: &str) -> Result<QuotaSummary> {
        let plan = self.plans.plan_of(account_id).await?;
        let usage = self.usage(account_id).await?;
        let limits = plan.limits();

        let usage_percentage = if limits.storage_bytes == 0 {
            100.0
        } else {
            (usage.storage_used_bytes as f64 / limits.storage_bytes as f64 * 100.0).min(100.0)
        };

        Ok(QuotaSummary {
            plan,
            usage,
            limits,
            bytes_available: limits.storage_bytes.saturating_sub(usage.storage_used_bytes),
            files_remaining: limits.files.saturating_sub(usage.files_uploaded),
            folders_remaining: limits.folders.saturating_sub(usage.folders_used),
            usage_percentage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;
    use crate::testing::{FlakyStore, StoreOp};

    const MIB: u64 = 1024 * 1024;

    async fn governor_with(plan: Plan) -> (QuotaGovernor, AccountDirectory) {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let accounts = AccountDirectory::new(store.clone());
        accounts.register("u1", plan, None).await.unwrap();
        (QuotaGovernor::new(store, Arc::new(accounts.clone())), accounts)
    }

    #[test]
    fn test_free_plan_storage_denial() {
        let usage = Usage {
            storage_used_bytes: 900 * MIB,
            files_uploaded: 40,
            folders_used: 4,
        };
        let decision =
            QuotaDecision::evaluate(&Plan::Free.limits(), &usage, QuotaOperation::Upload { bytes: 200 * MIB });
        assert_eq!(
            decision,
            QuotaDecision::Deny {
                dimension: QuotaDimension::Storage,
                limit: 1024 * MIB,
                used: 900 * MIB,
            }
        );
    }

    #[test]
    fn test_never_allows_past_limit() {
        for plan in [Plan::Free, Plan::Premium, Plan::Family] {
            let limits = plan.limits();

            // Exactly at the limit is fine, one past it is not
            let usage = Usage {
                storage_used_bytes: limits.storage_bytes - 10,
                files_uploaded: 0,
                folders_used: 0,
            };
            assert!(QuotaDecision::evaluate(&limits, &usage, QuotaOperation::Upload { bytes: 10 }).is_allowed());
            assert!(!QuotaDecision::evaluate(&limits, &usage, QuotaOperation::Upload { bytes: 11 }).is_allowed());

            let usage = Usage {
                storage_used_bytes: 0,
                files_uploaded: limits.files,
                folders_used: limits.folders,
            };
            assert_eq!(
                QuotaDecision::evaluate(&limits, &usage, QuotaOperation::Upload { bytes: 1 }),
                QuotaDecision::Deny {
                    dimension: QuotaDimension::Files,
                    limit: limits.files,
                    used: limits.files,
                }
            );
            assert_eq!(
                QuotaDecision::evaluate(&limits, &usage, QuotaOperation::CreateFolder),
                QuotaDecision::Deny {
                    dimension: QuotaDimension::Folders,
                    limit: limits.folders,
                    used: limits.folders,
                }
            );
        }
    }

    #[test]
    fn test_overflowing_request_is_denied() {
        let usage = Usage {
            storage_used_bytes: 1,
            ..Usage::default()
        };
        let decision =
            QuotaDecision::evaluate(&Plan::Family.limits(), &usage, QuotaOperation::Upload { bytes: u64::MAX });
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_releases_always_allowed() {
        let full = Usage {
            storage_used_bytes: u64::MAX,
            files_uploaded: u64::MAX,
            folders_used: u64::MAX,
        };
        let limits = Plan::Free.limits();
        assert!(QuotaDecision::evaluate(&limits, &full, QuotaOperation::DeleteFile { bytes: 5 }).is_allowed());
        assert!(QuotaDecision::evaluate(&limits, &full, QuotaOperation::DeleteFolder).is_allowed());
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let (governor, _) = governor_with(Plan::Free).await;
        let upload = QuotaOperation::Upload { bytes: 100 };

        assert_eq!(governor.commit("u1", upload, "upload:m1").await.unwrap(), CommitOutcome::Applied);
        assert_eq!(
            governor.commit("u1", upload, "upload:m1").await.unwrap(),
            CommitOutcome::AlreadyApplied
        );

        let usage = governor.usage("u1").await.unwrap();
        assert_eq!(usage.storage_used_bytes, 100);
        assert_eq!(usage.files_uploaded, 1);
    }

    #[tokio::test]
    async fn test_authorize_reads_committed_usage() {
        let (governor, _) = governor_with(Plan::Free).await;
        for i in 0..5 {
            let decision = governor.authorize("u1", QuotaOperation::CreateFolder).await.unwrap();
            assert!(decision.is_allowed());
            governor
                .commit("u1", QuotaOperation::CreateFolder, &format!("folder-create:{}", i))
                .await
                .unwrap();
        }

        let err = governor
            .authorize("u1", QuotaOperation::CreateFolder)
            .await
            .unwrap()
            .into_result()
            .unwrap_err();
        assert!(matches!(
            err,
            KeepsakeError::QuotaExceeded {
                dimension: QuotaDimension::Folders,
                limit: 5,
                used: 5,
            }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_commits_from_many_devices() {
        let (governor, _) = governor_with(Plan::Premium).await;
        let governor = Arc::new(governor);

        let mut handles = Vec::new();
        for i in 0..40 {
            let governor = governor.clone();
            handles.push(tokio::spawn(async move {
                governor
                    .commit("u1", QuotaOperation::Upload { bytes: 10 }, &format!("upload:{}", i))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let usage = governor.usage("u1").await.unwrap();
        assert_eq!(usage.storage_used_bytes, 400);
        assert_eq!(usage.files_uploaded, 40);
    }

    #[tokio::test]
    async fn test_replay_after_many_other_commits() {
        let (governor, _) = governor_with(Plan::Premium).await;
        let upload = QuotaOperation::Upload { bytes: 10 };

        governor.commit("u1", upload, "upload:first").await.unwrap();
        for i in 0..300 {
            governor
                .commit("u1", upload, &format!("upload:{}", i))
                .await
                .unwrap();
        }

        assert_eq!(
            governor.commit("u1", upload, "upload:first").await.unwrap(),
            CommitOutcome::AlreadyApplied
        );
        let usage = governor.usage("u1").await.unwrap();
        assert_eq!(usage.files_uploaded, 301);
        assert_eq!(usage.storage_used_bytes, 3010);
    }

    #[tokio::test]
    async fn test_interrupted_commit_resumes() {
        let store = FlakyStore::new();
        let accounts = AccountDirectory::new(store.clone());
        accounts.register("u1", Plan::Free, None).await.unwrap();
        let governor = QuotaGovernor::new(store.clone(), Arc::new(accounts));
        let upload = QuotaOperation::Upload { bytes: 100 };

        // Increment lands, sealing the commit does not
        store.fail(StoreOp::Update, collections::QUOTA_COMMITS, 1);
        assert!(governor.commit("u1", upload, "upload:m1").await.is_err());

        assert_eq!(
            governor.commit("u1", upload, "upload:m1").await.unwrap(),
            CommitOutcome::AlreadyApplied
        );
        assert_eq!(
            governor.commit("u1", upload, "upload:m1").await.unwrap(),
            CommitOutcome::AlreadyApplied
        );

        // Increment fails, the retry applies it once
        store.fail(StoreOp::Increment, collections::USERS, 1);
        assert!(governor.commit("u1", upload, "upload:m2").await.is_err());
        assert_eq!(
            governor.commit("u1", upload, "upload:m2").await.unwrap(),
            CommitOutcome::Applied
        );

        let usage = governor.usage("u1").await.unwrap();
        assert_eq!(usage.storage_used_bytes, 200);
        assert_eq!(usage.files_uploaded, 2);
    }

    #[tokio::test]
    async fn test_unsealed_commit_past_window_is_refused() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let accounts = AccountDirectory::new(store.clone());
        accounts.register("u1", Plan::Free, None).await.unwrap();
        let governor = QuotaGovernor::new(store.clone(), Arc::new(accounts))
            .with_retry_window(Duration::hours(1));

        let stale = CommitRecord {
            account_id: "u1".into(),
            idempotency_key: "upload:old".into(),
            sealed: false,
            claimed_at: Utc::now() - Duration::hours(2),
        };
        store
            .put(
                collections::QUOTA_COMMITS,
                "u1:upload:old",
                to_document(&stale).unwrap(),
            )
            .await
            .unwrap();

        let err = governor
            .commit("u1", QuotaOperation::Upload { bytes: 5 }, "upload:old")
            .await
            .unwrap_err();
        assert!(matches!(err, KeepsakeError::StaleCommit { .. }));
        assert_eq!(governor.usage("u1").await.unwrap(), Usage::default());
    }

    #[tokio::test]
    async fn test_release_never_goes_negative() {
        let (governor, _) = governor_with(Plan::Free).await;
        governor
            .commit("u1", QuotaOperation::DeleteFile { bytes: 500 }, "delete:ghost")
            .await
            .unwrap();
        assert_eq!(governor.usage("u1").await.unwrap(), Usage::default());
    }

    #[tokio::test]
    async fn test_plan_change_takes_effect_immediately() {
        let (governor, accounts) = governor_with(Plan::Free).await;
        let big = QuotaOperation::Upload { bytes: 2 * 1024 * MIB };
        assert!(!governor.authorize("u1", big).await.unwrap().is_allowed());

        accounts.set_plan("u1", Plan::Premium).await.unwrap();
        assert!(governor.authorize("u1", big).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_summary() {
        let (governor, _) = governor_with(Plan::Free).await;
        governor
            .commit("u1", QuotaOperation::Upload { bytes: 512 * MIB }, "upload:a")
            .await
            .unwrap();

        let summary = governor.summary("u1").await.unwrap();
        assert_eq!(summary.bytes_available, 512 * MIB);
        assert_eq!(summary.files_remaining, 49);
        assert_eq!(summary.folders_remaining, 5);
        assert!((summary.usage_percentage - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let (governor, _) = governor_with(Plan::Free).await;
        assert!(matches!(
            governor.commit("ghost", QuotaOperation::CreateFolder, "k").await,
            Err(KeepsakeError::NotFound { .. })
        ));
        assert!(matches!(
            governor.authorize("ghost", QuotaOperation::CreateFolder).await,
            Err(KeepsakeError::NotFound { .. })
        ));
    }
}
