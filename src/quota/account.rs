//! Account documents and the plan lookup collaborator

use super::Plan;
use crate::family::FamilyRole;
use crate::store::{collections, fields, from_document, to_document, DocumentStore, Filter, StoreError};
use crate::{EntityKind, KeepsakeError, Result};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

pub(crate) const STORAGE_USED_FIELD: &str = "usage.storage_used_bytes";
pub(crate) const FILES_UPLOADED_FIELD: &str = "usage.files_uploaded";
pub(crate) const FOLDERS_USED_FIELD: &str = "usage.folders_used";

/// Usage counters. Written only through the quota governor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub storage_used_bytes: u64,
    pub files_uploaded: u64,
    pub folders_used: u64,
}

/// Cross-reference from a member's account to the family unit it joined.
///
/// A hint only: the membership record is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyLink {
    pub owner_id: String,
    pub member_id: String,
    pub role: FamilyRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub plan: Plan,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub family: Option<FamilyLink>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// Plan lookup collaborator
#[async_trait]
pub trait PlanDirectory: Send + Sync {
    async fn plan_of(&self, account_id: &str) -> Result<Plan>;
}

/// Reads and maintains account documents in the `users` collection
#[derive(Clone)]
pub struct AccountDirectory {
    store: Arc<dyn DocumentStore>,
}

impl AccountDirectory {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Create an account with zeroed usage. Signup normally owns this.
    pub async fn register(
        &self,
        account_id: &str,
        plan: Plan,
        display_name: Option<&str>,
    ) -> Result<Account> {
        let account = Account {
            id: account_id.to_string(),
            plan,
            display_name: display_name.map(str::to_owned),
            usage: Usage::default(),
            family: None,
            created_at: Utc::now(),
        };

        self.store
            .create(collections::USERS, account_id, to_document(&account)?)
            .await
            .map_err(|e| match e {
                StoreError::AlreadyExists { .. } => KeepsakeError::InvalidArgument(format!(
                    "account {} already exists",
                    account_id
                )),
                other => other.into(),
            })?;

        tracing::info!("Registered account {} on the {} plan", account_id, plan);
        Ok(account)
    }

    /// Direct id lookup, so it observes the latest acknowledged write
    pub async fn get(&self, account_id: &str) -> Result<Account> {
        let doc = self
            .store
            .get(collections::USERS, account_id)
            .await?
            .ok_or_else(|| KeepsakeError::not_found(EntityKind::Account, account_id))?;
        Ok(from_document(doc)?)
    }

    pub async fn set_plan(&self, account_id: &str, plan: Plan) -> Result<()> {
        self.store
            .update(collections::USERS, account_id, fields([("plan", json!(plan))]))
            .await
            .map_err(|e| account_error(e, account_id))?;
        tracing::info!("Account {} moved to the {} plan", account_id, plan);
        Ok(())
    }

    pub(crate) async fn set_family_link(&self, account_id: &str, link: &FamilyLink) -> Result<()> {
        self.store
            .update(collections::USERS, account_id, fields([("family", json!(link))]))
            .await
            .map_err(|e| account_error(e, account_id))
    }

    /// Clear the cross-reference, but only if it still points at `member_id`.
    pub(crate) async fn clear_family_link(&self, account_id: &str, member_id: &str) -> Result<bool> {
        self.store
            .update_if(
                collections::USERS,
                account_id,
                &[Filter::eq("family.member_id", member_id)],
                fields([("family", Value::Null)]),
            )
            .await
            .map_err(|e| account_error(e, account_id))
    }
}

#[async_trait]
impl PlanDirectory for AccountDirectory {
    async fn plan_of(&self, account_id: &str) -> Result<Plan> {
        Ok(self.get(account_id).await?.plan)
    }
}

pub(crate) fn account_error(e: StoreError, account_id: &str) -> KeepsakeError {
    match e {
        StoreError::NotFound { .. } => KeepsakeError::not_found(EntityKind::Account, account_id),
        other => other.into(),
    }
}
