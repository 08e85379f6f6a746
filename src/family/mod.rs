//! Family Access Controller - Invitations and roles for a shared account
//!
//! Member lifecycle:
//!
//! ```text
//! [no record] --invite--> pending --accept(valid token)--> active
//! pending --resend--> pending (new token, same id)
//! pending | active --revoke--> [deleted]
//! active --change role--> active
//! ```
//!
//! The owner of a family unit is the account itself and never has a member
//! record. Every authorization check re-reads the caller's role from the
//! store; the account cross-reference is only a hint that is verified against
//! the membership record before it is trusted.

mod notify;
mod roles;

pub use notify::{InviteNotification, InviteNotifier, LogNotifier, NotifyError};
pub use roles::{FamilyRole, Permissions};

use crate::crypto::{derive_id, generate_invite_token};
use crate::quota::{AccountDirectory, FamilyLink};
use crate::store::{
    collections, fields, from_document, to_document, Direction, DocumentStore, Filter, Query,
    StoreError,
};
use crate::{EntityKind, KeepsakeConfig, KeepsakeError, Result};
use roles::FamilyAction;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

const MEMBER_ID_NAMESPACE: &str = "keepsake family member v1";
const TOKEN_ROTATION_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Pending,
    Active,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberStatus::Pending => f.write_str("pending"),
            MemberStatus::Active => f.write_str("active"),
        }
    }
}

/// Membership record, scoped to the owning account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyMember {
    pub id: String,
    pub owner_id: String,
    pub email: String,
    pub role: FamilyRole,
    pub status: MemberStatus,
    pub invited_by: String,
    /// Present only while pending
    #[serde(default)]
    pub invite_token: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Account bound on acceptance
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub added_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub token_issued_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_active_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewInvite {
    pub email: String,
    pub role: FamilyRole,
    pub message: Option<String>,
}

impl NewInvite {
    pub fn new(email: impl Into<String>, role: FamilyRole) -> Self {
        Self {
            email: email.into(),
            role,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Outcome of a redeemed invite
#[derive(Debug, Clone)]
pub struct AcceptedInvite {
    pub member: FamilyMember,
    /// False when the account cross-reference write failed; access still
    /// works through the membership scan.
    pub link_synced: bool,
}

/// Role currently in force for an account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveRole {
    pub owner_id: String,
    pub member_id: String,
    pub role: FamilyRole,
}

pub struct FamilyAccess {
    store: Arc<dyn DocumentStore>,
    accounts: AccountDirectory,
    notifier: Arc<dyn InviteNotifier>,
    invite_ttl: Option<Duration>,
}

impl FamilyAccess {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        accounts: AccountDirectory,
        notifier: Arc<dyn InviteNotifier>,
        config: &KeepsakeConfig,
    ) -> Self {
        Self {
            store,
            accounts,
            notifier,
            invite_ttl: config.invite_ttl_days.map(|d| Duration::days(i64::from(d))),
        }
    }

    pub fn permissions(role: FamilyRole) -> Permissions {
        role.permissions()
    }

    /// Invite an email address into the owner's family unit
    pub async fn invite(&self, owner_id: &str, caller_id: &str, invite: NewInvite) -> Result<FamilyMember> {
        self.authorize(owner_id, caller_id, FamilyAction::Invite).await?;

        let email = normalize_email(&invite.email)?;
        if invite.role == FamilyRole::Owner {
            return Err(KeepsakeError::InvalidArgument(
                "a family unit has exactly one owner".into(),
            ));
        }

        let now = Utc::now();
        let member = FamilyMember {
            id: derive_id(MEMBER_ID_NAMESPACE, &[owner_id, email.as_str()]),
            owner_id: owner_id.to_string(),
            email: email.clone(),
            role: invite.role,
            status: MemberStatus::Pending,
            invited_by: caller_id.to_string(),
            invite_token: Some(generate_invite_token()),
            message: invite.message,
            account_id: None,
            added_at: now,
            token_issued_at: Some(now),
            activated_at: None,
            last_active_at: None,
        };

        // The id is derived from (owner, email), so create-if-absent is the
        // duplicate check and two racing invites cannot both win.
        self.store
            .create(collections::FAMILY_MEMBERS, &member.id, to_document(&member)?)
            .await
            .map_err(|e| match e {
                StoreError::AlreadyExists { .. } => KeepsakeError::DuplicateMember {
                    email: email.clone(),
                },
                other => other.into(),
            })?;

        tracing::info!(
            "Invited {} to family {} as {} (member {})",
            email,
            owner_id,
            member.role,
            member.id
        );

        // Persisted first; a failed dispatch leaves a resendable invite
        self.dispatch(&member).await;
        Ok(member)
    }

    /// Redeem an invite token for an authenticated account
    pub async fn accept_invite(&self, token: &str, account_id: &str) -> Result<AcceptedInvite> {
        let member = self
            .store
            .query(
                collections::FAMILY_MEMBERS,
                &Query::new().filter(Filter::eq("invite_token", token)).limit(1),
            )
            .await?
            .into_iter()
            .next()
            .map(from_document::<FamilyMember>)
            .transpose()?
            .ok_or(KeepsakeError::InvalidOrExpiredInvite)?;

        if member.status != MemberStatus::Pending || self.is_expired(&member, Utc::now()) {
            return Err(KeepsakeError::InvalidOrExpiredInvite);
        }
        if member.owner_id == account_id {
            return Err(KeepsakeError::InvalidArgument(
                "the owner cannot join their own family unit".into(),
            ));
        }

        let now = Utc::now();
        let activated = self
            .store
            .update_if(
                collections::FAMILY_MEMBERS,
                &member.id,
                &[
                    Filter::eq("status", json!(MemberStatus::Pending)),
                    Filter::eq("invite_token", token),
                ],
                fields([
                    ("status", json!(MemberStatus::Active)),
                    ("account_id", json!(account_id)),
                    ("activated_at", json!(now.timestamp_millis())),
                    ("last_active_at", json!(now.timestamp_millis())),
                    ("invite_token", Value::Null),
                    ("token_issued_at", Value::Null),
                ]),
            )
            .await
            .map_err(|e| match e {
                StoreError::NotFound { .. } => KeepsakeError::InvalidOrExpiredInvite,
                other => other.into(),
            })?;

        // Replayed, rotated or revoked between the lookup and the write
        if !activated {
            return Err(KeepsakeError::InvalidOrExpiredInvite);
        }

        let member = FamilyMember {
            status: MemberStatus::Active,
            account_id: Some(account_id.to_string()),
            activated_at: Some(now),
            last_active_at: Some(now),
            invite_token: None,
            token_issued_at: None,
            ..member
        };

        tracing::info!(
            "Account {} joined family {} as {}",
            account_id,
            member.owner_id,
            member.role
        );

        let link = FamilyLink {
            owner_id: member.owner_id.clone(),
            member_id: member.id.clone(),
            role: member.role,
        };
        let link_synced = match self.accounts.set_family_link(account_id, &link).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    "Member {} is active but the cross-reference on {} is stale: {}",
                    member.id,
                    account_id,
                    e
                );
                false
            }
        };

        Ok(AcceptedInvite {
            member,
            link_synced,
        })
    }

    /// Rotate the token of a pending invite and send it again
    pub async fn resend_invite(&self, owner_id: &str, caller_id: &str, member_id: &str) -> Result<FamilyMember> {
        self.authorize(owner_id, caller_id, FamilyAction::Invite).await?;

        for _ in 0..TOKEN_ROTATION_ATTEMPTS {
            let member = self.member(owner_id, member_id).await?;
            if member.status != MemberStatus::Pending {
                return Err(KeepsakeError::InvalidTransition {
                    from: member.status.to_string(),
                    to: MemberStatus::Pending.to_string(),
                });
            }

            let token = generate_invite_token();
            let now = Utc::now();
            let precondition = [
                Filter::eq("status", json!(MemberStatus::Pending)),
                Filter::eq("invite_token", json!(member.invite_token)),
            ];
            let rotated = self
                .store
                .update_if(
                    collections::FAMILY_MEMBERS,
                    member_id,
                    &precondition,
                    fields([
                        ("invite_token", json!(token)),
                        ("token_issued_at", json!(now.timestamp_millis())),
                    ]),
                )
                .await
                .map_err(|e| member_error(e, member_id))?;

            if rotated {
                let member = FamilyMember {
                    invite_token: Some(token),
                    token_issued_at: Some(now),
                    ..member
                };
                tracing::info!("Rotated invite token for member {}", member_id);
                self.dispatch(&member).await;
                return Ok(member);
            }
            tracing::debug!("Invite {} changed during rotation, re-reading", member_id);
        }

        Err(StoreError::Unavailable(format!("invite {} is contended", member_id)).into())
    }

    /// Replace the role of a member
    pub async fn update_role(
        &self,
        owner_id: &str,
        caller_id: &str,
        member_id: &str,
        new_role: FamilyRole,
    ) -> Result<FamilyMember> {
        self.authorize(owner_id, caller_id, FamilyAction::ChangeRole).await?;

        if new_role == FamilyRole::Owner {
            return Err(KeepsakeError::InvalidArgument(
                "ownership cannot be granted through a role change".into(),
            ));
        }
        let member = self.member(owner_id, member_id).await?;
        if member.role == FamilyRole::Owner {
            return Err(KeepsakeError::InvalidArgument(
                "the owner's role cannot be changed".into(),
            ));
        }

        self.store
            .update(
                collections::FAMILY_MEMBERS,
                member_id,
                fields([("role", json!(new_role))]),
            )
            .await
            .map_err(|e| member_error(e, member_id))?;

        tracing::info!(
            "Member {} of family {} changed from {} to {}",
            member_id,
            owner_id,
            member.role,
            new_role
        );

        if let (MemberStatus::Active, Some(account_id)) = (member.status, &member.account_id) {
            let link = FamilyLink {
                owner_id: owner_id.to_string(),
                member_id: member_id.to_string(),
                role: new_role,
            };
            if let Err(e) = self.accounts.set_family_link(account_id, &link).await {
                tracing::warn!("Role cross-reference on {} is stale: {}", account_id, e);
            }
        }

        Ok(FamilyMember {
            role: new_role,
            ..member
        })
    }

    /// Revoke a pending invite or an active membership
    pub async fn remove_member(&self, owner_id: &str, caller_id: &str, member_id: &str) -> Result<()> {
        self.authorize(owner_id, caller_id, FamilyAction::Remove).await?;

        let member = self.member(owner_id, member_id).await?;
        self.store.delete(collections::FAMILY_MEMBERS, member_id).await?;
        tracing::info!("Removed member {} ({}) from family {}", member_id, member.email, owner_id);

        // Access is already gone: role resolution verifies the record
        if let Some(account_id) = &member.account_id {
            if let Err(e) = self.accounts.clear_family_link(account_id, member_id).await {
                tracing::warn!("Could not clear cross-reference on {}: {}", account_id, e);
            }
        }
        Ok(())
    }

    /// Members of a family unit; invite tokens are hidden from callers who
    /// cannot invite
    pub async fn list_members(&self, owner_id: &str, caller_id: &str) -> Result<Vec<FamilyMember>> {
        let role = self.authorize(owner_id, caller_id, FamilyAction::View).await?;

        let docs = self
            .store
            .query(
                collections::FAMILY_MEMBERS,
                &Query::new()
                    .filter(Filter::eq("owner_id", owner_id))
                    .order_by("added_at", Direction::Ascending),
            )
            .await?;

        docs.into_iter()
            .map(|doc| {
                let mut member: FamilyMember = from_document(doc)?;
                if !role.can_invite() {
                    member.invite_token = None;
                }
                Ok(member)
            })
            .collect()
    }

    /// Stamp `last_active_at` for an account's membership
    pub async fn touch_activity(&self, owner_id: &str, account_id: &str) -> Result<()> {
        let member = self
            .active_membership(owner_id, account_id)
            .await?
            .ok_or_else(|| KeepsakeError::not_found(EntityKind::FamilyMember, account_id))?;

        self.store
            .update(
                collections::FAMILY_MEMBERS,
                &member.id,
                fields([("last_active_at", json!(Utc::now().timestamp_millis()))]),
            )
            .await
            .map_err(|e| member_error(e, &member.id))
    }

    /// Role of `account_id` within the owner's family unit, freshly read
    pub async fn role_in(&self, owner_id: &str, account_id: &str) -> Result<Option<FamilyRole>> {
        if owner_id == account_id {
            return Ok(Some(FamilyRole::Owner));
        }
        if let Some(found) = self.linked_role(account_id).await? {
            if found.owner_id == owner_id {
                return Ok(Some(found.role));
            }
        }
        Ok(self
            .active_membership(owner_id, account_id)
            .await?
            .map(|m| m.role))
    }

    /// Family membership currently in force for an account.
    ///
    /// Trusts the account cross-reference only after checking it against the
    /// membership record, then falls back to scanning memberships bound to
    /// the account, so a lost cross-reference write never revokes access.
    pub async fn resolve_effective_role(&self, account_id: &str) -> Result<Option<EffectiveRole>> {
        if let Some(found) = self.linked_role(account_id).await? {
            return Ok(Some(found));
        }

        let docs = self
            .store
            .query(
                collections::FAMILY_MEMBERS,
                &Query::new()
                    .filter(Filter::eq("account_id", account_id))
                    .filter(Filter::eq("status", json!(MemberStatus::Active)))
                    .order_by("activated_at", Direction::Descending)
                    .limit(1),
            )
            .await?;

        match docs.into_iter().next() {
            Some(doc) => {
                let member: FamilyMember = from_document(doc)?;
                tracing::debug!(
                    "Resolved {} through membership scan (cross-reference missing or stale)",
                    account_id
                );
                Ok(Some(EffectiveRole {
                    owner_id: member.owner_id,
                    member_id: member.id,
                    role: member.role,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn get_member(&self, owner_id: &str, member_id: &str) -> Result<FamilyMember> {
        self.member(owner_id, member_id).await
    }

    async fn authorize(&self, owner_id: &str, caller_id: &str, action: FamilyAction) -> Result<FamilyRole> {
        match self.role_in(owner_id, caller_id).await? {
            Some(role) if action.allowed_for(role) => Ok(role),
            current => {
                tracing::info!(
                    "Denied {:?} in family {} to {} (role {:?})",
                    action,
                    owner_id,
                    caller_id,
                    current
                );
                Err(KeepsakeError::Unauthorized {
                    required_role: action.required_role(),
                })
            }
        }
    }

    /// Cross-reference on the account, verified against the member record
    async fn linked_role(&self, account_id: &str) -> Result<Option<EffectiveRole>> {
        let link = match self.accounts.get(account_id).await {
            Ok(account) => account.family,
            Err(KeepsakeError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        let Some(link) = link else {
            return Ok(None);
        };

        let record = self
            .store
            .get(collections::FAMILY_MEMBERS, &link.member_id)
            .await?
            .map(from_document::<FamilyMember>)
            .transpose()?;

        Ok(record.and_then(|m| {
            let bound = m.account_id.as_deref() == Some(account_id);
            (bound && m.status == MemberStatus::Active && m.owner_id == link.owner_id).then(|| {
                EffectiveRole {
                    owner_id: m.owner_id,
                    member_id: m.id,
                    role: m.role,
                }
            })
        }))
    }

    async fn active_membership(&self, owner_id: &str, account_id: &str) -> Result<Option<FamilyMember>> {
        let docs = self
            .store
            .query(
                collections::FAMILY_MEMBERS,
                &Query::new()
                    .filter(Filter::eq("owner_id", owner_id))
                    .filter(Filter::eq("account_id", account_id))
                    .filter(Filter::eq("status", json!(MemberStatus::Active)))
                    .limit(1),
            )
            .await?;
        docs.into_iter()
            .next()
            .map(from_document::<FamilyMember>)
            .transpose()
            .map_err(Into::into)
    }

    async fn member(&self, owner_id: &str, member_id: &str) -> Result<FamilyMember> {
        let member = self
            .store
            .get(collections::FAMILY_MEMBERS, member_id)
            .await?
            .map(from_document::<FamilyMember>)
            .transpose()?;
        match member {
            Some(m) if m.owner_id == owner_id => Ok(m),
            _ => Err(KeepsakeError::not_found(EntityKind::FamilyMember, member_id)),
        }
    }

    fn is_expired(&self, member: &FamilyMember, now: DateTime<Utc>) -> bool {
        match (self.invite_ttl, member.token_issued_at) {
            (Some(ttl), Some(issued)) => now - issued > ttl,
            _ => false,
        }
    }

    async fn dispatch(&self, member: &FamilyMember) {
        let Some(token) = member.invite_token.clone() else {
            return;
        };
        let from_name = match self.accounts.get(&member.owner_id).await {
            Ok(owner) => owner.display_name.unwrap_or(owner.id),
            Err(_) => member.owner_id.clone(),
        };
        let notification = InviteNotification {
            to_email: member.email.clone(),
            from_name,
            role: member.role,
            message: member.message.clone(),
            token,
        };

        if let Err(e) = self.notifier.send_invite(&notification).await {
            tracing::warn!(
                "Invite for member {} saved but not delivered: {}",
                member.id,
                e
            );
        }
    }
}

fn member_error(e: StoreError, member_id: &str) -> KeepsakeError {
    match e {
        StoreError::NotFound { .. } => KeepsakeError::not_found(EntityKind::FamilyMember, member_id),
        other => other.into(),
    }
}

fn normalize_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.is_empty() && !domain.contains('@') && !email.contains(' ')
        }
        None => false,
    };
    if !valid {
        return Err(KeepsakeError::InvalidArgument(format!(
            "not an email address: {}",
            raw
        )));
    }
    Ok(email)
}
