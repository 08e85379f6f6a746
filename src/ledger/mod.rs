//! Commission Ledger - Reward redemptions and their financial lifecycle
//!
//! ```text
//! status:         pending --> success --> refunded
//!                 pending --> failed
//! payout_status:  pending --> paid        (only once status = success)
//!                 pending | paid --> disputed
//! ```
//!
//! Commission is computed once at creation and never recomputed. Illegal
//! transitions are rejected before anything is written. Once settled, an
//! entry keeps its status for good, disputed or not.

mod money;
mod report;

pub use money::{CommissionRate, Money};
pub use report::{DateRange, LedgerSummary, StatusCounts, TaxReportRow};

use crate::crypto::derive_id;
use crate::store::{
    collections, fields, from_document, to_document, Direction, DocumentStore, Filter, Query,
    StoreError,
};
use crate::{EntityKind, KeepsakeConfig, KeepsakeError, Result};

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

const ENTRY_ID_NAMESPACE: &str = "keepsake ledger entry v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Success,
    Failed,
    Refunded,
}

impl EntryStatus {
    pub fn can_transition_to(self, next: EntryStatus) -> bool {
        matches!(
            (self, next),
            (EntryStatus::Pending, EntryStatus::Success)
                | (EntryStatus::Pending, EntryStatus::Failed)
                | (EntryStatus::Success, EntryStatus::Refunded)
        )
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Success => "success",
            EntryStatus::Failed => "failed",
            EntryStatus::Refunded => "refunded",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Paid,
    Disputed,
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayoutStatus::Pending => "payout pending",
            PayoutStatus::Paid => "paid",
            PayoutStatus::Disputed => "disputed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub user_id: String,
    /// Redemption session; one entry per reference
    pub transaction_ref: String,
    pub retailer: String,
    pub face_value: Money,
    pub bonus_value: Money,
    pub user_paid: Money,
    /// Fixed at creation
    pub commission_amount: Money,
    pub commission_rate: CommissionRate,
    pub status: EntryStatus,
    pub payout_status: PayoutStatus,
    #[serde(default)]
    pub payout_ref: Option<String>,
    #[serde(default)]
    pub paid_amount: Option<Money>,
    #[serde(default)]
    pub dispute_note: Option<String>,
    pub tax_year: i32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub paid_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    /// Whether a payout has settled this entry, disputed afterwards or not
    pub fn is_settled(&self) -> bool {
        self.paid_amount.is_some()
    }
}

/// A redemption attempt to record
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub user_id: String,
    pub transaction_ref: String,
    pub retailer: String,
    pub face_value: Money,
    pub bonus_value: Money,
    pub user_paid: Money,
    /// Rate in force for this user at redemption time
    pub commission_rate: CommissionRate,
}

/// How a payout total is attributed to the entries it settles
#[derive(Debug, Clone, PartialEq)]
pub enum PayoutAllocation {
    /// Equal shares; leftover cents go to the earliest entries
    EvenSplit(Money),
    /// One amount per entry id
    Explicit(HashMap<String, Money>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutBatch {
    pub payout_ref: String,
    /// Entries settled by this call, with their amounts
    pub paid: Vec<(String, Money)>,
    /// Entries already settled under the same reference by an earlier call
    pub already_paid: Vec<String>,
    pub total: Money,
}

pub struct CommissionLedger {
    store: Arc<dyn DocumentStore>,
    tax_threshold: Money,
}

impl CommissionLedger {
    pub fn new(store: Arc<dyn DocumentStore>, config: &KeepsakeConfig) -> Self {
        Self {
            store,
            tax_threshold: config.tax_report_threshold,
        }
    }

    /// Record a redemption. Recording the same `transaction_ref` again
    /// returns the existing entry unchanged.
    pub async fn create_entry(&self, new_entry: NewEntry) -> Result<LedgerEntry> {
        if new_entry.user_id.is_empty() || new_entry.transaction_ref.is_empty() {
            return Err(KeepsakeError::InvalidArgument(
                "user id and transaction reference are required".into(),
            ));
        }
        let amounts = [new_entry.face_value, new_entry.bonus_value, new_entry.user_paid];
        if amounts.iter().any(|m| m.is_negative()) {
            return Err(KeepsakeError::InvalidArgument(
                "ledger amounts cannot be negative".into(),
            ));
        }

        let now = Utc::now();
        let entry = LedgerEntry {
            id: derive_id(ENTRY_ID_NAMESPACE, &[new_entry.transaction_ref.as_str()]),
            commission_amount: new_entry.commission_rate.apply(new_entry.face_value),
            user_id: new_entry.user_id,
            transaction_ref: new_entry.transaction_ref,
            retailer: new_entry.retailer,
            face_value: new_entry.face_value,
            bonus_value: new_entry.bonus_value,
            user_paid: new_entry.user_paid,
            commission_rate: new_entry.commission_rate,
            status: EntryStatus::Pending,
            payout_status: PayoutStatus::Pending,
            payout_ref: None,
            paid_amount: None,
            dispute_note: None,
            tax_year: now.year(),
            created_at: now,
            processed_at: None,
            paid_at: None,
        };

        match self
            .store
            .create(collections::COMMISSION_LEDGER, &entry.id, to_document(&entry)?)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    "Ledger entry {} for {}: {} at {} = {} commission",
                    entry.id,
                    entry.user_id,
                    entry.face_value,
                    entry.commission_rate,
                    entry.commission_amount
                );
                Ok(entry)
            }
            Err(StoreError::AlreadyExists { .. }) => {
                let existing = self.get_entry(&entry.id).await?;
                if existing.user_id != entry.user_id {
                    return Err(KeepsakeError::InvalidArgument(format!(
                        "transaction {} is recorded for another user",
                        entry.transaction_ref
                    )));
                }
                tracing::debug!("Transaction {} already recorded", entry.transaction_ref);
                Ok(existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_entry(&self, entry_id: &str) -> Result<LedgerEntry> {
        let doc = self
            .store
            .get(collections::COMMISSION_LEDGER, entry_id)
            .await?
            .ok_or_else(|| KeepsakeError::not_found(EntityKind::LedgerEntry, entry_id))?;
        Ok(from_document(doc)?)
    }

    /// Move an entry along the status state machine
    pub async fn update_status(&self, entry_id: &str, next: EntryStatus) -> Result<LedgerEntry> {
        let entry = self.get_entry(entry_id).await?;
        if !entry.status.can_transition_to(next) {
            return Err(invalid_transition(entry.status, next));
        }
        // Settled entries only take dispute annotations
        if entry.is_settled() {
            return Err(invalid_transition(entry.payout_status, next));
        }

        let now = Utc::now();
        let mut changes = fields([("status", json!(next))]);
        if next == EntryStatus::Success {
            changes.insert("processed_at".into(), json!(now.timestamp_millis()));
        }

        let applied = self
            .store
            .update_if(
                collections::COMMISSION_LEDGER,
                entry_id,
                &[
                    Filter::eq("status", json!(entry.status)),
                    Filter::is_null("paid_amount"),
                ],
                changes,
            )
            .await
            .map_err(|e| entry_error(e, entry_id))?;

        if !applied {
            let latest = self.get_entry(entry_id).await?;
            if latest.is_settled() {
                return Err(invalid_transition(latest.payout_status, next));
            }
            return Err(invalid_transition(latest.status, next));
        }

        tracing::info!("Ledger entry {}: {} -> {}", entry_id, entry.status, next);
        Ok(LedgerEntry {
            status: next,
            processed_at: if next == EntryStatus::Success {
                Some(now)
            } else {
                entry.processed_at
            },
            ..entry
        })
    }

    /// Aggregate entries created inside `range`, optionally for one user
    pub async fn get_summary(&self, range: DateRange, user_id: Option<&str>) -> Result<LedgerSummary> {
        let mut query = Query::new()
            .filter(Filter::gte("created_at", range.start.timestamp_millis()))
            .filter(Filter::lt("created_at", range.end.timestamp_millis()));
        if let Some(user_id) = user_id {
            query = query.filter(Filter::eq("user_id", user_id));
        }
        let entries = self.entries(&query).await?;
        Ok(report::summarize(&entries))
    }

    /// Successful entries awaiting settlement, oldest first
    pub async fn get_pending_payouts(&self) -> Result<Vec<LedgerEntry>> {
        self.entries(
            &Query::new()
                .filter(Filter::eq("status", json!(EntryStatus::Success)))
                .filter(Filter::eq("payout_status", json!(PayoutStatus::Pending)))
                .order_by("created_at", Direction::Ascending),
        )
        .await
    }

    /// Settle a batch of entries under one payout reference.
    ///
    /// Every entry is checked before the first write. Entries already settled
    /// under `payout_ref` are skipped, so a batch interrupted part way can be
    /// resubmitted unchanged.
    pub async fn mark_as_paid(
        &self,
        entry_ids: &[&str],
        allocation: PayoutAllocation,
        payout_ref: &str,
    ) -> Result<PayoutBatch> {
        if entry_ids.is_empty() || payout_ref.is_empty() {
            return Err(KeepsakeError::InvalidArgument(
                "a payout needs entries and a reference".into(),
            ));
        }
        let unique: HashSet<&str> = entry_ids.iter().copied().collect();
        if unique.len() != entry_ids.len() {
            return Err(KeepsakeError::InvalidArgument(
                "payout batch lists an entry twice".into(),
            ));
        }

        let mut entries = Vec::with_capacity(entry_ids.len());
        for id in entry_ids {
            entries.push(self.get_entry(id).await?);
        }
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        for entry in &entries {
            if settled_by(entry, payout_ref) {
                continue;
            }
            if entry.status != EntryStatus::Success {
                return Err(invalid_transition(entry.status, PayoutStatus::Paid));
            }
            if entry.payout_status != PayoutStatus::Pending {
                return Err(invalid_transition(entry.payout_status, PayoutStatus::Paid));
            }
        }

        let amounts = allocate(&entries, &allocation)?;

        let mut batch = PayoutBatch {
            payout_ref: payout_ref.to_string(),
            paid: Vec::new(),
            already_paid: Vec::new(),
            total: amounts.iter().copied().sum(),
        };

        for (index, (entry, amount)) in entries.iter().zip(amounts).enumerate() {
            if settled_by(entry, payout_ref) {
                batch.already_paid.push(entry.id.clone());
                continue;
            }

            let outcome = self.settle(entry, amount, payout_ref).await;
            match outcome {
                Ok(true) => batch.paid.push((entry.id.clone(), amount)),
                Ok(false) => {
                    // Lost a race; fine only if the winner was this same payout
                    match self.get_entry(&entry.id).await {
                        Ok(latest) if settled_by(&latest, payout_ref) => {
                            batch.already_paid.push(entry.id.clone())
                        }
                        Ok(latest) => {
                            return Err(invalid_transition(latest.payout_status, PayoutStatus::Paid))
                        }
                        Err(e) => return Err(batch_interrupted(&batch, &entries[index..], e)),
                    }
                }
                Err(e) => return Err(batch_interrupted(&batch, &entries[index..], e)),
            }
        }

        tracing::info!(
            "Payout {}: {} entries settled, {} already settled, total {}",
            payout_ref,
            batch.paid.len(),
            batch.already_paid.len(),
            batch.total
        );
        Ok(batch)
    }

    /// Annotate an entry as disputed; the only change a settled entry accepts
    pub async fn mark_disputed(&self, entry_id: &str, note: &str) -> Result<LedgerEntry> {
        let note = note.trim();
        if note.is_empty() {
            return Err(KeepsakeError::InvalidArgument("dispute note cannot be empty".into()));
        }
        let entry = self.get_entry(entry_id).await?;

        let applied = self
            .store
            .update_if(
                collections::COMMISSION_LEDGER,
                entry_id,
                &[Filter::eq("payout_status", json!(entry.payout_status))],
                fields([
                    ("payout_status", json!(PayoutStatus::Disputed)),
                    ("dispute_note", json!(note)),
                ]),
            )
            .await
            .map_err(|e| entry_error(e, entry_id))?;
        if !applied {
            return Err(KeepsakeError::Store(StoreError::Unavailable(format!(
                "ledger entry {} changed concurrently",
                entry_id
            ))));
        }

        tracing::warn!("Ledger entry {} disputed: {}", entry_id, note);
        Ok(LedgerEntry {
            payout_status: PayoutStatus::Disputed,
            dispute_note: Some(note.to_string()),
            ..entry
        })
    }

    /// Per-user commission totals for a tax year. Pure read; safe to re-run.
    pub async fn get_1099_data(&self, tax_year: i32) -> Result<Vec<TaxReportRow>> {
        let entries = self
            .entries(
                &Query::new()
                    .filter(Filter::eq("tax_year", tax_year))
                    .filter(Filter::eq("status", json!(EntryStatus::Success))),
            )
            .await?;
        Ok(report::tax_rows(&entries, tax_year, self.tax_threshold))
    }

    async fn settle(&self, entry: &LedgerEntry, amount: Money, payout_ref: &str) -> Result<bool> {
        self.store
            .update_if(
                collections::COMMISSION_LEDGER,
                &entry.id,
                &[
                    Filter::eq("status", json!(EntryStatus::Success)),
                    Filter::eq("payout_status", json!(PayoutStatus::Pending)),
                ],
                fields([
                    ("payout_status", json!(PayoutStatus::Paid)),
                    ("payout_ref", json!(payout_ref)),
                    ("paid_amount", json!(amount)),
                    ("paid_at", json!(Utc::now().timestamp_millis())),
                ]),
            )
            .await
            .map_err(|e| entry_error(e, &entry.id))
    }

    async fn entries(&self, query: &Query) -> Result<Vec<LedgerEntry>> {
        self.store
            .query(collections::COMMISSION_LEDGER, query)
            .await?
            .into_iter()
            .map(|doc| from_document(doc).map_err(Into::into))
            .collect()
    }
}

fn settled_by(entry: &LedgerEntry, payout_ref: &str) -> bool {
    entry.payout_status == PayoutStatus::Paid && entry.payout_ref.as_deref() == Some(payout_ref)
}

/// Amount for each entry, in the order of `entries`
fn allocate(entries: &[LedgerEntry], allocation: &PayoutAllocation) -> Result<Vec<Money>> {
    match allocation {
        PayoutAllocation::EvenSplit(total) => {
            if total.is_negative() {
                return Err(KeepsakeError::InvalidArgument("payout total is negative".into()));
            }
            let first = entries[0].commission_amount;
            if entries.iter().any(|e| e.commission_amount != first) {
                tracing::warn!(
                    "Even split of {} over {} entries with unequal commissions",
                    total,
                    entries.len()
                );
            }
            Ok(total.split_evenly(entries.len()))
        }
        PayoutAllocation::Explicit(amounts) => {
            if amounts.len() != entries.len() {
                return Err(KeepsakeError::InvalidArgument(format!(
                    "{} amounts given for {} entries",
                    amounts.len(),
                    entries.len()
                )));
            }
            entries
                .iter()
                .map(|entry| match amounts.get(&entry.id) {
                    Some(amount) if !amount.is_negative() => Ok(*amount),
                    Some(_) => Err(KeepsakeError::InvalidArgument(format!(
                        "negative amount for entry {}",
                        entry.id
                    ))),
                    None => Err(KeepsakeError::InvalidArgument(format!(
                        "no amount for entry {}",
                        entry.id
                    ))),
                })
                .collect()
        }
    }
}

fn batch_interrupted(batch: &PayoutBatch, remaining: &[LedgerEntry], cause: KeepsakeError) -> KeepsakeError {
    tracing::warn!(
        "Payout {} interrupted after {} entries: {}",
        batch.payout_ref,
        batch.paid.len() + batch.already_paid.len(),
        cause
    );
    let completed = batch
        .already_paid
        .iter()
        .cloned()
        .chain(batch.paid.iter().map(|(id, _)| id.clone()))
        .map(|id| format!("settle {}", id));
    let remaining = remaining.iter().map(|e| format!("settle {}", e.id));
    KeepsakeError::partial(completed, remaining)
}

fn invalid_transition(from: impl fmt::Display, to: impl fmt::Display) -> KeepsakeError {
    KeepsakeError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}

fn entry_error(e: StoreError, entry_id: &str) -> KeepsakeError {
    match e {
        StoreError::NotFound { .. } => KeepsakeError::not_found(EntityKind::LedgerEntry, entry_id),
        other => other.into(),
    }
}
