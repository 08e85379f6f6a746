//! Read-only aggregations over ledger entries

use super::{EntryStatus, LedgerEntry, Money, PayoutStatus};
use crate::{KeepsakeError, Result};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Half-open time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end < start {
            return Err(KeepsakeError::InvalidArgument(format!(
                "range ends ({}) before it starts ({})",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    /// Calendar year in UTC
    pub fn year(year: i32) -> Result<Self> {
        let boundary = |y: i32| {
            Utc.with_ymd_and_hms(y, 1, 1, 0, 0, 0)
                .single()
                .ok_or_else(|| KeepsakeError::InvalidArgument(format!("year {} out of range", y)))
        };
        Self::new(boundary(year)?, boundary(year + 1)?)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub success: u64,
    pub failed: u64,
    pub refunded: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub entry_count: u64,
    pub by_status: StatusCounts,
    pub total_face_value: Money,
    pub total_user_paid: Money,
    /// Commission on successful redemptions only
    pub earned_commission: Money,
    /// Earned but not yet settled
    pub pending_payout: Money,
    /// Amounts actually settled, including settled-then-disputed entries
    pub paid_out: Money,
}

/// Per-user year-end figures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxReportRow {
    pub user_id: String,
    pub tax_year: i32,
    pub entry_count: u64,
    pub total_commission: Money,
    pub requires_1099k: bool,
}

pub(crate) fn summarize<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> LedgerSummary {
    let mut summary = LedgerSummary::default();

    for entry in entries {
        summary.entry_count += 1;
        summary.total_face_value += entry.face_value;
        summary.total_user_paid += entry.user_paid;

        match entry.status {
            EntryStatus::Pending => summary.by_status.pending += 1,
            EntryStatus::Success => {
                summary.by_status.success += 1;
                summary.earned_commission += entry.commission_amount;
                if entry.payout_status == PayoutStatus::Pending {
                    summary.pending_payout += entry.commission_amount;
                }
            }
            EntryStatus::Failed => summary.by_status.failed += 1,
            EntryStatus::Refunded => summary.by_status.refunded += 1,
        }

        if let Some(paid) = entry.paid_amount {
            summary.paid_out += paid;
        }
    }

    summary
}

/// Group successful entries by user and apply the reporting threshold
/// (inclusive). Entries of other years or statuses are ignored.
pub(crate) fn tax_rows<'a>(
    entries: impl IntoIterator<Item = &'a LedgerEntry>,
    tax_year: i32,
    threshold: Money,
) -> Vec<TaxReportRow> {
    let mut per_user: BTreeMap<&str, (u64, Money)> = BTreeMap::new();

    for entry in entries {
        if entry.tax_year != tax_year || entry.status != EntryStatus::Success {
            continue;
        }
        let totals = per_user.entry(entry.user_id.as_str()).or_default();
        totals.0 += 1;
        totals.1 += entry.commission_amount;
    }

    per_user
        .into_iter()
        .map(|(user_id, (entry_count, total_commission))| TaxReportRow {
            user_id: user_id.to_string(),
            tax_year,
            entry_count,
            total_commission,
            requires_1099k: total_commission >= threshold,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_year_range_is_half_open() {
        let range = DateRange::year(2024).unwrap();
        let new_year = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert!(range.contains(new_year - Duration::milliseconds(1)));
        assert!(!range.contains(new_year));
        assert!(range.contains(range.start));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let now = Utc::now();
        assert!(DateRange::new(now, now - Duration::seconds(1)).is_err());
        assert!(DateRange::new(now, now).is_ok());
    }
}
