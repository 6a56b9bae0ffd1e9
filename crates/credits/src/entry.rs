//! Ledger entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lumagen_core::{GenerationError, JobId, UserId};

/// Kind of a balance-affecting event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Charge for a generation job (negative amount).
    Debit,
    /// Return of a debit after terminal failure (positive amount).
    Refund,
    /// Promotional credits (positive amount).
    Bonus,
    /// Manual grant by an operator (positive amount).
    AdminGrant,
    /// Removal of unused subscription credits at period end (negative).
    SubscriptionExpire,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Debit => "debit",
            EntryType::Refund => "refund",
            EntryType::Bonus => "bonus",
            EntryType::AdminGrant => "admin_grant",
            EntryType::SubscriptionExpire => "subscription_expire",
        }
    }
}

impl core::str::FromStr for EntryType {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debit" => Ok(EntryType::Debit),
            "refund" => Ok(EntryType::Refund),
            "bonus" => Ok(EntryType::Bonus),
            "admin_grant" => Ok(EntryType::AdminGrant),
            "subscription_expire" => Ok(EntryType::SubscriptionExpire),
            other => Err(GenerationError::validation(format!(
                "unknown ledger entry type: {other}"
            ))),
        }
    }
}

impl core::fmt::Display for EntryType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable ledger row.
///
/// `amount` is signed: debits and expirations are negative, refunds and
/// grants positive. The current balance of a user is the sum of their rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: UserId,
    pub amount: i64,
    pub entry_type: EntryType,
    pub related_job_id: Option<JobId>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        user_id: UserId,
        amount: i64,
        entry_type: EntryType,
        related_job_id: Option<JobId>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            amount,
            entry_type,
            related_job_id,
            description: description.into(),
            created_at: Utc::now(),
        }
    }
}
