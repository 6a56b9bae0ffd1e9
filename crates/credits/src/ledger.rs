//! Credit ledger operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info};

use lumagen_core::{GenerationError, GenerationResult, JobId, UserId};

use crate::entry::{EntryType, LedgerEntry};

/// Result of a refund attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    /// A refund entry was appended and the balance restored.
    Refunded { new_balance: i64 },
    /// A refund for this job already exists; nothing was written.
    AlreadyRefunded,
}

/// Ledger abstraction.
///
/// All mutations are append-only entries; the balance is kept consistent
/// with the entry sum by every implementation.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Charge `amount` credits for `job_id`.
    ///
    /// Fails with `InsufficientCredits` without writing anything when the
    /// balance is below `amount`. At most one debit may exist per job.
    /// Returns the new balance.
    async fn debit(
        &self,
        user_id: UserId,
        amount: i64,
        job_id: JobId,
        description: &str,
    ) -> GenerationResult<i64>;

    /// Return the debit for `job_id` after a terminal failure.
    ///
    /// No-ops (not an error) when a refund for the job already exists.
    /// Never fails on a low balance; refunds only add back.
    async fn refund(
        &self,
        user_id: UserId,
        amount: i64,
        job_id: JobId,
        description: &str,
    ) -> GenerationResult<RefundOutcome>;

    /// Append a positive grant (`Bonus` or `AdminGrant`).
    async fn grant(
        &self,
        user_id: UserId,
        amount: i64,
        entry_type: EntryType,
        description: &str,
    ) -> GenerationResult<i64>;

    /// Remove up to `amount` unused credits at subscription period end.
    ///
    /// Clamped at the current balance so the balance never goes negative.
    /// Returns the amount actually expired.
    async fn expire(&self, user_id: UserId, amount: i64, description: &str)
        -> GenerationResult<i64>;

    /// Current balance (consistent with the ledger sum).
    async fn balance(&self, user_id: UserId) -> GenerationResult<i64>;

    /// Most recent entries, newest first.
    async fn entries(&self, user_id: UserId, limit: usize) -> GenerationResult<Vec<LedgerEntry>>;

    /// Recompute the cached balance from the ledger sum, repairing any
    /// divergence. Returns the authoritative balance.
    async fn reconcile(&self, user_id: UserId) -> GenerationResult<i64>;
}

#[derive(Debug, Default)]
struct UserAccount {
    balance: i64,
    entries: Vec<LedgerEntry>,
}

/// In-memory ledger for tests/dev.
///
/// A single lock guards balance and entries together, which gives the same
/// atomicity the Postgres implementation gets from transactions.
#[derive(Debug, Default)]
pub struct InMemoryCreditLedger {
    accounts: Mutex<HashMap<UserId, UserAccount>>,
}

impl InMemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn debit(
        &self,
        user_id: UserId,
        amount: i64,
        job_id: JobId,
        description: &str,
    ) -> GenerationResult<i64> {
        if amount <= 0 {
            return Err(GenerationError::validation("debit amount must be positive"));
        }

        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts.entry(user_id).or_default();

        let already_debited = account.entries.iter().any(|e| {
            e.entry_type == EntryType::Debit && e.related_job_id == Some(job_id)
        });
        if already_debited {
            return Err(GenerationError::conflict(format!(
                "job {job_id} already debited"
            )));
        }

        if account.balance < amount {
            return Err(GenerationError::InsufficientCredits {
                required: amount,
                available: account.balance,
            });
        }

        account.balance -= amount;
        account.entries.push(LedgerEntry::new(
            user_id,
            -amount,
            EntryType::Debit,
            Some(job_id),
            description,
        ));
        debug!(%user_id, %job_id, amount, balance = account.balance, "debited credits");
        Ok(account.balance)
    }

    async fn refund(
        &self,
        user_id: UserId,
        amount: i64,
        job_id: JobId,
        description: &str,
    ) -> GenerationResult<RefundOutcome> {
        if amount <= 0 {
            return Err(GenerationError::validation("refund amount must be positive"));
        }

        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts.entry(user_id).or_default();

        let already_refunded = account.entries.iter().any(|e| {
            e.entry_type == EntryType::Refund && e.related_job_id == Some(job_id)
        });
        if already_refunded {
            return Ok(RefundOutcome::AlreadyRefunded);
        }

        // A refund must mirror its debit exactly.
        if let Some(debit) = account.entries.iter().find(|e| {
            e.entry_type == EntryType::Debit && e.related_job_id == Some(job_id)
        }) {
            if debit.amount.abs() != amount {
                return Err(GenerationError::conflict(format!(
                    "refund of {amount} does not match debit of {} for job {job_id}",
                    debit.amount.abs()
                )));
            }
        }

        account.balance += amount;
        account.entries.push(LedgerEntry::new(
            user_id,
            amount,
            EntryType::Refund,
            Some(job_id),
            description,
        ));
        info!(%user_id, %job_id, amount, balance = account.balance, "refunded credits");
        Ok(RefundOutcome::Refunded {
            new_balance: account.balance,
        })
    }

    async fn grant(
        &self,
        user_id: UserId,
        amount: i64,
        entry_type: EntryType,
        description: &str,
    ) -> GenerationResult<i64> {
        if amount <= 0 {
            return Err(GenerationError::validation("grant amount must be positive"));
        }
        if !matches!(entry_type, EntryType::Bonus | EntryType::AdminGrant) {
            return Err(GenerationError::validation(
                "grant entry type must be bonus or admin_grant",
            ));
        }

        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts.entry(user_id).or_default();
        account.balance += amount;
        account
            .entries
            .push(LedgerEntry::new(user_id, amount, entry_type, None, description));
        Ok(account.balance)
    }

    async fn expire(
        &self,
        user_id: UserId,
        amount: i64,
        description: &str,
    ) -> GenerationResult<i64> {
        if amount <= 0 {
            return Err(GenerationError::validation("expire amount must be positive"));
        }

        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts.entry(user_id).or_default();
        let expired = amount.min(account.balance);
        if expired == 0 {
            return Ok(0);
        }

        account.balance -= expired;
        account.entries.push(LedgerEntry::new(
            user_id,
            -expired,
            EntryType::SubscriptionExpire,
            None,
            description,
        ));
        Ok(expired)
    }

    async fn balance(&self, user_id: UserId) -> GenerationResult<i64> {
        let accounts = self.accounts.lock().unwrap();
        Ok(accounts.get(&user_id).map(|a| a.balance).unwrap_or(0))
    }

    async fn entries(&self, user_id: UserId, limit: usize) -> GenerationResult<Vec<LedgerEntry>> {
        let accounts = self.accounts.lock().unwrap();
        let mut entries = accounts
            .get(&user_id)
            .map(|a| a.entries.clone())
            .unwrap_or_default();
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }

    async fn reconcile(&self, user_id: UserId) -> GenerationResult<i64> {
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts.entry(user_id).or_default();
        let sum: i64 = account.entries.iter().map(|e| e.amount).sum();
        if sum != account.balance {
            info!(%user_id, cached = account.balance, ledger = sum, "repairing diverged balance");
            account.balance = sum;
        }
        Ok(account.balance)
    }
}

#[async_trait]
impl<L: CreditLedger + ?Sized> CreditLedger for Arc<L> {
    async fn debit(
        &self,
        user_id: UserId,
        amount: i64,
        job_id: JobId,
        description: &str,
    ) -> GenerationResult<i64> {
        (**self).debit(user_id, amount, job_id, description).await
    }

    async fn refund(
        &self,
        user_id: UserId,
        amount: i64,
        job_id: JobId,
        description: &str,
    ) -> GenerationResult<RefundOutcome> {
        (**self).refund(user_id, amount, job_id, description).await
    }

    async fn grant(
        &self,
        user_id: UserId,
        amount: i64,
        entry_type: EntryType,
        description: &str,
    ) -> GenerationResult<i64> {
        (**self).grant(user_id, amount, entry_type, description).await
    }

    async fn expire(
        &self,
        user_id: UserId,
        amount: i64,
        description: &str,
    ) -> GenerationResult<i64> {
        (**self).expire(user_id, amount, description).await
    }

    async fn balance(&self, user_id: UserId) -> GenerationResult<i64> {
        (**self).balance(user_id).await
    }

    async fn entries(&self, user_id: UserId, limit: usize) -> GenerationResult<Vec<LedgerEntry>> {
        (**self).entries(user_id, limit).await
    }

    async fn reconcile(&self, user_id: UserId) -> GenerationResult<i64> {
        (**self).reconcile(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_user() -> UserId {
        UserId::new()
    }

    #[tokio::test]
    async fn debit_requires_sufficient_balance() {
        let ledger = InMemoryCreditLedger::new();
        let user = test_user();
        ledger
            .grant(user, 50, EntryType::Bonus, "welcome")
            .await
            .unwrap();

        let err = ledger.debit(user, 100, JobId::new(), "video").await.unwrap_err();
        assert_eq!(
            err,
            GenerationError::InsufficientCredits {
                required: 100,
                available: 50
            }
        );

        // Nothing was written on the failed debit.
        assert_eq!(ledger.balance(user).await.unwrap(), 50);
        assert_eq!(ledger.entries(user, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refund_is_idempotent_per_job() {
        let ledger = InMemoryCreditLedger::new();
        let user = test_user();
        let job = JobId::new();

        ledger.grant(user, 100, EntryType::Bonus, "welcome").await.unwrap();
        ledger.debit(user, 40, job, "photo").await.unwrap();
        assert_eq!(ledger.balance(user).await.unwrap(), 60);

        let first = ledger.refund(user, 40, job, "generation failed").await.unwrap();
        assert_eq!(first, RefundOutcome::Refunded { new_balance: 100 });

        let second = ledger.refund(user, 40, job, "generation failed").await.unwrap();
        assert_eq!(second, RefundOutcome::AlreadyRefunded);
        assert_eq!(ledger.balance(user).await.unwrap(), 100);

        let refunds = ledger
            .entries(user, 10)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.entry_type == EntryType::Refund)
            .count();
        assert_eq!(refunds, 1);
    }

    #[tokio::test]
    async fn refund_must_match_debit_magnitude() {
        let ledger = InMemoryCreditLedger::new();
        let user = test_user();
        let job = JobId::new();

        ledger.grant(user, 100, EntryType::Bonus, "welcome").await.unwrap();
        ledger.debit(user, 40, job, "photo").await.unwrap();

        let err = ledger.refund(user, 30, job, "bad amount").await.unwrap_err();
        assert!(matches!(err, GenerationError::Conflict(_)));
    }

    #[tokio::test]
    async fn double_debit_for_one_job_is_rejected() {
        let ledger = InMemoryCreditLedger::new();
        let user = test_user();
        let job = JobId::new();

        ledger.grant(user, 100, EntryType::Bonus, "welcome").await.unwrap();
        ledger.debit(user, 10, job, "photo").await.unwrap();
        let err = ledger.debit(user, 10, job, "photo").await.unwrap_err();
        assert!(matches!(err, GenerationError::Conflict(_)));
        assert_eq!(ledger.balance(user).await.unwrap(), 90);
    }

    #[tokio::test]
    async fn expire_clamps_at_balance() {
        let ledger = InMemoryCreditLedger::new();
        let user = test_user();
        ledger.grant(user, 30, EntryType::Bonus, "welcome").await.unwrap();

        let expired = ledger.expire(user, 100, "period end").await.unwrap();
        assert_eq!(expired, 30);
        assert_eq!(ledger.balance(user).await.unwrap(), 0);

        let expired = ledger.expire(user, 10, "period end").await.unwrap();
        assert_eq!(expired, 0);
    }

    #[tokio::test]
    async fn concurrent_debits_conserve_the_ledger() {
        let ledger = InMemoryCreditLedger::arc();
        let user = test_user();
        ledger.grant(user, 100, EntryType::Bonus, "welcome").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.debit(user, 10, JobId::new(), "photo").await.is_ok()
            }));
        }

        let mut succeeded = 0;
        for h in handles {
            if h.await.unwrap() {
                succeeded += 1;
            }
        }

        // Only as many debits as the balance could cover went through.
        assert_eq!(succeeded, 10);
        assert_eq!(ledger.balance(user).await.unwrap(), 0);
        assert_eq!(ledger.reconcile(user).await.unwrap(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: whatever interleaving of grants, debits, and refunds is
        /// applied, the cached balance equals the entry sum, never goes
        /// negative, and no job collects more than one refund.
        #[test]
        fn balance_always_equals_ledger_sum(
            ops in prop::collection::vec((0u8..3, 1i64..500), 1..40)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();

            rt.block_on(async {
                let ledger = InMemoryCreditLedger::new();
                let user = UserId::new();
                let mut open_jobs: Vec<(JobId, i64)> = Vec::new();

                for (op, amount) in ops {
                    match op {
                        0 => {
                            ledger.grant(user, amount, EntryType::Bonus, "grant").await.unwrap();
                        }
                        1 => {
                            let job = JobId::new();
                            if ledger.debit(user, amount, job, "debit").await.is_ok() {
                                open_jobs.push((job, amount));
                            }
                        }
                        _ => {
                            if let Some((job, debited)) = open_jobs.pop() {
                                ledger.refund(user, debited, job, "refund").await.unwrap();
                                // Duplicate observation of the same failure.
                                let again = ledger.refund(user, debited, job, "refund").await.unwrap();
                                assert_eq!(again, RefundOutcome::AlreadyRefunded);
                            }
                        }
                    }

                    let balance = ledger.balance(user).await.unwrap();
                    let sum: i64 = ledger
                        .entries(user, usize::MAX)
                        .await
                        .unwrap()
                        .iter()
                        .map(|e| e.amount)
                        .sum();
                    assert_eq!(balance, sum);
                    assert!(balance >= 0);
                }
            });
        }
    }
}
