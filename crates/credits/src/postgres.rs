//! Postgres-backed credit ledger.
//!
//! The balance column is updated in the same transaction that appends the
//! ledger entry, with the idempotency guards pushed into the database:
//!
//! - `balance >= amount` predicate on the debit update (no negative balances
//!   under concurrency)
//! - partial unique index on `(related_job_id, entry_type)` so a job can
//!   carry at most one debit and one refund, regardless of how many racing
//!   writers observe the same terminal failure

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{info, instrument};
use uuid::Uuid;

use lumagen_core::{GenerationError, GenerationResult, JobId, UserId};

use crate::entry::{EntryType, LedgerEntry};
use crate::ledger::{CreditLedger, RefundOutcome};

const PG_UNIQUE_VIOLATION: &str = "23505";

/// Durable ledger over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PostgresCreditLedger {
    pool: Arc<PgPool>,
}

impl PostgresCreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the ledger tables when they do not exist yet.
    pub async fn ensure_schema(&self) -> GenerationResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credit_balances (
                user_id UUID PRIMARY KEY,
                balance BIGINT NOT NULL DEFAULT 0 CHECK (balance >= 0)
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credit_ledger (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                amount BIGINT NOT NULL,
                entry_type TEXT NOT NULL,
                related_job_id UUID,
                description TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS credit_ledger_job_type_unique
            ON credit_ledger (related_job_id, entry_type)
            WHERE related_job_id IS NOT NULL
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        Ok(())
    }

    async fn ensure_account(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: UserId,
    ) -> GenerationResult<()> {
        sqlx::query(
            "INSERT INTO credit_balances (user_id, balance) VALUES ($1, 0) ON CONFLICT DO NOTHING",
        )
        .bind(user_id.as_uuid())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("ensure_account", e))?;
        Ok(())
    }

    async fn append_entry(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        entry: &LedgerEntry,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO credit_ledger (id, user_id, amount, entry_type, related_job_id, description, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(entry.user_id.as_uuid())
        .bind(entry.amount)
        .bind(entry.entry_type.as_str())
        .bind(entry.related_job_id.map(|j| *j.as_uuid()))
        .bind(&entry.description)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl CreditLedger for PostgresCreditLedger {
    #[instrument(skip(self, description), fields(user_id = %user_id, job_id = %job_id))]
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

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("debit", e))?;

        Self::ensure_account(&mut tx, user_id).await?;

        let updated = sqlx::query(
            r#"
            UPDATE credit_balances
            SET balance = balance - $2
            WHERE user_id = $1 AND balance >= $2
            RETURNING balance
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("debit", e))?;

        let Some(row) = updated else {
            let available = sqlx::query("SELECT balance FROM credit_balances WHERE user_id = $1")
                .bind(user_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("debit", e))?
                .map(|r| r.get::<i64, _>("balance"))
                .unwrap_or(0);
            return Err(GenerationError::InsufficientCredits {
                required: amount,
                available,
            });
        };
        let new_balance: i64 = row.get("balance");

        let entry = LedgerEntry::new(user_id, -amount, EntryType::Debit, Some(job_id), description);
        Self::append_entry(&mut tx, &entry).await.map_err(|e| {
            if is_unique_violation(&e) {
                GenerationError::conflict(format!("job {job_id} already debited"))
            } else {
                map_sqlx_error("debit", e)
            }
        })?;

        tx.commit().await.map_err(|e| map_sqlx_error("debit", e))?;
        Ok(new_balance)
    }

    #[instrument(skip(self, description), fields(user_id = %user_id, job_id = %job_id))]
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

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("refund", e))?;

        Self::ensure_account(&mut tx, user_id).await?;

        // The unique index arbitrates racing refunds: exactly one insert
        // wins, every other observer sees a no-op.
        let inserted = sqlx::query(
            r#"
            INSERT INTO credit_ledger (id, user_id, amount, entry_type, related_job_id, description, created_at)
            VALUES ($1, $2, $3, 'refund', $4, $5, $6)
            ON CONFLICT (related_job_id, entry_type) WHERE related_job_id IS NOT NULL
            DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(user_id.as_uuid())
        .bind(amount)
        .bind(job_id.as_uuid())
        .bind(description)
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("refund", e))?;

        if inserted.is_none() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("refund", e))?;
            return Ok(RefundOutcome::AlreadyRefunded);
        }

        let row = sqlx::query(
            "UPDATE credit_balances SET balance = balance + $2 WHERE user_id = $1 RETURNING balance",
        )
        .bind(user_id.as_uuid())
        .bind(amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("refund", e))?;
        let new_balance: i64 = row.get("balance");

        tx.commit().await.map_err(|e| map_sqlx_error("refund", e))?;
        info!(%user_id, %job_id, amount, new_balance, "refunded credits");
        Ok(RefundOutcome::Refunded { new_balance })
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

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("grant", e))?;
        Self::ensure_account(&mut tx, user_id).await?;

        let row = sqlx::query(
            "UPDATE credit_balances SET balance = balance + $2 WHERE user_id = $1 RETURNING balance",
        )
        .bind(user_id.as_uuid())
        .bind(amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("grant", e))?;
        let new_balance: i64 = row.get("balance");

        let entry = LedgerEntry::new(user_id, amount, entry_type, None, description);
        Self::append_entry(&mut tx, &entry)
            .await
            .map_err(|e| map_sqlx_error("grant", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("grant", e))?;
        Ok(new_balance)
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

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("expire", e))?;
        Self::ensure_account(&mut tx, user_id).await?;

        // Lock the row so the clamp and the entry agree under concurrency.
        let row = sqlx::query("SELECT balance FROM credit_balances WHERE user_id = $1 FOR UPDATE")
            .bind(user_id.as_uuid())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("expire", e))?;
        let balance: i64 = row.get("balance");
        let expired = amount.min(balance);

        if expired == 0 {
            tx.commit().await.map_err(|e| map_sqlx_error("expire", e))?;
            return Ok(0);
        }

        sqlx::query("UPDATE credit_balances SET balance = balance - $2 WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .bind(expired)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("expire", e))?;

        let entry = LedgerEntry::new(
            user_id,
            -expired,
            EntryType::SubscriptionExpire,
            None,
            description,
        );
        Self::append_entry(&mut tx, &entry)
            .await
            .map_err(|e| map_sqlx_error("expire", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("expire", e))?;
        Ok(expired)
    }

    async fn balance(&self, user_id: UserId) -> GenerationResult<i64> {
        let row = sqlx::query("SELECT balance FROM credit_balances WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("balance", e))?;
        Ok(row.map(|r| r.get::<i64, _>("balance")).unwrap_or(0))
    }

    async fn entries(&self, user_id: UserId, limit: usize) -> GenerationResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, amount, entry_type, related_job_id, description, created_at
            FROM credit_ledger
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("entries", e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let entry_type_raw: String = row.get("entry_type");
            entries.push(LedgerEntry {
                id: row.get::<Uuid, _>("id"),
                user_id: UserId::from_uuid(row.get("user_id")),
                amount: row.get("amount"),
                entry_type: EntryType::from_str(&entry_type_raw)?,
                related_job_id: row
                    .get::<Option<Uuid>, _>("related_job_id")
                    .map(JobId::from_uuid),
                description: row.get("description"),
                created_at: row.get::<DateTime<Utc>, _>("created_at"),
            });
        }
        Ok(entries)
    }

    async fn reconcile(&self, user_id: UserId) -> GenerationResult<i64> {
        let row = sqlx::query(
            r#"
            UPDATE credit_balances
            SET balance = COALESCE((SELECT SUM(amount) FROM credit_ledger WHERE user_id = $1), 0)
            WHERE user_id = $1
            RETURNING balance
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reconcile", e))?;
        Ok(row.map(|r| r.get::<i64, _>("balance")).unwrap_or(0))
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some(PG_UNIQUE_VIOLATION)
    )
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> GenerationError {
    if is_unique_violation(&err) {
        return GenerationError::conflict(format!("{operation}: concurrent duplicate write"));
    }
    GenerationError::storage(format!("{operation}: {err}"))
}
