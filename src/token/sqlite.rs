use anyhow::Context;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::domain::{AccountId, Units};
use crate::storage::Repository;

use super::{TransferError, ValueTransferService};

/// What a movement of funds does to the allowance granted to the operator.
#[derive(Clone, Copy)]
enum AllowanceEffect<'a> {
    Untouched,
    /// `from` pays out of the allowance it granted to this spender
    Spend(&'a AccountId),
    /// `to` gets back allowance it had granted to this spender
    Restore(&'a AccountId),
}

/// Token balances and allowances stored next to the ledger in SQLite.
///
/// Every movement of funds is one SQL transaction, so a failed transfer
/// never leaves a half-applied debit behind.
#[derive(Clone)]
pub struct SqliteToken {
    pool: SqlitePool,
    operator: AccountId,
}

impl SqliteToken {
    pub fn new(pool: SqlitePool, operator: AccountId) -> Self {
        Self { pool, operator }
    }

    /// Token sharing the repository's database.
    pub fn for_repository(repo: &Repository, operator: AccountId) -> Self {
        Self::new(repo.pool().clone(), operator)
    }

    /// Credit `amount` out of thin air. Returns the new balance.
    pub async fn mint(&self, account: &AccountId, amount: Units) -> Result<Units, TransferError> {
        if amount <= 0 {
            return Err(TransferError::InvalidAmount(amount));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO token_balances (account, balance) VALUES (?, ?)
            ON CONFLICT(account) DO UPDATE SET balance = balance + excluded.balance
            RETURNING balance
            "#,
        )
        .bind(account.as_str())
        .bind(amount)
        .fetch_one(&self.pool)
        .await
        .context("Failed to mint tokens")?;

        debug!(account = %account, amount, "minted tokens");
        Ok(row.get("balance"))
    }

    /// Set the allowance `owner` grants to `spender`, replacing any previous one.
    pub async fn approve(
        &self,
        owner: &AccountId,
        spender: &AccountId,
        amount: Units,
    ) -> Result<(), TransferError> {
        if amount < 0 {
            return Err(TransferError::InvalidAmount(amount));
        }

        sqlx::query(
            r#"
            INSERT INTO token_allowances (owner, spender, amount) VALUES (?, ?, ?)
            ON CONFLICT(owner, spender) DO UPDATE SET amount = excluded.amount
            "#,
        )
        .bind(owner.as_str())
        .bind(spender.as_str())
        .bind(amount)
        .execute(&self.pool)
        .await
        .context("Failed to approve allowance")?;

        debug!(owner = %owner, spender = %spender, amount, "approved allowance");
        Ok(())
    }

    pub async fn allowance(
        &self,
        owner: &AccountId,
        spender: &AccountId,
    ) -> Result<Units, TransferError> {
        let row = sqlx::query(
            "SELECT amount FROM token_allowances WHERE owner = ? AND spender = ?",
        )
        .bind(owner.as_str())
        .bind(spender.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read allowance")?;

        Ok(row.map(|r| r.get("amount")).unwrap_or(0))
    }

    async fn move_funds(
        &self,
        from: &AccountId,
        to: &AccountId,
        amount: Units,
        allowance: AllowanceEffect<'_>,
    ) -> Result<(), TransferError> {
        if amount < 0 {
            return Err(TransferError::InvalidAmount(amount));
        }
        if amount == 0 {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin token transaction")?;

        if let AllowanceEffect::Spend(spender) = allowance {
            let spent = sqlx::query(
                r#"
                UPDATE token_allowances
                SET amount = amount - ?
                WHERE owner = ? AND spender = ? AND amount >= ?
                "#,
            )
            .bind(amount)
            .bind(from.as_str())
            .bind(spender.as_str())
            .bind(amount)
            .execute(&mut *tx)
            .await
            .context("Failed to spend allowance")?;

            if spent.rows_affected() != 1 {
                tx.rollback().await.context("Failed to roll back token transfer")?;
                return Err(TransferError::InsufficientAllowance {
                    owner: from.clone(),
                    spender: spender.clone(),
                    allowance: self.allowance(from, spender).await?,
                    required: amount,
                });
            }
        }

        let debited = sqlx::query(
            r#"
            UPDATE token_balances
            SET balance = balance - ?
            WHERE account = ? AND balance >= ?
            "#,
        )
        .bind(amount)
        .bind(from.as_str())
        .bind(amount)
        .execute(&mut *tx)
        .await
        .context("Failed to debit balance")?;

        if debited.rows_affected() != 1 {
            tx.rollback().await.context("Failed to roll back token transfer")?;
            return Err(TransferError::InsufficientBalance {
                account: from.clone(),
                balance: self.balance_of(from).await?,
                required: amount,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO token_balances (account, balance) VALUES (?, ?)
            ON CONFLICT(account) DO UPDATE SET balance = balance + excluded.balance
            "#,
        )
        .bind(to.as_str())
        .bind(amount)
        .execute(&mut *tx)
        .await
        .context("Failed to credit balance")?;

        if let AllowanceEffect::Restore(spender) = allowance {
            sqlx::query(
                r#"
                INSERT INTO token_allowances (owner, spender, amount) VALUES (?, ?, ?)
                ON CONFLICT(owner, spender) DO UPDATE SET amount = amount + excluded.amount
                "#,
            )
            .bind(to.as_str())
            .bind(spender.as_str())
            .bind(amount)
            .execute(&mut *tx)
            .await
            .context("Failed to restore allowance")?;
        }

        tx.commit().await.context("Failed to commit token transfer")?;

        debug!(from = %from, to = %to, amount, "token transfer");
        Ok(())
    }
}

impl ValueTransferService for SqliteToken {
    fn operator(&self) -> &AccountId {
        &self.operator
    }

    async fn transfer_from(
        &self,
        from: &AccountId,
        to: &AccountId,
        amount: Units,
    ) -> Result<(), TransferError> {
        self.move_funds(from, to, amount, AllowanceEffect::Spend(&self.operator))
            .await
    }

    async fn transfer(&self, to: &AccountId, amount: Units) -> Result<(), TransferError> {
        self.move_funds(&self.operator, to, amount, AllowanceEffect::Untouched)
            .await
    }

    async fn refund_from(&self, from: &AccountId, amount: Units) -> Result<(), TransferError> {
        self.move_funds(
            &self.operator,
            from,
            amount,
            AllowanceEffect::Restore(&self.operator),
        )
        .await
    }

    async fn balance_of(&self, account: &AccountId) -> Result<Units, TransferError> {
        let row = sqlx::query("SELECT balance FROM token_balances WHERE account = ?")
            .bind(account.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read balance")?;

        Ok(row.map(|r| r.get("balance")).unwrap_or(0))
    }
}
