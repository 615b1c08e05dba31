//! Append-mostly wallet ledger. The stored `users.wallet_balance` scalar is a
//! cache of the running total of completed transactions; `rebuild_balance`
//! can reconstruct it by replay.

use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{PayMethod, TxMetadata, TxStatus, TxType};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: i64, required: i64 },
    #[error("account {0} not found")]
    AccountNotFound(Uuid),
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),
    #[error("duplicate external reference: {0}")]
    DuplicateReference(String),
    #[error("transaction {0} is not pending")]
    NotPending(Uuid),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub balance_after: i64,
}

/// Credit `amount` to the account and append one completed ledger entry.
/// The balance update is a single atomic expression, which serializes
/// concurrent mutations of the same account at the row level.
#[allow(clippy::too_many_arguments)]
pub async fn credit(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    amount: i64,
    tx_type: TxType,
    method: PayMethod,
    order_id: Option<Uuid>,
    external_reference: Option<&str>,
    metadata: &TxMetadata,
) -> LedgerResult<LedgerEntry> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    if let Some(reference) = external_reference {
        ensure_reference_unused(tx, reference).await?;
    }

    let row = sqlx::query(
        "UPDATE users SET wallet_balance = wallet_balance + $1 WHERE id = $2 RETURNING wallet_balance",
    )
    .bind(amount)
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(LedgerError::AccountNotFound(user_id))?;
    let balance_after: i64 = row.get("wallet_balance");

    insert_entry(
        tx,
        user_id,
        tx_type,
        amount,
        Some(balance_after),
        TxStatus::Completed,
        method,
        order_id,
        external_reference,
        metadata,
    )
    .await
    .map(|id| LedgerEntry { id, balance_after })
}

/// Debit `amount` from the account, refusing with `InsufficientFunds` when
/// the balance does not cover it. Never clamps.
#[allow(clippy::too_many_arguments)]
pub async fn debit(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    amount: i64,
    tx_type: TxType,
    method: PayMethod,
    order_id: Option<Uuid>,
    metadata: &TxMetadata,
) -> LedgerResult<LedgerEntry> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(amount));
    }

    // Conditional atomic update: the balance check and the write are one
    // statement, so two concurrent debits cannot both pass on a stale read.
    let updated = sqlx::query(
        "UPDATE users SET wallet_balance = wallet_balance - $1
         WHERE id = $2 AND wallet_balance >= $1
         RETURNING wallet_balance",
    )
    .bind(amount)
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?;

    let balance_after: i64 = match updated {
        Some(row) => row.get("wallet_balance"),
        None => {
            let current = sqlx::query("SELECT wallet_balance FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&mut **tx)
                .await?;
            return match current {
                Some(row) => Err(LedgerError::InsufficientFunds {
                    available: row.get("wallet_balance"),
                    required: amount,
                }),
                None => Err(LedgerError::AccountNotFound(user_id)),
            };
        }
    };

    insert_entry(
        tx,
        user_id,
        tx_type,
        amount,
        Some(balance_after),
        TxStatus::Completed,
        method,
        order_id,
        None,
        metadata,
    )
    .await
    .map(|id| LedgerEntry { id, balance_after })
}

/// Record a deposit that is not yet funded (bank transfer awaiting operator
/// approval, PayPal order awaiting user approval). No balance mutation.
pub async fn create_pending_deposit(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    amount: i64,
    method: PayMethod,
    order_id: Option<Uuid>,
    external_reference: Option<&str>,
    metadata: &TxMetadata,
) -> LedgerResult<Uuid> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    if let Some(reference) = external_reference {
        ensure_reference_unused(tx, reference).await?;
    }
    insert_entry(
        tx,
        user_id,
        TxType::Deposit,
        amount,
        None,
        TxStatus::Pending,
        method,
        order_id,
        external_reference,
        metadata,
    )
    .await
}

/// Fund a pending deposit: credit the wallet with the metadata's
/// `deposit_amount` and flip the entry to `completed`. The `status =
/// 'pending'` guard makes completion exactly-once.
pub async fn complete_pending_deposit(
    tx: &mut Transaction<'_, Postgres>,
    transaction_id: Uuid,
) -> LedgerResult<LedgerEntry> {
    let row = sqlx::query(
        "SELECT user_id, amount, status, metadata FROM wallet_transactions
         WHERE id = $1 FOR UPDATE",
    )
    .bind(transaction_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(LedgerError::NotPending(transaction_id))?;

    let status: TxStatus = row.get("status");
    if status != TxStatus::Pending {
        return Err(LedgerError::NotPending(transaction_id));
    }
    let user_id: Uuid = row.get("user_id");
    let metadata: TxMetadata =
        serde_json::from_value(row.get("metadata")).unwrap_or_default();
    // The wallet is credited with the net deposit, never the gross amount.
    let deposit_amount = metadata.deposit_amount.unwrap_or_else(|| row.get("amount"));

    let balance_row = sqlx::query(
        "UPDATE users SET wallet_balance = wallet_balance + $1 WHERE id = $2 RETURNING wallet_balance",
    )
    .bind(deposit_amount)
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(LedgerError::AccountNotFound(user_id))?;
    let balance_after: i64 = balance_row.get("wallet_balance");

    let updated = sqlx::query(
        "UPDATE wallet_transactions
         SET status = 'completed', balance_after = $1, updated_at = NOW()
         WHERE id = $2 AND status = 'pending'",
    )
    .bind(balance_after)
    .bind(transaction_id)
    .execute(&mut **tx)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(LedgerError::NotPending(transaction_id));
    }

    Ok(LedgerEntry {
        id: transaction_id,
        balance_after,
    })
}

/// Operator rejection of a pending deposit. Terminal, guarded, no balance
/// mutation.
pub async fn reject_pending_deposit(
    tx: &mut Transaction<'_, Postgres>,
    transaction_id: Uuid,
) -> LedgerResult<()> {
    let updated = sqlx::query(
        "UPDATE wallet_transactions SET status = 'rejected', updated_at = NOW()
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(transaction_id)
    .execute(&mut **tx)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(LedgerError::NotPending(transaction_id));
    }
    Ok(())
}

/// Recovery path: recompute the balance as the signed sum of completed
/// transactions and write it back. Returns the rebuilt balance.
pub async fn rebuild_balance(pool: &PgPool, user_id: Uuid) -> LedgerResult<i64> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query(
        "SELECT COALESCE(SUM(
            CASE WHEN type IN ('deposit', 'refund', 'manual_transfer') THEN amount
                 ELSE -amount END), 0)::BIGINT AS balance
         FROM wallet_transactions
         WHERE user_id = $1 AND status = 'completed'",
    )
    .bind(user_id)
    .fetch_one(&mut *tx)
    .await?;
    let balance: i64 = row.get("balance");

    let updated = sqlx::query("UPDATE users SET wallet_balance = $1 WHERE id = $2")
        .bind(balance)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    if updated.rows_affected() == 0 {
        return Err(LedgerError::AccountNotFound(user_id));
    }
    tx.commit().await?;
    Ok(balance)
}

async fn ensure_reference_unused(
    tx: &mut Transaction<'_, Postgres>,
    reference: &str,
) -> LedgerResult<()> {
    let existing = sqlx::query("SELECT id FROM wallet_transactions WHERE external_reference = $1")
        .bind(reference)
        .fetch_optional(&mut **tx)
        .await?;
    if existing.is_some() {
        return Err(LedgerError::DuplicateReference(reference.to_string()));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn insert_entry(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    tx_type: TxType,
    amount: i64,
    balance_after: Option<i64>,
    status: TxStatus,
    method: PayMethod,
    order_id: Option<Uuid>,
    external_reference: Option<&str>,
    metadata: &TxMetadata,
) -> LedgerResult<Uuid> {
    let metadata_json = serde_json::to_value(metadata).unwrap_or_else(|_| serde_json::json!({}));
    let row = sqlx::query(
        "INSERT INTO wallet_transactions
            (user_id, type, amount, balance_after, status, payment_method,
             external_reference, order_id, metadata)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         RETURNING id",
    )
    .bind(user_id)
    .bind(tx_type)
    .bind(amount)
    .bind(balance_after)
    .bind(status)
    .bind(method)
    .bind(external_reference)
    .bind(order_id)
    .bind(metadata_json)
    .fetch_one(&mut **tx)
    .await?;
    Ok(row.get("id"))
}
