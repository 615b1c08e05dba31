//! Uniform interface over the four settlement paths. External provider calls
//! happen before any database transaction is opened; ledger legs are applied
//! atomically afterwards, so a provider failure never half-mutates the wallet.

use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::config::Settings;
use crate::errors::ApiError;
use crate::models::{PayMethod, TxMetadata, TxStatus, TxType};
use crate::services::{ledger, providers};
use crate::state::AppState;

/// Provider fee breakdown for a funded deposit. The invariant
/// `deposit_amount + fee == gross_amount` holds for every path; the wallet
/// is only ever credited `deposit_amount` and the fee is platform revenue
/// that never enters the client's ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    pub deposit_amount: i64,
    pub fee: i64,
    pub gross_amount: i64,
}

impl FeeSplit {
    fn metadata(&self) -> TxMetadata {
        TxMetadata {
            deposit_amount: Some(self.deposit_amount),
            fee: Some(self.fee),
            gross_amount: Some(self.gross_amount),
            ..TxMetadata::default()
        }
    }
}

fn percentage_fee(amount: i64, pct: f64) -> i64 {
    ((amount as f64) * pct / 100.0).round() as i64
}

pub fn card_fees(settings: &Settings, total: i64) -> FeeSplit {
    let fee = percentage_fee(total, settings.card_fee_pct) + settings.card_fee_fixed;
    FeeSplit {
        deposit_amount: total,
        fee,
        gross_amount: total + fee,
    }
}

pub fn paypal_fees(settings: &Settings, total: i64) -> FeeSplit {
    let fee = percentage_fee(total, settings.paypal_fee_pct) + settings.paypal_fee_fixed;
    FeeSplit {
        deposit_amount: total,
        fee,
        gross_amount: total + fee,
    }
}

pub fn bank_transfer_fees(settings: &Settings, total: i64) -> FeeSplit {
    FeeSplit {
        deposit_amount: total,
        fee: settings.bank_transfer_fee,
        gross_amount: total + settings.bank_transfer_fee,
    }
}

/// Result of the provider-facing half of settlement, produced before the
/// order transaction is opened.
pub enum Prepared {
    Internal,
    CardCharged { charge_id: String, fees: FeeSplit },
    PaypalCreated {
        paypal_order_id: String,
        approve_url: String,
        fees: FeeSplit,
    },
    BankPending { fees: FeeSplit },
}

pub enum SettlementOutcome {
    Settled {
        payment_transaction_id: Uuid,
        new_balance: i64,
    },
    PendingApproval {
        approve_url: String,
        paypal_order_id: String,
        pending_transaction_id: Uuid,
    },
    PendingBankTransfer {
        pending_transaction_id: Uuid,
        transfer_amount: i64,
    },
}

/// Execute the external half of the chosen settlement path. Declines and
/// timeouts surface as `ProviderError` with zero ledger writes.
pub async fn prepare(
    state: &AppState,
    method: PayMethod,
    payment_method_id: Option<&str>,
    total: i64,
    order_number: &str,
) -> Result<Prepared, ApiError> {
    match method {
        PayMethod::InternalBalance => Ok(Prepared::Internal),
        PayMethod::Card => {
            let payment_method_id = payment_method_id.ok_or_else(|| {
                ApiError::Validation("paymentMethodId is required for card payments".to_string())
            })?;
            let fees = card_fees(&state.settings, total);
            let charge_id = providers::charge_card(
                &state.http,
                &state.settings,
                payment_method_id,
                fees.gross_amount,
            )
            .await?;
            Ok(Prepared::CardCharged { charge_id, fees })
        }
        PayMethod::Paypal => {
            let fees = paypal_fees(&state.settings, total);
            let order = providers::create_paypal_order(
                &state.http,
                &state.settings,
                fees.gross_amount,
                order_number,
            )
            .await?;
            Ok(Prepared::PaypalCreated {
                paypal_order_id: order.id,
                approve_url: order.approve_url,
                fees,
            })
        }
        PayMethod::BankTransfer => Ok(Prepared::BankPending {
            fees: bank_transfer_fees(&state.settings, total),
        }),
        PayMethod::ManualTransfer => Err(ApiError::Validation(
            "manual_transfer is not a valid order payment method".to_string(),
        )),
    }
}

/// Record a successful external card charge as a committed wallet credit,
/// keyed on the charge id. This runs in its own transaction before the order
/// is persisted: whatever happens to the order afterwards, the money the
/// client was charged exists in the ledger and can be spent or refunded.
pub async fn fund_card_charge(
    state: &AppState,
    client_id: Uuid,
    charge_id: &str,
    fees: FeeSplit,
) -> Result<(), ApiError> {
    let mut tx = state.pool.begin().await?;
    ledger::credit(
        &mut tx,
        client_id,
        fees.deposit_amount,
        TxType::Deposit,
        PayMethod::Card,
        None,
        Some(charge_id),
        &fees.metadata(),
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Apply the ledger half inside the caller's transaction, alongside order
/// persistence and promo usage accounting.
pub async fn apply(
    tx: &mut Transaction<'_, Postgres>,
    prepared: Prepared,
    client_id: Uuid,
    order_id: Uuid,
    total: i64,
) -> Result<SettlementOutcome, ApiError> {
    match prepared {
        Prepared::Internal => {
            let entry = ledger::debit(
                tx,
                client_id,
                total,
                TxType::Payment,
                PayMethod::InternalBalance,
                Some(order_id),
                &TxMetadata::default(),
            )
            .await?;
            Ok(SettlementOutcome::Settled {
                payment_transaction_id: entry.id,
                new_balance: entry.balance_after,
            })
        }
        Prepared::CardCharged { .. } => {
            // The fund leg was committed by `fund_card_charge` before this
            // transaction opened; only the spend leg runs here, so a rollback
            // of the order can never erase the record of the external charge.
            let entry = ledger::debit(
                tx,
                client_id,
                total,
                TxType::Payment,
                PayMethod::Card,
                Some(order_id),
                &TxMetadata::default(),
            )
            .await?;
            Ok(SettlementOutcome::Settled {
                payment_transaction_id: entry.id,
                new_balance: entry.balance_after,
            })
        }
        Prepared::PaypalCreated {
            paypal_order_id,
            approve_url,
            fees,
        } => {
            let pending_transaction_id = ledger::create_pending_deposit(
                tx,
                client_id,
                fees.deposit_amount,
                PayMethod::Paypal,
                Some(order_id),
                Some(&paypal_order_id),
                &fees.metadata(),
            )
            .await?;
            Ok(SettlementOutcome::PendingApproval {
                approve_url,
                paypal_order_id,
                pending_transaction_id,
            })
        }
        Prepared::BankPending { fees } => {
            let mut metadata = fees.metadata();
            metadata.transfer_amount = Some(fees.gross_amount);
            let pending_transaction_id = ledger::create_pending_deposit(
                tx,
                client_id,
                fees.deposit_amount,
                PayMethod::BankTransfer,
                Some(order_id),
                None,
                &metadata,
            )
            .await?;
            Ok(SettlementOutcome::PendingBankTransfer {
                pending_transaction_id,
                transfer_amount: fees.gross_amount,
            })
        }
    }
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResult {
    pub order_id: Uuid,
    pub order_number: String,
    pub new_balance: i64,
}

/// Finalize the fund+spend legs of a previously created PayPal order.
/// Idempotent: a deposit that is already completed returns success without
/// re-crediting.
pub async fn capture_paypal(
    state: &AppState,
    caller_id: Uuid,
    paypal_order_id: &str,
    order_number: &str,
) -> Result<CaptureResult, ApiError> {
    let row = sqlx::query(
        "SELECT t.id AS tx_id, t.status, t.user_id, o.id AS order_id, o.total
         FROM wallet_transactions t
         JOIN orders o ON o.id = t.order_id
         WHERE t.external_reference = $1 AND o.order_number = $2",
    )
    .bind(paypal_order_id)
    .bind(order_number)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::NotFound("no pending payment for that order".to_string()))?;

    let tx_id: Uuid = row.get("tx_id");
    let status: TxStatus = row.get("status");
    let client_id: Uuid = row.get("user_id");
    let order_id: Uuid = row.get("order_id");
    let total: i64 = row.get("total");

    // Only the client who opened the order may finalize its payment.
    if client_id != caller_id {
        return Err(ApiError::Forbidden);
    }

    if status == TxStatus::Completed {
        return Ok(CaptureResult {
            order_id,
            order_number: order_number.to_string(),
            new_balance: current_balance(state, client_id).await?,
        });
    }
    if status != TxStatus::Pending {
        return Err(ApiError::Conflict(
            "payment is no longer capturable".to_string(),
        ));
    }

    // Provider round trip first; the ledger legs only run on a COMPLETED
    // capture, so a timeout here leaves the order pending for retry.
    providers::capture_paypal_order(&state.http, &state.settings, paypal_order_id).await?;

    let mut tx = state.pool.begin().await?;
    match ledger::complete_pending_deposit(&mut tx, tx_id).await {
        Ok(_) => {}
        // Lost the race to a concurrent capture of the same order; the
        // money already moved exactly once.
        Err(ledger::LedgerError::NotPending(_)) => {
            tx.rollback().await.ok();
            return Ok(CaptureResult {
                order_id,
                order_number: order_number.to_string(),
                new_balance: current_balance(state, client_id).await?,
            });
        }
        Err(e) => return Err(e.into()),
    }
    let payment = ledger::debit(
        &mut tx,
        client_id,
        total,
        TxType::Payment,
        PayMethod::Paypal,
        Some(order_id),
        &TxMetadata::default(),
    )
    .await?;
    sqlx::query("UPDATE orders SET payment_transaction_id = $1, updated_at = NOW() WHERE id = $2")
        .bind(payment.id)
        .bind(order_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(CaptureResult {
        order_id,
        order_number: order_number.to_string(),
        new_balance: payment.balance_after,
    })
}

/// Operator approval of a pending bank-transfer deposit: credit the wallet
/// with the recorded `deposit_amount`, then apply the matching payment
/// debit for the linked order.
pub async fn approve_manual_transfer(
    state: &AppState,
    transaction_id: Uuid,
) -> Result<i64, ApiError> {
    let mut tx = state.pool.begin().await?;

    let row = sqlx::query(
        "SELECT user_id, order_id, payment_method, type, status
         FROM wallet_transactions WHERE id = $1 FOR UPDATE",
    )
    .bind(transaction_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("transaction {transaction_id} not found")))?;

    let method: PayMethod = row.get("payment_method");
    let tx_type: TxType = row.get("type");
    let status: TxStatus = row.get("status");
    if method != PayMethod::BankTransfer || tx_type != TxType::Deposit {
        return Err(ApiError::Conflict(
            "transaction is not a bank transfer deposit".to_string(),
        ));
    }
    if status != TxStatus::Pending {
        return Err(ApiError::Conflict("transaction is not pending".to_string()));
    }
    let client_id: Uuid = row.get("user_id");
    let order_id: Option<Uuid> = row.get("order_id");

    let funded = ledger::complete_pending_deposit(&mut tx, transaction_id).await?;
    let mut new_balance = funded.balance_after;

    // The deposit was sized to the order total, so this debit cannot fail
    // for lack of the freshly credited funds alone.
    if let Some(order_id) = order_id {
        let order = sqlx::query("SELECT total FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_one(&mut *tx)
            .await?;
        let total: i64 = order.get("total");
        let payment = ledger::debit(
            &mut tx,
            client_id,
            total,
            TxType::Payment,
            PayMethod::BankTransfer,
            Some(order_id),
            &TxMetadata::default(),
        )
        .await?;
        sqlx::query(
            "UPDATE orders SET payment_transaction_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(payment.id)
        .bind(order_id)
        .execute(&mut *tx)
        .await?;
        new_balance = payment.balance_after;
    }

    tx.commit().await?;
    Ok(new_balance)
}

/// Operator rejection: terminal `rejected` status, no wallet mutation, and
/// the order stays pending for the client to retry with another method.
pub async fn reject_manual_transfer(state: &AppState, transaction_id: Uuid) -> Result<(), ApiError> {
    let mut tx = state.pool.begin().await?;

    let row = sqlx::query(
        "SELECT payment_method, type FROM wallet_transactions WHERE id = $1 FOR UPDATE",
    )
    .bind(transaction_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("transaction {transaction_id} not found")))?;
    let method: PayMethod = row.get("payment_method");
    let tx_type: TxType = row.get("type");
    if method != PayMethod::BankTransfer || tx_type != TxType::Deposit {
        return Err(ApiError::Conflict(
            "transaction is not a bank transfer deposit".to_string(),
        ));
    }

    ledger::reject_pending_deposit(&mut tx, transaction_id).await?;
    tx.commit().await?;
    Ok(())
}

/// A wallet top-up arriving via webhook with no prior pending transaction.
#[derive(Debug, Clone, Copy)]
pub struct CardTopup {
    pub user_id: Uuid,
    pub gross_amount: i64,
    pub fee: i64,
}

pub enum WebhookOutcome {
    AlreadyProcessed,
    Funded {
        transaction_id: Uuid,
        new_balance: i64,
    },
}

/// Apply a confirmed card payment delivered via webhook. Idempotent keyed on
/// the provider's payment intent id: a transaction already completed under
/// that reference makes redelivery a no-op.
pub async fn confirm_card_deposit(
    state: &AppState,
    intent_id: &str,
    topup: Option<CardTopup>,
) -> Result<WebhookOutcome, ApiError> {
    let mut tx = state.pool.begin().await?;

    let existing = sqlx::query(
        "SELECT id, status FROM wallet_transactions WHERE external_reference = $1 FOR UPDATE",
    )
    .bind(intent_id)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(row) = existing {
        let status: TxStatus = row.get("status");
        let tx_id: Uuid = row.get("id");
        return match status {
            TxStatus::Completed => Ok(WebhookOutcome::AlreadyProcessed),
            TxStatus::Pending => {
                let funded = ledger::complete_pending_deposit(&mut tx, tx_id).await?;
                tx.commit().await?;
                Ok(WebhookOutcome::Funded {
                    transaction_id: tx_id,
                    new_balance: funded.balance_after,
                })
            }
            _ => Err(ApiError::Conflict(
                "payment reference is already terminal".to_string(),
            )),
        };
    }

    let Some(topup) = topup else {
        return Err(ApiError::Validation(
            "unknown payment intent and no account metadata".to_string(),
        ));
    };
    let deposit_amount = topup.gross_amount - topup.fee;
    if deposit_amount <= 0 {
        return Err(ApiError::Validation(
            "fee exceeds the charged amount".to_string(),
        ));
    }
    let entry = ledger::credit(
        &mut tx,
        topup.user_id,
        deposit_amount,
        TxType::Deposit,
        PayMethod::Card,
        None,
        Some(intent_id),
        &TxMetadata {
            deposit_amount: Some(deposit_amount),
            fee: Some(topup.fee),
            gross_amount: Some(topup.gross_amount),
            ..TxMetadata::default()
        },
    )
    .await?;
    tx.commit().await?;

    Ok(WebhookOutcome::Funded {
        transaction_id: entry.id,
        new_balance: entry.balance_after,
    })
}

async fn current_balance(state: &AppState, user_id: Uuid) -> Result<i64, ApiError> {
    let row = sqlx::query("SELECT wallet_balance FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("account {user_id} not found")))?;
    Ok(row.get("wallet_balance"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        let mut s = Settings::from_env();
        s.card_fee_pct = 2.9;
        s.card_fee_fixed = 30;
        s.paypal_fee_pct = 3.5;
        s.paypal_fee_fixed = 35;
        s.bank_transfer_fee = 150;
        s
    }

    #[test]
    fn card_fee_split_invariant() {
        let s = settings();
        for total in [1, 99, 100, 2500, 10000, 999999] {
            let split = card_fees(&s, total);
            assert_eq!(split.deposit_amount + split.fee, split.gross_amount);
            assert_eq!(split.deposit_amount, total);
        }
    }

    #[test]
    fn card_fee_schedule() {
        // 2.9% of 100.00 = 2.90, plus 0.30 fixed.
        let split = card_fees(&settings(), 10000);
        assert_eq!(split.fee, 320);
        assert_eq!(split.gross_amount, 10320);
    }

    #[test]
    fn paypal_fee_split_invariant() {
        let s = settings();
        for total in [1, 2500, 10000] {
            let split = paypal_fees(&s, total);
            assert_eq!(split.deposit_amount + split.fee, split.gross_amount);
        }
    }

    #[test]
    fn bank_transfer_records_wire_amount_separately() {
        let split = bank_transfer_fees(&settings(), 5000);
        assert_eq!(split.deposit_amount, 5000);
        assert_eq!(split.gross_amount, 5150);
        let metadata = split.metadata();
        assert_eq!(metadata.deposit_amount, Some(5000));
        assert_eq!(metadata.fee, Some(150));
    }

    #[test]
    fn percentage_fee_rounds_to_nearest_minor_unit() {
        // 2.9% of 0.99 = 0.0287 -> 0.03
        assert_eq!(percentage_fee(99, 2.9), 3);
        // 2.9% of 0.17 = 0.0049 -> 0.00
        assert_eq!(percentage_fee(17, 2.9), 0);
    }
}
