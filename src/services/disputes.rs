//! Time-driven dispute resolution. A fixed-interval task finds disputes
//! whose response deadline has passed without an answer and resolves them
//! in favor of the claimant, exactly once.

use std::time::Duration;

use serde_json::json;
use sqlx::Row;
use uuid::Uuid;

use crate::errors::ApiError;
use crate::models::{PayMethod, TxMetadata, TxType};
use crate::services::{ledger, notify};
use crate::state::AppState;

const BATCH_SIZE: i64 = 20;

pub async fn run(state: AppState) {
    let interval = Duration::from_secs(state.settings.dispute_poll_secs);
    tracing::info!(poll_secs = state.settings.dispute_poll_secs, "dispute scheduler started");
    loop {
        match resolve_expired(&state).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(resolved = n, "auto-closed expired disputes"),
            Err(e) => tracing::error!("dispute sweep failed: {e}"),
        }
        tokio::time::sleep(interval).await;
    }
}

/// One tick: resolve every dispute past its deadline. Each order is handled
/// in its own transaction; one failure is logged and the batch continues.
pub async fn resolve_expired(state: &AppState) -> Result<u32, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id FROM orders
         WHERE status = 'disputed' AND dispute_status = 'open'
           AND dispute_responded_at IS NULL
           AND dispute_response_deadline <= NOW()
         ORDER BY dispute_response_deadline
         LIMIT $1",
    )
    .bind(BATCH_SIZE)
    .fetch_all(&state.pool)
    .await?;

    let mut resolved = 0;
    for row in rows {
        let order_id: Uuid = row.get("id");
        match resolve_one(state, order_id).await {
            Ok(true) => resolved += 1,
            Ok(false) => {} // already handled by a concurrent tick
            Err(e) => tracing::error!(%order_id, "failed to auto-close dispute: {e}"),
        }
    }
    Ok(resolved)
}

/// Non-responding party loses: award per the claimant's side, then close the
/// dispute and cancel the order. The `dispute_status = 'open'` re-check under
/// row lock makes resolution exactly-once even across scheduler instances.
async fn resolve_one(state: &AppState, order_id: Uuid) -> Result<bool, ApiError> {
    let mut tx = state.pool.begin().await?;

    let row = sqlx::query(
        "SELECT client_id, professional_id, total, professional_payout_amount,
                payout_released_at, dispute_claimant_id, dispute_respondent_id,
                order_number
         FROM orders
         WHERE id = $1 AND status = 'disputed' AND dispute_status = 'open'
           AND dispute_responded_at IS NULL
           AND dispute_response_deadline <= NOW()
         FOR UPDATE SKIP LOCKED",
    )
    .bind(order_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(row) = row else {
        return Ok(false);
    };

    let client_id: Uuid = row.get("client_id");
    let professional_id: Uuid = row.get("professional_id");
    let total: i64 = row.get("total");
    let payout: i64 = row.get("professional_payout_amount");
    let payout_released: bool = row.get::<Option<chrono::DateTime<chrono::Utc>>, _>("payout_released_at").is_some();
    let claimant_id: Uuid = row.get("dispute_claimant_id");
    let respondent_id: Uuid = row.get("dispute_respondent_id");
    let order_number: String = row.get("order_number");

    let claimant = if claimant_id == client_id {
        Party::Client
    } else {
        Party::Professional
    };
    if let Some((winner, amount)) = award(claimant, total, payout, payout_released) {
        let recipient = match winner {
            Party::Client => client_id,
            Party::Professional => professional_id,
        };
        ledger::credit(
            &mut tx,
            recipient,
            amount,
            TxType::Deposit,
            PayMethod::InternalBalance,
            Some(order_id),
            None,
            &TxMetadata {
                dispute_order_id: Some(order_id),
                note: Some("dispute auto-closure award".to_string()),
                ..TxMetadata::default()
            },
        )
        .await?;
    }

    let closed = sqlx::query(
        "UPDATE orders
         SET dispute_status = 'closed', dispute_closed_at = NOW(),
             dispute_auto_closed = TRUE, dispute_winner_id = $1,
             status = 'cancelled', delivery_status = 'cancelled',
             updated_at = NOW()
         WHERE id = $2 AND dispute_status = 'open'",
    )
    .bind(claimant_id)
    .bind(order_id)
    .execute(&mut *tx)
    .await?;
    if closed.rows_affected() == 0 {
        tx.rollback().await.ok();
        return Ok(false);
    }
    tx.commit().await?;

    for recipient in [claimant_id, respondent_id] {
        notify::notify(
            state,
            recipient,
            "dispute_auto_closed",
            json!({ "orderNumber": order_number, "winnerId": claimant_id }),
        );
    }
    Ok(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Client,
    Professional,
}

/// Who gets credited what when a dispute expires unanswered. The claimant
/// always wins; money moves only where it has somewhere to come back from:
/// a client refund is the order total, a professional award is the payout
/// and only if it was never released. Released funds are not clawed back.
pub fn award(
    claimant: Party,
    total: i64,
    payout: i64,
    payout_released: bool,
) -> Option<(Party, i64)> {
    match claimant {
        Party::Client if total > 0 => Some((Party::Client, total)),
        Party::Client => None,
        Party::Professional if !payout_released && payout > 0 => {
            Some((Party::Professional, payout))
        }
        Party::Professional => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_claimant_is_refunded_the_total() {
        assert_eq!(
            award(Party::Client, 10000, 9000, false),
            Some((Party::Client, 10000))
        );
    }

    #[test]
    fn client_refund_unaffected_by_released_payout() {
        // No clawback: the client is still made whole from platform funds.
        assert_eq!(
            award(Party::Client, 10000, 9000, true),
            Some((Party::Client, 10000))
        );
    }

    #[test]
    fn professional_claimant_gets_unreleased_payout() {
        assert_eq!(
            award(Party::Professional, 10000, 9000, false),
            Some((Party::Professional, 9000))
        );
    }

    #[test]
    fn professional_claimant_not_paid_twice() {
        assert_eq!(award(Party::Professional, 10000, 9000, true), None);
    }

    #[test]
    fn zero_payout_moves_nothing() {
        // A pro promo can reduce the payout to zero.
        assert_eq!(award(Party::Professional, 1500, 0, false), None);
    }
}
