//! Order assembly and lifecycle: validation, pricing, settlement
//! orchestration, delivery/completion, dispute filing.

use chrono::{Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::errors::ApiError;
use crate::models::{
    CreateOrderRequest, DeliveryStatus, OrderItem, OrderStatus, OrderSummary, PayMethod,
    TxMetadata, TxType, UserRole,
};
use crate::services::gateway::{self, SettlementOutcome};
use crate::services::promo::{self, PromoCode};
use crate::services::{catalog, ledger, notify};
use crate::state::AppState;

pub struct PricedOrder {
    pub professional_id: Uuid,
    pub items: Vec<OrderItem>,
    pub subtotal: i64,
    pub discount: i64,
    pub service_fee: i64,
    pub total: i64,
    pub payout: i64,
    pub promo: Option<PromoCode>,
}

pub struct CreatedOrder {
    pub order_id: Uuid,
    pub order_number: String,
    pub order: OrderSummary,
    pub outcome: SettlementOutcome,
}

/// Validate and price the request against the catalog, promo engine and fee
/// schedule. Rejects before any side effect; a totals mismatch beyond one
/// minor unit is a hard error, never silently corrected.
pub async fn price_and_validate(
    state: &AppState,
    client_id: Uuid,
    req: &CreateOrderRequest,
) -> Result<PricedOrder, ApiError> {
    let (professional_id, items) = catalog::resolve_items(&state.pool, &req.items).await?;
    if professional_id == client_id {
        return Err(ApiError::Validation(
            "cannot order your own services".to_string(),
        ));
    }

    let subtotal: i64 = items.iter().map(|i| i.price * i.quantity).sum();
    let categories: Vec<String> = items.iter().map(|i| i.category.clone()).collect();

    let promo = match &req.promo_code {
        Some(code) => {
            Some(promo::validate(&state.pool, code, client_id, subtotal, &categories).await?)
        }
        None => None,
    };
    let discount = promo
        .as_ref()
        .map(|p| promo::calculate_discount(p, subtotal))
        .unwrap_or(0);
    let service_fee = service_fee_for(state.settings.service_fee_pct, subtotal);

    let total = check_totals(subtotal, discount, service_fee, req)?;
    let payout = promo::professional_payout(promo.as_ref().map(|p| p.promo_type), subtotal, discount);

    Ok(PricedOrder {
        professional_id,
        items,
        subtotal,
        discount,
        service_fee,
        total,
        payout,
        promo,
    })
}

pub fn service_fee_for(pct: f64, subtotal: i64) -> i64 {
    ((subtotal as f64) * pct / 100.0).round() as i64
}

/// Server-side totals are authoritative; the client's figures must agree.
/// Subtotal and discount must match exactly, the derived total within the
/// 1-minor-unit rounding tolerance.
// Upper bound on any client-supplied amount, well below i64 range so the
// difference checks below cannot overflow.
const MAX_AMOUNT: i64 = 1_000_000_000_000;

fn check_totals(
    subtotal: i64,
    discount: i64,
    service_fee: i64,
    req: &CreateOrderRequest,
) -> Result<i64, ApiError> {
    for (name, value) in [
        ("subtotal", req.subtotal),
        ("discount", req.discount),
        ("serviceFee", req.service_fee),
        ("total", req.total),
    ] {
        if !(0..=MAX_AMOUNT).contains(&value) {
            return Err(ApiError::Validation(format!("{name} is out of range")));
        }
    }
    if req.subtotal != subtotal {
        return Err(ApiError::Validation(format!(
            "subtotal mismatch: expected {subtotal}, got {}",
            req.subtotal
        )));
    }
    if req.discount != discount {
        return Err(ApiError::Validation(format!(
            "discount mismatch: expected {discount}, got {}",
            req.discount
        )));
    }
    if (req.service_fee - service_fee).abs() > 1 {
        return Err(ApiError::Validation(format!(
            "service fee mismatch: expected {service_fee}, got {}",
            req.service_fee
        )));
    }
    let total = subtotal - discount + service_fee;
    if (req.total - total).abs() > 1 {
        return Err(ApiError::Validation(format!(
            "total mismatch: expected {total}, got {}",
            req.total
        )));
    }
    Ok(total)
}

pub fn generate_order_number() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| (c as char).to_ascii_uppercase())
        .collect();
    format!("ORD-{}-{}", Utc::now().format("%Y%m%d"), suffix)
}

/// Create and settle an order. Provider round trips happen before the
/// database transaction; the order row, ledger legs and promo usage commit
/// atomically, so a promo slot cannot be consumed past its limit by
/// concurrent requests.
pub async fn create_order(
    state: &AppState,
    client_id: Uuid,
    req: CreateOrderRequest,
) -> Result<CreatedOrder, ApiError> {
    let priced = price_and_validate(state, client_id, &req).await?;
    let order_number = generate_order_number();

    let prepared = gateway::prepare(
        state,
        req.payment_method,
        req.payment_method_id.as_deref(),
        priced.total,
        &order_number,
    )
    .await?;

    // A charged card must leave a committed ledger record no matter what
    // happens to the order below.
    if let gateway::Prepared::CardCharged { charge_id, fees } = &prepared {
        gateway::fund_card_charge(state, client_id, charge_id, *fees).await?;
    }

    let mut tx = state.pool.begin().await?;

    let (order_id, created_at) = insert_order(&mut tx, client_id, &order_number, &priced, &req).await?;
    let outcome = gateway::apply(&mut tx, prepared, client_id, order_id, priced.total).await?;
    if let SettlementOutcome::Settled {
        payment_transaction_id,
        ..
    } = &outcome
    {
        sqlx::query(
            "UPDATE orders SET payment_transaction_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(payment_transaction_id)
        .bind(order_id)
        .execute(&mut *tx)
        .await?;
    }
    if let Some(promo) = &priced.promo {
        promo::record_usage(&mut tx, promo, client_id).await?;
    }
    tx.commit().await?;

    notify::notify(
        state,
        priced.professional_id,
        "order_created",
        json!({ "orderNumber": order_number }),
    );

    let order = OrderSummary {
        order_id,
        order_number: order_number.clone(),
        status: OrderStatus::Pending,
        delivery_status: DeliveryStatus::Pending,
        amount: priced.total,
        payment_method: req.payment_method,
        client_id,
        professional_id: priced.professional_id,
        created_at,
    };
    Ok(CreatedOrder {
        order_id,
        order_number,
        order,
        outcome,
    })
}

async fn insert_order(
    tx: &mut Transaction<'_, Postgres>,
    client_id: Uuid,
    order_number: &str,
    priced: &PricedOrder,
    req: &CreateOrderRequest,
) -> Result<(Uuid, chrono::DateTime<Utc>), ApiError> {
    let items_json = serde_json::to_value(&priced.items)
        .map_err(|_| ApiError::Validation("unserializable items".to_string()))?;
    let row = sqlx::query(
        "INSERT INTO orders
            (order_number, client_id, professional_id, items, subtotal, discount,
             service_fee, total, address, payment_method,
             professional_payout_amount, promo_code)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
         RETURNING id, created_at",
    )
    .bind(order_number)
    .bind(client_id)
    .bind(priced.professional_id)
    .bind(items_json)
    .bind(priced.subtotal)
    .bind(priced.discount)
    .bind(priced.service_fee)
    .bind(priced.total)
    .bind(req.address.clone())
    .bind(req.payment_method)
    .bind(priced.payout)
    .bind(priced.promo.as_ref().map(|p| p.code.clone()))
    .fetch_one(&mut **tx)
    .await?;
    Ok((row.get("id"), row.get("created_at")))
}

pub async fn list_orders(
    state: &AppState,
    caller_id: Uuid,
    role: UserRole,
) -> Result<Vec<OrderSummary>, ApiError> {
    let base = "SELECT id, order_number, status, delivery_status, total, payment_method,
                       client_id, professional_id, created_at
                FROM orders";
    let rows = match role {
        UserRole::Client => {
            sqlx::query(&format!("{base} WHERE client_id = $1 ORDER BY created_at DESC"))
                .bind(caller_id)
                .fetch_all(&state.pool)
                .await?
        }
        UserRole::Professional => {
            sqlx::query(&format!(
                "{base} WHERE professional_id = $1 ORDER BY created_at DESC"
            ))
            .bind(caller_id)
            .fetch_all(&state.pool)
            .await?
        }
        UserRole::Admin => {
            sqlx::query(&format!("{base} ORDER BY created_at DESC"))
                .fetch_all(&state.pool)
                .await?
        }
    };

    Ok(rows
        .into_iter()
        .map(|row| OrderSummary {
            order_id: row.get("id"),
            order_number: row.get("order_number"),
            status: row.get("status"),
            delivery_status: row.get("delivery_status"),
            amount: row.get("total"),
            payment_method: row.get("payment_method"),
            client_id: row.get("client_id"),
            professional_id: row.get("professional_id"),
            created_at: row.get("created_at"),
        })
        .collect())
}

/// Professional marks the work delivered.
pub async fn mark_delivered(
    state: &AppState,
    order_id: Uuid,
    caller_id: Uuid,
) -> Result<(), ApiError> {
    let updated = sqlx::query(
        "UPDATE orders SET status = 'delivered', delivery_status = 'delivered', updated_at = NOW()
         WHERE id = $1 AND professional_id = $2 AND status = 'pending'",
    )
    .bind(order_id)
    .bind(caller_id)
    .execute(&state.pool)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(order_transition_error(state, order_id, caller_id).await?);
    }
    Ok(())
}

/// Client confirms completion: releases the professional payout (a plain
/// ledger credit) and stamps `payout_released_at`.
pub async fn complete_order(
    state: &AppState,
    order_id: Uuid,
    caller_id: Uuid,
) -> Result<(), ApiError> {
    let mut tx = state.pool.begin().await?;

    let row = sqlx::query(
        "SELECT client_id, professional_id, status, payment_transaction_id,
                professional_payout_amount, order_number
         FROM orders WHERE id = $1 FOR UPDATE",
    )
    .bind(order_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("order {order_id} not found")))?;

    let client_id: Uuid = row.get("client_id");
    if client_id != caller_id {
        return Err(ApiError::Forbidden);
    }
    let status: OrderStatus = row.get("status");
    if !matches!(status, OrderStatus::Pending | OrderStatus::Delivered) {
        return Err(ApiError::Conflict("order cannot be completed".to_string()));
    }
    let funded: Option<Uuid> = row.get("payment_transaction_id");
    if funded.is_none() {
        return Err(ApiError::Conflict("order is not funded yet".to_string()));
    }

    let professional_id: Uuid = row.get("professional_id");
    let payout: i64 = row.get("professional_payout_amount");
    let order_number: String = row.get("order_number");
    if payout > 0 {
        ledger::credit(
            &mut tx,
            professional_id,
            payout,
            TxType::Deposit,
            PayMethod::InternalBalance,
            Some(order_id),
            None,
            &TxMetadata {
                note: Some("professional payout".to_string()),
                ..TxMetadata::default()
            },
        )
        .await?;
    }

    sqlx::query(
        "UPDATE orders SET status = 'completed', payout_released_at = NOW(), updated_at = NOW()
         WHERE id = $1",
    )
    .bind(order_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    notify::notify(
        state,
        professional_id,
        "order_completed",
        json!({ "orderNumber": order_number, "payout": payout }),
    );
    Ok(())
}

/// Either party files a dispute; the other party becomes the respondent and
/// the response clock starts.
pub async fn open_dispute(
    state: &AppState,
    order_id: Uuid,
    caller_id: Uuid,
    reason: &str,
) -> Result<(), ApiError> {
    let mut tx = state.pool.begin().await?;

    let row = sqlx::query(
        "SELECT client_id, professional_id, status, payment_transaction_id, order_number
         FROM orders WHERE id = $1 FOR UPDATE",
    )
    .bind(order_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("order {order_id} not found")))?;

    let client_id: Uuid = row.get("client_id");
    let professional_id: Uuid = row.get("professional_id");
    if caller_id != client_id && caller_id != professional_id {
        return Err(ApiError::Forbidden);
    }
    let status: OrderStatus = row.get("status");
    if !matches!(
        status,
        OrderStatus::Pending | OrderStatus::Delivered | OrderStatus::Completed
    ) {
        return Err(ApiError::Conflict("order cannot be disputed".to_string()));
    }
    // An unfunded order has no money to fight over; a refund against it
    // would mint funds out of nothing.
    let funded: Option<Uuid> = row.get("payment_transaction_id");
    if funded.is_none() {
        return Err(ApiError::Conflict("order is not funded yet".to_string()));
    }

    let respondent_id = if caller_id == client_id {
        professional_id
    } else {
        client_id
    };
    let deadline = Utc::now() + Duration::hours(state.settings.dispute_response_hours);

    sqlx::query(
        "UPDATE orders SET status = 'disputed', dispute_status = 'open',
                dispute_claimant_id = $1, dispute_respondent_id = $2,
                dispute_reason = $3, dispute_response_deadline = $4,
                updated_at = NOW()
         WHERE id = $5",
    )
    .bind(caller_id)
    .bind(respondent_id)
    .bind(reason)
    .bind(deadline)
    .bind(order_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    let order_number: String = row.get("order_number");
    notify::notify(
        state,
        respondent_id,
        "dispute_opened",
        json!({ "orderNumber": order_number, "respondBy": deadline }),
    );
    Ok(())
}

/// Respondent answers in time; the dispute leaves the scheduler's reach and
/// waits for human resolution.
pub async fn respond_dispute(
    state: &AppState,
    order_id: Uuid,
    caller_id: Uuid,
) -> Result<(), ApiError> {
    let updated = sqlx::query(
        "UPDATE orders SET dispute_status = 'responded', dispute_responded_at = NOW(),
                updated_at = NOW()
         WHERE id = $1 AND dispute_respondent_id = $2 AND dispute_status = 'open'",
    )
    .bind(order_id)
    .bind(caller_id)
    .execute(&state.pool)
    .await?;
    if updated.rows_affected() == 0 {
        let row = sqlx::query(
            "SELECT dispute_respondent_id, dispute_status FROM orders WHERE id = $1",
        )
        .bind(order_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("order {order_id} not found")))?;
        let respondent: Option<Uuid> = row.get("dispute_respondent_id");
        if respondent != Some(caller_id) {
            return Err(ApiError::Forbidden);
        }
        return Err(ApiError::Conflict("dispute is not open".to_string()));
    }
    Ok(())
}

async fn order_transition_error(
    state: &AppState,
    order_id: Uuid,
    caller_id: Uuid,
) -> Result<ApiError, ApiError> {
    let row = sqlx::query("SELECT professional_id, client_id FROM orders WHERE id = $1")
        .bind(order_id)
        .fetch_optional(&state.pool)
        .await?;
    Ok(match row {
        None => ApiError::NotFound(format!("order {order_id} not found")),
        Some(row) => {
            let professional_id: Uuid = row.get("professional_id");
            let client_id: Uuid = row.get("client_id");
            if caller_id != professional_id && caller_id != client_id {
                ApiError::Forbidden
            } else {
                ApiError::Conflict("order is not in a valid state for this action".to_string())
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(subtotal: i64, discount: i64, service_fee: i64, total: i64) -> CreateOrderRequest {
        CreateOrderRequest {
            items: vec![],
            address: None,
            skip_address: true,
            payment_method: PayMethod::InternalBalance,
            payment_method_id: None,
            subtotal,
            discount,
            service_fee,
            total,
            promo_code: None,
        }
    }

    #[test]
    fn totals_accept_exact_figures() {
        let req = request(3000, 1000, 150, 2150);
        assert_eq!(check_totals(3000, 1000, 150, &req).unwrap(), 2150);
    }

    #[test]
    fn totals_accept_one_minor_unit_drift() {
        let req = request(3000, 1000, 150, 2151);
        assert_eq!(check_totals(3000, 1000, 150, &req).unwrap(), 2150);
    }

    #[test]
    fn totals_reject_subtotal_mismatch() {
        let req = request(2999, 0, 150, 3149);
        assert!(check_totals(3000, 0, 150, &req).is_err());
    }

    #[test]
    fn totals_reject_unearned_discount() {
        let req = request(3000, 500, 150, 2650);
        assert!(check_totals(3000, 0, 150, &req).is_err());
    }

    #[test]
    fn totals_reject_out_of_range_amounts() {
        // Extreme values must be refused outright, not differenced.
        let req = request(3000, 0, 150, i64::MIN);
        assert!(check_totals(3000, 0, 150, &req).is_err());
        let req = request(3000, 0, i64::MAX, 3150);
        assert!(check_totals(3000, 0, 150, &req).is_err());
        let req = request(3000, -1, 150, 3149);
        assert!(check_totals(3000, 0, 150, &req).is_err());
    }

    #[test]
    fn totals_reject_drift_beyond_tolerance() {
        let req = request(3000, 0, 150, 3100);
        assert!(check_totals(3000, 0, 150, &req).is_err());
    }

    #[test]
    fn service_fee_schedule_rounds() {
        assert_eq!(service_fee_for(5.0, 3000), 150);
        // 5% of 0.99 = 0.0495 -> 0.05
        assert_eq!(service_fee_for(5.0, 99), 5);
        assert_eq!(service_fee_for(0.0, 3000), 0);
    }

    #[test]
    fn order_numbers_are_well_formed() {
        let n = generate_order_number();
        assert!(n.starts_with("ORD-"));
        let parts: Vec<&str> = n.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn order_numbers_do_not_repeat_trivially() {
        let a = generate_order_number();
        let b = generate_order_number();
        assert_ne!(a, b);
    }
}
