//! Promo code validation, pricing and usage accounting.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{DiscountType, PromoStatus, PromoType};

#[derive(Debug, Error)]
pub enum PromoError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("promo code not found")]
    NotFound,
    #[error("promo code is not active")]
    Inactive,
    #[error("promo code is not valid yet")]
    NotYetValid,
    #[error("promo code has expired")]
    Expired,
    #[error("promo code usage limit reached")]
    UsageLimitReached,
    #[error("promo code already used the maximum number of times")]
    PerUserLimitReached,
    #[error("order subtotal below the minimum of {0} for this code")]
    MinOrderNotMet(i64),
    #[error("promo code does not apply to any ordered category")]
    CategoryNotApplicable,
}

pub type PromoResult<T> = Result<T, PromoError>;

#[derive(Debug, Clone)]
pub struct PromoCode {
    pub id: Uuid,
    pub code: String,
    pub promo_type: PromoType,
    pub discount: i64,
    pub discount_type: DiscountType,
    pub max_discount_amount: Option<i64>,
    pub min_order_amount: i64,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub usage_limit: Option<i32>,
    pub used_count: i32,
    pub per_user_limit: i32,
    pub status: PromoStatus,
    pub categories: Vec<String>,
}

/// Validate `code` for `caller_id` against an order. Implements the six
/// acceptance rules; every violation is its own error so the caller can
/// surface a precise reason.
pub async fn validate(
    pool: &PgPool,
    code: &str,
    caller_id: Uuid,
    subtotal: i64,
    item_categories: &[String],
) -> PromoResult<PromoCode> {
    let promo = load(pool, code).await?;

    if promo.status != PromoStatus::Active {
        return Err(PromoError::Inactive);
    }

    let now = Utc::now();
    if let Some(from) = promo.valid_from {
        if now < from {
            return Err(PromoError::NotYetValid);
        }
    }
    if let Some(until) = promo.valid_until {
        if now > until {
            return Err(PromoError::Expired);
        }
    }

    if let Some(limit) = promo.usage_limit {
        if promo.used_count >= limit {
            return Err(PromoError::UsageLimitReached);
        }
    }

    let user_count = sqlx::query(
        "SELECT count FROM promo_code_usages WHERE promo_code_id = $1 AND user_id = $2",
    )
    .bind(promo.id)
    .bind(caller_id)
    .fetch_optional(pool)
    .await?
    .map(|row| row.get::<i32, _>("count"))
    .unwrap_or(0);
    if user_count >= promo.per_user_limit {
        return Err(PromoError::PerUserLimitReached);
    }

    if subtotal < promo.min_order_amount {
        return Err(PromoError::MinOrderNotMet(promo.min_order_amount));
    }

    // Admin codes may be restricted to service categories; at least one
    // ordered item must match.
    if promo.promo_type == PromoType::Admin
        && !promo.categories.is_empty()
        && !item_categories.iter().any(|c| promo.categories.contains(c))
    {
        return Err(PromoError::CategoryNotApplicable);
    }

    Ok(promo)
}

/// Atomic usage accounting, run inside the same transaction as order
/// persistence. Both counters are "increment if below limit" updates; zero
/// affected rows means a concurrent request took the last slot.
pub async fn record_usage(
    tx: &mut Transaction<'_, Postgres>,
    promo: &PromoCode,
    caller_id: Uuid,
) -> PromoResult<()> {
    let global = sqlx::query(
        "UPDATE promo_codes SET used_count = used_count + 1
         WHERE id = $1 AND status = 'active'
           AND (usage_limit IS NULL OR used_count < usage_limit)",
    )
    .bind(promo.id)
    .execute(&mut **tx)
    .await?;
    if global.rows_affected() == 0 {
        return Err(PromoError::UsageLimitReached);
    }

    let per_user = sqlx::query(
        "INSERT INTO promo_code_usages (promo_code_id, user_id, count)
         VALUES ($1, $2, 1)
         ON CONFLICT (promo_code_id, user_id)
         DO UPDATE SET count = promo_code_usages.count + 1
         WHERE promo_code_usages.count < $3",
    )
    .bind(promo.id)
    .bind(caller_id)
    .bind(promo.per_user_limit)
    .execute(&mut **tx)
    .await?;
    if per_user.rows_affected() == 0 {
        return Err(PromoError::PerUserLimitReached);
    }

    Ok(())
}

/// Discount for `subtotal` in minor units. Percentage discounts round
/// half-up and are capped; fixed discounts never exceed the subtotal.
pub fn calculate_discount(promo: &PromoCode, subtotal: i64) -> i64 {
    match promo.discount_type {
        DiscountType::Percentage => {
            let mut discount = (subtotal * promo.discount + 50) / 100;
            if let Some(cap) = promo.max_discount_amount {
                discount = discount.min(cap);
            }
            discount.min(subtotal)
        }
        DiscountType::Fixed => promo.discount.min(subtotal),
    }
}

/// Who absorbs the discount. A `pro` code was funded by the professional,
/// so their payout shrinks; an `admin` code is platform-funded and the
/// professional is paid the full subtotal. Computed once at order creation
/// and stored immutably on the order.
pub fn professional_payout(promo_type: Option<PromoType>, subtotal: i64, discount: i64) -> i64 {
    match promo_type {
        Some(PromoType::Pro) => (subtotal - discount).max(0),
        _ => subtotal,
    }
}

async fn load(pool: &PgPool, code: &str) -> PromoResult<PromoCode> {
    let row = sqlx::query(
        "SELECT id, code, type, discount, discount_type, max_discount_amount,
                min_order_amount, valid_from, valid_until, usage_limit,
                used_count, per_user_limit, status, categories
         FROM promo_codes WHERE code = LOWER($1)",
    )
    .bind(code)
    .fetch_optional(pool)
    .await?
    .ok_or(PromoError::NotFound)?;

    Ok(PromoCode {
        id: row.get("id"),
        code: row.get("code"),
        promo_type: row.get("type"),
        discount: row.get("discount"),
        discount_type: row.get("discount_type"),
        max_discount_amount: row.get("max_discount_amount"),
        min_order_amount: row.get("min_order_amount"),
        valid_from: row.get("valid_from"),
        valid_until: row.get("valid_until"),
        usage_limit: row.get("usage_limit"),
        used_count: row.get("used_count"),
        per_user_limit: row.get("per_user_limit"),
        status: row.get("status"),
        categories: row.get("categories"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn percentage_code(discount: i64, cap: Option<i64>) -> PromoCode {
        PromoCode {
            id: Uuid::new_v4(),
            code: "save".to_string(),
            promo_type: PromoType::Admin,
            discount,
            discount_type: DiscountType::Percentage,
            max_discount_amount: cap,
            min_order_amount: 0,
            valid_from: None,
            valid_until: None,
            usage_limit: None,
            used_count: 0,
            per_user_limit: 1,
            status: PromoStatus::Active,
            categories: vec![],
        }
    }

    fn fixed_code(discount: i64) -> PromoCode {
        PromoCode {
            discount,
            discount_type: DiscountType::Fixed,
            promo_type: PromoType::Pro,
            ..percentage_code(0, None)
        }
    }

    #[test]
    fn percentage_discount_is_capped() {
        // 50% of 30.00 would be 15.00; the cap holds it at 10.00.
        let promo = percentage_code(50, Some(1000));
        assert_eq!(calculate_discount(&promo, 3000), 1000);
    }

    #[test]
    fn percentage_discount_uncapped() {
        let promo = percentage_code(50, None);
        assert_eq!(calculate_discount(&promo, 3000), 1500);
    }

    #[test]
    fn percentage_discount_rounds_to_minor_unit() {
        // 15% of 0.99 = 0.1485, rounds to 0.15.
        let promo = percentage_code(15, None);
        assert_eq!(calculate_discount(&promo, 99), 15);
    }

    #[test]
    fn percentage_discount_never_exceeds_subtotal() {
        let promo = percentage_code(150, None);
        assert_eq!(calculate_discount(&promo, 2000), 2000);
    }

    #[test]
    fn fixed_discount_clamps_to_subtotal() {
        // 20.00 fixed against a 15.00 order discounts exactly 15.00.
        let promo = fixed_code(2000);
        assert_eq!(calculate_discount(&promo, 1500), 1500);
    }

    #[test]
    fn fixed_discount_below_subtotal_applies_fully() {
        let promo = fixed_code(500);
        assert_eq!(calculate_discount(&promo, 1500), 500);
    }

    #[test]
    fn admin_code_platform_absorbs_discount() {
        assert_eq!(professional_payout(Some(PromoType::Admin), 3000, 1000), 3000);
    }

    #[test]
    fn pro_code_professional_absorbs_discount() {
        assert_eq!(professional_payout(Some(PromoType::Pro), 3000, 1000), 2000);
    }

    #[test]
    fn pro_code_payout_never_negative() {
        assert_eq!(professional_payout(Some(PromoType::Pro), 1500, 1500), 0);
    }

    #[test]
    fn no_code_pays_full_subtotal() {
        assert_eq!(professional_payout(None, 3000, 0), 3000);
    }
}
