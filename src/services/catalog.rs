//! Catalog lookups: resolve service references to their owning professional
//! and denormalize the line items stored on the order.

use std::collections::HashMap;

use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::errors::ApiError;
use crate::models::{OrderItem, OrderItemInput};

/// Resolve the requested items. All items must belong to exactly one
/// professional; unknown service ids are rejected before any side effect.
pub async fn resolve_items(
    pool: &PgPool,
    inputs: &[OrderItemInput],
) -> Result<(Uuid, Vec<OrderItem>), ApiError> {
    if inputs.is_empty() {
        return Err(ApiError::Validation("order has no items".to_string()));
    }
    if inputs.iter().any(|i| i.quantity < 1) {
        return Err(ApiError::Validation(
            "item quantity must be at least 1".to_string(),
        ));
    }

    let ids: Vec<Uuid> = inputs.iter().map(|i| i.service_id).collect();
    let rows = sqlx::query(
        "SELECT id, professional_id, title, category, price FROM services WHERE id = ANY($1)",
    )
    .bind(&ids)
    .fetch_all(pool)
    .await?;

    let mut by_id = HashMap::new();
    for row in rows {
        let id: Uuid = row.get("id");
        by_id.insert(id, row);
    }

    let mut professional_id: Option<Uuid> = None;
    let mut items = Vec::with_capacity(inputs.len());
    for input in inputs {
        let row = by_id
            .get(&input.service_id)
            .ok_or_else(|| ApiError::NotFound(format!("service {} not found", input.service_id)))?;
        let owner: Uuid = row.get("professional_id");
        match professional_id {
            None => professional_id = Some(owner),
            Some(existing) if existing != owner => {
                return Err(ApiError::Validation(
                    "all items must belong to the same professional".to_string(),
                ));
            }
            _ => {}
        }
        items.push(OrderItem {
            service_id: input.service_id,
            title: row.get("title"),
            category: row.get("category"),
            price: row.get("price"),
            quantity: input.quantity,
            booking: input.booking,
        });
    }

    // inputs is non-empty, so a professional was always found
    let professional_id =
        professional_id.ok_or_else(|| ApiError::Validation("order has no items".to_string()))?;
    Ok((professional_id, items))
}
