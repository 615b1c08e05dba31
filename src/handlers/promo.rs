use axum::extract::{Extension, State};
use axum::Json;
use serde_json::{json, Value};

use crate::errors::ApiError;
use crate::middlewares::auth::AuthUser;
use crate::models::ValidatePromoRequest;
use crate::services::{catalog, promo};
use crate::state::AppState;

/// Pre-checkout validation: does the code apply to this caller and cart,
/// and what would it be worth. Read-only; usage is recorded only when an
/// order actually commits.
pub async fn validate_promo(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Json(payload): Json<ValidatePromoRequest>,
) -> Result<Json<Value>, ApiError> {
    let categories = if payload.items.is_empty() {
        Vec::new()
    } else {
        let (_, items) = catalog::resolve_items(&state.pool, &payload.items).await?;
        items.into_iter().map(|i| i.category).collect()
    };

    let code = promo::validate(
        &state.pool,
        &payload.code,
        caller.id,
        payload.subtotal,
        &categories,
    )
    .await?;
    let discount = promo::calculate_discount(&code, payload.subtotal);

    Ok(Json(json!({
        "valid": true,
        "promoCode": {
            "code": code.code,
            "discount": discount,
            "discountType": code.discount_type,
        },
    })))
}
