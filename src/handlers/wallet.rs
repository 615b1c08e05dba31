use axum::body::Bytes;
use axum::extract::{Extension, Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::ApiError;
use crate::middlewares::auth::AuthUser;
use crate::models::UserRole;
use crate::services::gateway::{self, WebhookOutcome};
use crate::services::providers;
use crate::state::AppState;

pub async fn approve_manual_transfer(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(transaction_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    if caller.role != UserRole::Admin {
        return Err(ApiError::Forbidden);
    }
    let new_balance = gateway::approve_manual_transfer(&state, transaction_id).await?;
    Ok(Json(json!({
        "transactionId": transaction_id,
        "status": "approved",
        "newBalance": new_balance,
    })))
}

pub async fn reject_manual_transfer(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(transaction_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    if caller.role != UserRole::Admin {
        return Err(ApiError::Forbidden);
    }
    gateway::reject_manual_transfer(&state, transaction_id).await?;
    Ok(Json(json!({
        "transactionId": transaction_id,
        "status": "rejected",
    })))
}

/// Card processor webhook. Signature is verified over the raw body before
/// anything is parsed; a bad signature is rejected with no state change.
/// Duplicate deliveries are no-ops keyed on the payment intent id.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !providers::verify_webhook_signature(&state.settings.stripe_webhook_secret, signature, &body)
    {
        return Err(ApiError::Validation("invalid webhook signature".to_string()));
    }

    let event: Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::Validation("malformed webhook payload".to_string()))?;
    let event_type = event["type"].as_str().unwrap_or("");
    if event_type != "payment_intent.succeeded" {
        return Ok(Json(json!({ "received": true, "ignored": true })));
    }

    let object = &event["data"]["object"];
    let intent_id = object["id"]
        .as_str()
        .ok_or_else(|| ApiError::Validation("event has no payment intent id".to_string()))?;

    // Stand-alone wallet top-ups arrive with no prior pending transaction;
    // the intent's metadata carries the account and fee split.
    let fallback = parse_topup(object);

    match gateway::confirm_card_deposit(&state, intent_id, fallback).await? {
        WebhookOutcome::AlreadyProcessed => {
            Ok(Json(json!({ "received": true, "duplicate": true })))
        }
        WebhookOutcome::Funded {
            transaction_id,
            new_balance,
        } => Ok(Json(json!({
            "received": true,
            "transactionId": transaction_id,
            "newBalance": new_balance,
        }))),
    }
}

fn parse_topup(object: &Value) -> Option<gateway::CardTopup> {
    let user_id = object["metadata"]["user_id"]
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())?;
    let gross_amount = object["amount"].as_i64()?;
    let fee = object["metadata"]["fee"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    Some(gateway::CardTopup {
        user_id,
        gross_amount,
        fee,
    })
}
