use axum::extract::{Extension, Path, State};
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::ApiError;
use crate::middlewares::auth::AuthUser;
use crate::models::{
    CapturePaypalRequest, CreateOrderRequest, OpenDisputeRequest, OrderSummary,
    RespondDisputeRequest, UserRole,
};
use crate::services::gateway::SettlementOutcome;
use crate::services::{gateway, orders};
use crate::state::AppState;

pub async fn create_order(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<Json<Value>, ApiError> {
    if caller.role != UserRole::Client {
        return Err(ApiError::Forbidden);
    }

    let created = orders::create_order(&state, caller.id, payload).await?;
    let body = match created.outcome {
        SettlementOutcome::Settled {
            payment_transaction_id,
            new_balance,
        } => json!({
            "orderId": created.order_id,
            "orderNumber": created.order_number,
            "order": created.order,
            "paymentTransactionId": payment_transaction_id,
            "newBalance": new_balance,
        }),
        SettlementOutcome::PendingApproval {
            approve_url,
            paypal_order_id,
            pending_transaction_id,
        } => json!({
            "orderId": created.order_id,
            "orderNumber": created.order_number,
            "approveUrl": approve_url,
            "paypalOrderId": paypal_order_id,
            "pendingTransactionId": pending_transaction_id,
            "requiresApproval": true,
        }),
        SettlementOutcome::PendingBankTransfer {
            pending_transaction_id,
            transfer_amount,
        } => json!({
            "orderId": created.order_id,
            "orderNumber": created.order_number,
            "pendingTransactionId": pending_transaction_id,
            "transferAmount": transfer_amount,
        }),
    };
    Ok(Json(body))
}

pub async fn capture_paypal(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Json(payload): Json<CapturePaypalRequest>,
) -> Result<Json<Value>, ApiError> {
    if caller.role != UserRole::Client {
        return Err(ApiError::Forbidden);
    }
    let captured = gateway::capture_paypal(
        &state,
        caller.id,
        &payload.paypal_order_id,
        &payload.order_number,
    )
    .await?;
    Ok(Json(json!({
        "orderId": captured.order_id,
        "orderNumber": captured.order_number,
        "newBalance": captured.new_balance,
    })))
}

pub async fn list_orders(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
) -> Result<Json<Vec<OrderSummary>>, ApiError> {
    let summaries = orders::list_orders(&state, caller.id, caller.role).await?;
    Ok(Json(summaries))
}

pub async fn mark_delivered(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    orders::mark_delivered(&state, order_id, caller.id).await?;
    Ok(Json(json!({ "orderId": order_id, "status": "delivered" })))
}

pub async fn complete_order(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    orders::complete_order(&state, order_id, caller.id).await?;
    Ok(Json(json!({ "orderId": order_id, "status": "completed" })))
}

pub async fn open_dispute(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<OpenDisputeRequest>,
) -> Result<Json<Value>, ApiError> {
    if payload.reason.trim().is_empty() {
        return Err(ApiError::Validation("dispute reason is required".to_string()));
    }
    orders::open_dispute(&state, order_id, caller.id, payload.reason.trim()).await?;
    Ok(Json(json!({ "orderId": order_id, "disputeStatus": "open" })))
}

pub async fn respond_dispute(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
    payload: Option<Json<RespondDisputeRequest>>,
) -> Result<Json<Value>, ApiError> {
    let _ = payload;
    orders::respond_dispute(&state, order_id, caller.id).await?;
    Ok(Json(json!({ "orderId": order_id, "disputeStatus": "responded" })))
}
