use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Postgres enum mappings. Every status field is an enum column so that
// invalid values are unrepresentable at the storage layer.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_role", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Client,
    Professional,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "tx_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Deposit,
    Withdrawal,
    Payment,
    Refund,
    ManualTransfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "tx_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "pay_method", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PayMethod {
    InternalBalance,
    Card,
    Paypal,
    BankTransfer,
    ManualTransfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Delivered,
    Completed,
    Cancelled,
    Disputed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "delivery_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "dispute_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    Responded,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "promo_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PromoType {
    Pro,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "discount_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    Percentage,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "promo_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PromoStatus {
    Active,
    Inactive,
    Expired,
}

/// Fee breakdown and settlement context carried on a wallet transaction.
/// For every funded deposit `deposit_amount + fee == gross_amount`, and the
/// wallet is only ever credited `deposit_amount`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deposit_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gross_amount: Option<i64>,
    /// Bank transfer only: the amount the user must actually wire
    /// (deposit + processing fee).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_amount: Option<i64>,
    /// Set on deposits created by dispute auto-closure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispute_order_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A line item as stored on the order: the catalog lookup is resolved once
/// at creation time and denormalized here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub service_id: Uuid,
    pub title: String,
    pub category: String,
    pub price: i64,
    pub quantity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking: Option<DateTime<Utc>>,
}

// Request bodies. Amounts are i64 minor units throughout.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemInput {
    pub service_id: Uuid,
    pub quantity: i64,
    pub booking: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub items: Vec<OrderItemInput>,
    #[serde(default)]
    pub address: Option<serde_json::Value>,
    #[serde(default)]
    pub skip_address: bool,
    pub payment_method: PayMethod,
    pub payment_method_id: Option<String>,
    pub subtotal: i64,
    #[serde(default)]
    pub discount: i64,
    pub service_fee: i64,
    pub total: i64,
    pub promo_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturePaypalRequest {
    pub paypal_order_id: String,
    pub order_number: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatePromoRequest {
    pub code: String,
    pub subtotal: i64,
    #[serde(default)]
    pub items: Vec<OrderItemInput>,
}

#[derive(Debug, Deserialize)]
pub struct OpenDisputeRequest {
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RespondDisputeRequest {
    pub message: Option<String>,
}

/// Denormalized row for the role-scoped order listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSummary {
    pub order_id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub delivery_status: DeliveryStatus,
    pub amount: i64,
    pub payment_method: PayMethod,
    pub client_id: Uuid,
    pub professional_id: Uuid,
    pub created_at: DateTime<Utc>,
}
