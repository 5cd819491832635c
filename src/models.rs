//! Queue records and the push/pull wire contract.
//!
//! Wire types serialize camelCase to match the admin dashboard; enums use the
//! SCREAMING_SNAKE_CASE spelling the server emits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SalesChannel {
    DineIn,
    Takeout,
    Delivery,
    Counter,
}

impl SalesChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DineIn => "DINE_IN",
            Self::Takeout => "TAKEOUT",
            Self::Delivery => "DELIVERY",
            Self::Counter => "COUNTER",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "DINE_IN" => Some(Self::DineIn),
            "TAKEOUT" | "TAKEAWAY" | "PICKUP" => Some(Self::Takeout),
            "DELIVERY" => Some(Self::Delivery),
            "COUNTER" => Some(Self::Counter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Cash,
    Card,
    Transfer,
    Voucher,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cash => "CASH",
            Self::Card => "CARD",
            Self::Transfer => "TRANSFER",
            Self::Voucher => "VOUCHER",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CASH" => Some(Self::Cash),
            "CARD" | "CREDIT_CARD" | "DEBIT_CARD" => Some(Self::Card),
            "TRANSFER" => Some(Self::Transfer),
            "VOUCHER" => Some(Self::Voucher),
            _ => None,
        }
    }
}

/// Lifecycle of a queued record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Synced,
    Error,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "synced" => Some(Self::Synced),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedModifier {
    pub modifier_id: i64,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: i64,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub modifiers: Vec<SelectedModifier>,
    #[serde(default)]
    pub removed_ingredients: Vec<i64>,
}

/// An order taken while the server was unreachable.
///
/// `temp_id` is assigned once and survives the server assigning `real_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrder {
    pub temp_id: String,
    pub items: Vec<OrderItem>,
    pub channel: SalesChannel,
    pub table_id: Option<i64>,
    /// Customer reference; serialized as `clientId` on the wire.
    #[serde(rename = "clientId")]
    pub customer_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub shift_id: i64,
    pub status: QueueStatus,
    pub error_message: Option<String>,
    pub rejection_kind: Option<MappingStatus>,
    pub real_id: Option<i64>,
    pub order_number: Option<i64>,
    pub push_attempts: i64,
}

impl PendingOrder {
    pub fn new(
        temp_id: impl Into<String>,
        items: Vec<OrderItem>,
        channel: SalesChannel,
        shift_id: i64,
    ) -> Self {
        Self {
            temp_id: temp_id.into(),
            items,
            channel,
            table_id: None,
            customer_id: None,
            created_at: Utc::now(),
            shift_id,
            status: QueueStatus::Pending,
            error_message: None,
            rejection_kind: None,
            real_id: None,
            order_number: None,
            push_attempts: 0,
        }
    }
}

/// A payment captured offline. Always references the order's temp id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPayment {
    pub payment_id: String,
    pub temp_order_id: String,
    pub method: PaymentMethod,
    pub amount: f64,
    /// Cash handed over by the customer, when more than `amount`.
    pub tendered: Option<f64>,
    pub change_given: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub status: QueueStatus,
    pub error_message: Option<String>,
}

impl PendingPayment {
    pub fn new(temp_order_id: impl Into<String>, method: PaymentMethod, amount: f64) -> Self {
        Self {
            payment_id: format!("pay-{}", uuid::Uuid::new_v4().simple()),
            temp_order_id: temp_order_id.into(),
            method,
            amount,
            tendered: None,
            change_given: None,
            created_at: Utc::now(),
            status: QueueStatus::Pending,
            error_message: None,
        }
    }

    /// Record cash tendered; change is derived, `amount` is never touched.
    pub fn with_tendered(mut self, tendered: f64) -> Self {
        self.tendered = Some(tendered);
        self.change_given = Some((tendered - self.amount).max(0.0));
        self
    }
}

/// Last-pulled reference data. Replaced wholesale on every pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    #[serde(default)]
    pub products: Vec<Value>,
    #[serde(default)]
    pub categories: Vec<Value>,
    #[serde(default)]
    pub printer_routing: Vec<Value>,
    pub server_time: DateTime<Utc>,
    pub sync_token: String,
}

/// Counts behind the UI badge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub pending_orders: i64,
    pub pending_payments: i64,
    pub error_orders: i64,
    pub error_payments: i64,
}

impl QueueCounts {
    pub fn total_pending(&self) -> i64 {
        self.pending_orders + self.pending_payments
    }

    pub fn total_errors(&self) -> i64 {
        self.error_orders + self.error_payments
    }
}

// ---------------------------------------------------------------------------
// Push wire contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOrder {
    pub temp_id: String,
    pub items: Vec<OrderItem>,
    pub channel: SalesChannel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_id: Option<i64>,
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub shift_id: i64,
}

impl From<&PendingOrder> for PushOrder {
    fn from(order: &PendingOrder) -> Self {
        Self {
            temp_id: order.temp_id.clone(),
            items: order.items.clone(),
            channel: order.channel,
            table_id: order.table_id,
            customer_id: order.customer_id,
            created_at: order.created_at,
            shift_id: order.shift_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayment {
    pub payment_id: String,
    pub temp_order_id: String,
    pub method: PaymentMethod,
    pub amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tendered: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_given: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl From<&PendingPayment> for PushPayment {
    fn from(payment: &PendingPayment) -> Self {
        Self {
            payment_id: payment.payment_id.clone(),
            temp_order_id: payment.temp_order_id.clone(),
            method: payment.method,
            amount: payment.amount,
            tendered: payment.tendered,
            change_given: payment.change_given,
            created_at: payment.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    /// Terminal identifier, not the customer.
    pub client_id: String,
    pub pending_orders: Vec<PushOrder>,
    pub pending_payments: Vec<PushPayment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingStatus {
    Synced,
    Conflict,
    Error,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "SYNCED",
            Self::Conflict => "CONFLICT",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SYNCED" => Some(Self::Synced),
            "CONFLICT" => Some(Self::Conflict),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMapping {
    pub temp_id: String,
    #[serde(default)]
    pub real_id: Option<i64>,
    #[serde(default)]
    pub order_number: Option<i64>,
    pub status: MappingStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncIssue {
    #[serde(default)]
    pub temp_id: Option<String>,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub success: bool,
    #[serde(default)]
    pub order_mappings: Vec<OrderMapping>,
    #[serde(default)]
    pub errors: Vec<SyncIssue>,
    #[serde(default)]
    pub warnings: Vec<SyncIssue>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

/// Server id/number assigned to a synced temp id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedOrder {
    pub temp_id: String,
    pub real_id: Option<i64>,
    pub order_number: Option<i64>,
}

// ---------------------------------------------------------------------------
// Direct order creation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub method: PaymentMethod,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tendered: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub items: Vec<OrderItem>,
    pub channel: SalesChannel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<i64>,
    #[serde(default, rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<i64>,
    pub shift_id: i64,
    #[serde(default)]
    pub payments: Vec<PaymentRequest>,
}

/// Body of the direct create call. Carries the temp id so a create whose
/// response was lost and that later gets pushed is absorbed server-side.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectOrderRequest<'a> {
    pub temp_id: &'a str,
    #[serde(flatten)]
    pub order: &'a OrderRequest,
}

/// What the server returns for a created order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOrder {
    pub id: i64,
    #[serde(default)]
    pub order_number: Option<i64>,
    #[serde(default)]
    pub subtotal: f64,
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub status: Option<String>,
}
