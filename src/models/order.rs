use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use utoipa::ToSchema;
use uuid::Uuid;

/// Sentinel `user_id` for orders placed without an account.
pub const GUEST_USER_ID: &str = "guest";

/// Workflow status of an order.
///
/// Progress is ranked `pending < processing < shipped < delivered < completed`.
/// `cancelled` carries a sentinel rank so that it is never overwritten by a
/// payment signal and always wins when proposed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
    ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum OrderStatus {
    Pending,
    Processing,
    Shipped,
    Delivered,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub const CANCELLED_RANK: u8 = 99;

    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 1,
            Self::Processing => 2,
            Self::Shipped => 3,
            Self::Delivered => 4,
            Self::Completed => 5,
            Self::Cancelled => Self::CANCELLED_RANK,
        }
    }

    /// Boundary normalisation for untrusted or stored values.
    ///
    /// Missing and unrecognised values map to `Pending`, the least progressed
    /// status, so garbage input can never outrank a known status.
    pub fn normalize(raw: Option<&str>) -> Self {
        raw.map(str::trim)
            .and_then(|value| value.parse().ok())
            .unwrap_or(Self::Pending)
    }
}

impl Default for OrderStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Payment state as last reported by the gateway.
///
/// Not rank constrained: a later gateway report may move `paid` to `failed`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
    ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

impl PaymentStatus {
    pub fn normalize(raw: Option<&str>) -> Self {
        raw.map(str::trim)
            .and_then(|value| value.parse().ok())
            .unwrap_or(Self::Pending)
    }
}

impl Default for PaymentStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// A single order line. Immutable after the order is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OrderItem {
    pub product_id: String,
    pub quantity: u32,
    pub price: Decimal,
}

/// Stock movement requested from the inventory adjuster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryLine {
    pub product_id: String,
    pub quantity: u32,
}

/// The order document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Order {
    pub id: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_tracking_id: Option<String>,
    pub user_id: String,
    pub user_email: String,
    pub items: Vec<OrderItem>,
    pub currency: String,
    pub inventory_reduced: bool,
    pub inventory_reduced_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory_claim_token: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory_claimed_at: Option<DateTime<Utc>>,
    pub payment_confirmed_at: Option<DateTime<Utc>>,
    /// Last raw transaction status returned by the gateway, kept for audit.
    #[schema(value_type = Option<Object>)]
    pub gateway_payload: Option<Value>,
    pub ipn_processed_at: Option<DateTime<Utc>>,
    pub callback_processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Order {
    /// Creates a fresh `pending`/`pending` order as the checkout flow does.
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        user_email: impl Into<String>,
        items: Vec<OrderItem>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            payment_tracking_id: None,
            user_id: user_id.into(),
            user_email: user_email.into(),
            items,
            currency: currency.into(),
            inventory_reduced: false,
            inventory_reduced_at: None,
            inventory_claim_token: None,
            inventory_claimed_at: None,
            payment_confirmed_at: None,
            gateway_payload: None,
            ipn_processed_at: None,
            callback_processed_at: None,
            created_at: Utc::now(),
            updated_at: None,
            version: 1,
        }
    }

    pub fn total_amount(&self) -> Decimal {
        self.items
            .iter()
            .map(|item| item.price * Decimal::from(item.quantity))
            .sum()
    }

    pub fn inventory_lines(&self) -> Vec<InventoryLine> {
        self.items
            .iter()
            .map(|item| InventoryLine {
                product_id: item.product_id.clone(),
                quantity: item.quantity,
            })
            .collect()
    }

    /// True when the order belongs to the guest sentinel or an anonymous id.
    pub fn is_unlinked(&self, guest_user_id: &str, anonymous_prefix: &str) -> bool {
        is_unlinked_user(&self.user_id, guest_user_id, anonymous_prefix)
    }

    /// Applies a merge patch and bumps the document version.
    pub fn apply_patch(&mut self, patch: OrderPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(payment_status) = patch.payment_status {
            self.payment_status = payment_status;
        }
        if let Some(tracking_id) = patch.payment_tracking_id {
            self.payment_tracking_id = Some(tracking_id);
        }
        if let Some(user_id) = patch.user_id {
            self.user_id = user_id;
        }
        if let Some(payload) = patch.gateway_payload {
            self.gateway_payload = Some(payload);
        }
        if let Some(at) = patch.payment_confirmed_at {
            self.payment_confirmed_at = Some(at);
        }
        if let Some(at) = patch.ipn_processed_at {
            self.ipn_processed_at = Some(at);
        }
        if let Some(at) = patch.callback_processed_at {
            self.callback_processed_at = Some(at);
        }
        self.updated_at = Some(now);
        self.version += 1;
    }
}

pub fn is_unlinked_user(user_id: &str, guest_user_id: &str, anonymous_prefix: &str) -> bool {
    user_id == guest_user_id || (!anonymous_prefix.is_empty() && user_id.starts_with(anonymous_prefix))
}

/// Merge-update of an order document. `None` fields are left untouched.
///
/// `items`, `id` and the inventory flags are not patchable. The inventory flag
/// only moves through the claim protocol.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderPatch {
    pub status: Option<OrderStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub payment_tracking_id: Option<String>,
    pub user_id: Option<String>,
    pub gateway_payload: Option<Value>,
    pub payment_confirmed_at: Option<DateTime<Utc>>,
    pub ipn_processed_at: Option<DateTime<Utc>>,
    pub callback_processed_at: Option<DateTime<Utc>>,
}
