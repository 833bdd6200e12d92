//! Payment gateway client.
//!
//! Only the gateway's responses matter to reconciliation; retries and
//! timeouts belong to the client.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ServiceError;

pub mod http;

pub use http::HttpPaymentGateway;

/// Raw transaction status as returned by the gateway.
///
/// The whole document is kept so it can be stored on the order for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionStatus {
    raw: Value,
}

impl TransactionStatus {
    pub fn from_raw(raw: Value) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn into_raw(self) -> Value {
        self.raw
    }

    /// Human readable state, e.g. `"Completed"`.
    pub fn description(&self) -> Option<&str> {
        self.raw
            .get("payment_status_description")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Machine code, read from `payment_status` or its alias `status_code`.
    ///
    /// Numeric and textual codes are both returned as upper-cased text.
    pub fn code(&self) -> Option<String> {
        ["payment_status", "status_code"]
            .iter()
            .filter_map(|field| self.raw.get(*field))
            .find_map(|value| match value {
                Value::Number(number) => Some(number.to_string()),
                Value::String(text) if !text.trim().is_empty() => {
                    Some(text.trim().to_ascii_uppercase())
                }
                _ => None,
            })
    }

    pub fn confirmation_code(&self) -> Option<&str> {
        self.raw.get("confirmation_code").and_then(Value::as_str)
    }

    pub fn merchant_reference(&self) -> Option<&str> {
        self.raw.get("merchant_reference").and_then(Value::as_str)
    }
}

/// Order submission for the hosted payment page.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOrderRequest {
    /// Our order id, echoed back as `OrderMerchantReference`.
    pub merchant_reference: String,
    pub currency: String,
    pub amount: Decimal,
    pub description: String,
    pub callback_url: String,
    pub notification_id: Option<String>,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitOrderResponse {
    pub order_tracking_id: String,
    #[serde(default)]
    pub merchant_reference: Option<String>,
    pub redirect_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpnRegistration {
    pub ipn_id: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Authoritative status of the transaction behind `tracking_id`.
    async fn transaction_status(&self, tracking_id: &str)
        -> Result<TransactionStatus, ServiceError>;

    async fn submit_order(
        &self,
        request: SubmitOrderRequest,
    ) -> Result<SubmitOrderResponse, ServiceError>;

    /// Registers our IPN endpoint and returns the notification id to submit with orders.
    async fn register_ipn(&self, url: &str) -> Result<IpnRegistration, ServiceError>;
}
