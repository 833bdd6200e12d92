use std::sync::Arc;

use tracing::{info, instrument};

use crate::{
    config::GatewayConfig,
    errors::ServiceError,
    gateway::{PaymentGateway, SubmitOrderRequest, SubmitOrderResponse, TransactionStatus},
    models::{OrderPatch, OrderStatus, PaymentStatus},
    repositories::OrderStore,
};

const COMPLETED_CODES: &[&str] = &["1", "COMPLETED"];
const FAILED_CODES: &[&str] = &["2", "FAILED"];

/// What a gateway status reading means for the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentInterpretation {
    pub payment_status: PaymentStatus,
    pub proposed_status: OrderStatus,
}

impl PaymentInterpretation {
    pub fn is_completed(&self) -> bool {
        self.payment_status == PaymentStatus::Paid
    }
}

/// Maps a fresh gateway reading to payment and proposed order status.
///
/// Either the description or the machine code may carry the signal.
/// Completion is checked first. Prior order state is never consulted.
pub fn interpret_payment_status(status: &TransactionStatus) -> PaymentInterpretation {
    let description = status.description().map(str::to_ascii_lowercase);
    let code = status.code();
    let signals = |text: &str, codes: &[&str]| {
        description.as_deref() == Some(text)
            || code.as_deref().map_or(false, |code| codes.contains(&code))
    };

    if signals("completed", COMPLETED_CODES) {
        PaymentInterpretation {
            payment_status: PaymentStatus::Paid,
            proposed_status: OrderStatus::Processing,
        }
    } else if signals("failed", FAILED_CODES) {
        PaymentInterpretation {
            payment_status: PaymentStatus::Failed,
            proposed_status: OrderStatus::Pending,
        }
    } else {
        PaymentInterpretation {
            payment_status: PaymentStatus::Pending,
            proposed_status: OrderStatus::Pending,
        }
    }
}

/// Submits orders to the gateway's hosted checkout and records the tracking id.
#[derive(Clone)]
pub struct PaymentSubmissionService {
    store: Arc<dyn OrderStore>,
    gateway: Arc<dyn PaymentGateway>,
    config: GatewayConfig,
}

impl PaymentSubmissionService {
    pub fn new(
        store: Arc<dyn OrderStore>,
        gateway: Arc<dyn PaymentGateway>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    /// Submits the order for payment. The tracking id is set once: an order
    /// that already has one is a `Conflict`.
    #[instrument(skip(self))]
    pub async fn submit(&self, order_id: &str) -> Result<SubmitOrderResponse, ServiceError> {
        let order = self
            .store
            .get(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.payment_tracking_id.is_some() {
            return Err(ServiceError::Conflict(format!(
                "Order {} has already been submitted for payment",
                order_id
            )));
        }
        if order.items.is_empty() {
            return Err(ServiceError::ValidationError(format!(
                "Order {} has no items",
                order_id
            )));
        }
        let callback_url = self.config.callback_url.clone().ok_or_else(|| {
            ServiceError::ConfigError("gateway.callback_url is not configured".into())
        })?;

        let request = SubmitOrderRequest {
            merchant_reference: order.id.clone(),
            currency: if order.currency.is_empty() {
                self.config.currency.clone()
            } else {
                order.currency.clone()
            },
            amount: order.total_amount(),
            description: format!("Order {}", order.id),
            callback_url,
            notification_id: self.config.ipn_id.clone(),
            email: order.user_email.clone(),
        };
        let response = self.gateway.submit_order(request).await?;

        let patch = OrderPatch {
            payment_tracking_id: Some(response.order_tracking_id.clone()),
            ..Default::default()
        };
        if !self.store.update(order_id, patch, Some(order.version)).await? {
            return Err(ServiceError::ConcurrentModification(order_id.to_string()));
        }

        info!(
            tracking_id = %response.order_tracking_id,
            "Order {} submitted for payment", order_id
        );
        Ok(response)
    }
}
