//! Converges gateway payment signals from both delivery channels onto the
//! order record.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use serde_json::json;
use strum::{AsRefStr, Display};
use tracing::{debug, info, instrument, warn};

use crate::{
    errors::ServiceError,
    gateway::PaymentGateway,
    models::{Order, OrderPatch, OrderStatus, PaymentStatus},
    notifications::{dispatch_detached, NotificationDispatcher, NotificationKind},
    repositories::OrderStore,
    services::{
        inventory::{InventoryOutcome, InventoryReductionGuard},
        order_status::merge_status,
        payments::{interpret_payment_status, PaymentInterpretation},
    },
};

/// Delivery path a payment signal arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Channel {
    /// Server-to-server notification from the gateway
    Ipn,
    /// Browser redirect back from the hosted payment page
    Callback,
}

/// Summary of a browser-visible payment result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum PaymentOutcome {
    Success,
    Failed,
    Pending,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub order_id: String,
    pub tracking_id: String,
    pub previous_status: OrderStatus,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    /// This delivery recorded the first confirmation of payment.
    pub newly_confirmed: bool,
    /// `None` when the payment is not completed.
    pub inventory: Option<InventoryOutcome>,
    pub attempts: u32,
}

impl ReconcileReport {
    pub fn payment_outcome(&self) -> PaymentOutcome {
        match self.payment_status {
            PaymentStatus::Paid => PaymentOutcome::Success,
            PaymentStatus::Failed => PaymentOutcome::Failed,
            PaymentStatus::Pending => PaymentOutcome::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Reconciled(ReconcileReport),
    OrderNotFound,
}

/// Fetch gateway status, merge, persist, then fire side effects.
///
/// Every step is idempotent so either channel may deliver any number of
/// times in any order.
#[derive(Clone)]
pub struct ReconciliationService {
    store: Arc<dyn OrderStore>,
    gateway: Arc<dyn PaymentGateway>,
    inventory: InventoryReductionGuard,
    notifier: Arc<dyn NotificationDispatcher>,
    max_attempts: u32,
}

impl ReconciliationService {
    pub fn new(
        store: Arc<dyn OrderStore>,
        gateway: Arc<dyn PaymentGateway>,
        inventory: InventoryReductionGuard,
        notifier: Arc<dyn NotificationDispatcher>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            gateway,
            inventory,
            notifier,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Errors only when the gateway or the store cannot be read or written;
    /// inventory and notification failures never surface here.
    #[instrument(skip(self), fields(channel = %channel))]
    pub async fn reconcile(
        &self,
        channel: Channel,
        tracking_id: &str,
        order_id: &str,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let status = self.gateway.transaction_status(tracking_id).await?;
        let interpretation = interpret_payment_status(&status);
        debug!(?interpretation, "Interpreted gateway status");
        if let Some(reference) = status
            .merchant_reference()
            .filter(|reference| *reference != order_id)
        {
            warn!(
                merchant_reference = reference,
                "Gateway merchant reference differs from the notified order id"
            );
        }
        let raw_payload = status.into_raw();

        let mut attempt = 0;
        let (order, updated, newly_confirmed) = loop {
            attempt += 1;

            let order = match self.store.get(order_id).await? {
                Some(order) => order,
                None => {
                    warn!("Payment notification for unknown order {}", order_id);
                    counter!("storefront.reconciliation.order_not_found", 1, "channel" => channel.as_ref().to_string());
                    return Ok(ReconcileOutcome::OrderNotFound);
                }
            };

            let (patch, newly_confirmed) =
                build_patch(&order, channel, tracking_id, &interpretation, raw_payload.clone());

            match self
                .store
                .update(order_id, patch.clone(), Some(order.version))
                .await
            {
                Ok(true) => {
                    let mut updated = order.clone();
                    updated.apply_patch(patch, Utc::now());
                    break (order, updated, newly_confirmed);
                }
                Ok(false) if attempt < self.max_attempts => {
                    debug!(attempt, "Order changed underneath us; retrying merge");
                }
                Ok(false) => {
                    warn!(attempt, "Giving up after repeated concurrent modifications");
                    counter!("storefront.reconciliation.conflicts", 1, "channel" => channel.as_ref().to_string());
                    return Err(ServiceError::ConcurrentModification(order_id.to_string()));
                }
                Err(ServiceError::NotFound(_)) => return Ok(ReconcileOutcome::OrderNotFound),
                Err(e) => return Err(e),
            }
        };

        let inventory = if interpretation.is_completed() {
            Some(self.inventory.reduce_once(&order).await)
        } else {
            None
        };

        if newly_confirmed {
            dispatch_detached(
                self.notifier.clone(),
                updated.clone(),
                NotificationKind::PaymentConfirmed,
                Some(json!({ "tracking_id": tracking_id, "channel": channel.as_ref() })),
            );
        }

        counter!(
            "storefront.reconciliation.processed",
            1,
            "channel" => channel.as_ref().to_string(),
            "payment_status" => updated.payment_status.as_ref().to_string()
        );
        info!(
            order_id,
            previous_status = %order.status,
            status = %updated.status,
            payment_status = %updated.payment_status,
            newly_confirmed,
            ?inventory,
            "Order reconciled"
        );

        Ok(ReconcileOutcome::Reconciled(ReconcileReport {
            order_id: order_id.to_string(),
            tracking_id: tracking_id.to_string(),
            previous_status: order.status,
            status: updated.status,
            payment_status: updated.payment_status,
            newly_confirmed,
            inventory,
            attempts: attempt,
        }))
    }
}

/// The merge update for one reading against one snapshot of the order.
fn build_patch(
    order: &Order,
    channel: Channel,
    tracking_id: &str,
    interpretation: &PaymentInterpretation,
    raw_payload: serde_json::Value,
) -> (OrderPatch, bool) {
    let now = Utc::now();
    let newly_confirmed = interpretation.is_completed() && order.payment_confirmed_at.is_none();

    let payment_tracking_id = match order.payment_tracking_id.as_deref() {
        None => Some(tracking_id.to_string()),
        Some(existing) if existing != tracking_id => {
            warn!(
                stored = existing,
                received = tracking_id,
                "Notification tracking id differs from the one on the order"
            );
            None
        }
        Some(_) => None,
    };

    let patch = OrderPatch {
        status: Some(merge_status(order.status, interpretation.proposed_status)),
        payment_status: Some(interpretation.payment_status),
        payment_tracking_id,
        gateway_payload: Some(raw_payload),
        payment_confirmed_at: newly_confirmed.then_some(now),
        ipn_processed_at: (channel == Channel::Ipn).then_some(now),
        callback_processed_at: (channel == Channel::Callback).then_some(now),
        ..Default::default()
    };
    (patch, newly_confirmed)
}
