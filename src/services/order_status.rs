use std::sync::Arc;

use strum::IntoEnumIterator;
use tracing::{info, instrument, warn};

use crate::{
    errors::ServiceError,
    models::{Order, OrderPatch, OrderStatus},
    notifications::{dispatch_detached, NotificationDispatcher, NotificationKind},
    repositories::OrderStore,
};

/// Forward-only status merge used by payment reconciliation.
///
/// Returns `proposed` only when it outranks `current`. `cancelled` carries the
/// top rank, so a cancelled order is never promoted and a proposed
/// cancellation always wins.
pub fn merge_status(current: OrderStatus, proposed: OrderStatus) -> OrderStatus {
    if proposed.rank() > current.rank() {
        proposed
    } else {
        current
    }
}

/// Parses an operator supplied status, rejecting anything outside the known set
pub fn parse_status(raw: &str) -> Result<OrderStatus, ServiceError> {
    raw.trim().parse::<OrderStatus>().map_err(|_| {
        let valid: Vec<String> = OrderStatus::iter().map(|s| s.to_string()).collect();
        ServiceError::ValidationError(format!(
            "Invalid status: {}. Valid statuses are: {}",
            raw,
            valid.join(", ")
        ))
    })
}

/// Administrative status changes.
///
/// Writes `status` as given: the rank guard applies only to payment signals.
#[derive(Clone)]
pub struct OrderStatusService {
    store: Arc<dyn OrderStore>,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl OrderStatusService {
    pub fn new(store: Arc<dyn OrderStore>, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        Self { store, notifier }
    }

    #[instrument(skip(self), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn update_status(
        &self,
        order_id: &str,
        new_status: &str,
    ) -> Result<Order, ServiceError> {
        let status = parse_status(new_status)?;

        let current = self
            .store
            .get(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let old_status = current.status;

        if merge_status(old_status, status) != status && old_status != status {
            warn!(
                "Administrative change moves order {} from '{}' back to '{}'",
                order_id, old_status, status
            );
        }

        let patch = OrderPatch {
            status: Some(status),
            ..Default::default()
        };
        self.store.update(order_id, patch, None).await?;

        let updated = self
            .store
            .get(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        info!(
            "Order {} status updated from '{}' to '{}'",
            order_id, old_status, status
        );

        if old_status != status {
            dispatch_detached(
                self.notifier.clone(),
                updated.clone(),
                NotificationKind::OrderStatusChanged,
                Some(serde_json::json!({ "previous_status": old_status })),
            );
        }

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::MockNotificationDispatcher;
    use crate::repositories::InMemoryOrderStore;
    use crate::models::GUEST_USER_ID;
    use proptest::prelude::*;

    fn any_status() -> impl Strategy<Value = OrderStatus> {
        prop::sample::select(OrderStatus::iter().collect::<Vec<_>>())
    }

    #[test]
    fn merge_only_moves_forward() {
        use OrderStatus::*;
        assert_eq!(merge_status(Pending, Processing), Processing);
        assert_eq!(merge_status(Processing, Pending), Processing);
        assert_eq!(merge_status(Shipped, Processing), Shipped);
        assert_eq!(merge_status(Processing, Processing), Processing);
        assert_eq!(merge_status(Cancelled, Completed), Cancelled);
        assert_eq!(merge_status(Completed, Cancelled), Cancelled);
    }

    #[test]
    fn garbage_current_status_is_outranked_by_any_real_status() {
        assert_eq!(
            merge_status(OrderStatus::normalize(Some("awaiting_magic")), OrderStatus::Processing),
            OrderStatus::Processing
        );
        assert_eq!(
            merge_status(OrderStatus::normalize(None), OrderStatus::Pending),
            OrderStatus::Pending
        );
    }

    #[test]
    fn strict_parse_rejects_unknown_values() {
        assert_eq!(parse_status("Shipped").unwrap(), OrderStatus::Shipped);
        assert!(matches!(
            parse_status("on_hold"),
            Err(ServiceError::ValidationError(_))
        ));
    }

    proptest! {
        #[test]
        fn merge_result_is_one_of_its_inputs(current in any_status(), proposed in any_status()) {
            let merged = merge_status(current, proposed);
            prop_assert!(merged == current || merged == proposed);
            prop_assert!(merged.rank() >= current.rank());
        }

        #[test]
        fn merge_is_idempotent(current in any_status(), proposed in any_status()) {
            let once = merge_status(current, proposed);
            prop_assert_eq!(merge_status(once, proposed), once);
        }
    }

    #[tokio::test]
    async fn admin_update_bypasses_rank_guard() {
        let store = Arc::new(InMemoryOrderStore::new());
        let mut order = Order::new("O1", GUEST_USER_ID, "a@x.com", vec![], "KES");
        order.status = OrderStatus::Shipped;
        store.create(order).await.unwrap();

        let mut notifier = MockNotificationDispatcher::new();
        notifier.expect_send().returning(|_, _, _| Ok(()));
        let service = OrderStatusService::new(store.clone(), Arc::new(notifier));

        let updated = service.update_status("O1", "pending").await.unwrap();
        assert_eq!(updated.status, OrderStatus::Pending);
        assert_eq!(updated.version, 2);
    }

    #[tokio::test]
    async fn admin_update_of_missing_order_is_not_found() {
        let store = Arc::new(InMemoryOrderStore::new());
        let service = OrderStatusService::new(store, Arc::new(MockNotificationDispatcher::new()));
        let result = service.update_status("missing", "shipped").await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }
}
