use std::sync::Arc;

use metrics::counter;
use tracing::{debug, info, instrument, warn};

use crate::{
    errors::ServiceError,
    models::OrderPatch,
    repositories::OrderStore,
};

/// Re-associates orders placed before sign-in with the authenticated user.
#[derive(Clone)]
pub struct GuestOrderLinker {
    store: Arc<dyn OrderStore>,
    guest_user_id: String,
    anonymous_prefix: String,
}

impl GuestOrderLinker {
    pub fn new(
        store: Arc<dyn OrderStore>,
        guest_user_id: impl Into<String>,
        anonymous_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            guest_user_id: guest_user_id.into(),
            anonymous_prefix: anonymous_prefix.into(),
        }
    }

    /// Links every unlinked order for `email` to `user_id` and returns how
    /// many were linked. Re-running finds nothing new: linked orders no
    /// longer carry the guest or anonymous owner.
    #[instrument(skip(self, email), fields(user_id = %user_id))]
    pub async fn link(&self, email: &str, user_id: &str) -> Result<usize, ServiceError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(ServiceError::ValidationError("email is required".into()));
        }
        if user_id.trim().is_empty() || self.owner_is_unlinked(user_id) {
            return Err(ServiceError::ValidationError(format!(
                "{} is not an authenticated user id",
                user_id
            )));
        }

        let candidates = self
            .store
            .find_unlinked_by_email(email, &self.guest_user_id, &self.anonymous_prefix)
            .await?;

        let mut linked = 0;
        for order in candidates {
            let patch = OrderPatch {
                user_id: Some(user_id.to_string()),
                ..Default::default()
            };
            // a concurrent writer wins; the order is picked up on the next run
            match self.store.update(&order.id, patch, Some(order.version)).await {
                Ok(true) => linked += 1,
                Ok(false) => debug!(order_id = %order.id, "Order changed while linking; skipped"),
                Err(e) => {
                    warn!(
                        order_id = %order.id,
                        linked,
                        error = %e,
                        "Guest order linking stopped partway; remaining orders link on the next run"
                    );
                    record_linked(linked);
                    return Err(e);
                }
            }
        }

        record_linked(linked);
        if linked > 0 {
            info!("Linked {} guest orders", linked);
        }
        Ok(linked)
    }

    /// Session-time linking: failures are logged and reported as zero.
    pub async fn link_on_session(&self, email: &str, user_id: &str) -> usize {
        match self.link(email, user_id).await {
            Ok(linked) => linked,
            Err(e) => {
                warn!(user_id, error = %e, "Guest order linking failed; continuing");
                0
            }
        }
    }

    fn owner_is_unlinked(&self, user_id: &str) -> bool {
        crate::models::order::is_unlinked_user(user_id, &self.guest_user_id, &self.anonymous_prefix)
    }
}

fn record_linked(linked: usize) {
    if linked > 0 {
        counter!("storefront.guest_orders.linked", linked as u64);
    }
}
