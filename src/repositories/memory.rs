use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use uuid::Uuid;

use super::{normalized_email, OrderStore};
use crate::errors::ServiceError;
use crate::models::{Order, OrderPatch};

/// Process-local order store. Each document is mutated under its shard lock,
/// so read-check-write sequences on a single order are atomic.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderStore {
    orders: Arc<DashMap<String, Order>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn get(&self, order_id: &str) -> Result<Option<Order>, ServiceError> {
        Ok(self.orders.get(order_id).map(|entry| entry.value().clone()))
    }

    async fn create(&self, order: Order) -> Result<(), ServiceError> {
        match self.orders.entry(order.id.clone()) {
            Entry::Occupied(_) => Err(ServiceError::Conflict(format!(
                "Order {} already exists",
                order.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(order);
                Ok(())
            }
        }
    }

    async fn update(
        &self,
        order_id: &str,
        patch: OrderPatch,
        expected_version: Option<i64>,
    ) -> Result<bool, ServiceError> {
        let mut order = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if let Some(expected) = expected_version {
            if order.version != expected {
                return Ok(false);
            }
        }

        order.apply_patch(patch, Utc::now());
        Ok(true)
    }

    async fn find_unlinked_by_email(
        &self,
        email: &str,
        guest_user_id: &str,
        anonymous_prefix: &str,
    ) -> Result<Vec<Order>, ServiceError> {
        let wanted = normalized_email(email);
        let mut matches: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| {
                normalized_email(&entry.user_email) == wanted
                    && entry.is_unlinked(guest_user_id, anonymous_prefix)
            })
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matches)
    }

    async fn claim_inventory_reduction(
        &self,
        order_id: &str,
        token: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let mut order = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.inventory_reduced {
            return Ok(false);
        }
        let claim_is_live = order.inventory_claim_token.is_some()
            && order
                .inventory_claimed_at
                .map_or(false, |claimed_at| claimed_at >= stale_before);
        if claim_is_live {
            return Ok(false);
        }

        order.inventory_claim_token = Some(token);
        order.inventory_claimed_at = Some(now);
        Ok(true)
    }

    async fn complete_inventory_reduction(
        &self,
        order_id: &str,
        token: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let mut order = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.inventory_reduced || order.inventory_claim_token != Some(token) {
            return Ok(false);
        }

        order.inventory_reduced = true;
        order.inventory_reduced_at = Some(at);
        order.inventory_claim_token = None;
        order.inventory_claimed_at = None;
        Ok(true)
    }

    async fn release_inventory_claim(
        &self,
        order_id: &str,
        token: Uuid,
    ) -> Result<(), ServiceError> {
        if let Some(mut order) = self.orders.get_mut(order_id) {
            if order.inventory_claim_token == Some(token) {
                order.inventory_claim_token = None;
                order.inventory_claimed_at = None;
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, GUEST_USER_ID};
    use chrono::Duration;

    fn order(id: &str, user_id: &str, email: &str) -> Order {
        Order::new(id, user_id, email, vec![], "KES")
    }

    #[tokio::test]
    async fn versioned_update_rejects_stale_writers() {
        let store = InMemoryOrderStore::new();
        store.create(order("O1", GUEST_USER_ID, "a@x.com")).await.unwrap();

        let patch = OrderPatch {
            status: Some(OrderStatus::Processing),
            ..Default::default()
        };
        assert!(store.update("O1", patch.clone(), Some(1)).await.unwrap());
        assert!(!store.update("O1", patch, Some(1)).await.unwrap());

        let stored = store.get("O1").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.status, OrderStatus::Processing);
    }

    #[tokio::test]
    async fn update_of_missing_order_is_not_found() {
        let store = InMemoryOrderStore::new();
        let result = store.update("nope", OrderPatch::default(), None).await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn duplicate_create_is_a_conflict() {
        let store = InMemoryOrderStore::new();
        store.create(order("O1", GUEST_USER_ID, "a@x.com")).await.unwrap();
        let result = store.create(order("O1", GUEST_USER_ID, "a@x.com")).await;
        assert!(matches!(result, Err(ServiceError::Conflict(_))));
    }

    #[tokio::test]
    async fn inventory_claim_is_exclusive_until_released_or_stale() {
        let store = InMemoryOrderStore::new();
        store.create(order("O1", GUEST_USER_ID, "a@x.com")).await.unwrap();
        let now = Utc::now();
        let stale_before = now - Duration::seconds(300);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(store
            .claim_inventory_reduction("O1", first, now, stale_before)
            .await
            .unwrap());
        assert!(!store
            .claim_inventory_reduction("O1", second, now, stale_before)
            .await
            .unwrap());

        store.release_inventory_claim("O1", first).await.unwrap();
        assert!(store
            .claim_inventory_reduction("O1", second, now, stale_before)
            .await
            .unwrap());

        // an abandoned claim can be taken over once it is older than the ttl
        let later = now + Duration::seconds(301);
        assert!(store
            .claim_inventory_reduction("O1", first, later, later - Duration::seconds(300))
            .await
            .unwrap());
        assert!(!store
            .complete_inventory_reduction("O1", second, later)
            .await
            .unwrap());
        assert!(store
            .complete_inventory_reduction("O1", first, later)
            .await
            .unwrap());

        let stored = store.get("O1").await.unwrap().unwrap();
        assert!(stored.inventory_reduced);
        assert!(stored.inventory_claim_token.is_none());
        assert!(!store
            .claim_inventory_reduction("O1", Uuid::new_v4(), later, later)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn unlinked_lookup_matches_email_case_insensitively() {
        let store = InMemoryOrderStore::new();
        store.create(order("O1", GUEST_USER_ID, "A@X.com")).await.unwrap();
        store.create(order("O2", "anon_77", "a@x.com ")).await.unwrap();
        store.create(order("O3", "user-1", "a@x.com")).await.unwrap();
        store.create(order("O4", GUEST_USER_ID, "b@x.com")).await.unwrap();

        let found = store
            .find_unlinked_by_email("a@x.com", GUEST_USER_ID, "anon_")
            .await
            .unwrap();
        let mut ids: Vec<_> = found.into_iter().map(|o| o.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["O1".to_string(), "O2".to_string()]);
    }
}
