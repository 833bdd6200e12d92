use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::models::{Order, OrderPatch};

pub mod memory;
pub mod order_repository;

pub use memory::InMemoryOrderStore;
pub use order_repository::SeaOrmOrderStore;

/// Document store holding one record per order.
///
/// There are no cross-document transactions. Callers get safety from two
/// single-document primitives: versioned merge updates and the inventory
/// claim protocol.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get(&self, order_id: &str) -> Result<Option<Order>, ServiceError>;

    /// Inserts a new order. Fails with `Conflict` when the id is taken.
    async fn create(&self, order: Order) -> Result<(), ServiceError>;

    /// Merge-updates the order and bumps its version.
    ///
    /// With `expected_version` set the write applies only if the stored
    /// version still matches; `Ok(false)` reports a lost race. A missing order
    /// is `NotFound`.
    async fn update(
        &self,
        order_id: &str,
        patch: OrderPatch,
        expected_version: Option<i64>,
    ) -> Result<bool, ServiceError>;

    /// Orders whose `user_email` matches case-insensitively and whose owner is
    /// still the guest sentinel or an anonymous id.
    async fn find_unlinked_by_email(
        &self,
        email: &str,
        guest_user_id: &str,
        anonymous_prefix: &str,
    ) -> Result<Vec<Order>, ServiceError>;

    /// Takes the exclusive right to reduce stock for this order.
    ///
    /// Succeeds only while `inventory_reduced` is false and no claim newer than
    /// `stale_before` exists.
    async fn claim_inventory_reduction(
        &self,
        order_id: &str,
        token: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, ServiceError>;

    /// Sets `inventory_reduced = true` if `token` still holds the claim.
    async fn complete_inventory_reduction(
        &self,
        order_id: &str,
        token: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, ServiceError>;

    /// Drops the claim held by `token`, leaving `inventory_reduced` untouched.
    async fn release_inventory_claim(&self, order_id: &str, token: Uuid)
        -> Result<(), ServiceError>;

    /// Confirms the backing store is reachable.
    async fn ping(&self) -> Result<(), ServiceError>;
}

/// Lowercased with surrounding spaces removed, the same as SQL `LOWER(TRIM(..))`.
pub(crate) fn normalized_email(email: &str) -> String {
    email.trim_matches(' ').to_lowercase()
}
