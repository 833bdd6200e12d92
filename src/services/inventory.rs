use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait,
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::product_stock::{Column as StockColumn, Entity as ProductStock},
    errors::ServiceError,
    models::{InventoryLine, Order},
    repositories::OrderStore,
};

/// Decrements stock for a list of lines. Not idempotent: callers must make
/// sure it runs at most once per order.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InventoryAdjuster: Send + Sync {
    async fn reduce(&self, lines: &[InventoryLine]) -> Result<(), ServiceError>;
}

/// Stock adjuster over the `product_stock` table
#[derive(Clone)]
pub struct DbInventoryAdjuster {
    db_pool: Arc<DatabaseConnection>,
}

impl DbInventoryAdjuster {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl InventoryAdjuster for DbInventoryAdjuster {
    /// All lines are decremented in one transaction; a missing product
    /// aborts the whole reduction.
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    async fn reduce(&self, lines: &[InventoryLine]) -> Result<(), ServiceError> {
        let txn = self.db_pool.begin().await?;

        for line in lines {
            let stock = ProductStock::find_by_id(line.product_id.clone())
                .one(&txn)
                .await?
                .ok_or_else(|| {
                    ServiceError::InventoryError(format!(
                        "No stock record for product {}",
                        line.product_id
                    ))
                })?;

            let remaining = stock.quantity - i64::from(line.quantity);
            if remaining < 0 {
                warn!(
                    product_id = %line.product_id,
                    remaining,
                    "Stock for product went negative"
                );
            }

            ProductStock::update_many()
                .col_expr(
                    StockColumn::Quantity,
                    Expr::col(StockColumn::Quantity).sub(i64::from(line.quantity)),
                )
                .col_expr(StockColumn::UpdatedAt, Expr::value(Some(Utc::now())))
                .filter(StockColumn::ProductId.eq(line.product_id.clone()))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;
        info!("Reduced stock for {} lines", lines.len());
        Ok(())
    }
}

/// Process-local stock counts, paired with the in-memory order store
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryAdjuster {
    stock: Arc<DashMap<String, i64>>,
    reductions: Arc<AtomicUsize>,
}

impl InMemoryInventoryAdjuster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stock(&self, product_id: impl Into<String>, quantity: i64) {
        self.stock.insert(product_id.into(), quantity);
    }

    pub fn stock(&self, product_id: &str) -> Option<i64> {
        self.stock.get(product_id).map(|entry| *entry)
    }

    /// Number of successful `reduce` calls
    pub fn reductions(&self) -> usize {
        self.reductions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InventoryAdjuster for InMemoryInventoryAdjuster {
    async fn reduce(&self, lines: &[InventoryLine]) -> Result<(), ServiceError> {
        if let Some(missing) = lines
            .iter()
            .find(|line| !self.stock.contains_key(&line.product_id))
        {
            return Err(ServiceError::InventoryError(format!(
                "No stock record for product {}",
                missing.product_id
            )));
        }
        for line in lines {
            if let Some(mut quantity) = self.stock.get_mut(&line.product_id) {
                *quantity -= i64::from(line.quantity);
            }
        }
        self.reductions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Outcome of one attempt to reduce stock for an order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryOutcome {
    /// Stock was decremented by this call.
    Reduced,
    /// The order had already been reduced.
    AlreadyReduced,
    /// Another delivery holds a live claim and is reducing right now.
    ClaimedElsewhere,
    /// The adjuster or the store failed; the flag stays false for a retry.
    Failed,
}

/// Runs the adjuster at most once per order using the store's claim protocol
#[derive(Clone)]
pub struct InventoryReductionGuard {
    store: Arc<dyn OrderStore>,
    adjuster: Arc<dyn InventoryAdjuster>,
    claim_ttl: Duration,
}

impl InventoryReductionGuard {
    pub fn new(
        store: Arc<dyn OrderStore>,
        adjuster: Arc<dyn InventoryAdjuster>,
        claim_ttl: Duration,
    ) -> Self {
        Self {
            store,
            adjuster,
            claim_ttl,
        }
    }

    /// Never fails: every error is logged and reported as `Failed`.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn reduce_once(&self, order: &Order) -> InventoryOutcome {
        if order.inventory_reduced {
            return InventoryOutcome::AlreadyReduced;
        }

        let token = Uuid::new_v4();
        let now = Utc::now();
        let claimed = match self
            .store
            .claim_inventory_reduction(&order.id, token, now, now - self.claim_ttl)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(error = %e, "Failed to claim inventory reduction");
                counter!("storefront.inventory.reduction_failed", 1);
                return InventoryOutcome::Failed;
            }
        };

        if !claimed {
            return match self.store.get(&order.id).await {
                Ok(Some(current)) if current.inventory_reduced => InventoryOutcome::AlreadyReduced,
                _ => {
                    info!("Inventory reduction already in progress elsewhere");
                    InventoryOutcome::ClaimedElsewhere
                }
            };
        }

        if let Err(e) = self.adjuster.reduce(&order.inventory_lines()).await {
            error!(error = %e, "Inventory adjustment failed; leaving order unreduced");
            counter!("storefront.inventory.reduction_failed", 1);
            if let Err(release_err) = self.store.release_inventory_claim(&order.id, token).await {
                warn!(error = %release_err, "Failed to release inventory claim; it will expire");
            }
            return InventoryOutcome::Failed;
        }

        match self
            .store
            .complete_inventory_reduction(&order.id, token, Utc::now())
            .await
        {
            Ok(true) => {
                counter!("storefront.inventory.reduced", 1);
                info!("Inventory reduced");
                InventoryOutcome::Reduced
            }
            Ok(false) => {
                // the claim expired and was taken over while the adjuster ran
                warn!("Inventory claim was lost before completion; stock may be reduced twice");
                counter!("storefront.inventory.claim_lost", 1);
                InventoryOutcome::Reduced
            }
            Err(e) => {
                error!(error = %e, "Stock reduced but the order flag could not be set");
                counter!("storefront.inventory.reduction_failed", 1);
                InventoryOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderItem, GUEST_USER_ID};
    use crate::repositories::InMemoryOrderStore;
    use rust_decimal_macros::dec;

    fn order() -> Order {
        Order::new(
            "O1",
            GUEST_USER_ID,
            "a@x.com",
            vec![OrderItem {
                product_id: "p-1".into(),
                quantity: 3,
                price: dec!(1),
            }],
            "KES",
        )
    }

    async fn store_with_order() -> Arc<InMemoryOrderStore> {
        let store = Arc::new(InMemoryOrderStore::new());
        store.create(order()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn reduces_once_and_sets_flag() {
        let store = store_with_order().await;
        let mut adjuster = MockInventoryAdjuster::new();
        adjuster
            .expect_reduce()
            .withf(|lines| lines.len() == 1 && lines[0].quantity == 3)
            .times(1)
            .returning(|_| Ok(()));
        let guard = InventoryReductionGuard::new(store.clone(), Arc::new(adjuster), Duration::seconds(300));

        assert_eq!(guard.reduce_once(&order()).await, InventoryOutcome::Reduced);
        // a stale snapshot still saying `false` must not reduce again
        assert_eq!(guard.reduce_once(&order()).await, InventoryOutcome::AlreadyReduced);

        let stored = store.get("O1").await.unwrap().unwrap();
        assert!(stored.inventory_reduced);
        assert!(stored.inventory_reduced_at.is_some());
    }

    #[tokio::test]
    async fn adjuster_failure_releases_the_claim() {
        let store = store_with_order().await;
        let mut adjuster = MockInventoryAdjuster::new();
        let mut seq = mockall::Sequence::new();
        adjuster
            .expect_reduce()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(ServiceError::InventoryError("warehouse offline".into())));
        adjuster
            .expect_reduce()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let guard = InventoryReductionGuard::new(store.clone(), Arc::new(adjuster), Duration::seconds(300));

        assert_eq!(guard.reduce_once(&order()).await, InventoryOutcome::Failed);
        let stored = store.get("O1").await.unwrap().unwrap();
        assert!(!stored.inventory_reduced);
        assert!(stored.inventory_claim_token.is_none());

        assert_eq!(guard.reduce_once(&order()).await, InventoryOutcome::Reduced);
    }

    #[tokio::test]
    async fn live_foreign_claim_skips_adjustment() {
        let store = store_with_order().await;
        let now = Utc::now();
        assert!(store
            .claim_inventory_reduction("O1", Uuid::new_v4(), now, now - Duration::seconds(300))
            .await
            .unwrap());

        let mut adjuster = MockInventoryAdjuster::new();
        adjuster.expect_reduce().never();
        let guard = InventoryReductionGuard::new(store, Arc::new(adjuster), Duration::seconds(300));

        assert_eq!(
            guard.reduce_once(&order()).await,
            InventoryOutcome::ClaimedElsewhere
        );
    }
}
