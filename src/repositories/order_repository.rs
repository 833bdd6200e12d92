use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::{Alias, Expr, Func},
    ActiveValue::Set,
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
};
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

use super::{normalized_email, OrderStore};
use crate::entities::order::{
    ActiveModel as OrderActiveModel, Column, Entity as OrderEntity, Model as OrderModel,
};
use crate::errors::ServiceError;
use crate::models::{order::is_unlinked_user, Order, OrderPatch, OrderStatus, PaymentStatus};

/// Order store backed by a relational database through sea-orm.
///
/// Every conditional write is a single `UPDATE ... WHERE` so the database
/// arbitrates concurrent webhook and callback deliveries.
#[derive(Debug, Clone)]
pub struct SeaOrmOrderStore {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmOrderStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn exists(&self, order_id: &str) -> Result<bool, ServiceError> {
        Ok(OrderEntity::find_by_id(order_id.to_string())
            .one(self.db())
            .await?
            .is_some())
    }
}

/// Converts a stored row into the domain model, normalising loose strings.
fn into_domain(model: OrderModel) -> Result<Order, ServiceError> {
    let status = OrderStatus::normalize(Some(&model.status));
    if status.as_ref() != model.status.trim().to_ascii_lowercase() {
        warn!(
            order_id = %model.id,
            stored_status = %model.status,
            "Unrecognised order status treated as pending"
        );
    }

    Ok(Order {
        status,
        payment_status: PaymentStatus::normalize(Some(&model.payment_status)),
        items: serde_json::from_value(model.items)?,
        id: model.id,
        payment_tracking_id: model.payment_tracking_id,
        user_id: model.user_id,
        user_email: model.user_email,
        currency: model.currency,
        inventory_reduced: model.inventory_reduced,
        inventory_reduced_at: model.inventory_reduced_at,
        inventory_claim_token: model.inventory_claim_token,
        inventory_claimed_at: model.inventory_claimed_at,
        payment_confirmed_at: model.payment_confirmed_at,
        gateway_payload: model.gateway_payload,
        ipn_processed_at: model.ipn_processed_at,
        callback_processed_at: model.callback_processed_at,
        created_at: model.created_at,
        updated_at: model.updated_at,
        version: model.version,
    })
}

fn into_active_model(order: Order) -> Result<OrderActiveModel, ServiceError> {
    Ok(OrderActiveModel {
        id: Set(order.id),
        status: Set(order.status.to_string()),
        payment_status: Set(order.payment_status.to_string()),
        payment_tracking_id: Set(order.payment_tracking_id),
        user_id: Set(order.user_id),
        user_email: Set(order.user_email),
        items: Set(serde_json::to_value(&order.items)?),
        currency: Set(order.currency),
        inventory_reduced: Set(order.inventory_reduced),
        inventory_reduced_at: Set(order.inventory_reduced_at),
        inventory_claim_token: Set(order.inventory_claim_token),
        inventory_claimed_at: Set(order.inventory_claimed_at),
        payment_confirmed_at: Set(order.payment_confirmed_at),
        gateway_payload: Set(order.gateway_payload),
        ipn_processed_at: Set(order.ipn_processed_at),
        callback_processed_at: Set(order.callback_processed_at),
        created_at: Set(order.created_at),
        updated_at: Set(order.updated_at),
        version: Set(order.version),
    })
}

#[async_trait]
impl OrderStore for SeaOrmOrderStore {
    #[instrument(skip(self))]
    async fn get(&self, order_id: &str) -> Result<Option<Order>, ServiceError> {
        OrderEntity::find_by_id(order_id.to_string())
            .one(self.db())
            .await?
            .map(into_domain)
            .transpose()
    }

    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn create(&self, order: Order) -> Result<(), ServiceError> {
        if self.exists(&order.id).await? {
            return Err(ServiceError::Conflict(format!(
                "Order {} already exists",
                order.id
            )));
        }
        OrderEntity::insert(into_active_model(order)?)
            .exec(self.db())
            .await?;
        Ok(())
    }

    #[instrument(skip(self, patch))]
    async fn update(
        &self,
        order_id: &str,
        patch: OrderPatch,
        expected_version: Option<i64>,
    ) -> Result<bool, ServiceError> {
        let mut query = OrderEntity::update_many()
            .col_expr(Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .col_expr(Column::Version, Expr::col(Column::Version).add(1))
            .filter(Column::Id.eq(order_id));

        if let Some(status) = patch.status {
            query = query.col_expr(Column::Status, Expr::value(status.to_string()));
        }
        if let Some(payment_status) = patch.payment_status {
            query = query.col_expr(
                Column::PaymentStatus,
                Expr::value(payment_status.to_string()),
            );
        }
        if let Some(tracking_id) = patch.payment_tracking_id {
            query = query.col_expr(Column::PaymentTrackingId, Expr::value(Some(tracking_id)));
        }
        if let Some(user_id) = patch.user_id {
            query = query.col_expr(Column::UserId, Expr::value(user_id));
        }
        if let Some(payload) = patch.gateway_payload {
            query = query.col_expr(Column::GatewayPayload, Expr::value(Some(payload)));
        }
        if let Some(at) = patch.payment_confirmed_at {
            query = query.col_expr(Column::PaymentConfirmedAt, Expr::value(Some(at)));
        }
        if let Some(at) = patch.ipn_processed_at {
            query = query.col_expr(Column::IpnProcessedAt, Expr::value(Some(at)));
        }
        if let Some(at) = patch.callback_processed_at {
            query = query.col_expr(Column::CallbackProcessedAt, Expr::value(Some(at)));
        }
        if let Some(expected) = expected_version {
            query = query.filter(Column::Version.eq(expected));
        }

        let result = query.exec(self.db()).await?;
        if result.rows_affected == 1 {
            return Ok(true);
        }
        if self.exists(order_id).await? {
            Ok(false)
        } else {
            Err(ServiceError::NotFound(format!("Order {} not found", order_id)))
        }
    }

    #[instrument(skip(self, email))]
    async fn find_unlinked_by_email(
        &self,
        email: &str,
        guest_user_id: &str,
        anonymous_prefix: &str,
    ) -> Result<Vec<Order>, ServiceError> {
        // stored emails are compared trimmed and lowercased, like the search email
        let stored_email =
            Func::lower(Func::cust(Alias::new("TRIM")).arg(Expr::col(Column::UserEmail)));
        let rows = OrderEntity::find()
            .filter(Expr::expr(stored_email).eq(normalized_email(email)))
            .order_by_asc(Column::CreatedAt)
            .all(self.db())
            .await?;

        rows.into_iter()
            .filter(|row| is_unlinked_user(&row.user_id, guest_user_id, anonymous_prefix))
            .map(into_domain)
            .collect()
    }

    #[instrument(skip(self))]
    async fn claim_inventory_reduction(
        &self,
        order_id: &str,
        token: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let result = OrderEntity::update_many()
            .col_expr(Column::InventoryClaimToken, Expr::value(Some(token)))
            .col_expr(Column::InventoryClaimedAt, Expr::value(Some(now)))
            .filter(Column::Id.eq(order_id))
            .filter(Column::InventoryReduced.eq(false))
            .filter(
                Condition::any()
                    .add(Column::InventoryClaimToken.is_null())
                    .add(Column::InventoryClaimedAt.is_null())
                    .add(Column::InventoryClaimedAt.lt(stale_before)),
            )
            .exec(self.db())
            .await?;
        Ok(result.rows_affected == 1)
    }

    #[instrument(skip(self))]
    async fn complete_inventory_reduction(
        &self,
        order_id: &str,
        token: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let result = OrderEntity::update_many()
            .col_expr(Column::InventoryReduced, Expr::value(true))
            .col_expr(Column::InventoryReducedAt, Expr::value(Some(at)))
            .col_expr(Column::InventoryClaimToken, Expr::value(Option::<Uuid>::None))
            .col_expr(
                Column::InventoryClaimedAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(Column::Id.eq(order_id))
            .filter(Column::InventoryReduced.eq(false))
            .filter(Column::InventoryClaimToken.eq(token))
            .exec(self.db())
            .await?;
        Ok(result.rows_affected == 1)
    }

    #[instrument(skip(self))]
    async fn release_inventory_claim(
        &self,
        order_id: &str,
        token: Uuid,
    ) -> Result<(), ServiceError> {
        OrderEntity::update_many()
            .col_expr(Column::InventoryClaimToken, Expr::value(Option::<Uuid>::None))
            .col_expr(
                Column::InventoryClaimedAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(Column::Id.eq(order_id))
            .filter(Column::InventoryClaimToken.eq(token))
            .exec(self.db())
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        crate::db::check_connection(self.db()).await
    }
}
