use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// The `orders` table. Line items and the last gateway payload are JSON documents.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Raw stored status; normalised when loaded into the domain model.
    pub status: String,
    pub payment_status: String,
    #[sea_orm(indexed)]
    pub payment_tracking_id: Option<String>,
    #[sea_orm(indexed)]
    pub user_id: String,
    #[sea_orm(indexed)]
    pub user_email: String,
    #[sea_orm(column_type = "Json")]
    pub items: Json,
    pub currency: String,
    pub inventory_reduced: bool,
    pub inventory_reduced_at: Option<DateTime<Utc>>,
    pub inventory_claim_token: Option<Uuid>,
    pub inventory_claimed_at: Option<DateTime<Utc>>,
    pub payment_confirmed_at: Option<DateTime<Utc>>,
    #[sea_orm(column_type = "Json", nullable)]
    pub gateway_payload: Option<Json>,
    pub ipn_processed_at: Option<DateTime<Utc>>,
    pub callback_processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
