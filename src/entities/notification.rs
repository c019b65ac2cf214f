use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::ActiveValue::Set;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationKind {
    #[sea_orm(string_value = "order_created")]
    OrderCreated,
    #[sea_orm(string_value = "order_confirmed")]
    OrderConfirmed,
    #[sea_orm(string_value = "order_shipped")]
    OrderShipped,
    #[sea_orm(string_value = "order_delivered")]
    OrderDelivered,
    #[sea_orm(string_value = "invoice_generated")]
    InvoiceGenerated,
    #[sea_orm(string_value = "invoice_paid")]
    InvoicePaid,
    #[sea_orm(string_value = "low_stock")]
    LowStock,
    #[sea_orm(string_value = "system")]
    System,
}

/// Persisted notification. `user_id = None` is a broadcast.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize, ToSchema)]
#[sea_orm(table_name = "notifications")]
#[schema(as = Notification)]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub user_id: Option<String>,
    #[schema(value_type = Object)]
    pub metadata: Json,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        if !insert {
            return Err(DbErr::Custom("notifications are append-only".to_string()));
        }
        let mut active_model = self;
        if active_model.created_at.is_not_set() {
            active_model.created_at = Set(Utc::now());
        }
        Ok(active_model)
    }
}
