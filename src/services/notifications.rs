use crate::{
    db::DbPool,
    entities::notification::{self, Entity as NotificationEntity, Model as NotificationModel},
    entities::NotificationKind,
    errors::ServiceError,
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    Set,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

pub const DEFAULT_USER_LIMIT: u64 = 20;
pub const DEFAULT_ADMIN_LIMIT: u64 = 50;

/// Input for [`NotificationService::create`].
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    /// `None` broadcasts to every user.
    pub user_id: Option<String>,
    pub metadata: serde_json::Value,
}

/// Persisted, append-only notification sink.
#[derive(Clone)]
pub struct NotificationService {
    db_pool: Arc<DbPool>,
}

impl NotificationService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self, input), fields(kind = %input.kind))]
    pub async fn create(&self, input: NewNotification) -> Result<NotificationModel, ServiceError> {
        let model = notification::ActiveModel {
            id: Set(Uuid::new_v4()),
            kind: Set(input.kind),
            title: Set(input.title),
            message: Set(input.message),
            user_id: Set(input.user_id),
            metadata: Set(input.metadata),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db_pool)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to persist notification");
            ServiceError::DatabaseError(e)
        })?;

        info!(
            notification_id = %model.id,
            kind = %model.kind,
            "[{}] {}: {}",
            model.kind,
            model.title,
            model.message
        );
        Ok(model)
    }

    /// Newest first: the user's own notifications plus broadcasts.
    #[instrument(skip(self))]
    pub async fn for_user(
        &self,
        user_id: &str,
        limit: u64,
    ) -> Result<Vec<NotificationModel>, ServiceError> {
        NotificationEntity::find()
            .filter(
                Condition::any()
                    .add(notification::Column::UserId.eq(user_id))
                    .add(notification::Column::UserId.is_null()),
            )
            .order_by_desc(notification::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)
    }

    #[instrument(skip(self))]
    pub async fn all(&self, limit: u64) -> Result<Vec<NotificationModel>, ServiceError> {
        NotificationEntity::find()
            .order_by_desc(notification::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)
    }

    pub async fn order_confirmed(
        &self,
        order_id: Uuid,
        order_number: &str,
        user_id: Option<&str>,
    ) -> Result<NotificationModel, ServiceError> {
        self.create(NewNotification {
            kind: NotificationKind::OrderConfirmed,
            title: "Order Confirmed".to_string(),
            message: format!(
                "Order {} has been confirmed and is being processed.",
                order_number
            ),
            user_id: user_id.map(str::to_string),
            metadata: json!({ "orderId": order_id, "orderNumber": order_number }),
        })
        .await
    }

    pub async fn invoice_generated(
        &self,
        invoice_id: Uuid,
        invoice_number: &str,
        user_id: Option<&str>,
    ) -> Result<NotificationModel, ServiceError> {
        self.create(NewNotification {
            kind: NotificationKind::InvoiceGenerated,
            title: "Invoice Generated".to_string(),
            message: format!("Invoice {} has been generated.", invoice_number),
            user_id: user_id.map(str::to_string),
            metadata: json!({ "invoiceId": invoice_id, "invoiceNumber": invoice_number }),
        })
        .await
    }

    pub async fn low_stock(
        &self,
        product_id: Uuid,
        product_name: &str,
        current_stock: i32,
        threshold: i32,
    ) -> Result<NotificationModel, ServiceError> {
        self.create(NewNotification {
            kind: NotificationKind::LowStock,
            title: "Low Stock Alert".to_string(),
            message: format!(
                "{} is running low ({} remaining, threshold: {}).",
                product_name, current_stock, threshold
            ),
            user_id: None,
            metadata: json!({
                "productId": product_id,
                "productName": product_name,
                "currentStock": current_stock,
                "threshold": threshold,
            }),
        })
        .await
    }

    /// Broadcast system message.
    pub async fn system(
        &self,
        title: &str,
        message: String,
        metadata: serde_json::Value,
    ) -> Result<NotificationModel, ServiceError> {
        self.create(NewNotification {
            kind: NotificationKind::System,
            title: title.to_string(),
            message,
            user_id: None,
            metadata,
        })
        .await
    }
}
