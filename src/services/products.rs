use crate::{
    db::DbPool,
    entities::inventory_log,
    entities::product::{self, Entity as ProductEntity, Model as ProductModel},
    errors::ServiceError,
    events::{Event, EventSender},
    services::{normalize_paging, validate_money, Page, PageMeta},
};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

pub const DEFAULT_LOW_STOCK_THRESHOLD: i32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateProductRequest {
    #[validate(length(min = 1, max = 100, message = "SKU must be between 1 and 100 characters"))]
    pub sku: String,
    #[validate(length(
        min = 1,
        max = 255,
        message = "Product name must be between 1 and 255 characters"
    ))]
    pub name: String,
    pub description: Option<String>,
    #[validate(custom = "validate_money")]
    pub price: Decimal,
    #[validate(custom = "validate_money")]
    pub cost: Option<Decimal>,
    #[validate(range(min = 0, message = "Stock cannot be negative"))]
    pub stock_quantity: Option<i32>,
    #[validate(range(min = 0, message = "Threshold cannot be negative"))]
    pub low_stock_threshold: Option<i32>,
}

/// Catalog fields that can change after creation. Stock has its own endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct UpdateProductRequest {
    #[validate(length(
        min = 1,
        max = 255,
        message = "Product name must be between 1 and 255 characters"
    ))]
    pub name: Option<String>,
    pub description: Option<String>,
    #[validate(custom = "validate_money")]
    pub price: Option<Decimal>,
    #[validate(custom = "validate_money")]
    pub cost: Option<Decimal>,
    #[validate(range(min = 0, message = "Threshold cannot be negative"))]
    pub low_stock_threshold: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StockOperation {
    Add,
    Subtract,
    Set,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct UpdateStockRequest {
    #[validate(range(min = 0, message = "Quantity cannot be negative"))]
    pub quantity: i32,
    pub operation: StockOperation,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ProductQuery {
    pub page: Option<u64>,
    pub limit: Option<u64>,
    /// Matches name or SKU.
    pub search: Option<String>,
    /// Only products at or below their threshold.
    pub low_stock: Option<bool>,
}

/// Stock after applying `op` to `current`. Subtraction clamps at zero.
pub fn apply_stock_operation(current: i32, quantity: i32, op: StockOperation) -> i32 {
    match op {
        StockOperation::Add => current.saturating_add(quantity),
        StockOperation::Subtract => current.saturating_sub(quantity).max(0),
        StockOperation::Set => quantity,
    }
}

#[derive(Clone)]
pub struct ProductService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
}

impl ProductService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    #[instrument(skip(self, request), fields(sku = %request.sku))]
    pub async fn create(&self, request: CreateProductRequest) -> Result<ProductModel, ServiceError> {
        request.validate()?;
        let db = &*self.db_pool;

        let existing = ProductEntity::find()
            .filter(product::Column::Sku.eq(request.sku.clone()))
            .one(db)
            .await?;
        if existing.is_some() {
            return Err(ServiceError::Conflict(format!(
                "Product with SKU {} already exists",
                request.sku
            )));
        }

        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            sku: Set(request.sku),
            name: Set(request.name),
            description: Set(request.description),
            price: Set(request.price),
            cost: Set(request.cost.unwrap_or(Decimal::ZERO)),
            stock_quantity: Set(request.stock_quantity.unwrap_or(0)),
            low_stock_threshold: Set(request
                .low_stock_threshold
                .unwrap_or(DEFAULT_LOW_STOCK_THRESHOLD)),
            is_active: Set(true),
            ..Default::default()
        }
        .insert(db)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to create product");
            ServiceError::DatabaseError(e)
        })?;

        info!(product_id = %model.id, sku = %model.sku, "Product created");
        Ok(model)
    }

    /// Active products, name ascending.
    #[instrument(skip(self))]
    pub async fn find_all(&self, query: ProductQuery) -> Result<Page<ProductModel>, ServiceError> {
        let (page, limit) = normalize_paging(query.page, query.limit);

        let mut select = ProductEntity::find().filter(product::Column::IsActive.eq(true));
        if let Some(term) = query.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            select = select.filter(
                Condition::any()
                    .add(product::Column::Name.contains(term))
                    .add(product::Column::Sku.contains(term)),
            );
        }
        if query.low_stock.unwrap_or(false) {
            select = select.filter(
                Expr::col(product::Column::StockQuantity)
                    .lte(Expr::col(product::Column::LowStockThreshold)),
            );
        }

        let paginator = select
            .order_by_asc(product::Column::Name)
            .paginate(&*self.db_pool, limit);
        let total = paginator.num_items().await.map_err(|e| {
            error!(error = %e, "Failed to count products");
            ServiceError::DatabaseError(e)
        })?;
        let data = paginator.fetch_page(page - 1).await?;

        Ok(Page {
            data,
            meta: PageMeta::new(total, page, limit),
        })
    }

    #[instrument(skip(self))]
    pub async fn find_by_id(&self, id: Uuid) -> Result<ProductModel, ServiceError> {
        ProductEntity::find_by_id(id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))
    }

    /// Updates catalog fields. Existing order lines keep the price they were
    /// created with.
    #[instrument(skip(self, request), fields(product_id = %id))]
    pub async fn update(
        &self,
        id: Uuid,
        request: UpdateProductRequest,
    ) -> Result<ProductModel, ServiceError> {
        request.validate()?;
        let existing = self.find_by_id(id).await?;
        let old_price = existing.price;

        let mut active: product::ActiveModel = existing.into();
        if let Some(name) = request.name {
            active.name = Set(name);
        }
        if let Some(description) = request.description {
            active.description = Set(Some(description));
        }
        if let Some(price) = request.price {
            active.price = Set(price);
        }
        if let Some(cost) = request.cost {
            active.cost = Set(cost);
        }
        if let Some(threshold) = request.low_stock_threshold {
            active.low_stock_threshold = Set(threshold);
        }

        let model = active.update(&*self.db_pool).await.map_err(|e| {
            error!(error = %e, "Failed to update product");
            ServiceError::DatabaseError(e)
        })?;

        info!(old_price = %old_price, new_price = %model.price, "Product updated");
        Ok(model)
    }

    /// Applies a manual stock adjustment and records the signed delta in the
    /// inventory log, both in one transaction.
    #[instrument(skip(self, request), fields(product_id = %id, op = %request.operation, quantity = request.quantity))]
    pub async fn update_stock(
        &self,
        id: Uuid,
        request: UpdateStockRequest,
    ) -> Result<ProductModel, ServiceError> {
        request.validate()?;
        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start stock adjustment transaction");
            ServiceError::DatabaseError(e)
        })?;

        let (before, after) = adjust_stock(&txn, id, request.quantity, request.operation).await?;
        let change = after - before;
        let reason = format!("Stock {}: {} units", request.operation, request.quantity);

        inventory_log::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(id),
            quantity_change: Set(change),
            reason: Set(reason.clone()),
            reference: Set(None),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        let updated = ProductEntity::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit stock adjustment");
            ServiceError::DatabaseError(e)
        })?;

        info!(before, after, "Stock adjusted");
        self.event_sender
            .emit(Event::StockAdjusted {
                product_id: id,
                quantity_change: change,
                new_quantity: after,
                reason,
            })
            .await;
        if updated.is_low_stock() {
            self.event_sender
                .emit(Event::LowStock {
                    product_id: id,
                    stock_quantity: updated.stock_quantity,
                    threshold: updated.low_stock_threshold,
                })
                .await;
        }

        Ok(updated)
    }

    /// Soft delete: the row stays for order history.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: Uuid) -> Result<ProductModel, ServiceError> {
        let existing = self.find_by_id(id).await?;
        let mut active: product::ActiveModel = existing.into();
        active.is_active = Set(false);
        let model = active.update(&*self.db_pool).await?;
        info!(product_id = %id, "Product deactivated");
        Ok(model)
    }

    /// Active products at or below their threshold.
    #[instrument(skip(self))]
    pub async fn low_stock(&self) -> Result<Vec<ProductModel>, ServiceError> {
        ProductEntity::find()
            .filter(product::Column::IsActive.eq(true))
            .filter(
                Expr::col(product::Column::StockQuantity)
                    .lte(Expr::col(product::Column::LowStockThreshold)),
            )
            .order_by_asc(product::Column::StockQuantity)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)
    }
}

/// Guarded read-modify-write of a product's stock on `conn`.
///
/// The update only applies if the row still holds the value that was read,
/// so a concurrent adjustment makes this retry instead of being overwritten.
/// Returns `(before, after)`.
async fn adjust_stock<C>(
    conn: &C,
    id: Uuid,
    quantity: i32,
    op: StockOperation,
) -> Result<(i32, i32), ServiceError>
where
    C: ConnectionTrait,
{
    const MAX_RETRIES: usize = 5;

    for _ in 0..MAX_RETRIES {
        let current = ProductEntity::find_by_id(id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))?;

        let next = apply_stock_operation(current.stock_quantity, quantity, op);
        let res = ProductEntity::update_many()
            .col_expr(product::Column::StockQuantity, Expr::value(next))
            .col_expr(product::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(product::Column::Id.eq(id))
            .filter(product::Column::StockQuantity.eq(current.stock_quantity))
            .exec(conn)
            .await?;

        if res.rows_affected == 1 {
            return Ok((current.stock_quantity, next));
        }
        warn!(product_id = %id, "Concurrent stock change detected, retrying");
    }

    Err(ServiceError::Conflict(format!(
        "Stock for product {} is changing too fast, try again",
        id
    )))
}
