use crate::{
    db::DbPool,
    entities::customer::{self, Entity as CustomerEntity, Model as CustomerModel},
    entities::order_item::{self, Entity as OrderItemEntity, Model as OrderItemModel},
    entities::product::{self, Entity as ProductEntity, Model as ProductModel},
    entities::sales_order::{self, Entity as SalesOrderEntity, Model as SalesOrderModel},
    entities::{JobState, OrderStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    message_queue::{JobOptions, JobQueue},
    services::numbering::{next_number, Sequence},
    services::order_processor::{job_id_for, ProcessOrderPayload, PROCESS_ORDER_JOB},
    services::order_processor::aggregate_demand,
    services::{normalize_paging, validate_money, validate_tax_rate, Page, PageMeta},
};
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct OrderItemInput {
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 1000000, message = "Quantity must be between 1 and 1000000"))]
    pub quantity: i32,
    #[validate(custom = "validate_money")]
    pub discount: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateOrderRequest {
    pub customer_id: Uuid,
    #[validate(length(min = 1, message = "Order must contain at least one item"))]
    pub items: Vec<OrderItemInput>,
    /// Percent, defaults to 0.
    #[validate(custom = "validate_tax_rate")]
    pub tax_rate: Option<Decimal>,
    #[validate(custom = "validate_money")]
    pub discount: Option<Decimal>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OrderQuery {
    pub page: Option<u64>,
    pub limit: Option<u64>,
    #[param(value_type = Option<String>)]
    pub status: Option<OrderStatus>,
    pub customer_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderItemDetail {
    #[serde(flatten)]
    pub item: OrderItemModel,
    pub product: Option<ProductModel>,
}

/// Order with its customer and items in submission order.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderDetail {
    #[serde(flatten)]
    pub order: SalesOrderModel,
    pub customer: Option<CustomerModel>,
    pub items: Vec<OrderItemDetail>,
}

/// The confirmed order's own fields plus `job_id` and `message`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConfirmOrderResponse {
    #[serde(flatten)]
    pub order: SalesOrderModel,
    pub job_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProcessingStatus {
    pub order_id: Uuid,
    pub order_status: OrderStatus,
    /// `not_started`, or the job state.
    pub processing_status: String,
    pub progress: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts_made: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricedLine {
    pub unit_price: Decimal,
    pub quantity: i32,
    pub discount: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderPricing {
    pub lines: Vec<PricedLine>,
    pub subtotal: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
}

/// Rounds to cents, halves away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn pricing_overflow() -> ServiceError {
    ServiceError::ValidationError("Order amounts are too large".to_string())
}

/// Prices an order from `(unit_price, quantity, line_discount)` triples.
///
/// `line total = unit_price * quantity - line_discount`,
/// `tax = round(subtotal * tax_rate / 100)`,
/// `total = subtotal + tax - discount`.
///
/// Fails with `ValidationError` when an amount leaves the decimal range.
pub fn price_order<I>(
    lines: I,
    tax_rate: Decimal,
    discount: Decimal,
) -> Result<OrderPricing, ServiceError>
where
    I: IntoIterator<Item = (Decimal, i32, Decimal)>,
{
    let lines = lines
        .into_iter()
        .map(|(unit_price, quantity, line_discount)| -> Result<PricedLine, ServiceError> {
            let total = unit_price
                .checked_mul(Decimal::from(quantity))
                .and_then(|gross| gross.checked_sub(line_discount))
                .ok_or_else(pricing_overflow)?;
            Ok(PricedLine {
                unit_price,
                quantity,
                discount: line_discount,
                total,
            })
        })
        .collect::<Result<Vec<PricedLine>, ServiceError>>()?;

    let subtotal = lines
        .iter()
        .try_fold(Decimal::ZERO, |acc, line| acc.checked_add(line.total))
        .ok_or_else(pricing_overflow)?;
    let tax_amount = subtotal
        .checked_mul(tax_rate)
        .and_then(|taxed| taxed.checked_div(Decimal::ONE_HUNDRED))
        .map(round_money)
        .ok_or_else(pricing_overflow)?;
    let total = subtotal
        .checked_add(tax_amount)
        .and_then(|gross| gross.checked_sub(discount))
        .ok_or_else(pricing_overflow)?;

    Ok(OrderPricing {
        lines,
        subtotal,
        tax_rate,
        tax_amount,
        discount,
        total,
    })
}

#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    queue: JobQueue,
}

impl OrderService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>, queue: JobQueue) -> Self {
        Self {
            db_pool,
            event_sender,
            queue,
        }
    }

    /// Creates a DRAFT order with a fresh `SO-` number. Item prices are
    /// snapshotted from the catalog.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id, items = request.items.len()))]
    pub async fn create(
        &self,
        user_id: &str,
        request: CreateOrderRequest,
    ) -> Result<OrderDetail, ServiceError> {
        request.validate()?;
        for item in &request.items {
            item.validate()?;
        }
        aggregate_demand(request.items.iter().map(|i| (i.product_id, i.quantity)))?;

        let db = &*self.db_pool;

        let wanted: BTreeSet<Uuid> = request.items.iter().map(|i| i.product_id).collect();
        let products: HashMap<Uuid, ProductModel> = ProductEntity::find()
            .filter(product::Column::Id.is_in(wanted.iter().copied()))
            .all(db)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to load order products");
                ServiceError::DatabaseError(e)
            })?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        if products.len() != wanted.len() {
            let missing: Vec<String> = wanted
                .iter()
                .filter(|id| !products.contains_key(id))
                .map(Uuid::to_string)
                .collect();
            warn!(missing = ?missing, "Order references unknown products");
            return Err(ServiceError::BadRequest(format!(
                "One or more products not found: {}",
                missing.join(", ")
            )));
        }
        if let Some(inactive) = products.values().find(|p| !p.is_active) {
            return Err(ServiceError::ValidationError(format!(
                "Product {} is no longer available",
                inactive.sku
            )));
        }

        CustomerEntity::find_by_id(request.customer_id)
            .one(db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Customer {} not found", request.customer_id))
            })?;

        let pricing = price_order(
            request.items.iter().map(|item| {
                (
                    products[&item.product_id].price,
                    item.quantity,
                    item.discount.unwrap_or(Decimal::ZERO),
                )
            }),
            request.tax_rate.unwrap_or(Decimal::ZERO),
            request.discount.unwrap_or(Decimal::ZERO),
        )?;
        if pricing.lines.iter().any(|l| l.total.is_sign_negative() && !l.total.is_zero()) {
            return Err(ServiceError::ValidationError(
                "Item discount cannot exceed the line amount".to_string(),
            ));
        }
        if pricing.total.is_sign_negative() && !pricing.total.is_zero() {
            return Err(ServiceError::ValidationError(
                "Discount cannot exceed the order amount".to_string(),
            ));
        }

        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for order creation");
            ServiceError::DatabaseError(e)
        })?;

        let order_number = next_number(&txn, Sequence::SalesOrder).await?;
        let order_id = Uuid::new_v4();

        let order = sales_order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.clone()),
            customer_id: Set(request.customer_id),
            user_id: Set(user_id.to_string()),
            status: Set(OrderStatus::Draft),
            subtotal: Set(pricing.subtotal),
            tax_rate: Set(pricing.tax_rate),
            tax_amount: Set(pricing.tax_amount),
            discount: Set(pricing.discount),
            total: Set(pricing.total),
            notes: Set(request.notes.clone()),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to insert order");
            ServiceError::DatabaseError(e)
        })?;

        for (position, (input, line)) in request.items.iter().zip(&pricing.lines).enumerate() {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(input.product_id),
                position: Set(position as i32),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                discount: Set(line.discount),
                total: Set(line.total),
            }
            .insert(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %order_id, "Failed to insert order item");
                ServiceError::DatabaseError(e)
            })?;
        }

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit order creation");
            ServiceError::DatabaseError(e)
        })?;

        info!(order_id = %order_id, order_number = %order_number, total = %order.total, "Order created");
        self.event_sender
            .emit(Event::OrderCreated {
                order_id,
                order_number,
            })
            .await;

        self.find_by_id(order_id).await
    }

    #[instrument(skip(self))]
    pub async fn find_all(&self, query: OrderQuery) -> Result<Page<OrderDetail>, ServiceError> {
        let (page, limit) = normalize_paging(query.page, query.limit);
        let db = &*self.db_pool;

        let mut select = SalesOrderEntity::find();
        if let Some(status) = query.status {
            select = select.filter(sales_order::Column::Status.eq(status));
        }
        if let Some(customer_id) = query.customer_id {
            select = select.filter(sales_order::Column::CustomerId.eq(customer_id));
        }

        let paginator = select
            .order_by_desc(sales_order::Column::CreatedAt)
            .paginate(db, limit);
        let total = paginator.num_items().await.map_err(|e| {
            error!(error = %e, "Failed to count orders");
            ServiceError::DatabaseError(e)
        })?;
        let orders = paginator.fetch_page(page - 1).await.map_err(|e| {
            error!(error = %e, page, limit, "Failed to fetch orders page");
            ServiceError::DatabaseError(e)
        })?;

        Ok(Page {
            data: load_details(db, orders).await?,
            meta: PageMeta::new(total, page, limit),
        })
    }

    #[instrument(skip(self))]
    pub async fn find_by_id(&self, order_id: Uuid) -> Result<OrderDetail, ServiceError> {
        let db = &*self.db_pool;
        let order = find_order(db, order_id).await?;
        load_details(db, vec![order])
            .await?
            .pop()
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    /// DRAFT -> CONFIRMED, enqueueing the processing job in the same transaction.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn confirm_order(
        &self,
        order_id: Uuid,
        user_id: &str,
    ) -> Result<ConfirmOrderResponse, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for order confirmation");
            ServiceError::DatabaseError(e)
        })?;

        let order = find_order(&txn, order_id).await?;
        if order.status != OrderStatus::Draft {
            return Err(ServiceError::InvalidState(
                "Can only confirm draft orders".to_string(),
            ));
        }

        let confirmed = SalesOrderEntity::update_many()
            .col_expr(sales_order::Column::Status, Expr::value(OrderStatus::Confirmed))
            .col_expr(sales_order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(sales_order::Column::Id.eq(order_id))
            .filter(sales_order::Column::Status.eq(OrderStatus::Draft))
            .exec(&txn)
            .await?;
        if confirmed.rows_affected == 0 {
            return Err(ServiceError::InvalidState(
                "Can only confirm draft orders".to_string(),
            ));
        }

        let payload = ProcessOrderPayload {
            order_id,
            user_id: user_id.to_string(),
        };
        let job = self
            .queue
            .add(
                &txn,
                PROCESS_ORDER_JOB,
                &payload,
                JobOptions {
                    job_id: Some(job_id_for(order_id)),
                    priority: 1,
                    ..Default::default()
                },
            )
            .await?;

        let order = find_order(&txn, order_id).await?;
        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit order confirmation");
            ServiceError::DatabaseError(e)
        })?;

        info!(order_number = %order.order_number, job_id = %job.id, "Order confirmed and queued");
        self.event_sender
            .emit(Event::OrderConfirmed {
                order_id,
                job_id: job.id.clone(),
            })
            .await;

        Ok(ConfirmOrderResponse {
            order,
            job_id: job.id,
            message: "Order confirmed and queued for processing".to_string(),
        })
    }

    #[instrument(skip(self))]
    pub async fn get_processing_status(
        &self,
        order_id: Uuid,
    ) -> Result<ProcessingStatus, ServiceError> {
        let order = find_order(&*self.db_pool, order_id).await?;
        let job = self.queue.get_job(&job_id_for(order_id)).await?;

        Ok(match job {
            None => ProcessingStatus {
                order_id,
                order_status: order.status,
                processing_status: "not_started".to_string(),
                progress: 0,
                attempts_made: None,
                failed_reason: None,
            },
            Some(job) => ProcessingStatus {
                order_id,
                order_status: order.status,
                processing_status: job.state.to_string(),
                progress: job.progress,
                attempts_made: Some(job.attempts_made),
                failed_reason: job.last_error.filter(|_| job.state == JobState::Failed),
            },
        })
    }

    /// Direct status write; only the existence of the order is checked.
    #[instrument(skip(self), fields(order_id = %order_id, new_status = %status))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
    ) -> Result<SalesOrderModel, ServiceError> {
        let db = &*self.db_pool;
        let order = find_order(db, order_id).await?;
        let old_status = order.status;

        let mut active: sales_order::ActiveModel = order.into();
        active.status = Set(status);
        let updated = active.update(db).await.map_err(|e| {
            error!(error = %e, "Failed to update order status");
            ServiceError::DatabaseError(e)
        })?;

        info!(old_status = %old_status, "Order status updated");
        self.event_sender
            .emit(Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status: status,
            })
            .await;
        Ok(updated)
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn delete(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await?;

        let order = find_order(&txn, order_id).await?;
        if order.status != OrderStatus::Draft {
            return Err(ServiceError::InvalidState(
                "Can only delete draft orders".to_string(),
            ));
        }

        OrderItemEntity::delete_many()
            .filter(order_item::Column::OrderId.eq(order_id))
            .exec(&txn)
            .await?;
        SalesOrderEntity::delete_by_id(order_id).exec(&txn).await?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit order deletion");
            ServiceError::DatabaseError(e)
        })?;

        info!(order_number = %order.order_number, "Draft order deleted");
        self.event_sender.emit(Event::OrderDeleted(order_id)).await;
        Ok(())
    }
}

pub(crate) async fn find_order<C>(conn: &C, order_id: Uuid) -> Result<SalesOrderModel, ServiceError>
where
    C: ConnectionTrait,
{
    SalesOrderEntity::find_by_id(order_id)
        .one(conn)
        .await
        .map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to fetch order");
            ServiceError::DatabaseError(e)
        })?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

/// Attaches customers and items (with products) to a batch of orders using
/// one query per relation.
pub(crate) async fn load_details<C>(
    conn: &C,
    orders: Vec<SalesOrderModel>,
) -> Result<Vec<OrderDetail>, ServiceError>
where
    C: ConnectionTrait,
{
    if orders.is_empty() {
        return Ok(Vec::new());
    }

    let order_ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
    let customer_ids: BTreeSet<Uuid> = orders.iter().map(|o| o.customer_id).collect();

    let customers: HashMap<Uuid, CustomerModel> = CustomerEntity::find()
        .filter(customer::Column::Id.is_in(customer_ids))
        .all(conn)
        .await?
        .into_iter()
        .map(|c| (c.id, c))
        .collect();

    let mut items: HashMap<Uuid, Vec<OrderItemDetail>> = HashMap::new();
    for (item, product) in OrderItemEntity::find()
        .filter(order_item::Column::OrderId.is_in(order_ids))
        .order_by_asc(order_item::Column::Position)
        .find_also_related(ProductEntity)
        .all(conn)
        .await?
    {
        items
            .entry(item.order_id)
            .or_default()
            .push(OrderItemDetail { item, product });
    }

    Ok(orders
        .into_iter()
        .map(|order| OrderDetail {
            customer: customers.get(&order.customer_id).cloned(),
            items: items.remove(&order.id).unwrap_or_default(),
            order,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn prices_reference_scenario() {
        let pricing = price_order([(dec!(100), 1, dec!(0))], dec!(8), dec!(0)).unwrap();
        assert_eq!(pricing.subtotal, dec!(100));
        assert_eq!(pricing.tax_amount, dec!(8));
        assert_eq!(pricing.total, dec!(108));
    }

    #[test]
    fn line_discounts_reduce_subtotal() {
        let pricing = price_order(
            [(dec!(100), 1, dec!(0)), (dec!(50), 2, dec!(10))],
            dec!(0),
            dec!(5),
        )
        .unwrap();
        assert_eq!(pricing.lines[1].total, dec!(90));
        assert_eq!(pricing.subtotal, dec!(190));
        assert_eq!(pricing.total, dec!(185));
    }

    #[test]
    fn overflowing_amounts_are_rejected() {
        let err = price_order([(dec!(100), 1, dec!(0))], Decimal::MAX, dec!(0)).unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
        let err = price_order([(Decimal::MAX, 2, dec!(0))], dec!(0), dec!(0)).unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }

    #[test]
    fn out_of_range_inputs_fail_validation() {
        let request = CreateOrderRequest {
            customer_id: Uuid::new_v4(),
            items: vec![OrderItemInput {
                product_id: Uuid::new_v4(),
                quantity: 1,
                discount: None,
            }],
            tax_rate: Some(dec!(101)),
            discount: None,
            notes: None,
        };
        assert!(request.validate().is_err());

        let item = OrderItemInput {
            product_id: Uuid::new_v4(),
            quantity: i32::MAX,
            discount: Some(Decimal::MAX),
        };
        assert!(item.validate().is_err());
    }

    #[test]
    fn empty_items_fail_validation() {
        let request = CreateOrderRequest {
            customer_id: Uuid::new_v4(),
            items: vec![],
            tax_rate: None,
            discount: None,
            notes: None,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn zero_quantity_fails_validation() {
        let item = OrderItemInput {
            product_id: Uuid::new_v4(),
            quantity: 0,
            discount: None,
        };
        assert!(item.validate().is_err());
    }

    fn money() -> impl Strategy<Value = Decimal> {
        (0i64..1_000_000).prop_map(|cents| Decimal::new(cents, 2))
    }

    proptest! {
        #[test]
        fn totals_satisfy_pricing_invariants(
            lines in prop::collection::vec((money(), 1i32..50, money()), 1..8),
            tax_rate in (0i64..3_000).prop_map(|bp| Decimal::new(bp, 2)),
            discount in money(),
        ) {
            let pricing = price_order(lines.clone(), tax_rate, discount).unwrap();

            let expected_subtotal: Decimal = lines
                .iter()
                .map(|(price, qty, disc)| *price * Decimal::from(*qty) - *disc)
                .sum();
            prop_assert_eq!(pricing.subtotal, expected_subtotal);
            prop_assert_eq!(pricing.total, pricing.subtotal + pricing.tax_amount - pricing.discount);

            let exact_tax = pricing.subtotal * tax_rate / Decimal::ONE_HUNDRED;
            prop_assert!((pricing.tax_amount - exact_tax).abs() <= dec!(0.005));
        }
    }
}
