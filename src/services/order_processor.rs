use crate::{
    db::DbPool,
    entities::inventory_log,
    entities::job,
    entities::product::{self, Entity as ProductEntity, Model as ProductModel},
    entities::sales_order::{self, Entity as SalesOrderEntity},
    entities::OrderStatus,
    errors::ServiceError,
    events::{Event, EventSender},
    message_queue::{JobContext, JobHandler},
    services::invoices::InvoiceService,
    services::mail::{MailLineItem, MailService, OrderConfirmationMail},
    services::notifications::NotificationService,
    services::orders::{find_order, load_details, OrderDetail},
};
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

pub const ORDER_QUEUE: &str = "order-processing";
pub const PROCESS_ORDER_JOB: &str = "process-order";

/// Job ids are derived from the order so one order maps to at most one job.
pub fn job_id_for(order_id: Uuid) -> String {
    format!("order-{}", order_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOrderPayload {
    pub order_id: Uuid,
    pub user_id: String,
}

/// Stored as the job result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOrderOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProcessOrderOutcome {
    fn skipped(reason: String) -> Self {
        Self {
            success: false,
            invoice_id: None,
            reason: Some(reason),
        }
    }
}

/// Units needed per product, in first-seen item order. An order may list the
/// same product on several lines.
pub fn aggregate_demand<I>(lines: I) -> Result<Vec<(Uuid, i32)>, ServiceError>
where
    I: IntoIterator<Item = (Uuid, i32)>,
{
    let mut demand: Vec<(Uuid, i32)> = Vec::new();
    for (product_id, quantity) in lines {
        match demand.iter_mut().find(|(id, _)| *id == product_id) {
            Some((_, total)) => {
                *total = total.checked_add(quantity).ok_or_else(|| {
                    ServiceError::ValidationError(format!(
                        "Quantity ordered for product {} is too large",
                        product_id
                    ))
                })?;
            }
            None => demand.push((product_id, quantity)),
        }
    }
    Ok(demand)
}

fn insufficient_stock(product: &ProductModel, needed: i32) -> ServiceError {
    ServiceError::InsufficientStock(format!(
        "Insufficient stock for {}: need {}, have {}",
        product.name, needed, product.stock_quantity
    ))
}

/// Background fulfillment of a confirmed order: stock, invoice, mail,
/// notifications, then SHIPPED.
#[derive(Clone)]
pub struct OrderProcessor {
    db_pool: Arc<DbPool>,
    invoices: Arc<InvoiceService>,
    notifications: Arc<NotificationService>,
    mail: Arc<MailService>,
    event_sender: Arc<EventSender>,
}

impl OrderProcessor {
    pub fn new(
        db_pool: Arc<DbPool>,
        invoices: Arc<InvoiceService>,
        notifications: Arc<NotificationService>,
        mail: Arc<MailService>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db_pool,
            invoices,
            notifications,
            mail,
            event_sender,
        }
    }

    #[instrument(skip(self, payload, ctx), fields(order_id = %payload.order_id, job_id = %ctx.job_id()))]
    pub async fn process(
        &self,
        payload: &ProcessOrderPayload,
        ctx: &JobContext,
    ) -> Result<ProcessOrderOutcome, ServiceError> {
        let db = &*self.db_pool;

        let order = find_order(db, payload.order_id).await?;
        let detail = load_details(db, vec![order])
            .await?
            .pop()
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", payload.order_id)))?;
        ctx.progress(10).await;

        if detail.order.status != OrderStatus::Confirmed {
            info!(status = %detail.order.status, "Order is not awaiting processing, skipping");
            return Ok(ProcessOrderOutcome::skipped(format!(
                "Order is {}, expected {}",
                detail.order.status,
                OrderStatus::Confirmed
            )));
        }

        let demand = aggregate_demand(
            detail
                .items
                .iter()
                .map(|line| (line.item.product_id, line.item.quantity)),
        )?;
        self.check_stock(&detail, &demand)?;
        ctx.progress(30).await;

        let restocked = self.commit_inventory(&detail, &demand).await?;
        ctx.progress(60).await;
        self.alert_low_stock(&restocked).await;

        let invoice = self.invoices.generate_for_order(&detail.order).await?;
        ctx.progress(80).await;

        self.send_confirmation(&detail).await;

        let user_id = Some(payload.user_id.as_str());
        if let Err(e) = self
            .notifications
            .order_confirmed(detail.order.id, &detail.order.order_number, user_id)
            .await
        {
            warn!(error = %e, "Failed to record order notification");
        }
        if let Err(e) = self
            .notifications
            .invoice_generated(invoice.id, &invoice.invoice_number, user_id)
            .await
        {
            warn!(error = %e, "Failed to record invoice notification");
        }
        ctx.progress(90).await;

        SalesOrderEntity::update_many()
            .col_expr(sales_order::Column::Status, Expr::value(OrderStatus::Shipped))
            .col_expr(sales_order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(sales_order::Column::Id.eq(detail.order.id))
            .exec(db)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to mark order shipped");
                ServiceError::DatabaseError(e)
            })?;
        ctx.progress(100).await;

        info!(
            order_number = %detail.order.order_number,
            invoice_number = %invoice.invoice_number,
            "Order processed"
        );
        self.event_sender
            .emit(Event::OrderProcessed {
                order_id: detail.order.id,
                invoice_id: invoice.id,
            })
            .await;

        Ok(ProcessOrderOutcome {
            success: true,
            invoice_id: Some(invoice.id),
            reason: None,
        })
    }

    /// Pre-check against the loaded snapshot. The decrement re-checks.
    fn check_stock(&self, detail: &OrderDetail, demand: &[(Uuid, i32)]) -> Result<(), ServiceError> {
        for (product_id, needed) in demand {
            let product = detail
                .items
                .iter()
                .find(|line| line.item.product_id == *product_id)
                .and_then(|line| line.product.as_ref())
                .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

            if product.stock_quantity < *needed {
                warn!(product_id = %product.id, needed, available = product.stock_quantity, "Insufficient stock");
                return Err(insufficient_stock(product, *needed));
            }
        }
        Ok(())
    }

    /// Deducts stock, writes the sale ledger and moves the order to
    /// PROCESSING in one transaction. Returns the products after deduction.
    ///
    /// Every decrement is re-checked against the live row, so a shortfall on
    /// any product rolls back the deductions already made for the others.
    pub async fn commit_inventory(
        &self,
        detail: &OrderDetail,
        demand: &[(Uuid, i32)],
    ) -> Result<Vec<ProductModel>, ServiceError> {
        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start inventory transaction");
            ServiceError::DatabaseError(e)
        })?;

        let mut updated = Vec::with_capacity(demand.len());
        for (product_id, needed) in demand {
            decrement_stock(&txn, *product_id, *needed).await?;

            inventory_log::ActiveModel {
                id: Set(Uuid::new_v4()),
                product_id: Set(*product_id),
                quantity_change: Set(-needed),
                reason: Set("Sale".to_string()),
                reference: Set(Some(detail.order.order_number.clone())),
                ..Default::default()
            }
            .insert(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, product_id = %product_id, "Failed to write inventory log");
                ServiceError::DatabaseError(e)
            })?;

            if let Some(product) = ProductEntity::find_by_id(*product_id).one(&txn).await? {
                updated.push(product);
            }
        }

        let moved = SalesOrderEntity::update_many()
            .col_expr(sales_order::Column::Status, Expr::value(OrderStatus::Processing))
            .col_expr(sales_order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(sales_order::Column::Id.eq(detail.order.id))
            .filter(sales_order::Column::Status.eq(OrderStatus::Confirmed))
            .exec(&txn)
            .await?;
        if moved.rows_affected == 0 {
            return Err(ServiceError::InvalidState(format!(
                "Order {} changed status during processing",
                detail.order.order_number
            )));
        }

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit inventory transaction");
            ServiceError::DatabaseError(e)
        })?;

        for (product_id, needed) in demand {
            if let Some(product) = updated.iter().find(|p| p.id == *product_id) {
                self.event_sender
                    .emit(Event::StockAdjusted {
                        product_id: *product_id,
                        quantity_change: -needed,
                        new_quantity: product.stock_quantity,
                        reason: "Sale".to_string(),
                    })
                    .await;
            }
        }
        Ok(updated)
    }

    async fn alert_low_stock(&self, products: &[ProductModel]) {
        for product in products.iter().filter(|p| p.is_low_stock()) {
            if let Err(e) = self
                .notifications
                .low_stock(
                    product.id,
                    &product.name,
                    product.stock_quantity,
                    product.low_stock_threshold,
                )
                .await
            {
                warn!(error = %e, product_id = %product.id, "Failed to record low stock notification");
            }
            self.event_sender
                .emit(Event::LowStock {
                    product_id: product.id,
                    stock_quantity: product.stock_quantity,
                    threshold: product.low_stock_threshold,
                })
                .await;
        }
    }

    async fn send_confirmation(&self, detail: &OrderDetail) {
        let Some(customer) = detail.customer.as_ref() else {
            warn!(order_id = %detail.order.id, "Order has no customer, skipping confirmation email");
            return;
        };

        let mail = self.mail.order_confirmation(&OrderConfirmationMail {
            order_number: detail.order.order_number.clone(),
            customer_name: customer.name.clone(),
            customer_email: customer.email.clone(),
            total: detail.order.total,
            items: detail
                .items
                .iter()
                .map(|line| MailLineItem {
                    name: line
                        .product
                        .as_ref()
                        .map(|p| p.name.clone())
                        .unwrap_or_else(|| line.item.product_id.to_string()),
                    quantity: line.item.quantity,
                    price: line.item.unit_price,
                })
                .collect(),
        });

        let result = self.mail.send(mail).await;
        if !result.success {
            warn!(order_number = %detail.order.order_number, "Order confirmation email failed");
        }
    }
}

/// Conditional decrement: applies only while enough stock remains.
async fn decrement_stock<C>(conn: &C, product_id: Uuid, quantity: i32) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    let res = ProductEntity::update_many()
        .col_expr(
            product::Column::StockQuantity,
            Expr::col(product::Column::StockQuantity).sub(quantity),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product::Column::Id.eq(product_id))
        .filter(product::Column::StockQuantity.gte(quantity))
        .exec(conn)
        .await?;

    if res.rows_affected == 1 {
        return Ok(());
    }

    let product = ProductEntity::find_by_id(product_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;
    Err(insufficient_stock(&product, quantity))
}

#[async_trait]
impl JobHandler for OrderProcessor {
    async fn handle(
        &self,
        job: &job::Model,
        ctx: &JobContext,
    ) -> Result<serde_json::Value, ServiceError> {
        let payload: ProcessOrderPayload = serde_json::from_value(job.payload.clone())?;
        let outcome = self.process(&payload, ctx).await?;
        Ok(serde_json::to_value(outcome)?)
    }

    async fn on_failed(&self, job: &job::Model, error: &ServiceError, exhausted: bool) {
        let Ok(payload) = serde_json::from_value::<ProcessOrderPayload>(job.payload.clone()) else {
            error!(job_id = %job.id, "Failed job carries an unreadable payload");
            return;
        };
        if exhausted {
            error!(
                job_id = %job.id,
                order_id = %payload.order_id,
                attempts = job.attempts_made,
                error = %error,
                "Order processing failed permanently"
            );
        }
        self.event_sender
            .emit(Event::OrderProcessingFailed {
                order_id: payload.order_id,
                job_id: job.id.clone(),
                error: error.to_string(),
                exhausted,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_derived_from_order() {
        let id = Uuid::nil();
        assert_eq!(job_id_for(id), "order-00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn demand_merges_repeated_products_in_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(
            aggregate_demand([(a, 2), (b, 1), (a, 3)]).unwrap(),
            vec![(a, 5), (b, 1)]
        );
    }

    #[test]
    fn demand_overflow_is_rejected() {
        let a = Uuid::new_v4();
        let err = aggregate_demand([(a, i32::MAX), (a, 1)]).unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }

    #[test]
    fn payload_uses_camel_case() {
        let payload = ProcessOrderPayload {
            order_id: Uuid::nil(),
            user_id: "user-1".into(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["userId"], "user-1");
        assert!(value.get("orderId").is_some());
    }

    #[test]
    fn skipped_outcome_omits_invoice() {
        let value = serde_json::to_value(ProcessOrderOutcome::skipped("Order is SHIPPED".into())).unwrap();
        assert_eq!(value["success"], false);
        assert!(value.get("invoiceId").is_none());
    }
}
