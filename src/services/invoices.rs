use crate::{
    db::DbPool,
    entities::customer::{Entity as CustomerEntity, Model as CustomerModel},
    entities::invoice::{self, Entity as InvoiceEntity, Model as InvoiceModel},
    entities::sales_order::{Entity as SalesOrderEntity, Model as SalesOrderModel},
    entities::InvoiceStatus,
    errors::ServiceError,
    events::{Event, EventSender},
    services::mail::{InvoiceMail, MailService},
    services::numbering::{next_number, Sequence},
    services::{normalize_paging, Page, PageMeta},
};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

/// Payment terms in days.
pub const PAYMENT_TERMS_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateInvoiceStatusRequest {
    pub status: InvoiceStatus,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct InvoiceQuery {
    pub page: Option<u64>,
    pub limit: Option<u64>,
    #[param(value_type = Option<String>)]
    pub status: Option<InvoiceStatus>,
    pub customer_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InvoiceDetail {
    #[serde(flatten)]
    pub invoice: InvoiceModel,
    pub customer: Option<CustomerModel>,
    pub order: Option<SalesOrderModel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SendInvoiceResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OverdueSweepResult {
    pub marked: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct InvoiceStats {
    pub total: u64,
    pub draft: u64,
    pub sent: u64,
    pub paid: u64,
    pub overdue: u64,
    /// Sum of PAID invoice totals.
    pub total_revenue: Decimal,
}

#[derive(Clone)]
pub struct InvoiceService {
    db_pool: Arc<DbPool>,
    mail: Arc<MailService>,
    event_sender: Arc<EventSender>,
}

impl InvoiceService {
    pub fn new(db_pool: Arc<DbPool>, mail: Arc<MailService>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            mail,
            event_sender,
        }
    }

    /// Issues a SENT invoice for `order`, due after the payment terms.
    #[instrument(skip(self, order), fields(order_id = %order.id, order_number = %order.order_number))]
    pub async fn generate_for_order(
        &self,
        order: &SalesOrderModel,
    ) -> Result<InvoiceModel, ServiceError> {
        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start invoice transaction");
            ServiceError::DatabaseError(e)
        })?;

        let invoice_number = next_number(&txn, Sequence::Invoice).await?;
        let issue_date = Utc::now();

        let invoice = invoice::ActiveModel {
            id: Set(Uuid::new_v4()),
            invoice_number: Set(invoice_number),
            customer_id: Set(order.customer_id),
            order_id: Set(Some(order.id)),
            status: Set(InvoiceStatus::Sent),
            subtotal: Set(order.subtotal),
            tax_amount: Set(order.tax_amount),
            discount: Set(order.discount),
            total: Set(order.total),
            issue_date: Set(issue_date),
            due_date: Set(issue_date + Duration::days(PAYMENT_TERMS_DAYS)),
            paid_date: Set(None),
            notes: Set(None),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to insert invoice");
            ServiceError::DatabaseError(e)
        })?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit invoice");
            ServiceError::DatabaseError(e)
        })?;

        info!(invoice_id = %invoice.id, invoice_number = %invoice.invoice_number, "Invoice generated");
        self.event_sender
            .emit(Event::InvoiceGenerated {
                invoice_id: invoice.id,
                invoice_number: invoice.invoice_number.clone(),
                order_id: invoice.order_id,
            })
            .await;
        Ok(invoice)
    }

    #[instrument(skip(self))]
    pub async fn find_all(&self, query: InvoiceQuery) -> Result<Page<InvoiceDetail>, ServiceError> {
        let (page, limit) = normalize_paging(query.page, query.limit);
        let db = &*self.db_pool;

        let mut select = InvoiceEntity::find();
        if let Some(status) = query.status {
            select = select.filter(invoice::Column::Status.eq(status));
        }
        if let Some(customer_id) = query.customer_id {
            select = select.filter(invoice::Column::CustomerId.eq(customer_id));
        }

        let paginator = select
            .order_by_desc(invoice::Column::CreatedAt)
            .paginate(db, limit);
        let total = paginator.num_items().await.map_err(|e| {
            error!(error = %e, "Failed to count invoices");
            ServiceError::DatabaseError(e)
        })?;
        let invoices = paginator.fetch_page(page - 1).await?;

        Ok(Page {
            data: self.attach_relations(invoices).await?,
            meta: PageMeta::new(total, page, limit),
        })
    }

    #[instrument(skip(self))]
    pub async fn find_by_id(&self, id: Uuid) -> Result<InvoiceDetail, ServiceError> {
        let invoice = self.find_model(id).await?;
        self.attach_relations(vec![invoice])
            .await?
            .pop()
            .ok_or_else(|| ServiceError::NotFound(format!("Invoice {} not found", id)))
    }

    /// Direct status write. PAID stamps `paid_date`.
    #[instrument(skip(self), fields(invoice_id = %id, new_status = %status))]
    pub async fn update_status(
        &self,
        id: Uuid,
        status: InvoiceStatus,
    ) -> Result<InvoiceModel, ServiceError> {
        let invoice = self.find_model(id).await?;
        let old_status = invoice.status;

        let mut active: invoice::ActiveModel = invoice.into();
        active.status = Set(status);
        if status == InvoiceStatus::Paid {
            active.paid_date = Set(Some(Utc::now()));
        }
        let updated = active.update(&*self.db_pool).await.map_err(|e| {
            error!(error = %e, "Failed to update invoice status");
            ServiceError::DatabaseError(e)
        })?;

        info!(old_status = %old_status, "Invoice status updated");
        self.event_sender
            .emit(Event::InvoiceStatusChanged {
                invoice_id: id,
                old_status,
                new_status: status,
            })
            .await;
        Ok(updated)
    }

    /// Mails the invoice to its customer. A DRAFT invoice becomes SENT once
    /// the mail goes out.
    #[instrument(skip(self), fields(invoice_id = %id))]
    pub async fn send_invoice(&self, id: Uuid) -> Result<SendInvoiceResponse, ServiceError> {
        let invoice = self.find_model(id).await?;
        if invoice.status == InvoiceStatus::Paid {
            return Err(ServiceError::InvalidState(
                "Cannot send a paid invoice".to_string(),
            ));
        }

        let customer = CustomerEntity::find_by_id(invoice.customer_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Customer {} not found", invoice.customer_id))
            })?;

        let mail = self.mail.invoice_email(&InvoiceMail {
            invoice_number: invoice.invoice_number.clone(),
            customer_name: customer.name.clone(),
            customer_email: customer.email.clone(),
            total: invoice.total,
            due_date: invoice.due_date,
        });
        let result = self.mail.send(mail).await;

        if result.success && invoice.status == InvoiceStatus::Draft {
            InvoiceEntity::update_many()
                .col_expr(invoice::Column::Status, Expr::value(InvoiceStatus::Sent))
                .col_expr(invoice::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(invoice::Column::Id.eq(id))
                .filter(invoice::Column::Status.eq(InvoiceStatus::Draft))
                .exec(&*self.db_pool)
                .await?;
            self.event_sender
                .emit(Event::InvoiceStatusChanged {
                    invoice_id: id,
                    old_status: InvoiceStatus::Draft,
                    new_status: InvoiceStatus::Sent,
                })
                .await;
        } else if !result.success {
            warn!(invoice_number = %invoice.invoice_number, "Invoice email was not delivered");
        }

        Ok(SendInvoiceResponse {
            success: result.success,
            message: format!("Invoice {} sent to {}", invoice.invoice_number, customer.email),
        })
    }

    /// SENT invoices past their due date become OVERDUE. Safe to re-run.
    #[instrument(skip(self))]
    pub async fn mark_overdue_invoices(&self) -> Result<OverdueSweepResult, ServiceError> {
        let now = Utc::now();
        let res = InvoiceEntity::update_many()
            .col_expr(invoice::Column::Status, Expr::value(InvoiceStatus::Overdue))
            .col_expr(invoice::Column::UpdatedAt, Expr::value(now))
            .filter(invoice::Column::Status.eq(InvoiceStatus::Sent))
            .filter(invoice::Column::DueDate.lt(now))
            .exec(&*self.db_pool)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to mark overdue invoices");
                ServiceError::DatabaseError(e)
            })?;

        if res.rows_affected > 0 {
            info!(marked = res.rows_affected, "Invoices marked overdue");
            self.event_sender
                .emit(Event::InvoicesMarkedOverdue(res.rows_affected))
                .await;
        }
        Ok(OverdueSweepResult {
            marked: res.rows_affected,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_stats(&self) -> Result<InvoiceStats, ServiceError> {
        let db = &*self.db_pool;
        let count = |status: InvoiceStatus| {
            InvoiceEntity::find()
                .filter(invoice::Column::Status.eq(status))
                .count(db)
        };

        let total = InvoiceEntity::find().count(db).await?;
        let draft = count(InvoiceStatus::Draft).await?;
        let sent = count(InvoiceStatus::Sent).await?;
        let paid = count(InvoiceStatus::Paid).await?;
        let overdue = count(InvoiceStatus::Overdue).await?;

        let paid_totals: Vec<Decimal> = InvoiceEntity::find()
            .select_only()
            .column(invoice::Column::Total)
            .filter(invoice::Column::Status.eq(InvoiceStatus::Paid))
            .into_tuple()
            .all(db)
            .await?;

        Ok(InvoiceStats {
            total,
            draft,
            sent,
            paid,
            overdue,
            total_revenue: paid_totals.into_iter().sum(),
        })
    }

    async fn find_model(&self, id: Uuid) -> Result<InvoiceModel, ServiceError> {
        InvoiceEntity::find_by_id(id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Invoice {} not found", id)))
    }

    async fn attach_relations(
        &self,
        invoices: Vec<InvoiceModel>,
    ) -> Result<Vec<InvoiceDetail>, ServiceError> {
        if invoices.is_empty() {
            return Ok(Vec::new());
        }
        let db = &*self.db_pool;

        let customer_ids: BTreeSet<Uuid> = invoices.iter().map(|i| i.customer_id).collect();
        let order_ids: BTreeSet<Uuid> = invoices.iter().filter_map(|i| i.order_id).collect();

        let customers: HashMap<Uuid, CustomerModel> = CustomerEntity::find()
            .filter(crate::entities::customer::Column::Id.is_in(customer_ids))
            .all(db)
            .await?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();

        let orders: HashMap<Uuid, SalesOrderModel> = if order_ids.is_empty() {
            HashMap::new()
        } else {
            SalesOrderEntity::find()
                .filter(crate::entities::sales_order::Column::Id.is_in(order_ids))
                .all(db)
                .await?
                .into_iter()
                .map(|o| (o.id, o))
                .collect()
        };

        Ok(invoices
            .into_iter()
            .map(|invoice| InvoiceDetail {
                customer: customers.get(&invoice.customer_id).cloned(),
                order: invoice.order_id.and_then(|id| orders.get(&id).cloned()),
                invoice,
            })
            .collect())
    }
}
