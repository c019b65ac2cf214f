pub mod customers;
pub mod health;
pub mod invoices;
pub mod notifications;
pub mod orders;
pub mod products;

use crate::events::EventSender;
use crate::message_queue::JobQueue;
use crate::services::{
    customers::CustomerService,
    invoices::InvoiceService,
    mail::MailService,
    notifications::NotificationService,
    order_processor::{OrderProcessor, ORDER_QUEUE},
    orders::OrderService,
    products::ProductService,
};
use crate::{db::DbPool, ApiResponse};
use axum::{http::StatusCode, Json};
use std::sync::Arc;
use validator::ValidationErrors;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
/// and the background worker.
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<OrderService>,
    pub invoices: Arc<InvoiceService>,
    pub products: Arc<ProductService>,
    pub customers: Arc<CustomerService>,
    pub notifications: Arc<NotificationService>,
    pub mail: Arc<MailService>,
    pub order_processor: Arc<OrderProcessor>,
    pub order_queue: JobQueue,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        mail: Arc<MailService>,
    ) -> Self {
        let order_queue = JobQueue::new(db_pool.clone(), ORDER_QUEUE);

        let notifications = Arc::new(NotificationService::new(db_pool.clone()));
        let invoices = Arc::new(InvoiceService::new(
            db_pool.clone(),
            mail.clone(),
            event_sender.clone(),
        ));
        let products = Arc::new(ProductService::new(db_pool.clone(), event_sender.clone()));
        let customers = Arc::new(CustomerService::new(db_pool.clone()));
        let orders = Arc::new(OrderService::new(
            db_pool.clone(),
            event_sender.clone(),
            order_queue.clone(),
        ));
        let order_processor = Arc::new(OrderProcessor::new(
            db_pool,
            invoices.clone(),
            notifications.clone(),
            mail.clone(),
            event_sender,
        ));

        Self {
            orders,
            invoices,
            products,
            customers,
            notifications,
            mail,
            order_processor,
            order_queue,
        }
    }
}

/// Flattens validator output into `field: message` lines.
pub(crate) fn validation_messages(errors: &ValidationErrors) -> Vec<String> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |error| {
                format!(
                    "{}: {}",
                    field,
                    error
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| "Invalid value".to_string())
                )
            })
        })
        .collect()
}

/// 400 body listing every failed field.
pub(crate) fn validation_failure<T>(errors: &ValidationErrors) -> (StatusCode, Json<ApiResponse<T>>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiResponse::validation_errors(validation_messages(errors))),
    )
}
