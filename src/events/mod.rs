use crate::entities::{InvoiceStatus, OrderStatus};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Best-effort variant: a closed channel is logged and swallowed.
    pub async fn emit(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            warn!(event = name, error = %e, "dropping domain event");
        }
    }
}

/// Domain events raised by the fulfillment pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
    },
    OrderConfirmed {
        order_id: Uuid,
        job_id: String,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderDeleted(Uuid),
    OrderProcessed {
        order_id: Uuid,
        invoice_id: Uuid,
    },
    OrderProcessingFailed {
        order_id: Uuid,
        job_id: String,
        error: String,
        /// No retries remain.
        exhausted: bool,
    },
    InvoiceGenerated {
        invoice_id: Uuid,
        invoice_number: String,
        order_id: Option<Uuid>,
    },
    InvoiceStatusChanged {
        invoice_id: Uuid,
        old_status: InvoiceStatus,
        new_status: InvoiceStatus,
    },
    InvoicesMarkedOverdue(u64),
    StockAdjusted {
        product_id: Uuid,
        quantity_change: i32,
        new_quantity: i32,
        reason: String,
    },
    LowStock {
        product_id: Uuid,
        stock_quantity: i32,
        threshold: i32,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::OrderConfirmed { .. } => "order_confirmed",
            Event::OrderStatusChanged { .. } => "order_status_changed",
            Event::OrderDeleted(_) => "order_deleted",
            Event::OrderProcessed { .. } => "order_processed",
            Event::OrderProcessingFailed { .. } => "order_processing_failed",
            Event::InvoiceGenerated { .. } => "invoice_generated",
            Event::InvoiceStatusChanged { .. } => "invoice_status_changed",
            Event::InvoicesMarkedOverdue(_) => "invoices_marked_overdue",
            Event::StockAdjusted { .. } => "stock_adjusted",
            Event::LowStock { .. } => "low_stock",
        }
    }
}

/// Drains the event channel, logging each event and counting it by name.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        counter!("erp_events_total", 1, "event" => event.name());

        match &event {
            Event::OrderProcessingFailed {
                order_id,
                job_id,
                error,
                exhausted: true,
            } => {
                warn!(
                    %order_id,
                    job_id = %job_id,
                    error = %error,
                    "order processing exhausted its retries"
                );
            }
            Event::LowStock {
                product_id,
                stock_quantity,
                threshold,
            } => {
                warn!(%product_id, stock_quantity, threshold, "product below stock threshold");
            }
            other => info!(event = other.name(), payload = ?other, "domain event"),
        }
    }

    info!("Event channel closed; event processing loop stopped");
}
