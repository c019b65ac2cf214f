//! Daily time-of-day schedules mapped to sweep tasks.

use crate::{
    errors::ServiceError,
    services::invoices::InvoiceService,
    services::notifications::NotificationService,
    services::products::ProductService,
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime};
use metrics::counter;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

#[async_trait]
pub trait ScheduledTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Runs one sweep and returns a short summary for the log.
    async fn run(&self) -> Result<String, ServiceError>;
}

/// First occurrence of `at` strictly after `now`.
pub fn next_occurrence(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

struct Entry {
    at: NaiveTime,
    task: Arc<dyn ScheduledTask>,
}

/// Registry built at startup. Each registered task gets its own loop, so a
/// failing sweep never blocks another.
#[derive(Default)]
pub struct Scheduler {
    entries: Vec<Entry>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn daily(mut self, at: NaiveTime, task: Arc<dyn ScheduledTask>) -> Self {
        self.entries.push(Entry { at, task });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.entries
            .into_iter()
            .map(|entry| {
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let name = entry.task.name();
                    info!(task = name, at = %entry.at, "scheduled daily task");
                    loop {
                        let now = Local::now().naive_local();
                        let wait = (next_occurrence(now, entry.at) - now)
                            .to_std()
                            .unwrap_or(Duration::from_secs(1));

                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = shutdown.changed() => {}
                        }
                        if *shutdown.borrow() {
                            break;
                        }
                        run_task(entry.task.as_ref()).await;
                    }
                    info!(task = name, "scheduled task stopped");
                })
            })
            .collect()
    }
}

/// Runs a task once, logging instead of propagating failure.
pub async fn run_task(task: &dyn ScheduledTask) {
    let name = task.name();
    match task.run().await {
        Ok(summary) => {
            counter!("erp_scheduled_runs_total", 1, "task" => name, "outcome" => "ok");
            info!(task = name, summary = %summary, "scheduled task finished");
        }
        Err(e) => {
            counter!("erp_scheduled_runs_total", 1, "task" => name, "outcome" => "error");
            error!(task = name, error = %e, "scheduled task failed");
        }
    }
}

/// Marks past-due SENT invoices OVERDUE and broadcasts the count.
pub struct OverdueInvoiceSweep {
    invoices: Arc<InvoiceService>,
    notifications: Arc<NotificationService>,
}

impl OverdueInvoiceSweep {
    pub fn new(invoices: Arc<InvoiceService>, notifications: Arc<NotificationService>) -> Self {
        Self {
            invoices,
            notifications,
        }
    }
}

#[async_trait]
impl ScheduledTask for OverdueInvoiceSweep {
    fn name(&self) -> &'static str {
        "overdue_invoices"
    }

    #[instrument(skip(self))]
    async fn run(&self) -> Result<String, ServiceError> {
        let result = self.invoices.mark_overdue_invoices().await?;
        if result.marked > 0 {
            if let Err(e) = self
                .notifications
                .system(
                    "Overdue Invoices",
                    format!("{} invoice(s) have been marked as overdue.", result.marked),
                    json!({ "count": result.marked }),
                )
                .await
            {
                warn!(error = %e, "Failed to record overdue notification");
            }
        }
        Ok(format!("{} invoice(s) marked overdue", result.marked))
    }
}

/// One low-stock notification per active product at or below its threshold.
pub struct LowStockSweep {
    products: Arc<ProductService>,
    notifications: Arc<NotificationService>,
}

impl LowStockSweep {
    pub fn new(products: Arc<ProductService>, notifications: Arc<NotificationService>) -> Self {
        Self {
            products,
            notifications,
        }
    }
}

#[async_trait]
impl ScheduledTask for LowStockSweep {
    fn name(&self) -> &'static str {
        "low_stock"
    }

    #[instrument(skip(self))]
    async fn run(&self) -> Result<String, ServiceError> {
        let products = self.products.low_stock().await?;
        let mut notified = 0usize;
        for product in &products {
            match self
                .notifications
                .low_stock(
                    product.id,
                    &product.name,
                    product.stock_quantity,
                    product.low_stock_threshold,
                )
                .await
            {
                Ok(_) => notified += 1,
                Err(e) => warn!(error = %e, product_id = %product.id, "Failed to record low stock notification"),
            }
        }
        Ok(format!(
            "{} of {} low-stock product(s) notified",
            notified,
            products.len()
        ))
    }
}
