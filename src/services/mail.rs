use crate::config::AppConfig;
use crate::errors::ServiceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("static regex"));
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl From<MailError> for ServiceError {
    fn from(err: MailError) -> Self {
        ServiceError::MailError(err.to_string())
    }
}

/// Message as built by callers; `text` and `from` fall back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailOptions {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
    pub from: Option<String>,
}

/// Fully resolved message handed to a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Delivers the message and returns the transport's message id.
    async fn deliver(&self, mail: &OutgoingMail) -> Result<String, MailError>;
}

/// Development transport: logs the message instead of sending it.
#[derive(Debug, Default, Clone)]
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn deliver(&self, mail: &OutgoingMail) -> Result<String, MailError> {
        let preview: String = mail.text.chars().take(200).collect();
        debug!(
            from = %mail.from,
            to = %mail.to,
            subject = %mail.subject,
            preview = %preview,
            "email logged, not sent"
        );
        Ok(format!("<{}@erp.local>", Uuid::new_v4()))
    }
}

#[derive(Debug, Clone)]
pub struct MailLineItem {
    pub name: String,
    pub quantity: i32,
    pub price: Decimal,
}

#[derive(Debug, Clone)]
pub struct OrderConfirmationMail {
    pub order_number: String,
    pub customer_name: String,
    pub customer_email: String,
    pub total: Decimal,
    pub items: Vec<MailLineItem>,
}

#[derive(Debug, Clone)]
pub struct InvoiceMail {
    pub invoice_number: String,
    pub customer_name: String,
    pub customer_email: String,
    pub total: Decimal,
    pub due_date: DateTime<Utc>,
}

/// Renders templates and dispatches them through a [`MailTransport`].
#[derive(Clone)]
pub struct MailService {
    transport: Arc<dyn MailTransport>,
    default_from: String,
}

impl MailService {
    pub fn new(transport: Arc<dyn MailTransport>, default_from: impl Into<String>) -> Self {
        Self {
            transport,
            default_from: default_from.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let transport: Arc<dyn MailTransport> =
            match config.mail_transport.to_ascii_lowercase().as_str() {
                "log" => Arc::new(LogTransport),
                other => {
                    return Err(ServiceError::InternalError(format!(
                        "unsupported mail transport: {}",
                        other
                    )))
                }
            };
        info!(
            transport = %config.mail_transport,
            "Mail service configured; messages are logged, not delivered"
        );
        Ok(Self::new(transport, config.mail_from.clone()))
    }

    /// Sends a message. Never errors: failures are logged and reported as
    /// `success: false`.
    #[instrument(skip(self, options), fields(to = %options.to, subject = %options.subject))]
    pub async fn send(&self, options: MailOptions) -> MailResult {
        let outgoing = OutgoingMail {
            from: options.from.unwrap_or_else(|| self.default_from.clone()),
            text: options
                .text
                .unwrap_or_else(|| strip_html(&options.html)),
            to: options.to,
            subject: options.subject,
            html: options.html,
        };

        let delivered = if outgoing.to.trim().is_empty() || !outgoing.to.contains('@') {
            Err(MailError::InvalidRecipient(outgoing.to.clone()))
        } else {
            self.transport.deliver(&outgoing).await
        };

        match delivered {
            Ok(message_id) => {
                counter!("erp_mail_sent_total", 1);
                info!(message_id = %message_id, "email dispatched");
                MailResult {
                    success: true,
                    message_id: Some(message_id),
                }
            }
            Err(e) => {
                counter!("erp_mail_failed_total", 1);
                error!(error = %e, "Failed to send email to {}", outgoing.to);
                MailResult {
                    success: false,
                    message_id: None,
                }
            }
        }
    }

    pub fn order_confirmation(&self, order: &OrderConfirmationMail) -> MailOptions {
        let items_html: String = order
            .items
            .iter()
            .map(|item| {
                format!(
                    "<tr><td>{}</td><td>{}</td><td>${:.2}</td></tr>",
                    escape_html(&item.name),
                    item.quantity,
                    item.price
                )
            })
            .collect();

        let html = format!(
            r#"<div style="font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto;">
  <h1 style="color: #333;">Thank you for your order!</h1>
  <p>Hi {name},</p>
  <p>Your order <strong>{number}</strong> has been confirmed.</p>
  <h2 style="color: #666;">Order Details</h2>
  <table style="width: 100%; border-collapse: collapse;">
    <thead>
      <tr style="background: #f5f5f5;">
        <th style="padding: 10px; text-align: left;">Item</th>
        <th style="padding: 10px; text-align: left;">Qty</th>
        <th style="padding: 10px; text-align: left;">Price</th>
      </tr>
    </thead>
    <tbody>{items}</tbody>
  </table>
  <p style="font-size: 18px; margin-top: 20px;"><strong>Total: ${total:.2}</strong></p>
  <p style="color: #666; margin-top: 30px;">We'll notify you when your order ships.</p>
</div>"#,
            name = escape_html(&order.customer_name),
            number = escape_html(&order.order_number),
            items = items_html,
            total = order.total,
        );

        MailOptions {
            to: order.customer_email.clone(),
            subject: format!("Order Confirmation - {}", order.order_number),
            html,
            text: None,
            from: None,
        }
    }

    pub fn invoice_email(&self, invoice: &InvoiceMail) -> MailOptions {
        let html = format!(
            r#"<div style="font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto;">
  <h1 style="color: #333;">Invoice {number}</h1>
  <p>Hi {name},</p>
  <p>Please find your invoice attached.</p>
  <div style="background: #f5f5f5; padding: 20px; margin: 20px 0;">
    <p><strong>Amount Due:</strong> ${total:.2}</p>
    <p><strong>Due Date:</strong> {due}</p>
  </div>
  <p style="color: #666;">Thank you for your business!</p>
</div>"#,
            number = escape_html(&invoice.invoice_number),
            name = escape_html(&invoice.customer_name),
            total = invoice.total,
            due = invoice.due_date.format("%Y-%m-%d"),
        );

        MailOptions {
            to: invoice.customer_email.clone(),
            subject: format!("Invoice {}", invoice.invoice_number),
            html,
            text: None,
            from: None,
        }
    }
}

/// Plain-text fallback: drops tags and collapses whitespace.
pub fn strip_html(html: &str) -> String {
    let without_tags = TAG_RE.replace_all(html, "");
    WS_RE.replace_all(&without_tags, " ").trim().to_string()
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
