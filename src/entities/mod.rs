pub mod customer;
pub mod inventory_log;
pub mod invoice;
pub mod job;
pub mod notification;
pub mod number_sequence;
pub mod order_item;
pub mod product;
pub mod sales_order;

pub use invoice::InvoiceStatus;
pub use job::JobState;
pub use notification::NotificationKind;
pub use sales_order::OrderStatus;
