mod common;

use assert_matches::assert_matches;
use erp_fulfillment::{
    entities::{
        inventory_log::{self, Entity as InventoryLogEntity},
        invoice::{self, Entity as InvoiceEntity},
        product::{self, Entity as ProductEntity},
        JobState, NotificationKind, OrderStatus,
    },
    errors::ServiceError,
    message_queue::JobContext,
    services::order_processor::{aggregate_demand, job_id_for, ProcessOrderPayload},
    services::products::UpdateProductRequest,
};
use rust_decimal_macros::dec;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

use common::{TestApp, ADMIN_USER};

#[tokio::test]
async fn confirmed_order_is_fulfilled_end_to_end() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-A", dec!(100), 5).await;
    let customer = app.seed_customer("buyer@example.com").await;

    let order = app
        .create_order(customer.id, &[(product.id, 1)], dec!(8))
        .await;
    assert_eq!(order.order.status, OrderStatus::Draft);
    assert_eq!(order.order.subtotal, dec!(100));
    assert_eq!(order.order.tax_amount, dec!(8));
    assert_eq!(order.order.total, dec!(108));
    assert!(order.order.order_number.starts_with("SO-"));

    let services = &app.state.services;
    let confirmed = services
        .orders
        .confirm_order(order.order.id, ADMIN_USER)
        .await
        .expect("confirm order");
    assert_eq!(confirmed.job_id, job_id_for(order.order.id));
    assert_eq!(confirmed.order.status, OrderStatus::Confirmed);

    let waiting = services
        .orders
        .get_processing_status(order.order.id)
        .await
        .unwrap();
    assert_eq!(waiting.processing_status, "waiting");

    assert!(app.run_next_job().await);

    let product = services.products.find_by_id(product.id).await.unwrap();
    assert_eq!(product.stock_quantity, 4);

    let detail = services.orders.find_by_id(order.order.id).await.unwrap();
    assert_eq!(detail.order.status, OrderStatus::Shipped);

    let invoices = InvoiceEntity::find()
        .filter(invoice::Column::OrderId.eq(order.order.id))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].total, dec!(108.00));
    assert_eq!(invoices[0].status, erp_fulfillment::entities::InvoiceStatus::Sent);
    assert!(invoices[0].invoice_number.starts_with("INV-"));

    let logs = InventoryLogEntity::find()
        .filter(inventory_log::Column::ProductId.eq(product.id))
        .all(&*app.state.db)
        .await
        .unwrap();
    let sale = logs.iter().find(|l| l.reason == "Sale").expect("sale log");
    assert_eq!(sale.quantity_change, -1);
    assert_eq!(sale.reference.as_deref(), Some(order.order.order_number.as_str()));

    let status = services
        .orders
        .get_processing_status(order.order.id)
        .await
        .unwrap();
    assert_eq!(status.processing_status, "completed");
    assert_eq!(status.progress, 100);
    assert_eq!(status.order_status, OrderStatus::Shipped);

    let feed = services.notifications.for_user(ADMIN_USER, 20).await.unwrap();
    assert!(feed.iter().any(|n| n.kind == NotificationKind::OrderConfirmed));
    assert!(feed.iter().any(|n| n.kind == NotificationKind::InvoiceGenerated));

    let subjects = app.mail.subjects();
    assert!(subjects
        .iter()
        .any(|s| s == &format!("Order Confirmation - {}", order.order.order_number)));
}

#[tokio::test]
async fn insufficient_stock_fails_without_side_effects() {
    let app = TestApp::new().await;
    let product_a = app.seed_product("SKU-A", dec!(100), 5).await;
    let product_b = app.seed_product("SKU-B", dec!(50), 1).await;
    let customer = app.seed_customer("short@example.com").await;

    // Stock is not checked at creation time.
    let order = app
        .create_order(customer.id, &[(product_a.id, 1), (product_b.id, 2)], dec!(0))
        .await;
    let services = &app.state.services;
    services
        .orders
        .confirm_order(order.order.id, ADMIN_USER)
        .await
        .unwrap();

    let ctx = JobContext::new(services.order_queue.clone(), job_id_for(order.order.id));
    let payload = ProcessOrderPayload {
        order_id: order.order.id,
        user_id: ADMIN_USER.to_string(),
    };
    let err = services
        .order_processor
        .process(&payload, &ctx)
        .await
        .expect_err("processing must fail");
    assert_matches!(err, ServiceError::InsufficientStock(ref msg) => {
        assert_eq!(msg, "Insufficient stock for Product SKU-B: need 2, have 1");
    });

    let a = services.products.find_by_id(product_a.id).await.unwrap();
    let b = services.products.find_by_id(product_b.id).await.unwrap();
    assert_eq!(a.stock_quantity, 5);
    assert_eq!(b.stock_quantity, 1);

    let detail = services.orders.find_by_id(order.order.id).await.unwrap();
    assert_eq!(detail.order.status, OrderStatus::Confirmed);

    let invoices = InvoiceEntity::find()
        .filter(invoice::Column::OrderId.eq(order.order.id))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert!(invoices.is_empty());
}

#[tokio::test]
async fn shortfall_during_deduction_rolls_back_earlier_items() {
    let app = TestApp::new().await;
    let product_a = app.seed_product("SKU-A", dec!(100), 5).await;
    let product_b = app.seed_product("SKU-B", dec!(50), 3).await;
    let customer = app.seed_customer("race@example.com").await;
    let order = app
        .create_order(customer.id, &[(product_a.id, 2), (product_b.id, 2)], dec!(0))
        .await;
    let services = &app.state.services;
    services
        .orders
        .confirm_order(order.order.id, ADMIN_USER)
        .await
        .unwrap();

    // Snapshot still shows enough of both products.
    let detail = services.orders.find_by_id(order.order.id).await.unwrap();
    let demand = aggregate_demand(
        detail
            .items
            .iter()
            .map(|line| (line.item.product_id, line.item.quantity)),
    )
    .unwrap();

    // A concurrent sale takes SKU-B below what this order needs.
    ProductEntity::update_many()
        .col_expr(product::Column::StockQuantity, Expr::value(1))
        .filter(product::Column::Id.eq(product_b.id))
        .exec(&*app.state.db)
        .await
        .unwrap();

    let err = services
        .order_processor
        .commit_inventory(&detail, &demand)
        .await
        .expect_err("deduction must fail");
    assert_matches!(err, ServiceError::InsufficientStock(ref msg) => {
        assert_eq!(msg, "Insufficient stock for Product SKU-B: need 2, have 1");
    });

    let a = services.products.find_by_id(product_a.id).await.unwrap();
    assert_eq!(a.stock_quantity, 5, "first item's deduction must be rolled back");
    let b = services.products.find_by_id(product_b.id).await.unwrap();
    assert_eq!(b.stock_quantity, 1);

    let sales = InventoryLogEntity::find()
        .filter(inventory_log::Column::Reason.eq("Sale"))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert!(sales.is_empty());

    let detail = services.orders.find_by_id(order.order.id).await.unwrap();
    assert_eq!(detail.order.status, OrderStatus::Confirmed);
}

#[tokio::test]
async fn order_lines_keep_the_price_they_were_created_with() {
    let app = TestApp::new().await;
    let product = app.seed_product("SNAP", dec!(100), 10).await;
    let customer = app.seed_customer("snapshot@example.com").await;
    let order = app
        .create_order(customer.id, &[(product.id, 2)], dec!(8))
        .await;
    let services = &app.state.services;

    let repriced = services
        .products
        .update(
            product.id,
            UpdateProductRequest {
                price: Some(dec!(250)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(repriced.price, dec!(250));

    let detail = services.orders.find_by_id(order.order.id).await.unwrap();
    assert_eq!(detail.items[0].item.unit_price, dec!(100));
    assert_eq!(detail.items[0].item.total, dec!(200));
    assert_eq!(detail.order.subtotal, dec!(200));
    assert_eq!(detail.order.total, dec!(216));

    services
        .orders
        .confirm_order(order.order.id, ADMIN_USER)
        .await
        .unwrap();
    assert!(app.run_next_job().await);

    let invoice = InvoiceEntity::find()
        .filter(invoice::Column::OrderId.eq(order.order.id))
        .one(&*app.state.db)
        .await
        .unwrap()
        .expect("invoice generated");
    assert_eq!(invoice.total, dec!(216));
}

#[tokio::test]
async fn failed_attempt_is_retried_with_backoff() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-LOW", dec!(10), 1).await;
    let customer = app.seed_customer("retry@example.com").await;
    let order = app
        .create_order(customer.id, &[(product.id, 3)], dec!(0))
        .await;
    let services = &app.state.services;
    services
        .orders
        .confirm_order(order.order.id, ADMIN_USER)
        .await
        .unwrap();

    assert!(app.run_next_job().await);

    let status = services
        .orders
        .get_processing_status(order.order.id)
        .await
        .unwrap();
    assert_eq!(status.processing_status, JobState::Delayed.to_string());
    assert_eq!(status.attempts_made, Some(1));
    assert_eq!(status.order_status, OrderStatus::Confirmed);

    // Backing off: nothing is runnable yet.
    assert!(!app.run_next_job().await);
}

#[tokio::test]
async fn reprocessing_an_advanced_order_is_a_no_op() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-A", dec!(100), 5).await;
    let customer = app.seed_customer("again@example.com").await;
    let order = app
        .create_order(customer.id, &[(product.id, 1)], dec!(8))
        .await;
    let services = &app.state.services;
    services
        .orders
        .confirm_order(order.order.id, ADMIN_USER)
        .await
        .unwrap();
    assert!(app.run_next_job().await);

    let ctx = JobContext::new(services.order_queue.clone(), job_id_for(order.order.id));
    let payload = ProcessOrderPayload {
        order_id: order.order.id,
        user_id: ADMIN_USER.to_string(),
    };
    let outcome = services
        .order_processor
        .process(&payload, &ctx)
        .await
        .expect("rerun must not error");
    assert!(!outcome.success);
    assert!(outcome.invoice_id.is_none());

    let product = services.products.find_by_id(product.id).await.unwrap();
    assert_eq!(product.stock_quantity, 4, "stock must not be deducted twice");

    let invoices = InvoiceEntity::find()
        .filter(invoice::Column::OrderId.eq(order.order.id))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(invoices.len(), 1);
}

#[tokio::test]
async fn only_draft_orders_can_be_confirmed_or_deleted() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-A", dec!(20), 5).await;
    let customer = app.seed_customer("draft@example.com").await;
    let order = app
        .create_order(customer.id, &[(product.id, 1)], dec!(0))
        .await;
    let services = &app.state.services;

    services
        .orders
        .confirm_order(order.order.id, ADMIN_USER)
        .await
        .unwrap();

    let again = services
        .orders
        .confirm_order(order.order.id, ADMIN_USER)
        .await
        .unwrap_err();
    assert_matches!(again, ServiceError::InvalidState(_));

    let delete = services.orders.delete(order.order.id).await.unwrap_err();
    assert_matches!(delete, ServiceError::InvalidState(_));

    let draft = app
        .create_order(customer.id, &[(product.id, 2)], dec!(0))
        .await;
    services.orders.delete(draft.order.id).await.unwrap();
    assert_matches!(
        services.orders.find_by_id(draft.order.id).await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn duplicate_product_lines_are_checked_against_combined_demand() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-DUP", dec!(5), 3).await;
    let customer = app.seed_customer("dup@example.com").await;
    let order = app
        .create_order(customer.id, &[(product.id, 2), (product.id, 2)], dec!(0))
        .await;
    assert_eq!(order.items.len(), 2);
    let services = &app.state.services;
    services
        .orders
        .confirm_order(order.order.id, ADMIN_USER)
        .await
        .unwrap();

    let ctx = JobContext::new(services.order_queue.clone(), job_id_for(order.order.id));
    let payload = ProcessOrderPayload {
        order_id: order.order.id,
        user_id: ADMIN_USER.to_string(),
    };
    let err = services
        .order_processor
        .process(&payload, &ctx)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));

    let product = services.products.find_by_id(product.id).await.unwrap();
    assert_eq!(product.stock_quantity, 3);
}

#[tokio::test]
async fn order_creation_rejects_unknown_references() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-A", dec!(20), 5).await;
    let services = &app.state.services;

    let missing_customer = services
        .orders
        .create(
            ADMIN_USER,
            erp_fulfillment::services::orders::CreateOrderRequest {
                customer_id: uuid::Uuid::new_v4(),
                items: vec![erp_fulfillment::services::orders::OrderItemInput {
                    product_id: product.id,
                    quantity: 1,
                    discount: None,
                }],
                tax_rate: None,
                discount: None,
                notes: None,
            },
        )
        .await
        .unwrap_err();
    assert_matches!(missing_customer, ServiceError::NotFound(_));

    let customer = app.seed_customer("refs@example.com").await;
    let missing_product = services
        .orders
        .create(
            ADMIN_USER,
            erp_fulfillment::services::orders::CreateOrderRequest {
                customer_id: customer.id,
                items: vec![erp_fulfillment::services::orders::OrderItemInput {
                    product_id: uuid::Uuid::new_v4(),
                    quantity: 1,
                    discount: None,
                }],
                tax_rate: None,
                discount: None,
                notes: None,
            },
        )
        .await
        .unwrap_err();
    assert_matches!(missing_product, ServiceError::BadRequest(ref msg) => {
        assert!(msg.starts_with("One or more products not found"));
    });
}

#[tokio::test]
async fn repeated_lines_that_overflow_are_rejected_at_creation() {
    let app = TestApp::new().await;
    let product = app.seed_product("BULK", dec!(1), 5).await;
    let customer = app.seed_customer("bulk@example.com").await;

    let err = app
        .state
        .services
        .orders
        .create(
            ADMIN_USER,
            erp_fulfillment::services::orders::CreateOrderRequest {
                customer_id: customer.id,
                items: vec![
                    erp_fulfillment::services::orders::OrderItemInput {
                        product_id: product.id,
                        quantity: i32::MAX,
                        discount: None,
                    },
                    erp_fulfillment::services::orders::OrderItemInput {
                        product_id: product.id,
                        quantity: 1,
                        discount: None,
                    },
                ],
                tax_rate: None,
                discount: None,
                notes: None,
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let stock = app.state.services.products.find_by_id(product.id).await.unwrap();
    assert_eq!(stock.stock_quantity, 5);
}
