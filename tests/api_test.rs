mod common;

use axum::http::{Method, StatusCode};
use chrono::Duration;
use erp_fulfillment::auth::Role;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::str::FromStr;

use common::{TestApp, STAFF_USER};

/// Decimals travel as JSON strings.
fn money(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).expect("decimal string"),
        other => Decimal::from_str(&other.to_string()).expect("decimal number"),
    }
}

async fn draft_order(app: &TestApp, stock: i32) -> (Value, uuid::Uuid) {
    let product = app.seed_product("HTTP-A", dec!(100), stock).await;
    let customer = app.seed_customer("http@example.com").await;
    let (status, body) = app
        .as_staff(
            Method::POST,
            "/api/v1/erp/orders",
            Some(json!({
                "customer_id": customer.id,
                "items": [{ "product_id": product.id, "quantity": 1 }],
                "tax_rate": "8"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    (body, product.id)
}

#[tokio::test]
async fn health_is_public() {
    let app = TestApp::new().await;
    let (status, body) = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "up");
    assert_eq!(body["database"]["status"], "up");
    assert_eq!(body["queue"]["waiting"], 0);
}

#[tokio::test]
async fn api_requires_a_valid_bearer_token() {
    let app = TestApp::new().await;

    let (status, body) = app
        .request(Method::GET, "/api/v1/erp/orders", None, None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let (status, _) = app
        .request(Method::GET, "/api/v1/erp/orders", None, Some("not-a-jwt"))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let expired = app
        .state
        .auth
        .issue_token(STAFF_USER, Role::Staff, Duration::hours(-2))
        .unwrap();
    let (status, _) = app
        .request(Method::GET, "/api/v1/erp/orders", None, Some(&expired))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn order_flow_over_http() {
    let app = TestApp::new().await;
    let (created, product_id) = draft_order(&app, 5).await;
    assert_eq!(created["success"], true);
    let data = &created["data"];
    assert_eq!(data["status"], "DRAFT");
    assert_eq!(money(&data["total"]), dec!(108));
    assert_eq!(data["items"].as_array().unwrap().len(), 1);
    let order_id = data["id"].as_str().unwrap().to_string();

    let (status, body) = app
        .as_staff(Method::GET, &format!("/api/v1/erp/orders/{order_id}/processing-status"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["processing_status"], "not_started");

    let (status, body) = app
        .as_staff(Method::POST, &format!("/api/v1/erp/orders/{order_id}/confirm"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["job_id"], format!("order-{order_id}"));
    assert_eq!(body["message"], "Order confirmed and queued for processing");

    let (status, body) = app
        .as_staff(Method::POST, &format!("/api/v1/erp/orders/{order_id}/confirm"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_state");

    assert!(app.run_next_job().await);

    let (_, body) = app
        .as_staff(Method::GET, &format!("/api/v1/erp/orders/{order_id}"), None)
        .await;
    assert_eq!(body["data"]["status"], "SHIPPED");
    assert_eq!(body["data"]["customer"]["email"], "http@example.com");

    let (_, body) = app
        .as_staff(Method::GET, &format!("/api/v1/erp/products/{product_id}"), None)
        .await;
    assert_eq!(body["data"]["stock_quantity"], 4);

    let (status, body) = app
        .as_staff(Method::GET, "/api/v1/erp/orders?status=SHIPPED", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["meta"]["total"], 1);
}

#[tokio::test]
async fn order_validation_errors_are_reported() {
    let app = TestApp::new().await;
    let customer = app.seed_customer("invalid@example.com").await;

    let (status, body) = app
        .as_staff(
            Method::POST,
            "/api/v1/erp/orders",
            Some(json!({ "customer_id": customer.id, "items": [] })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(!body["errors"].as_array().unwrap().is_empty());

    let (status, _) = app
        .as_staff(Method::GET, &format!("/api/v1/erp/orders/{}", uuid::Uuid::new_v4()), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_products_and_out_of_range_amounts_are_bad_requests() {
    let app = TestApp::new().await;
    let product = app.seed_product("RANGE", dec!(10), 5).await;
    let customer = app.seed_customer("range@example.com").await;

    let (status, body) = app
        .as_staff(
            Method::POST,
            "/api/v1/erp/orders",
            Some(json!({
                "customer_id": customer.id,
                "items": [{ "product_id": uuid::Uuid::new_v4(), "quantity": 1 }]
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    assert_eq!(body["code"], "bad_request");

    for order in [
        json!({
            "customer_id": customer.id,
            "items": [{ "product_id": product.id, "quantity": 1 }],
            "tax_rate": "79228162514264337593543950335"
        }),
        json!({
            "customer_id": customer.id,
            "items": [{ "product_id": product.id, "quantity": 1 }],
            "discount": "79228162514264337593543950335"
        }),
        json!({
            "customer_id": customer.id,
            "items": [{ "product_id": product.id, "quantity": 2147483647 }]
        }),
    ] {
        let (status, body) = app.as_staff(Method::POST, "/api/v1/erp/orders", Some(order)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    }

    let (_, body) = app.as_staff(Method::GET, "/api/v1/erp/orders", None).await;
    assert_eq!(body["data"]["meta"]["total"], 0);
}

#[tokio::test]
async fn confirm_returns_the_order_fields_with_the_job() {
    let app = TestApp::new().await;
    let (created, _) = draft_order(&app, 5).await;
    let order_id = created["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = app
        .as_staff(Method::POST, &format!("/api/v1/erp/orders/{order_id}/confirm"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let data = &body["data"];
    assert_eq!(data["id"], order_id.as_str());
    assert_eq!(data["status"], "CONFIRMED");
    assert!(data["order_number"].as_str().unwrap().starts_with("SO-"));
    assert_eq!(data["job_id"], format!("order-{order_id}"));
    assert!(data.get("order").is_none());
}

#[tokio::test]
async fn invoice_status_changes_need_a_back_office_role() {
    let app = TestApp::new().await;
    let (created, _) = draft_order(&app, 5).await;
    let order_id = created["data"]["id"].as_str().unwrap().to_string();
    app.as_staff(Method::POST, &format!("/api/v1/erp/orders/{order_id}/confirm"), None)
        .await;
    assert!(app.run_next_job().await);

    let (status, body) = app.as_staff(Method::GET, "/api/v1/erp/invoices", None).await;
    assert_eq!(status, StatusCode::OK);
    let invoice_id = body["data"]["data"][0]["id"].as_str().unwrap().to_string();
    assert_eq!(money(&body["data"]["data"][0]["total"]), dec!(108));

    let uri = format!("/api/v1/erp/invoices/{invoice_id}/status");
    let (status, body) = app
        .as_staff(Method::PATCH, &uri, Some(json!({ "status": "PAID" })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    let (status, body) = app
        .as_admin(Method::PATCH, &uri, Some(json!({ "status": "PAID" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "PAID");
    assert!(body["data"]["paid_date"].is_string());

    let (status, body) = app
        .as_staff(Method::POST, &format!("/api/v1/erp/invoices/{invoice_id}/send"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid state: Cannot send a paid invoice");

    let (status, body) = app.as_staff(Method::GET, "/api/v1/erp/invoices/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["paid"], 1);
    assert_eq!(money(&body["data"]["total_revenue"]), dec!(108));
}

#[tokio::test]
async fn product_management_over_http() {
    let app = TestApp::new().await;

    let (status, body) = app
        .as_staff(
            Method::POST,
            "/api/v1/erp/products",
            Some(json!({
                "sku": "WIDGET",
                "name": "Widget",
                "price": "12.50",
                "stock_quantity": 3,
                "low_stock_threshold": 5
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let product_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = app
        .as_staff(
            Method::PATCH,
            &format!("/api/v1/erp/products/{product_id}/stock"),
            Some(json!({ "quantity": 10, "operation": "add" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["stock_quantity"], 13);

    let (_, body) = app.as_staff(Method::GET, "/api/v1/erp/products/low-stock", None).await;
    assert!(body["data"].as_array().unwrap().is_empty());

    let (status, body) = app
        .as_staff(
            Method::PATCH,
            &format!("/api/v1/erp/products/{product_id}"),
            Some(json!({ "price": "15.00", "low_stock_threshold": 20 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(money(&body["data"]["price"]), dec!(15));
    assert_eq!(body["data"]["stock_quantity"], 13);

    let (_, body) = app.as_staff(Method::GET, "/api/v1/erp/products/low-stock", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, _) = app
        .as_staff(
            Method::PATCH,
            &format!("/api/v1/erp/products/{product_id}"),
            Some(json!({ "price": "-1" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .as_staff(Method::DELETE, &format!("/api/v1/erp/products/{product_id}"), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .as_admin(Method::DELETE, &format!("/api/v1/erp/products/{product_id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_active"], false);
}

#[tokio::test]
async fn notification_feed_is_scoped_to_the_caller() {
    let app = TestApp::new().await;
    let notifications = &app.state.services.notifications;
    let order_id = uuid::Uuid::new_v4();
    notifications
        .order_confirmed(order_id, "SO-000001", Some(STAFF_USER))
        .await
        .unwrap();
    notifications
        .order_confirmed(order_id, "SO-000002", Some("someone-else"))
        .await
        .unwrap();
    notifications
        .system("Maintenance", "Nightly maintenance".into(), json!({}))
        .await
        .unwrap();

    let (status, body) = app.as_staff(Method::GET, "/api/v1/erp/notifications", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    // Staff cannot widen the feed.
    let (_, body) = app
        .as_staff(Method::GET, "/api/v1/erp/notifications?all=true", None)
        .await;
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (_, body) = app
        .as_admin(Method::GET, "/api/v1/erp/notifications?all=true", None)
        .await;
    assert_eq!(body["data"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn customers_can_be_created_and_fetched() {
    let app = TestApp::new().await;
    let (status, body) = app
        .as_staff(
            Method::POST,
            "/api/v1/erp/customers",
            Some(json!({ "name": "Jane Buyer", "email": "jane@example.com" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = app
        .as_staff(Method::GET, &format!("/api/v1/erp/customers/{id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["email"], "jane@example.com");

    let (status, _) = app
        .as_staff(
            Method::POST,
            "/api/v1/erp/customers",
            Some(json!({ "name": "Jane Again", "email": "jane@example.com" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = app
        .as_staff(
            Method::PATCH,
            &format!("/api/v1/erp/customers/{id}"),
            Some(json!({ "company": "Buyer Co" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["company"], "Buyer Co");
    assert_eq!(body["data"]["email"], "jane@example.com");
}

#[tokio::test]
async fn customers_are_listed_with_paging_and_search() {
    let app = TestApp::new().await;
    app.seed_customer("first@example.com").await;
    app.seed_customer("second@example.com").await;
    let taken = app.seed_customer("third@example.com").await;

    let (status, body) = app
        .as_staff(Method::GET, "/api/v1/erp/customers?limit=2", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["data"].as_array().unwrap().len(), 2);
    assert_eq!(body["data"]["meta"]["total"], 3);
    assert_eq!(body["data"]["meta"]["total_pages"], 2);

    let (_, body) = app
        .as_staff(Method::GET, "/api/v1/erp/customers?search=second", None)
        .await;
    assert_eq!(body["data"]["meta"]["total"], 1);
    assert_eq!(body["data"]["data"][0]["email"], "second@example.com");

    let (status, _) = app
        .as_staff(
            Method::PATCH,
            &format!("/api/v1/erp/customers/{}", taken.id),
            Some(json!({ "email": "first@example.com" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
