use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "ERP Fulfillment API",
        version = "1.0.0",
        description = r#"
# ERP Order Fulfillment

Sales orders move through a fixed pipeline: a DRAFT order is confirmed, a
background job validates and deducts stock, issues an invoice, notifies the
customer and marks the order SHIPPED.

## Authentication

Every `/api/v1` endpoint requires an HS256 JWT bearer token:

```
Authorization: Bearer <your-jwt-token>
```

Changing invoice status and deactivating products require the `admin` or
`manager` role.

## Pagination

List endpoints accept `page` (default 1) and `limit` (default 10, max 100) and
return `{data, meta: {total, page, limit, total_pages}}`.

## Processing status

`GET /api/v1/erp/orders/{id}/processing-status` reports the background job
state (`not_started`, `waiting`, `active`, `delayed`, `completed`, `failed`)
and its progress percentage.
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:3000", description = "Local development")
    ),
    tags(
        (name = "Orders", description = "Sales order intake, confirmation and tracking"),
        (name = "Invoices", description = "Invoice lifecycle and statistics"),
        (name = "Products", description = "Catalog and stock adjustments"),
        (name = "Customers", description = "Customer records"),
        (name = "Notifications", description = "In-app notification feed"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        // Orders
        crate::handlers::orders::create_order,
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::confirm_order,
        crate::handlers::orders::get_processing_status,
        crate::handlers::orders::update_order_status,
        crate::handlers::orders::delete_order,

        // Invoices
        crate::handlers::invoices::list_invoices,
        crate::handlers::invoices::get_invoice_stats,
        crate::handlers::invoices::get_invoice,
        crate::handlers::invoices::update_invoice_status,
        crate::handlers::invoices::send_invoice,

        // Products
        crate::handlers::products::list_products,
        crate::handlers::products::list_low_stock,
        crate::handlers::products::get_product,
        crate::handlers::products::create_product,
        crate::handlers::products::update_product,
        crate::handlers::products::update_stock,
        crate::handlers::products::remove_product,

        // Customers
        crate::handlers::customers::list_customers,
        crate::handlers::customers::create_customer,
        crate::handlers::customers::get_customer,
        crate::handlers::customers::update_customer,

        // Notifications
        crate::handlers::notifications::list_notifications,

        // Health
        crate::handlers::health::health_check,
    ),
    components(
        schemas(
            crate::errors::ErrorResponse,
            crate::entities::OrderStatus,
            crate::entities::InvoiceStatus,
            crate::entities::NotificationKind,
            crate::services::products::StockOperation,
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "Bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDocV1::openapi())
}
