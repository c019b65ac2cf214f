//! ERP order fulfillment service.
//!
//! Draft sales orders are confirmed over HTTP and fulfilled by a background
//! worker that deducts stock, issues an invoice and notifies the customer.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod message_queue;
pub mod middleware_helpers;
pub mod migrator;
pub mod openapi;
pub mod scheduler;
pub mod services;
pub mod tracing;

use axum::{response::Json, Extension, Router};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::db::DbPool;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: config::AppConfig,
    pub event_sender: Arc<events::EventSender>,
    pub services: handlers::AppServices,
    pub auth: Arc<auth::AuthService>,
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn validation_errors(errors: Vec<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some("Validation failed".to_string()),
            errors: Some(errors),
            meta: Some(ResponseMeta::capture()),
        }
    }
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use chrono::DateTime;

    #[tokio::test]
    async fn success_response_includes_request_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-123"), async {
                ApiResponse::success("ok")
            })
            .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-123"));
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("timestamp should parse");
    }

    #[tokio::test]
    async fn error_response_carries_message() {
        let response = ApiResponse::<()>::error("oops".into());
        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some("oops"));
        assert!(response.meta.is_some());
    }

    #[tokio::test]
    async fn validation_errors_response_includes_metadata() {
        let response = crate::tracing::scope_request_id(
            crate::tracing::RequestId::new("meta-validation"),
            async { ApiResponse::<()>::validation_errors(vec!["missing".into()]) },
        )
        .await;

        assert_eq!(response.errors.as_deref(), Some(&["missing".to_string()][..]));
        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-validation"));
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

/// `/api/v1` routes. Every router attaches its own auth layers.
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .nest("/erp/orders", handlers::orders::orders_routes())
        .nest("/erp/invoices", handlers::invoices::invoices_routes())
        .nest("/erp/products", handlers::products::products_routes())
        .nest("/erp/customers", handlers::customers::customers_routes())
        .nest(
            "/erp/notifications",
            handlers::notifications::notifications_routes(),
        )
}

/// Full application router: health, the v1 API and Swagger UI, with request
/// ids, HTTP tracing and the auth service installed.
pub fn app_router(state: AppState) -> Router {
    let auth = state.auth.clone();
    Router::new()
        .merge(handlers::health::health_routes())
        .nest("/api/v1", api_v1_routes())
        .merge(openapi::swagger_ui())
        .layer(crate::tracing::configure_http_tracing())
        .layer(Extension(auth))
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id::request_id_middleware,
        ))
        .with_state(state)
}
