use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthRouterExt;
use crate::entities::sales_order::Model as SalesOrderModel;
use crate::handlers::validation_failure;
use crate::services::orders::{
    ConfirmOrderResponse, CreateOrderRequest, OrderDetail, OrderQuery, ProcessingStatus,
    UpdateOrderStatusRequest,
};
use crate::services::Page;
use crate::{auth::AuthUser, errors::ServiceError, ApiResponse, ApiResult, AppState};

pub fn orders_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_orders).post(create_order))
        .route("/:id", get(get_order).delete(delete_order))
        .route("/:id/confirm", post(confirm_order))
        .route("/:id/processing-status", get(get_processing_status))
        .route("/:id/status", patch(update_order_status))
        .with_auth()
}

/// Create a draft sales order
#[utoipa::path(
    post,
    path = "/api/v1/erp/orders",
    summary = "Create order",
    description = "Create a DRAFT sales order. Prices are taken from the catalog at creation time.",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created", body = ApiResponse<OrderDetail>),
        (status = 400, description = "Invalid request data or unknown product", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Customer not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderDetail>>), ServiceError> {
    if let Err(errors) = request.validate() {
        return Ok(validation_failure(&errors));
    }
    for item in &request.items {
        if let Err(errors) = item.validate() {
            return Ok(validation_failure(&errors));
        }
    }

    let order = state
        .services
        .orders
        .create(&auth_user.user_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(order))))
}

/// List orders, newest first
#[utoipa::path(
    get,
    path = "/api/v1/erp/orders",
    summary = "List orders",
    params(OrderQuery),
    responses(
        (status = 200, description = "Orders retrieved", body = ApiResponse<Page<OrderDetail>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<OrderQuery>,
) -> ApiResult<Page<OrderDetail>> {
    let page = state.services.orders.find_all(query).await?;
    Ok(Json(ApiResponse::success(page)))
}

#[utoipa::path(
    get,
    path = "/api/v1/erp/orders/{id}",
    summary = "Get order",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order with customer and items", body = ApiResponse<OrderDetail>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<OrderDetail> {
    let order = state.services.orders.find_by_id(id).await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Confirm a draft order and queue it for fulfillment
#[utoipa::path(
    post,
    path = "/api/v1/erp/orders/{id}/confirm",
    summary = "Confirm order",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order confirmed and queued", body = ApiResponse<ConfirmOrderResponse>),
        (status = 400, description = "Order is not a draft", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn confirm_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<ConfirmOrderResponse> {
    let confirmed = state
        .services
        .orders
        .confirm_order(id, &auth_user.user_id)
        .await?;
    let message = confirmed.message.clone();
    let mut response = ApiResponse::success(confirmed);
    response.message = Some(message);
    Ok(Json(response))
}

#[utoipa::path(
    get,
    path = "/api/v1/erp/orders/{id}/processing-status",
    summary = "Order processing status",
    description = "State and progress of the background fulfillment job for this order.",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Processing status", body = ApiResponse<ProcessingStatus>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn get_processing_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ProcessingStatus> {
    let status = state.services.orders.get_processing_status(id).await?;
    Ok(Json(ApiResponse::success(status)))
}

#[utoipa::path(
    patch,
    path = "/api/v1/erp/orders/{id}/status",
    summary = "Set order status",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = ApiResponse<SalesOrderModel>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateOrderStatusRequest>,
) -> ApiResult<SalesOrderModel> {
    let order = state
        .services
        .orders
        .update_status(id, request.status)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/erp/orders/{id}",
    summary = "Delete draft order",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 204, description = "Order deleted"),
        (status = 400, description = "Order is not a draft", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn delete_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ServiceError> {
    state.services.orders.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
