use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, patch},
    Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::auth::{AuthRouterExt, BACK_OFFICE};
use crate::entities::product::Model as ProductModel;
use crate::handlers::validation_failure;
use crate::services::products::{
    CreateProductRequest, ProductQuery, UpdateProductRequest, UpdateStockRequest,
};
use crate::services::Page;
use crate::{errors::ServiceError, ApiResponse, ApiResult, AppState};

pub fn products_routes() -> Router<AppState> {
    let catalog = Router::new()
        .route("/", get(list_products).post(create_product))
        .route("/low-stock", get(list_low_stock))
        .route("/:id", get(get_product).patch(update_product))
        .route("/:id/stock", patch(update_stock))
        .with_auth();

    let manage = Router::new()
        .route("/:id", delete(remove_product))
        .with_roles(BACK_OFFICE);

    catalog.merge(manage)
}

#[utoipa::path(
    get,
    path = "/api/v1/erp/products",
    summary = "List products",
    description = "Active products ordered by name. `search` matches name or SKU.",
    params(ProductQuery),
    responses(
        (status = 200, description = "Products retrieved", body = ApiResponse<Page<ProductModel>>),
    ),
    security(("Bearer" = [])),
    tag = "Products"
)]
pub async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<ProductQuery>,
) -> ApiResult<Page<ProductModel>> {
    let page = state.services.products.find_all(query).await?;
    Ok(Json(ApiResponse::success(page)))
}

#[utoipa::path(
    get,
    path = "/api/v1/erp/products/low-stock",
    summary = "Low stock products",
    responses(
        (status = 200, description = "Products at or below their threshold", body = ApiResponse<Vec<ProductModel>>),
    ),
    security(("Bearer" = [])),
    tag = "Products"
)]
pub async fn list_low_stock(State(state): State<AppState>) -> ApiResult<Vec<ProductModel>> {
    let products = state.services.products.low_stock().await?;
    Ok(Json(ApiResponse::success(products)))
}

#[utoipa::path(
    get,
    path = "/api/v1/erp/products/{id}",
    summary = "Get product",
    params(("id" = Uuid, Path, description = "Product ID")),
    responses(
        (status = 200, description = "Product", body = ApiResponse<ProductModel>),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Products"
)]
pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ProductModel> {
    let product = state.services.products.find_by_id(id).await?;
    Ok(Json(ApiResponse::success(product)))
}

#[utoipa::path(
    post,
    path = "/api/v1/erp/products",
    summary = "Create product",
    request_body = CreateProductRequest,
    responses(
        (status = 201, description = "Product created", body = ApiResponse<ProductModel>),
        (status = 400, description = "Invalid request data", body = crate::errors::ErrorResponse),
        (status = 409, description = "SKU already exists", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Products"
)]
pub async fn create_product(
    State(state): State<AppState>,
    Json(request): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ProductModel>>), ServiceError> {
    if let Err(errors) = request.validate() {
        return Ok(validation_failure(&errors));
    }
    let product = state.services.products.create(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(product))))
}

#[utoipa::path(
    patch,
    path = "/api/v1/erp/products/{id}",
    summary = "Update product",
    description = "Changes catalog fields. Order lines keep the unit price they were created with.",
    params(("id" = Uuid, Path, description = "Product ID")),
    request_body = UpdateProductRequest,
    responses(
        (status = 200, description = "Product updated", body = ApiResponse<ProductModel>),
        (status = 400, description = "Invalid request data", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Products"
)]
pub async fn update_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateProductRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ProductModel>>), ServiceError> {
    if let Err(errors) = request.validate() {
        return Ok(validation_failure(&errors));
    }
    let product = state.services.products.update(id, request).await?;
    Ok((StatusCode::OK, Json(ApiResponse::success(product))))
}

/// Manual stock adjustment, recorded in the inventory log
#[utoipa::path(
    patch,
    path = "/api/v1/erp/products/{id}/stock",
    summary = "Adjust stock",
    params(("id" = Uuid, Path, description = "Product ID")),
    request_body = UpdateStockRequest,
    responses(
        (status = 200, description = "Stock updated", body = ApiResponse<ProductModel>),
        (status = 400, description = "Invalid request data", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Products"
)]
pub async fn update_stock(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateStockRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ProductModel>>), ServiceError> {
    if let Err(errors) = request.validate() {
        return Ok(validation_failure(&errors));
    }
    let product = state.services.products.update_stock(id, request).await?;
    Ok((StatusCode::OK, Json(ApiResponse::success(product))))
}

#[utoipa::path(
    delete,
    path = "/api/v1/erp/products/{id}",
    summary = "Deactivate product",
    description = "Soft delete. Requires the admin or manager role.",
    params(("id" = Uuid, Path, description = "Product ID")),
    responses(
        (status = 200, description = "Product deactivated", body = ApiResponse<ProductModel>),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Products"
)]
pub async fn remove_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ProductModel> {
    let product = state.services.products.remove(id).await?;
    Ok(Json(ApiResponse::success(product)))
}
