use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthRouterExt;
use crate::entities::customer::Model as CustomerModel;
use crate::handlers::validation_failure;
use crate::services::customers::{CreateCustomerRequest, CustomerQuery, UpdateCustomerRequest};
use crate::services::Page;
use crate::{errors::ServiceError, ApiResponse, ApiResult, AppState};

pub fn customers_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_customers).post(create_customer))
        .route("/:id", get(get_customer).patch(update_customer))
        .with_auth()
}

#[utoipa::path(
    get,
    path = "/api/v1/erp/customers",
    summary = "List customers",
    params(CustomerQuery),
    responses(
        (status = 200, description = "Customers retrieved", body = ApiResponse<Page<CustomerModel>>),
    ),
    security(("Bearer" = [])),
    tag = "Customers"
)]
pub async fn list_customers(
    State(state): State<AppState>,
    Query(query): Query<CustomerQuery>,
) -> ApiResult<Page<CustomerModel>> {
    let page = state.services.customers.find_all(query).await?;
    Ok(Json(ApiResponse::success(page)))
}

#[utoipa::path(
    post,
    path = "/api/v1/erp/customers",
    summary = "Create customer",
    request_body = CreateCustomerRequest,
    responses(
        (status = 201, description = "Customer created", body = ApiResponse<CustomerModel>),
        (status = 400, description = "Invalid request data", body = crate::errors::ErrorResponse),
        (status = 409, description = "Email already registered", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Customers"
)]
pub async fn create_customer(
    State(state): State<AppState>,
    Json(request): Json<CreateCustomerRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CustomerModel>>), ServiceError> {
    if let Err(errors) = request.validate() {
        return Ok(validation_failure(&errors));
    }
    let customer = state.services.customers.create(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(customer))))
}

#[utoipa::path(
    get,
    path = "/api/v1/erp/customers/{id}",
    summary = "Get customer",
    params(("id" = Uuid, Path, description = "Customer ID")),
    responses(
        (status = 200, description = "Customer", body = ApiResponse<CustomerModel>),
        (status = 404, description = "Customer not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Customers"
)]
pub async fn get_customer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<CustomerModel> {
    let customer = state.services.customers.find_by_id(id).await?;
    Ok(Json(ApiResponse::success(customer)))
}

#[utoipa::path(
    patch,
    path = "/api/v1/erp/customers/{id}",
    summary = "Update customer",
    params(("id" = Uuid, Path, description = "Customer ID")),
    request_body = UpdateCustomerRequest,
    responses(
        (status = 200, description = "Customer updated", body = ApiResponse<CustomerModel>),
        (status = 400, description = "Invalid request data", body = crate::errors::ErrorResponse),
        (status = 404, description = "Customer not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Email already registered", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Customers"
)]
pub async fn update_customer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateCustomerRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CustomerModel>>), ServiceError> {
    if let Err(errors) = request.validate() {
        return Ok(validation_failure(&errors));
    }
    let customer = state.services.customers.update(id, request).await?;
    Ok((StatusCode::OK, Json(ApiResponse::success(customer))))
}
