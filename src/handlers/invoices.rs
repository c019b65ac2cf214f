use axum::{
    extract::{Path, Query, State},
    routing::{get, patch, post},
    Json, Router,
};
use uuid::Uuid;

use crate::auth::{AuthRouterExt, BACK_OFFICE};
use crate::entities::invoice::Model as InvoiceModel;
use crate::services::invoices::{
    InvoiceDetail, InvoiceQuery, InvoiceStats, SendInvoiceResponse, UpdateInvoiceStatusRequest,
};
use crate::services::Page;
use crate::{ApiResponse, ApiResult, AppState};

pub fn invoices_routes() -> Router<AppState> {
    let read = Router::new()
        .route("/", get(list_invoices))
        .route("/stats", get(get_invoice_stats))
        .route("/:id", get(get_invoice))
        .route("/:id/send", post(send_invoice))
        .with_auth();

    let manage = Router::new()
        .route("/:id/status", patch(update_invoice_status))
        .with_roles(BACK_OFFICE);

    read.merge(manage)
}

#[utoipa::path(
    get,
    path = "/api/v1/erp/invoices",
    summary = "List invoices",
    params(InvoiceQuery),
    responses(
        (status = 200, description = "Invoices retrieved", body = ApiResponse<Page<InvoiceDetail>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Invoices"
)]
pub async fn list_invoices(
    State(state): State<AppState>,
    Query(query): Query<InvoiceQuery>,
) -> ApiResult<Page<InvoiceDetail>> {
    let page = state.services.invoices.find_all(query).await?;
    Ok(Json(ApiResponse::success(page)))
}

/// Counts per status and revenue from paid invoices
#[utoipa::path(
    get,
    path = "/api/v1/erp/invoices/stats",
    summary = "Invoice statistics",
    responses(
        (status = 200, description = "Invoice statistics", body = ApiResponse<InvoiceStats>),
    ),
    security(("Bearer" = [])),
    tag = "Invoices"
)]
pub async fn get_invoice_stats(State(state): State<AppState>) -> ApiResult<InvoiceStats> {
    let stats = state.services.invoices.get_stats().await?;
    Ok(Json(ApiResponse::success(stats)))
}

#[utoipa::path(
    get,
    path = "/api/v1/erp/invoices/{id}",
    summary = "Get invoice",
    params(("id" = Uuid, Path, description = "Invoice ID")),
    responses(
        (status = 200, description = "Invoice with customer and order", body = ApiResponse<InvoiceDetail>),
        (status = 404, description = "Invoice not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Invoices"
)]
pub async fn get_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<InvoiceDetail> {
    let invoice = state.services.invoices.find_by_id(id).await?;
    Ok(Json(ApiResponse::success(invoice)))
}

#[utoipa::path(
    patch,
    path = "/api/v1/erp/invoices/{id}/status",
    summary = "Set invoice status",
    description = "Requires the admin or manager role. Marking PAID stamps the paid date.",
    params(("id" = Uuid, Path, description = "Invoice ID")),
    request_body = UpdateInvoiceStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = ApiResponse<InvoiceModel>),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Invoice not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Invoices"
)]
pub async fn update_invoice_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateInvoiceStatusRequest>,
) -> ApiResult<InvoiceModel> {
    let invoice = state
        .services
        .invoices
        .update_status(id, request.status)
        .await?;
    Ok(Json(ApiResponse::success(invoice)))
}

#[utoipa::path(
    post,
    path = "/api/v1/erp/invoices/{id}/send",
    summary = "Email invoice",
    params(("id" = Uuid, Path, description = "Invoice ID")),
    responses(
        (status = 200, description = "Send result", body = ApiResponse<SendInvoiceResponse>),
        (status = 400, description = "Invoice already paid", body = crate::errors::ErrorResponse),
        (status = 404, description = "Invoice not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Invoices"
)]
pub async fn send_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<SendInvoiceResponse> {
    let result = state.services.invoices.send_invoice(id).await?;
    Ok(Json(ApiResponse::success(result)))
}
