use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::auth::{AuthRouterExt, AuthUser, BACK_OFFICE};
use crate::entities::notification::Model as NotificationModel;
use crate::services::notifications::{DEFAULT_ADMIN_LIMIT, DEFAULT_USER_LIMIT};
use crate::services::MAX_PAGE_SIZE;
use crate::{ApiResponse, ApiResult, AppState};

pub fn notifications_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_notifications))
        .with_auth()
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct NotificationQuery {
    pub limit: Option<u64>,
    /// Every notification regardless of recipient; admin and manager only.
    pub all: Option<bool>,
}

/// Latest notifications for the caller, including broadcasts
#[utoipa::path(
    get,
    path = "/api/v1/erp/notifications",
    summary = "List notifications",
    params(NotificationQuery),
    responses(
        (status = 200, description = "Notifications, newest first", body = ApiResponse<Vec<NotificationModel>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Notifications"
)]
pub async fn list_notifications(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Query(query): Query<NotificationQuery>,
) -> ApiResult<Vec<NotificationModel>> {
    let service = &state.services.notifications;

    let notifications = if query.all.unwrap_or(false) && auth_user.has_any_role(BACK_OFFICE) {
        let limit = query.limit.unwrap_or(DEFAULT_ADMIN_LIMIT).clamp(1, MAX_PAGE_SIZE);
        service.all(limit).await?
    } else {
        let limit = query.limit.unwrap_or(DEFAULT_USER_LIMIT).clamp(1, MAX_PAGE_SIZE);
        service.for_user(&auth_user.user_id, limit).await?
    };

    Ok(Json(ApiResponse::success(notifications)))
}
