use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    auth::{require_admin, require_owner_or_admin, AuthUser},
    errors::ServiceError,
    models::Order,
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Deserialize, Serialize, Validate, ToSchema)]
pub struct UpdateOrderStatusRequest {
    /// One of pending, processing, shipped, delivered, completed, cancelled
    #[validate(length(min = 1))]
    pub status: String,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct LinkGuestOrdersResponse {
    pub linked: usize,
}

/// Get an order
#[utoipa::path(
    get,
    path = "/api/v1/orders/{order_id}",
    params(("order_id" = String, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order found", body = ApiResponse<Order>),
        (status = 403, description = "Caller does not own the order", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(order_id): Path<String>,
) -> ApiResult<Order> {
    let order = state
        .store
        .get(&order_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
    require_owner_or_admin(&identity, &order.user_id)?;
    Ok(Json(ApiResponse::success(order)))
}

/// Set an order's status (administrators)
///
/// Written as given; payment reconciliation's forward-only rule does not apply here.
#[utoipa::path(
    put,
    path = "/api/v1/orders/{order_id}/status",
    params(("order_id" = String, Path, description = "Order id")),
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = ApiResponse<Order>),
        (status = 400, description = "Unknown status", body = crate::errors::ErrorResponse),
        (status = 403, description = "Administrator role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(order_id): Path<String>,
    Json(payload): Json<UpdateOrderStatusRequest>,
) -> ApiResult<Order> {
    require_admin(&identity)?;
    payload.validate()?;

    let order = state
        .order_status
        .update_status(&order_id, &payload.status)
        .await?;
    info!(order_id = %order_id, admin = %identity.user_id, status = %order.status, "Order status set by administrator");
    Ok(Json(ApiResponse::success(order)))
}

/// Link guest orders placed with the caller's verified email
#[utoipa::path(
    post,
    path = "/api/v1/orders/link-guest",
    responses(
        (status = 200, description = "Orders linked", body = ApiResponse<LinkGuestOrdersResponse>),
        (status = 400, description = "Credential carries no email", body = crate::errors::ErrorResponse),
        (status = 401, description = "Missing or invalid credential", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn link_guest_orders(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> ApiResult<LinkGuestOrdersResponse> {
    let email = identity
        .email
        .as_deref()
        .ok_or_else(|| ServiceError::BadRequest("Credential carries no email".into()))?;

    let linked = state.linker.link(email, &identity.user_id).await?;
    Ok(Json(ApiResponse::success(LinkGuestOrdersResponse { linked })))
}
