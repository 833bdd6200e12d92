use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::{
    auth::{require_owner_or_admin, AuthUser},
    errors::ServiceError,
    ApiResponse, ApiResult, AppState,
};

/// Where to send the shopper to pay
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PaymentSubmission {
    pub order_id: String,
    pub tracking_id: String,
    pub redirect_url: String,
}

/// Submit an order to the payment gateway
#[utoipa::path(
    post,
    path = "/api/v1/payments/orders/{order_id}/submit",
    params(("order_id" = String, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order submitted", body = ApiResponse<PaymentSubmission>),
        (status = 401, description = "Missing or invalid credential", body = crate::errors::ErrorResponse),
        (status = 403, description = "Caller does not own the order", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order already submitted", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway unavailable", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn submit_order_payment(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(order_id): Path<String>,
) -> ApiResult<PaymentSubmission> {
    let order = state
        .store
        .get(&order_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
    require_owner_or_admin(&identity, &order.user_id)?;

    let response = state.submissions.submit(&order_id).await?;
    info!(order_id = %order_id, user_id = %identity.user_id, "Payment submission created");

    Ok(Json(ApiResponse::success(PaymentSubmission {
        order_id,
        tracking_id: response.order_tracking_id,
        redirect_url: response.redirect_url,
    })))
}
