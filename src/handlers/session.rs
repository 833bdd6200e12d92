use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use validator::Validate;

use crate::{auth::Identity, ApiResponse, ApiResult, AppState};

#[derive(Debug, Deserialize, Serialize, Validate, ToSchema)]
pub struct SessionRequest {
    /// Credential issued by the identity provider
    #[validate(length(min = 1))]
    pub credential: String,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct SessionResponse {
    pub identity: Identity,
    /// Guest orders attached to this account during sign-in
    pub linked_orders: usize,
}

/// Start a session
///
/// Verifies the credential, then links guest orders for the verified email.
/// Linking never fails the sign-in.
#[utoipa::path(
    post,
    path = "/api/v1/session",
    request_body = SessionRequest,
    responses(
        (status = 200, description = "Session established", body = ApiResponse<SessionResponse>),
        (status = 400, description = "Missing credential", body = crate::errors::ErrorResponse),
        (status = 401, description = "Invalid credential", body = crate::errors::ErrorResponse)
    ),
    tag = "Session"
)]
pub async fn create_session(
    State(state): State<AppState>,
    Json(payload): Json<SessionRequest>,
) -> ApiResult<SessionResponse> {
    payload.validate()?;
    let identity = state.verifier.verify(payload.credential.trim()).await?;

    let linked_orders = match identity.email.as_deref() {
        Some(email) => state.linker.link_on_session(email, &identity.user_id).await,
        None => 0,
    };

    info!(user_id = %identity.user_id, linked_orders, "Session created");
    Ok(Json(ApiResponse::success(SessionResponse {
        identity,
        linked_orders,
    })))
}
