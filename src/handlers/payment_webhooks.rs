use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use utoipa::{IntoParams, ToSchema};

use crate::{
    errors::{ErrorResponse, ServiceError},
    services::{Channel, ReconcileOutcome},
    AppState,
};

/// Identifiers the gateway sends on both the IPN and the browser callback
#[derive(Debug, Clone, Default, Deserialize, Serialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct PaymentNotificationParams {
    /// Gateway tracking id of the transaction
    #[serde(rename = "OrderTrackingId", alias = "orderTrackingId", default)]
    pub order_tracking_id: Option<String>,
    /// Our order id
    #[serde(rename = "OrderMerchantReference", alias = "orderMerchantReference", default)]
    pub order_merchant_reference: Option<String>,
    #[serde(rename = "OrderNotificationType", alias = "orderNotificationType", default)]
    pub order_notification_type: Option<String>,
}

impl PaymentNotificationParams {
    /// Both identifiers, trimmed, or a `BadRequest` naming what is missing
    pub fn identifiers(&self) -> Result<(String, String), ServiceError> {
        let present = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        match (
            present(&self.order_tracking_id),
            present(&self.order_merchant_reference),
        ) {
            (Some(tracking_id), Some(order_id)) => Ok((tracking_id, order_id)),
            (None, Some(_)) => Err(ServiceError::BadRequest("missing OrderTrackingId".into())),
            (Some(_), None) => Err(ServiceError::BadRequest(
                "missing OrderMerchantReference".into(),
            )),
            (None, None) => Err(ServiceError::BadRequest(
                "missing OrderTrackingId and OrderMerchantReference".into(),
            )),
        }
    }

    /// Fills fields missing here from `fallback`
    fn or(self, fallback: Self) -> Self {
        Self {
            order_tracking_id: self.order_tracking_id.or(fallback.order_tracking_id),
            order_merchant_reference: self
                .order_merchant_reference
                .or(fallback.order_merchant_reference),
            order_notification_type: self
                .order_notification_type
                .or(fallback.order_notification_type),
        }
    }

    /// Reads a POST body as JSON, then as a form; unreadable bodies yield no fields.
    fn from_body(body: &[u8]) -> Self {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Self::default();
        }
        if let Ok(params) = serde_json::from_slice::<Self>(body) {
            return params;
        }

        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(body) {
            let value = Some(value.into_owned());
            match key.as_ref() {
                "OrderTrackingId" | "orderTrackingId" => params.order_tracking_id = value,
                "OrderMerchantReference" | "orderMerchantReference" => {
                    params.order_merchant_reference = value
                }
                "OrderNotificationType" | "orderNotificationType" => {
                    params.order_notification_type = value
                }
                _ => {}
            }
        }
        params
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IpnAcknowledgement {
    /// `success` or `order_not_found`
    pub status: String,
    #[serde(rename = "orderTrackingId")]
    pub order_tracking_id: String,
    #[serde(rename = "orderMerchantReference")]
    pub order_merchant_reference: String,
}

/// Gateway IPN delivered as a GET with query parameters
#[utoipa::path(
    get,
    path = "/api/v1/payments/ipn",
    params(PaymentNotificationParams),
    responses(
        (status = 200, description = "Notification processed", body = IpnAcknowledgement),
        (status = 400, description = "Missing identifiers", body = ErrorResponse),
        (status = 500, description = "Processing failed; the gateway should retry", body = ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_ipn_get(
    State(state): State<AppState>,
    Query(params): Query<PaymentNotificationParams>,
) -> Response {
    handle_ipn(&state, params).await
}

/// Gateway IPN delivered as a POST; body fields win over query parameters
#[utoipa::path(
    post,
    path = "/api/v1/payments/ipn",
    params(PaymentNotificationParams),
    request_body = PaymentNotificationParams,
    responses(
        (status = 200, description = "Notification processed", body = IpnAcknowledgement),
        (status = 400, description = "Missing identifiers", body = ErrorResponse),
        (status = 500, description = "Processing failed; the gateway should retry", body = ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_ipn_post(
    State(state): State<AppState>,
    Query(query): Query<PaymentNotificationParams>,
    body: Bytes,
) -> Response {
    let params = PaymentNotificationParams::from_body(&body).or(query);
    handle_ipn(&state, params).await
}

async fn handle_ipn(state: &AppState, params: PaymentNotificationParams) -> Response {
    let (tracking_id, order_id) = match params.identifiers() {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "Rejected IPN with missing identifiers");
            return e.into_response();
        }
    };
    info!(
        tracking_id = %tracking_id,
        order_id = %order_id,
        notification_type = params.order_notification_type.as_deref().unwrap_or("unspecified"),
        "IPN received"
    );

    match state
        .reconciler
        .reconcile(Channel::Ipn, &tracking_id, &order_id)
        .await
    {
        Ok(outcome) => {
            let status = match outcome {
                ReconcileOutcome::Reconciled(_) => "success",
                // acknowledged so the gateway stops redelivering
                ReconcileOutcome::OrderNotFound => "order_not_found",
            };
            (
                StatusCode::OK,
                Json(IpnAcknowledgement {
                    status: status.to_string(),
                    order_tracking_id: tracking_id,
                    order_merchant_reference: order_id,
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(order_id = %order_id, error = %e, "IPN processing failed");
            ipn_failure(&e)
        }
    }
}

/// Any processing failure is a 500 so the gateway retries the delivery.
fn ipn_failure(err: &ServiceError) -> Response {
    let status = StatusCode::INTERNAL_SERVER_ERROR;
    let body = ErrorResponse {
        error: status.canonical_reason().unwrap_or("Error").to_string(),
        message: err.response_message(),
        details: None,
        request_id: crate::tracing::current_request_id().map(|rid| rid.to_string()),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    (status, Json(body)).into_response()
}
