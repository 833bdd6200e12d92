use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tracing::{error, info, warn};
use url::Url;

use super::payment_webhooks::PaymentNotificationParams;
use crate::{
    services::{Channel, PaymentOutcome, ReconcileOutcome},
    AppState,
};

/// Browser return from the hosted payment page.
///
/// Reconciles like the IPN, then redirects to the dashboard with the outcome.
#[utoipa::path(
    get,
    path = "/api/v1/payments/callback",
    params(PaymentNotificationParams),
    responses(
        (status = 302, description = "Redirect to the storefront dashboard with the payment outcome"),
        (status = 400, description = "Missing identifiers", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_callback(
    State(state): State<AppState>,
    Query(params): Query<PaymentNotificationParams>,
) -> Response {
    let (tracking_id, order_id) = match params.identifiers() {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "Rejected payment callback with missing identifiers");
            return e.into_response();
        }
    };

    let outcome = match state
        .reconciler
        .reconcile(Channel::Callback, &tracking_id, &order_id)
        .await
    {
        Ok(ReconcileOutcome::Reconciled(report)) => report.payment_outcome(),
        Ok(ReconcileOutcome::OrderNotFound) => {
            warn!(order_id = %order_id, "Payment callback for unknown order");
            PaymentOutcome::Error
        }
        Err(e) => {
            // the order id stays on the redirect for manual follow-up
            error!(order_id = %order_id, error = %e, "Payment callback processing failed");
            PaymentOutcome::Error
        }
    };

    info!(order_id = %order_id, outcome = %outcome, "Redirecting payment callback");
    redirect(&dashboard_location(
        &state.config.dashboard_url(),
        outcome,
        &order_id,
        Utc::now().timestamp_millis(),
    ))
}

/// `{dashboard}?payment={outcome}&orderId={id}&timestamp={epoch millis}`
pub fn dashboard_location(
    dashboard_url: &str,
    outcome: PaymentOutcome,
    order_id: &str,
    timestamp_millis: i64,
) -> String {
    let timestamp = timestamp_millis.to_string();
    match Url::parse(dashboard_url) {
        Ok(mut url) => {
            url.query_pairs_mut()
                .append_pair("payment", outcome.as_ref())
                .append_pair("orderId", order_id)
                .append_pair("timestamp", &timestamp);
            url.to_string()
        }
        Err(e) => {
            warn!(error = %e, "Dashboard URL is not absolute; building redirect by hand");
            let query: String = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("payment", outcome.as_ref())
                .append_pair("orderId", order_id)
                .append_pair("timestamp", &timestamp)
                .finish();
            format!("{}?{}", dashboard_url, query)
        }
    }
}

fn redirect(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}
