//! Storefront payments library
//!
//! Reconciles payment gateway notifications (IPN and browser callback) with
//! storefront orders, reduces stock once per paid order and links guest
//! orders to accounts at sign-in.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod middleware_helpers;
pub mod models;
pub mod notifications;
pub mod openapi;
pub mod repositories;
pub mod services;
pub mod tracing;

use axum::{
    extract::FromRef,
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::{
    auth::CredentialVerifier,
    config::AppConfig,
    gateway::PaymentGateway,
    notifications::NotificationDispatcher,
    repositories::OrderStore,
    services::{
        GuestOrderLinker, InventoryAdjuster, InventoryReductionGuard, OrderStatusService,
        PaymentSubmissionService, ReconciliationService,
    },
};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn OrderStore>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub reconciler: ReconciliationService,
    pub linker: GuestOrderLinker,
    pub submissions: PaymentSubmissionService,
    pub order_status: OrderStatusService,
}

impl AppState {
    /// Wires the services over the given collaborators
    pub fn new(
        config: AppConfig,
        store: Arc<dyn OrderStore>,
        gateway: Arc<dyn PaymentGateway>,
        adjuster: Arc<dyn InventoryAdjuster>,
        notifier: Arc<dyn NotificationDispatcher>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        let guard =
            InventoryReductionGuard::new(store.clone(), adjuster, config.inventory_claim_ttl());
        let reconciler = ReconciliationService::new(
            store.clone(),
            gateway.clone(),
            guard,
            notifier.clone(),
            config.reconcile_max_attempts,
        );
        let linker = GuestOrderLinker::new(
            store.clone(),
            config.guest_user_id.clone(),
            config.anonymous_user_prefix.clone(),
        );
        let submissions =
            PaymentSubmissionService::new(store.clone(), gateway, config.gateway.clone());
        let order_status = OrderStatusService::new(store.clone(), notifier);

        Self {
            config: Arc::new(config),
            store,
            verifier,
            reconciler,
            linker,
            submissions,
            order_status,
        }
    }
}

impl FromRef<AppState> for Arc<dyn CredentialVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.verifier.clone()
    }
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use chrono::DateTime;

    #[tokio::test]
    async fn success_response_includes_request_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-123"), async {
                ApiResponse::success("ok")
            })
            .await;

        assert!(response.success);
        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-123"));
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("timestamp should parse");
    }

    #[test]
    fn message_is_attached() {
        let response = ApiResponse::success(1).with_message("linked");
        assert_eq!(response.message.as_deref(), Some("linked"));
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

/// Routes mounted under `/api/v1`
pub fn api_v1_routes() -> Router<AppState> {
    let payments = Router::new()
        .route(
            "/payments/ipn",
            get(handlers::payment_webhooks::payment_ipn_get)
                .post(handlers::payment_webhooks::payment_ipn_post),
        )
        .route(
            "/payments/callback",
            get(handlers::payment_callback::payment_callback),
        )
        .route(
            "/payments/orders/:order_id/submit",
            post(handlers::payments::submit_order_payment),
        );

    let orders = Router::new()
        .route(
            "/orders/link-guest",
            post(handlers::orders::link_guest_orders),
        )
        .route("/orders/:order_id", get(handlers::orders::get_order))
        .route(
            "/orders/:order_id/status",
            put(handlers::orders::update_order_status),
        );

    Router::new()
        .merge(payments)
        .merge(orders)
        .route("/session", post(handlers::session::create_session))
}

/// The full application router with request tracing and request ids
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/api-docs/openapi.json", get(openapi::openapi_json))
        .nest("/api/v1", api_v1_routes())
        .layer(crate::tracing::configure_http_tracing())
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id::request_id_middleware,
        ))
        .with_state(state)
}
