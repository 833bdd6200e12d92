use axum::Json;
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront Payments API",
        version = "0.1.0",
        description = r#"
# Storefront Payments API

Reconciles payment gateway notifications with storefront orders.

## Payment notifications

The gateway reports payments on two independent paths that may arrive in any
order and any number of times:

- **IPN** (`/api/v1/payments/ipn`): server-to-server, GET or POST. Answered
  with JSON; a 500 asks the gateway to retry.
- **Callback** (`/api/v1/payments/callback`): the shopper's browser returning
  from the hosted payment page. Answered with a redirect to the dashboard.

Both carry `OrderTrackingId` and `OrderMerchantReference`. The payment status
is always fetched from the gateway; order status only ever moves forward and
stock is reduced once per order.

## Authentication

Order and session endpoints take a bearer credential:

```
Authorization: Bearer <your-jwt-token>
```
        "#
    ),
    tags(
        (name = "Payments", description = "Gateway notifications and order submission"),
        (name = "Orders", description = "Order access and administration"),
        (name = "Session", description = "Sign-in and guest order linking"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        crate::handlers::payment_webhooks::payment_ipn_get,
        crate::handlers::payment_webhooks::payment_ipn_post,
        crate::handlers::payment_callback::payment_callback,
        crate::handlers::payments::submit_order_payment,
        crate::handlers::orders::get_order,
        crate::handlers::orders::update_order_status,
        crate::handlers::orders::link_guest_orders,
        crate::handlers::session::create_session,
        crate::handlers::health::health_check,
    ),
    components(
        schemas(
            crate::models::Order,
            crate::models::OrderItem,
            crate::models::OrderStatus,
            crate::models::PaymentStatus,
            crate::auth::Identity,
            crate::auth::Role,
            crate::handlers::payment_webhooks::PaymentNotificationParams,
            crate::handlers::payment_webhooks::IpnAcknowledgement,
            crate::handlers::payments::PaymentSubmission,
            crate::handlers::orders::UpdateOrderStatusRequest,
            crate::handlers::orders::LinkGuestOrdersResponse,
            crate::handlers::session::SessionRequest,
            crate::handlers::session::SessionResponse,
            crate::handlers::health::HealthResponse,
            crate::errors::ErrorResponse
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

/// Serves the generated document at `/api-docs/openapi.json`
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDocV1::openapi())
}
