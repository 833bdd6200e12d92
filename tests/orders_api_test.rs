mod common;

use axum::http::{Method, StatusCode};
use common::TestApp;
use serde_json::json;
use storefront_payments::{
    auth::Role,
    models::{OrderStatus, GUEST_USER_ID},
    notifications::NotificationKind,
};

#[tokio::test]
async fn session_links_guest_orders_once() {
    let app = TestApp::new();
    app.seed_guest_order("G1", "a@x.com").await;
    app.seed_order("G2", "anon_7f3a", "A@X.com").await;
    app.seed_guest_order("G3", "other@x.com").await;
    app.seed_order("G4", "someone-else", "a@x.com").await;

    let credential = app.token_for("uid-1", Some("a@x.com"), Role::Customer);
    let response = app
        .post_json("/api/v1/session", json!({ "credential": credential }), None)
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["data"]["linked_orders"], 2);
    assert_eq!(response.body["data"]["identity"]["user_id"], "uid-1");

    assert_eq!(app.order("G1").await.user_id, "uid-1");
    assert_eq!(app.order("G2").await.user_id, "uid-1");
    assert_eq!(app.order("G3").await.user_id, GUEST_USER_ID);
    assert_eq!(app.order("G4").await.user_id, "someone-else");

    let response = app
        .post_json("/api/v1/session", json!({ "credential": credential }), None)
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["data"]["linked_orders"], 0);
}

#[tokio::test]
async fn session_succeeds_when_guest_linking_fails() {
    let app = TestApp::new();
    app.seed_guest_order("G1", "a@x.com").await;
    app.faults.set_failing(true);

    let credential = app.token_for("uid-1", Some("a@x.com"), Role::Customer);
    let response = app
        .post_json("/api/v1/session", json!({ "credential": credential }), None)
        .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["data"]["linked_orders"], 0);
    assert_eq!(response.body["data"]["identity"]["user_id"], "uid-1");
    assert_eq!(app.order("G1").await.user_id, GUEST_USER_ID);

    // the next sign-in after recovery picks the order up
    app.faults.set_failing(false);
    let response = app
        .post_json("/api/v1/session", json!({ "credential": credential }), None)
        .await;
    assert_eq!(response.body["data"]["linked_orders"], 1);
}

#[tokio::test]
async fn session_with_invalid_credential_is_unauthorized() {
    let app = TestApp::new();

    let response = app
        .post_json("/api/v1/session", json!({ "credential": "not-a-jwt" }), None)
        .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn explicit_link_uses_the_verified_email() {
    let app = TestApp::new();
    app.seed_guest_order("G1", "a@x.com").await;

    let token = app.token_for("uid-1", Some("a@x.com"), Role::Customer);
    let response = app
        .request(Method::POST, "/api/v1/orders/link-guest", None, Some(&token))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["data"]["linked"], 1);

    let response = app
        .request(Method::POST, "/api/v1/orders/link-guest", None, Some(&token))
        .await;
    assert_eq!(response.body["data"]["linked"], 0);

    let no_email = app.token_for("uid-2", None, Role::Customer);
    let response = app
        .request(Method::POST, "/api/v1/orders/link-guest", None, Some(&no_email))
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn order_is_visible_to_owner_and_admin_only() {
    let app = TestApp::new();
    app.seed_order("O1", "uid-1", "a@x.com").await;

    let owner = app.token_for("uid-1", Some("a@x.com"), Role::Customer);
    let response = app
        .request(Method::GET, "/api/v1/orders/O1", None, Some(&owner))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["data"]["id"], "O1");
    assert_eq!(response.body["data"]["status"], "pending");

    let stranger = app.token_for("uid-2", None, Role::Customer);
    let response = app
        .request(Method::GET, "/api/v1/orders/O1", None, Some(&stranger))
        .await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);

    let admin = app.token_for("admin-1", None, Role::Admin);
    let response = app
        .request(Method::GET, "/api/v1/orders/O1", None, Some(&admin))
        .await;
    assert_eq!(response.status, StatusCode::OK);

    let response = app.get("/api/v1/orders/O1").await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_status_update_bypasses_the_rank_guard() {
    let app = TestApp::new();
    app.seed_order("O1", "uid-1", "a@x.com").await;
    let admin = app.token_for("admin-1", None, Role::Admin);

    for status in ["shipped", "processing"] {
        let response = app
            .request(
                Method::PUT,
                "/api/v1/orders/O1/status",
                Some(("application/json", json!({ "status": status }).to_string())),
                Some(&admin),
            )
            .await;
        assert_eq!(response.status, StatusCode::OK);
    }
    assert_eq!(app.order("O1").await.status, OrderStatus::Processing);

    let notifications = app.notifier.drain().await;
    assert_eq!(notifications.len(), 2);
    assert!(notifications
        .iter()
        .all(|(_, kind)| *kind == NotificationKind::OrderStatusChanged));
}

#[tokio::test]
async fn status_update_rejects_unknown_values_and_non_admins() {
    let app = TestApp::new();
    app.seed_order("O1", "uid-1", "a@x.com").await;

    let admin = app.token_for("admin-1", None, Role::Admin);
    let response = app
        .request(
            Method::PUT,
            "/api/v1/orders/O1/status",
            Some(("application/json", json!({ "status": "on_hold" }).to_string())),
            Some(&admin),
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    let owner = app.token_for("uid-1", Some("a@x.com"), Role::Customer);
    let response = app
        .request(
            Method::PUT,
            "/api/v1/orders/O1/status",
            Some(("application/json", json!({ "status": "completed" }).to_string())),
            Some(&owner),
        )
        .await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(app.order("O1").await.status, OrderStatus::Pending);
}

#[tokio::test]
async fn submitting_an_order_records_the_tracking_id() {
    let app = TestApp::new();
    app.seed_order("O1", "uid-1", "a@x.com").await;
    let owner = app.token_for("uid-1", Some("a@x.com"), Role::Customer);

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/orders/O1/submit",
            None,
            Some(&owner),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["data"]["tracking_id"], "T-O1");
    assert!(response.body["data"]["redirect_url"]
        .as_str()
        .unwrap_or_default()
        .starts_with("https://pay.example.com/"));

    assert_eq!(
        app.order("O1").await.payment_tracking_id.as_deref(),
        Some("T-O1")
    );
    let submissions = app.gateway.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].amount, rust_decimal::Decimal::new(3500, 2));
    assert_eq!(submissions[0].notification_id.as_deref(), Some("ipn-test"));

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/orders/O1/submit",
            None,
            Some(&owner),
        )
        .await;
    assert_eq!(response.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn health_and_openapi_are_served() {
    let app = TestApp::new();

    let health = app.get("/health").await;
    assert_eq!(health.status, StatusCode::OK);
    assert_eq!(health.body["status"], "up");
    assert_eq!(health.body["store"], "up");

    let docs = app.get("/api-docs/openapi.json").await;
    assert_eq!(docs.status, StatusCode::OK);
    assert!(docs.body["paths"]["/api/v1/payments/ipn"].is_object());
}

#[tokio::test]
async fn health_reports_an_unreachable_store() {
    let app = TestApp::new();
    app.faults.set_failing(true);

    let health = app.get("/health").await;

    assert_eq!(health.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health.body["status"], "down");
    assert_eq!(health.body["store"], "down");
}
