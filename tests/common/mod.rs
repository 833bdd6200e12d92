#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use storefront_payments::{
    app_router,
    auth::{Identity, JwtCredentialVerifier, Role},
    config::{AppConfig, MEMORY_DATABASE_URL},
    errors::ServiceError,
    gateway::{
        IpnRegistration, PaymentGateway, SubmitOrderRequest, SubmitOrderResponse,
        TransactionStatus,
    },
    models::{Order, OrderItem, OrderPatch, GUEST_USER_ID},
    notifications::{NotificationDispatcher, NotificationKind},
    repositories::{InMemoryOrderStore, OrderStore},
    services::InMemoryInventoryAdjuster,
    AppState,
};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const APP_URL: &str = "https://shop.example.com";

/// Gateway answering from a per-tracking-id script
#[derive(Default)]
pub struct ScriptedGateway {
    statuses: DashMap<String, Value>,
    failing: AtomicBool,
    status_calls: AtomicUsize,
    submissions: Mutex<Vec<SubmitOrderRequest>>,
}

impl ScriptedGateway {
    pub fn set_status(&self, tracking_id: &str, raw: Value) {
        self.statuses.insert(tracking_id.to_string(), raw);
    }

    pub fn set_completed(&self, tracking_id: &str) {
        self.set_status(
            tracking_id,
            json!({
                "payment_status_description": "Completed",
                "status_code": 1,
                "confirmation_code": "CONF-1",
            }),
        );
    }

    pub fn set_failed(&self, tracking_id: &str) {
        self.set_status(
            tracking_id,
            json!({ "payment_status_description": "Failed", "status_code": 2 }),
        );
    }

    pub fn set_pending(&self, tracking_id: &str) {
        self.set_status(
            tracking_id,
            json!({ "payment_status_description": "Pending", "status_code": 0 }),
        );
    }

    pub fn fail_requests(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> Vec<SubmitOrderRequest> {
        self.submissions
            .lock()
            .map(|submissions| submissions.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn transaction_status(&self, tracking_id: &str) -> Result<TransactionStatus, ServiceError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ServiceError::ExternalServiceError("gateway unreachable".into()));
        }
        let raw = self
            .statuses
            .get(tracking_id)
            .map(|entry| entry.clone())
            .unwrap_or_else(|| json!({ "payment_status_description": "Pending" }));
        Ok(TransactionStatus::from_raw(raw))
    }

    async fn submit_order(
        &self,
        request: SubmitOrderRequest,
    ) -> Result<SubmitOrderResponse, ServiceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ServiceError::ExternalServiceError("gateway unreachable".into()));
        }
        let merchant_reference = request.merchant_reference.clone();
        if let Ok(mut submissions) = self.submissions.lock() {
            submissions.push(request);
        }
        Ok(SubmitOrderResponse {
            order_tracking_id: format!("T-{}", merchant_reference),
            merchant_reference: Some(merchant_reference.clone()),
            redirect_url: format!("https://pay.example.com/iframe?ref={}", merchant_reference),
        })
    }

    async fn register_ipn(&self, url: &str) -> Result<IpnRegistration, ServiceError> {
        Ok(IpnRegistration {
            ipn_id: "ipn-test".into(),
            url: Some(url.to_string()),
        })
    }
}

/// In-memory store whose guest lookups and health ping can be switched to fail
pub struct FaultyStore {
    inner: Arc<InMemoryOrderStore>,
    failing: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<InMemoryOrderStore>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), ServiceError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(ServiceError::InternalError("order store unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl OrderStore for FaultyStore {
    async fn get(&self, order_id: &str) -> Result<Option<Order>, ServiceError> {
        self.inner.get(order_id).await
    }

    async fn create(&self, order: Order) -> Result<(), ServiceError> {
        self.inner.create(order).await
    }

    async fn update(
        &self,
        order_id: &str,
        patch: OrderPatch,
        expected_version: Option<i64>,
    ) -> Result<bool, ServiceError> {
        self.inner.update(order_id, patch, expected_version).await
    }

    async fn find_unlinked_by_email(
        &self,
        email: &str,
        guest_user_id: &str,
        anonymous_prefix: &str,
    ) -> Result<Vec<Order>, ServiceError> {
        self.check()?;
        self.inner
            .find_unlinked_by_email(email, guest_user_id, anonymous_prefix)
            .await
    }

    async fn claim_inventory_reduction(
        &self,
        order_id: &str,
        token: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        self.inner
            .claim_inventory_reduction(order_id, token, now, stale_before)
            .await
    }

    async fn complete_inventory_reduction(
        &self,
        order_id: &str,
        token: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        self.inner.complete_inventory_reduction(order_id, token, at).await
    }

    async fn release_inventory_claim(
        &self,
        order_id: &str,
        token: Uuid,
    ) -> Result<(), ServiceError> {
        self.inner.release_inventory_claim(order_id, token).await
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        self.check()?;
        self.inner.ping().await
    }
}

/// Notifier forwarding every send to a channel the test can wait on
pub struct RecordingNotifier {
    tx: mpsc::UnboundedSender<(String, NotificationKind)>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<(String, NotificationKind)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: AsyncMutex::new(rx),
        }
    }

    /// Next notification, or `None` if nothing arrives within `wait`
    pub async fn next(&self, wait: Duration) -> Option<(String, NotificationKind)> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
    }

    /// Drains everything sent so far after giving detached tasks a moment to run
    pub async fn drain(&self) -> Vec<(String, NotificationKind)> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut rx = self.rx.lock().await;
        let mut received = Vec::new();
        while let Ok(item) = rx.try_recv() {
            received.push(item);
        }
        received
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingNotifier {
    async fn send(
        &self,
        order: &Order,
        kind: NotificationKind,
        _extra: Option<Value>,
    ) -> Result<(), ServiceError> {
        let _ = self.tx.send((order.id.clone(), kind));
        Ok(())
    }
}

pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl Response {
    pub fn location(&self) -> String {
        self.headers
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }
}

/// Application wired over the in-memory store with scripted collaborators
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub store: Arc<InMemoryOrderStore>,
    pub faults: Arc<FaultyStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub adjuster: InMemoryInventoryAdjuster,
    pub notifier: Arc<RecordingNotifier>,
    verifier: Arc<JwtCredentialVerifier>,
}

impl TestApp {
    pub fn new() -> Self {
        let mut cfg = AppConfig::new(
            MEMORY_DATABASE_URL.to_string(),
            APP_URL.to_string(),
            TEST_JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.gateway.callback_url = Some(format!("{}/api/v1/payments/callback", APP_URL));
        cfg.gateway.ipn_id = Some("ipn-test".into());

        let store = Arc::new(InMemoryOrderStore::new());
        let faults = Arc::new(FaultyStore::new(store.clone()));
        let gateway = Arc::new(ScriptedGateway::default());
        let adjuster = InMemoryInventoryAdjuster::new();
        let notifier = Arc::new(RecordingNotifier::new());
        let verifier = Arc::new(JwtCredentialVerifier::new(TEST_JWT_SECRET));

        let state = AppState::new(
            cfg,
            faults.clone(),
            gateway.clone(),
            Arc::new(adjuster.clone()),
            notifier.clone(),
            verifier.clone(),
        );

        Self {
            router: app_router(state.clone()),
            state,
            store,
            faults,
            gateway,
            adjuster,
            notifier,
            verifier,
        }
    }

    /// Stores an order for `p-1` x2 and `p-2` x1 and seeds stock of 10 each
    pub async fn seed_order(&self, order_id: &str, user_id: &str, email: &str) -> Order {
        let order = Order::new(
            order_id,
            user_id,
            email,
            vec![
                OrderItem {
                    product_id: "p-1".into(),
                    quantity: 2,
                    price: Decimal::new(1500, 2),
                },
                OrderItem {
                    product_id: "p-2".into(),
                    quantity: 1,
                    price: Decimal::new(500, 2),
                },
            ],
            "KES",
        );
        self.adjuster.set_stock("p-1", 10);
        self.adjuster.set_stock("p-2", 10);
        self.store
            .create(order.clone())
            .await
            .expect("seed order");
        order
    }

    pub async fn seed_guest_order(&self, order_id: &str, email: &str) -> Order {
        self.seed_order(order_id, GUEST_USER_ID, email).await
    }

    pub async fn order(&self, order_id: &str) -> Order {
        self.store
            .get(order_id)
            .await
            .expect("store read")
            .expect("order exists")
    }

    pub fn token_for(&self, user_id: &str, email: Option<&str>, role: Role) -> String {
        self.verifier
            .issue(
                &Identity {
                    user_id: user_id.to_string(),
                    email: email.map(str::to_string),
                    role,
                },
                chrono::Duration::hours(1),
            )
            .expect("issue test credential")
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<(&str, String)>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some((content_type, body)) => builder
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(body)),
            None => builder.body(Body::empty()),
        }
        .expect("build request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        Response {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, uri: &str) -> Response {
        self.request(Method::GET, uri, None, None).await
    }

    pub async fn post_json(&self, uri: &str, body: Value, token: Option<&str>) -> Response {
        self.request(
            Method::POST,
            uri,
            Some(("application/json", body.to_string())),
            token,
        )
        .await
    }
}

pub fn ipn_uri(tracking_id: &str, order_id: &str) -> String {
    format!(
        "/api/v1/payments/ipn?OrderTrackingId={}&OrderMerchantReference={}&OrderNotificationType=IPNCHANGE",
        tracking_id, order_id
    )
}

pub fn callback_uri(tracking_id: &str, order_id: &str) -> String {
    format!(
        "/api/v1/payments/callback?OrderTrackingId={}&OrderMerchantReference={}",
        tracking_id, order_id
    )
}
