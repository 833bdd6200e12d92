use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use strum::{AsRefStr, Display};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::config::NotificationConfig;
use crate::errors::ServiceError;
use crate::models::{Order, OrderStatus, PaymentStatus};

type HmacSha256 = Hmac<Sha256>;

/// Order events the storefront mails customers about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationKind {
    PaymentConfirmed,
    OrderStatusChanged,
}

/// Payload delivered to the mail relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub event: NotificationKind,
    pub order_id: String,
    pub user_id: String,
    pub user_email: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub total_amount: Decimal,
    pub currency: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl NotificationEvent {
    pub fn new(order: &Order, kind: NotificationKind, extra: Option<Value>) -> Self {
        Self {
            event: kind,
            order_id: order.id.clone(),
            user_id: order.user_id.clone(),
            user_email: order.user_email.clone(),
            status: order.status,
            payment_status: order.payment_status,
            total_amount: order.total_amount(),
            currency: order.currency.clone(),
            occurred_at: Utc::now(),
            extra,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(
        &self,
        order: &Order,
        kind: NotificationKind,
        extra: Option<Value>,
    ) -> Result<(), ServiceError>;
}

/// HMAC signature generator for relay authentication
pub struct SignatureGenerator {
    secret: String,
}

impl SignatureGenerator {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Hex HMAC-SHA256 over `"{timestamp}.{body}"`
    pub fn sign_payload(&self, timestamp: &str, body: &str) -> Result<String, ServiceError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ServiceError::ConfigError(format!("Invalid signing secret: {}", e)))?;
        mac.update(format!("{}.{}", timestamp, body).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Posts order events to an HTTP mail relay
pub struct WebhookNotificationDispatcher {
    client: reqwest::Client,
    url: String,
    signature_generator: Option<SignatureGenerator>,
    max_retries: u32,
    base_backoff: Duration,
}

impl WebhookNotificationDispatcher {
    pub fn new(url: String, config: &NotificationConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| {
                ServiceError::ConfigError(format!("Failed to build notification client: {}", e))
            })?;

        Ok(Self {
            client,
            url,
            signature_generator: config.signing_secret.clone().map(SignatureGenerator::new),
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
        })
    }

    pub fn with_retry_policy(mut self, max_retries: u32, base_backoff: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.base_backoff = base_backoff;
        self
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookNotificationDispatcher {
    #[instrument(skip(self, order, extra), fields(order_id = %order.id, kind = %kind))]
    async fn send(
        &self,
        order: &Order,
        kind: NotificationKind,
        extra: Option<Value>,
    ) -> Result<(), ServiceError> {
        let body = serde_json::to_string(&NotificationEvent::new(order, kind, extra))?;
        let timestamp = Utc::now().timestamp().to_string();
        let signature = self
            .signature_generator
            .as_ref()
            .map(|generator| generator.sign_payload(&timestamp, &body))
            .transpose()?;

        for attempt in 1..=self.max_retries {
            let mut request = self
                .client
                .post(&self.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header("x-timestamp", &timestamp)
                .body(body.clone());
            if let Some(ref sig) = signature {
                request = request.header("x-signature", sig);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    info!("Notification delivered");
                    return Ok(());
                }
                Ok(response) => warn!(
                    "Notification relay responded with {} (attempt {}/{})",
                    response.status(),
                    attempt,
                    self.max_retries
                ),
                Err(e) => warn!(
                    "Notification delivery error: {} (attempt {}/{})",
                    e, attempt, self.max_retries
                ),
            }

            if attempt < self.max_retries {
                tokio::time::sleep(self.base_backoff * 2_u32.pow(attempt - 1)).await;
            }
        }

        Err(ServiceError::NotificationError(format!(
            "Failed to deliver {} notification after {} attempts",
            kind, self.max_retries
        )))
    }
}

/// Stand-in used when no relay is configured; records the event in the log
#[derive(Debug, Clone, Default)]
pub struct LogNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for LogNotificationDispatcher {
    async fn send(
        &self,
        order: &Order,
        kind: NotificationKind,
        _extra: Option<Value>,
    ) -> Result<(), ServiceError> {
        info!(
            order_id = %order.id,
            user_email = %order.user_email,
            kind = %kind,
            "Notification (no relay configured)"
        );
        Ok(())
    }
}

/// Picks the relay dispatcher when a URL is configured, the log stand-in otherwise
pub fn dispatcher_from_config(
    config: &NotificationConfig,
) -> Result<Arc<dyn NotificationDispatcher>, ServiceError> {
    match config.webhook_url.as_deref().filter(|url| !url.trim().is_empty()) {
        Some(url) => Ok(Arc::new(WebhookNotificationDispatcher::new(
            url.to_string(),
            config,
        )?)),
        None => Ok(Arc::new(LogNotificationDispatcher)),
    }
}

/// Sends on a detached task. The caller never awaits the outcome; failures
/// are only logged and counted.
pub fn dispatch_detached(
    dispatcher: Arc<dyn NotificationDispatcher>,
    order: Order,
    kind: NotificationKind,
    extra: Option<Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = dispatcher.send(&order, kind, extra).await {
            counter!("storefront.notifications.failed", 1, "kind" => kind.as_ref().to_string());
            error!(order_id = %order.id, kind = %kind, error = %e, "Notification dispatch failed");
        }
    })
}
