use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use reqwest::{Client, RequestBuilder};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::{IpnRegistration, PaymentGateway, SubmitOrderRequest, SubmitOrderResponse, TransactionStatus};
use crate::config::GatewayConfig;
use crate::errors::ServiceError;

const TOKEN_PATH: &str = "/api/Auth/RequestToken";
const TRANSACTION_STATUS_PATH: &str = "/api/Transactions/GetTransactionStatus";
const SUBMIT_ORDER_PATH: &str = "/api/Transactions/SubmitOrderRequest";
const REGISTER_IPN_PATH: &str = "/api/URLSetup/RegisterIPN";

/// Tokens are refreshed this long before the gateway says they expire.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;
/// Lifetime assumed when the gateway omits or garbles `expiryDate`.
const FALLBACK_TOKEN_LIFETIME_SECS: i64 = 240;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + ChronoDuration::seconds(TOKEN_REFRESH_MARGIN_SECS) < self.expires_at
    }
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    consumer_key: &'a str,
    consumer_secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    #[serde(rename = "expiryDate")]
    expiry_date: Option<String>,
}

#[derive(Debug, Serialize)]
struct BillingAddress<'a> {
    email_address: &'a str,
}

#[derive(Debug, Serialize)]
struct SubmitOrderBody<'a> {
    id: &'a str,
    currency: &'a str,
    amount: f64,
    description: &'a str,
    callback_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    notification_id: Option<&'a str>,
    billing_address: BillingAddress<'a>,
}

#[derive(Debug, Serialize)]
struct RegisterIpnBody<'a> {
    url: &'a str,
    ipn_notification_type: &'a str,
}

/// REST client for the hosted-checkout gateway.
///
/// Every call carries a bearer token obtained from the gateway's auth
/// endpoint; the token is cached until shortly before it expires.
pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
    consumer_key: String,
    consumer_secret: String,
    token: RwLock<Option<CachedToken>>,
}

impl HttpPaymentGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ServiceError::ConfigError(format!("Failed to build gateway client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            consumer_key: config.consumer_key.clone(),
            consumer_secret: config.consumer_secret.clone(),
            token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn bearer_token(&self) -> Result<String, ServiceError> {
        let now = Utc::now();
        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.is_fresh(now) {
                return Ok(cached.token.clone());
            }
        }

        let mut slot = self.token.write().await;
        // another task may have refreshed while we waited for the lock
        if let Some(cached) = slot.as_ref() {
            if cached.is_fresh(now) {
                return Ok(cached.token.clone());
            }
        }

        let fresh = self.request_token().await?;
        let token = fresh.token.clone();
        *slot = Some(fresh);
        Ok(token)
    }

    #[instrument(skip(self))]
    async fn request_token(&self) -> Result<CachedToken, ServiceError> {
        let request = self.client.post(self.url(TOKEN_PATH)).json(&TokenRequest {
            consumer_key: &self.consumer_key,
            consumer_secret: &self.consumer_secret,
        });
        let body = send_json(request).await?;
        let response: TokenResponse = serde_json::from_value(body)?;

        let token = response
            .token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ServiceError::ExternalApiError("Gateway returned no token".into()))?;

        let expires_at = response
            .expiry_date
            .as_deref()
            .and_then(parse_expiry)
            .unwrap_or_else(|| Utc::now() + ChronoDuration::seconds(FALLBACK_TOKEN_LIFETIME_SECS));

        debug!(%expires_at, "Obtained gateway access token");
        Ok(CachedToken { token, expires_at })
    }
}

/// Parses `expiryDate`, which the gateway emits with or without an offset.
fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// Sends the request and returns the JSON body, mapping gateway-level errors.
async fn send_json(request: RequestBuilder) -> Result<Value, ServiceError> {
    let response = request
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        warn!(%status, body = %text, "Gateway request failed");
        return Err(ServiceError::ExternalApiError(format!(
            "Gateway responded with {}",
            status
        )));
    }

    let body: Value = response.json().await?;
    if let Some(error) = body.get("error").filter(|error| is_reported_error(error)) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| error.as_str())
            .unwrap_or("unspecified gateway error")
            .to_string();
        warn!(error = %error, "Gateway reported an error");
        return Err(ServiceError::ExternalApiError(message));
    }

    Ok(body)
}

/// Successful responses carry an `error` object whose fields are all null.
fn is_reported_error(error: &Value) -> bool {
    match error {
        Value::Null => false,
        Value::String(text) => !text.trim().is_empty(),
        Value::Object(fields) => fields.values().any(|value| !value.is_null()),
        _ => true,
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self))]
    async fn transaction_status(
        &self,
        tracking_id: &str,
    ) -> Result<TransactionStatus, ServiceError> {
        let token = self.bearer_token().await?;
        let request = self
            .client
            .get(self.url(TRANSACTION_STATUS_PATH))
            .bearer_auth(token)
            .query(&[("orderTrackingId", tracking_id)]);

        let body = send_json(request).await?;
        Ok(TransactionStatus::from_raw(body))
    }

    #[instrument(skip(self, request), fields(order_id = %request.merchant_reference))]
    async fn submit_order(
        &self,
        request: SubmitOrderRequest,
    ) -> Result<SubmitOrderResponse, ServiceError> {
        let amount = request.amount.to_f64().ok_or_else(|| {
            ServiceError::ValidationError(format!("Amount {} is not representable", request.amount))
        })?;
        let token = self.bearer_token().await?;

        let body = SubmitOrderBody {
            id: &request.merchant_reference,
            currency: &request.currency,
            amount,
            description: &request.description,
            callback_url: &request.callback_url,
            notification_id: request.notification_id.as_deref(),
            billing_address: BillingAddress {
                email_address: &request.email,
            },
        };
        let http_request = self
            .client
            .post(self.url(SUBMIT_ORDER_PATH))
            .bearer_auth(token)
            .json(&body);

        let response: SubmitOrderResponse = serde_json::from_value(send_json(http_request).await?)?;
        info!(tracking_id = %response.order_tracking_id, "Order submitted to gateway");
        Ok(response)
    }

    #[instrument(skip(self))]
    async fn register_ipn(&self, url: &str) -> Result<IpnRegistration, ServiceError> {
        let token = self.bearer_token().await?;
        let request = self
            .client
            .post(self.url(REGISTER_IPN_PATH))
            .bearer_auth(token)
            .json(&RegisterIpnBody {
                url,
                ipn_notification_type: "GET",
            });

        let registration: IpnRegistration = serde_json::from_value(send_json(request).await?)?;
        info!(ipn_id = %registration.ipn_id, "IPN endpoint registered with gateway");
        Ok(registration)
    }
}
