//! Paystack payment provider implementation
//!
//! Redirect-based flow: `/transaction/initialize` returns an `authorization_url` the customer is
//! sent to, and the outcome arrives as a `charge.*` webhook or is polled with
//! `/transaction/verify/{reference}`. Our payment id doubles as the Paystack reference.

use crate::error::{AppError, AppResult, ExternalError};
use crate::payments::status::PaymentStatus;
use crate::payments::status_mapper::{PaystackStatusMapper, StatusMapper};
use crate::payments::traits::PaymentGateway;
use crate::payments::types::{
    GatewayResult, Money, PaymentIntentRequest, PaymentMethod, RefundRequest, RefundResult,
    WebhookEvent,
};
use crate::payments::webhook::SignatureScheme;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info, warn};

const PROVIDER: &str = "Paystack";

/// Paystack payment provider configuration
#[derive(Clone)]
pub struct PaystackConfig {
    /// Paystack API secret key, also the webhook signing key
    pub secret_key: String,
    /// Paystack API base URL (defaults to https://api.paystack.co)
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Maximum number of retries for idempotent reads
    pub max_retries: u32,
    /// Verify `x-paystack-signature` on webhooks
    pub sign_webhooks: bool,
}

impl Default for PaystackConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            base_url: "https://api.paystack.co".to_string(),
            timeout_secs: 30,
            max_retries: 3,
            sign_webhooks: true,
        }
    }
}

impl std::fmt::Debug for PaystackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaystackConfig")
            .field("secret_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("sign_webhooks", &self.sign_webhooks)
            .finish()
    }
}

impl PaystackConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        let secret_key = std::env::var("PAYSTACK_SECRET_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                AppError::configuration("PAYSTACK_SECRET_KEY environment variable is required")
            })?;

        let base_url = std::env::var("PAYSTACK_BASE_URL")
            .unwrap_or_else(|_| "https://api.paystack.co".to_string());

        let timeout_secs = std::env::var("PAYSTACK_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let max_retries = std::env::var("PAYSTACK_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let sign_webhooks = std::env::var("PAYSTACK_SIGN_WEBHOOKS")
            .map(|s| !matches!(s.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no"))
            .unwrap_or(true);

        Ok(Self {
            secret_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs,
            max_retries,
            sign_webhooks,
        })
    }
}

/// Answer from the Paystack API that reached the business layer.
enum PaystackReply<T> {
    /// `status: true` with a decoded `data` object
    Accepted { data: T, raw: Value },
    /// Paystack understood the request and refused it
    Rejected { message: String, raw: Value },
}

/// Paystack payment provider
pub struct PaystackProvider {
    config: PaystackConfig,
    client: Client,
    mapper: PaystackStatusMapper,
}

fn provider_error(message: impl Into<String>, is_retryable: bool) -> AppError {
    ExternalError::PaymentProvider {
        provider: PROVIDER.to_string(),
        message: message.into(),
        is_retryable,
    }
    .into()
}

impl PaystackProvider {
    /// Create a new Paystack provider instance
    pub fn new(config: PaystackConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            client,
            mapper: PaystackStatusMapper,
        })
    }

    /// Create provider from environment variables
    pub fn from_env() -> AppResult<Self> {
        Self::new(PaystackConfig::from_env()?)
    }

    /// Make an authenticated request to the Paystack API
    ///
    /// Only idempotent reads pass `retry = true`; writes are sent exactly once so a lost
    /// response can never open a second transaction or issue a second refund.
    async fn make_request<T>(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        body: Option<&Value>,
        retry: bool,
    ) -> AppResult<PaystackReply<T>>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.config.base_url, endpoint);
        let max_retries = if retry { self.config.max_retries } else { 0 };
        let mut attempt: u32 = 0;

        loop {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&self.config.secret_key);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    if attempt < max_retries {
                        let backoff = 2_u64.pow(attempt);
                        warn!(
                            endpoint = %endpoint,
                            attempt = attempt + 1,
                            backoff_secs = backoff,
                            error = %e,
                            "Paystack request error, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                        attempt += 1;
                        continue;
                    }
                    if e.is_timeout() {
                        return Err(ExternalError::Timeout {
                            service: PROVIDER.to_string(),
                            seconds: self.config.timeout_secs,
                        }
                        .into());
                    }
                    return Err(provider_error(
                        format!("Request failed after {} attempts: {}", attempt + 1, e),
                        true,
                    ));
                }
            };

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| provider_error(format!("Failed to read response: {}", e), true))?;

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if attempt < max_retries {
                    let backoff = 2_u64.pow(attempt);
                    warn!(
                        endpoint = %endpoint,
                        http_status = %status,
                        attempt = attempt + 1,
                        backoff_secs = backoff,
                        "Paystack unavailable, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    attempt += 1;
                    continue;
                }
                if status == StatusCode::TOO_MANY_REQUESTS {
                    return Err(ExternalError::RateLimit {
                        service: PROVIDER.to_string(),
                        retry_after: Some(60),
                    }
                    .into());
                }
                error!(endpoint = %endpoint, http_status = %status, "Paystack server error");
                return Err(provider_error(format!("HTTP {}: {}", status, text), true));
            }

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                error!(endpoint = %endpoint, http_status = %status, "Paystack rejected our credentials");
                return Err(AppError::configuration("Paystack rejected the configured secret key"));
            }

            let raw: Value = serde_json::from_str(&text).map_err(|e| {
                error!(endpoint = %endpoint, error = %e, "Failed to parse Paystack response");
                provider_error(format!("Invalid response format: {}", e), false)
            })?;
            let envelope: PaystackEnvelope = serde_json::from_value(raw.clone())
                .map_err(|e| provider_error(format!("Invalid response envelope: {}", e), false))?;

            if !status.is_success() || !envelope.status {
                warn!(
                    endpoint = %endpoint,
                    http_status = %status,
                    message = %envelope.message,
                    "Paystack refused the request"
                );
                return Ok(PaystackReply::Rejected {
                    message: envelope.message,
                    raw,
                });
            }

            let data = serde_json::from_value(envelope.data.unwrap_or(Value::Null))
                .map_err(|e| provider_error(format!("Invalid response data: {}", e), false))?;
            return Ok(PaystackReply::Accepted { data, raw });
        }
    }

    fn amount_of(&self, amount: Option<i64>, currency: Option<&str>) -> Option<Money> {
        match (amount, currency) {
            (Some(amount), Some(currency)) => Money::new(currency, amount).ok(),
            _ => None,
        }
    }

    /// Classify a webhook body. Anything that does not look like a real charge event for a
    /// known reference is a dashboard connectivity test.
    fn classify_webhook(&self, payload: &Value) -> AppResult<WebhookEvent> {
        if !payload.is_object() {
            return Err(crate::error::WebhookError::MalformedPayload {
                provider: PaymentMethod::Paystack.to_string(),
                message: "payload is not a JSON object".to_string(),
            }
            .into());
        }

        let event = match payload.get("event").and_then(Value::as_str) {
            Some(event) if !event.trim().is_empty() => event.trim(),
            _ => return Ok(WebhookEvent::TestPing),
        };
        let lowered = event.to_ascii_lowercase();
        if lowered.contains("ping") || lowered.contains("test") {
            return Ok(WebhookEvent::TestPing);
        }

        let data = payload.get("data");
        let reference = data
            .and_then(|d| d.get("reference"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|r| !r.is_empty());
        let Some(reference) = reference else {
            return Ok(WebhookEvent::TestPing);
        };

        if !lowered.starts_with("charge.") {
            return Ok(WebhookEvent::Ignored {
                event_type: event.to_string(),
                reason: "not a charge event".to_string(),
            });
        }

        // The event name carries the outcome when data.status is absent.
        let raw_status = data
            .and_then(|d| d.get("status"))
            .and_then(Value::as_str)
            .unwrap_or_else(|| lowered.trim_start_matches("charge."));
        let status = self.mapper.map(raw_status);

        let mut result = GatewayResult::observed(reference, status, payload.clone());
        result.amount = self.amount_of(
            data.and_then(|d| d.get("amount")).and_then(Value::as_i64),
            data.and_then(|d| d.get("currency")).and_then(Value::as_str),
        );
        if status == PaymentStatus::Failed {
            result.error = data
                .and_then(|d| d.get("gateway_response"))
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        Ok(WebhookEvent::Payment {
            event_type: event.to_string(),
            result,
        })
    }
}

#[async_trait]
impl PaymentGateway for PaystackProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Paystack
    }

    fn status_mapper(&self) -> &dyn StatusMapper {
        &self.mapper
    }

    fn signature_header(&self) -> &'static str {
        "x-paystack-signature"
    }

    fn webhook_signature(&self) -> Option<SignatureScheme> {
        self.config
            .sign_webhooks
            .then(|| SignatureScheme::HmacSha512Hex {
                secret: self.config.secret_key.clone(),
            })
    }

    async fn create_payment_intent(&self, request: PaymentIntentRequest) -> AppResult<GatewayResult> {
        let email = request
            .customer_email
            .clone()
            .ok_or_else(|| AppError::validation("customerEmail", "Paystack requires a customer e-mail"))?;

        info!(
            payment_id = %request.payment_id,
            target = %request.target,
            amount = %request.amount,
            "Initiating Paystack payment"
        );

        let mut metadata = json!({
            "payment_id": request.payment_id,
            "target_kind": request.target.kind(),
            "target_id": request.target.id(),
            "user_id": request.user_id,
        });
        if let Some(description) = &request.description {
            metadata["description"] = Value::String(description.clone());
        }
        if let Some(extra) = request.metadata {
            metadata["custom"] = extra;
        }

        let payload = json!({
            "email": email,
            "amount": request.amount.minor_units,
            "currency": request.amount.currency,
            "reference": request.payment_id.to_string(),
            "callback_url": request.return_url,
            "metadata": metadata,
        });

        let reply: PaystackReply<PaystackInitializeData> = self
            .make_request(reqwest::Method::POST, "/transaction/initialize", Some(&payload), false)
            .await?;

        match reply {
            PaystackReply::Accepted { data, raw } => {
                info!(
                    payment_id = %request.payment_id,
                    reference = %data.reference,
                    "Paystack payment initiated"
                );
                let mut result = GatewayResult::observed(data.reference, PaymentStatus::Pending, raw);
                result.redirect_url = Some(data.authorization_url);
                Ok(result)
            }
            PaystackReply::Rejected { message, raw } => Ok(GatewayResult::rejected(
                None,
                PaymentStatus::Failed,
                message,
                raw,
            )),
        }
    }

    async fn verify_payment(&self, reference: &str) -> AppResult<GatewayResult> {
        info!(reference = %reference, "Verifying Paystack payment");

        let reply: PaystackReply<PaystackVerifyData> = self
            .make_request(
                reqwest::Method::GET,
                &format!("/transaction/verify/{}", reference),
                None,
                true,
            )
            .await?;

        match reply {
            PaystackReply::Accepted { data, raw } => {
                let status = self.mapper.map(&data.status);
                info!(
                    reference = %reference,
                    raw_status = %data.status,
                    status = %status,
                    "Paystack payment verified"
                );
                let mut result = GatewayResult::observed(reference, status, raw);
                result.amount = self.amount_of(data.amount, data.currency.as_deref());
                if status == PaymentStatus::Failed {
                    result.error = data.gateway_response;
                }
                Ok(result)
            }
            PaystackReply::Rejected { message, raw } => Ok(GatewayResult::rejected(
                Some(reference.to_string()),
                PaymentStatus::Pending,
                message,
                raw,
            )),
        }
    }

    fn process_webhook(&self, payload: &Value) -> AppResult<WebhookEvent> {
        self.classify_webhook(payload)
    }

    async fn refund_payment(&self, request: RefundRequest) -> AppResult<RefundResult> {
        info!(
            payment_id = %request.payment_id,
            reference = %request.gateway_transaction_id,
            amount = ?request.amount.as_ref().map(|m| m.minor_units),
            "Requesting Paystack refund"
        );

        let mut payload = json!({ "transaction": request.gateway_transaction_id });
        if let Some(amount) = &request.amount {
            payload["amount"] = json!(amount.minor_units);
        }
        if let Some(reason) = &request.reason {
            payload["merchant_note"] = Value::String(reason.clone());
        }

        let reply: PaystackReply<PaystackRefundData> = self
            .make_request(reqwest::Method::POST, "/refund", Some(&payload), false)
            .await?;

        Ok(match reply {
            PaystackReply::Accepted { data, raw } => RefundResult {
                success: true,
                refund_id: data.id.map(|id| id.to_string()),
                amount: data.amount,
                raw_response: raw,
                error: None,
            },
            PaystackReply::Rejected { message, raw } => RefundResult {
                success: false,
                refund_id: None,
                amount: None,
                raw_response: raw,
                error: Some(message),
            },
        })
    }

    /// Paystack has no cancellation endpoint: the transaction is abandoned locally, which is
    /// only allowed while Paystack does not report it as paid. The checkout link stays usable,
    /// so a payment made through it afterwards is refunded by the orchestrator.
    async fn cancel_payment(&self, reference: &str) -> AppResult<GatewayResult> {
        let current = self.verify_payment(reference).await?;

        if current.success
            && matches!(
                current.status,
                PaymentStatus::Completed | PaymentStatus::Refunded
            )
        {
            return Ok(GatewayResult::rejected(
                Some(reference.to_string()),
                current.status,
                "transaction already captured; refund it instead",
                current.raw_response,
            ));
        }

        info!(reference = %reference, "Abandoning Paystack transaction");
        Ok(GatewayResult::observed(
            reference,
            PaymentStatus::Cancelled,
            current.raw_response,
        ))
    }
}

// Paystack API response wrapper
#[derive(Debug, Deserialize)]
struct PaystackEnvelope {
    status: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PaystackInitializeData {
    authorization_url: String,
    reference: String,
}

#[derive(Debug, Deserialize)]
struct PaystackVerifyData {
    status: String,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    gateway_response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaystackRefundData {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    amount: Option<i64>,
}
