//! Stripe card payment provider implementation
//!
//! PaymentIntents flow: the intent is created server-side and its `client_secret` is handed to
//! the front end, which confirms the card. Requests are form-encoded. Every write carries an
//! `Idempotency-Key` derived from our payment id, so a retried call replays Stripe's original
//! answer instead of charging or refunding twice.

use crate::error::{AppError, AppResult, ExternalError, WebhookError};
use crate::payments::status::PaymentStatus;
use crate::payments::status_mapper::{StatusMapper, StripeStatusMapper, STRIPE_PAYMENT_FAILED_EVENT};
use crate::payments::traits::PaymentGateway;
use crate::payments::types::{
    GatewayResult, Money, PaymentIntentRequest, PaymentMethod, RefundRequest, RefundResult,
    WebhookEvent,
};
use crate::payments::webhook::SignatureScheme;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info, warn};

const PROVIDER: &str = "Stripe";

/// Stripe provider configuration
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// `whsec_...` endpoint secret; webhooks are unsigned when absent
    pub webhook_secret: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
    /// Retries for idempotent reads
    pub max_retries: u32,
    /// Maximum accepted age of a signed webhook
    pub webhook_tolerance_secs: u64,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            webhook_secret: None,
            base_url: "https://api.stripe.com".to_string(),
            timeout_secs: 30,
            max_retries: 2,
            webhook_tolerance_secs: 300,
        }
    }
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"<redacted>")
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("webhook_tolerance_secs", &self.webhook_tolerance_secs)
            .finish()
    }
}

impl StripeConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                AppError::configuration("STRIPE_SECRET_KEY environment variable is required")
            })?;

        let defaults = Self::default();

        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .ok()
            .filter(|secret| !secret.trim().is_empty());

        let base_url = std::env::var("STRIPE_BASE_URL").unwrap_or(defaults.base_url);

        let timeout_secs = std::env::var("STRIPE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.timeout_secs);

        let max_retries = std::env::var("STRIPE_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_retries);

        let webhook_tolerance_secs = std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.webhook_tolerance_secs);

        Ok(Self {
            secret_key,
            webhook_secret,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs,
            max_retries,
            webhook_tolerance_secs,
        })
    }
}

enum StripeReply {
    Accepted(Value),
    /// 4xx answer Stripe attaches a business reason to (card declined, wrong state, unknown id)
    Rejected { message: String, raw: Value },
}

pub struct StripeProvider {
    config: StripeConfig,
    client: Client,
    mapper: StripeStatusMapper,
}

fn provider_error(message: impl Into<String>, is_retryable: bool) -> AppError {
    ExternalError::PaymentProvider {
        provider: PROVIDER.to_string(),
        message: message.into(),
        is_retryable,
    }
    .into()
}

fn malformed(message: impl Into<String>) -> AppError {
    WebhookError::MalformedPayload {
        provider: PaymentMethod::Card.to_string(),
        message: message.into(),
    }
    .into()
}

impl StripeProvider {
    pub fn new(config: StripeConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            client,
            mapper: StripeStatusMapper,
        })
    }

    pub fn from_env() -> AppResult<Self> {
        Self::new(StripeConfig::from_env()?)
    }

    async fn make_request(
        &self,
        method: reqwest::Method,
        path: &str,
        form: Option<&[(String, String)]>,
        idempotency_key: Option<&str>,
        retry: bool,
    ) -> AppResult<StripeReply> {
        let url = format!("{}{}", self.config.base_url, path);
        let max_retries = if retry { self.config.max_retries } else { 0 };
        let mut attempt: u32 = 0;

        loop {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&self.config.secret_key);
            if let Some(key) = idempotency_key {
                request = request.header("Idempotency-Key", key);
            }
            if let Some(form) = form {
                request = request.form(form);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    if attempt < max_retries {
                        let backoff = 2_u64.pow(attempt);
                        warn!(path = %path, attempt = attempt + 1, error = %e, "Stripe request error, retrying");
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
                    return Err(provider_error(format!("Request failed: {}", e), true));
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
                    warn!(path = %path, http_status = %status, attempt = attempt + 1, "Stripe unavailable, retrying");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    attempt += 1;
                    continue;
                }
                if status == StatusCode::TOO_MANY_REQUESTS {
                    return Err(ExternalError::RateLimit {
                        service: PROVIDER.to_string(),
                        retry_after: None,
                    }
                    .into());
                }
                error!(path = %path, http_status = %status, "Stripe server error");
                return Err(provider_error(format!("HTTP {}", status), true));
            }

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                error!(path = %path, http_status = %status, "Stripe rejected our credentials");
                return Err(AppError::configuration("Stripe rejected the configured secret key"));
            }

            let raw: Value = serde_json::from_str(&text)
                .map_err(|e| provider_error(format!("Invalid response format: {}", e), false))?;

            if status.is_success() {
                return Ok(StripeReply::Accepted(raw));
            }

            let message = raw
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("request refused")
                .to_string();
            let code = raw.pointer("/error/code").and_then(Value::as_str);
            warn!(
                path = %path,
                http_status = %status,
                code = ?code,
                message = %message,
                "Stripe refused the request"
            );
            return Ok(StripeReply::Rejected { message, raw });
        }
    }

    /// Read the fields we care about from a PaymentIntent object.
    fn intent_result(&self, intent: &Value, raw: Value, event_type: Option<&str>) -> AppResult<GatewayResult> {
        let id = intent
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| provider_error("PaymentIntent without id", false))?;
        let raw_status = intent.get("status").and_then(Value::as_str).unwrap_or_default();
        let failure = intent
            .pointer("/last_payment_error/message")
            .and_then(Value::as_str)
            .map(str::to_string);

        // A declined confirmation sends the intent back to requires_payment_method; the
        // attempt we recorded has failed either way, in polling and webhooks alike.
        let status = if event_type == Some(STRIPE_PAYMENT_FAILED_EVENT)
            || (raw_status == "requires_payment_method" && failure.is_some())
        {
            self.mapper.map(STRIPE_PAYMENT_FAILED_EVENT)
        } else {
            self.mapper.map(raw_status)
        };

        let mut result = GatewayResult::observed(id, status, raw);
        result.client_secret = intent
            .get("client_secret")
            .and_then(Value::as_str)
            .map(str::to_string);
        result.redirect_url = intent
            .pointer("/next_action/redirect_to_url/url")
            .and_then(Value::as_str)
            .map(str::to_string);
        result.amount = match (
            intent.get("amount").and_then(Value::as_i64),
            intent.get("currency").and_then(Value::as_str),
        ) {
            (Some(amount), Some(currency)) => Money::new(currency, amount).ok(),
            _ => None,
        };
        if status == PaymentStatus::Failed {
            result.error = failure.or_else(|| Some("payment failed".to_string()));
        }
        Ok(result)
    }
}

/// Flatten caller metadata into Stripe's `metadata[key]=value` form fields.
fn metadata_fields(metadata: &Value, form: &mut Vec<(String, String)>) {
    if let Some(object) = metadata.as_object() {
        for (key, value) in object {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Null => continue,
                other => other.to_string(),
            };
            form.push((format!("metadata[{}]", key), value));
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Card
    }

    fn status_mapper(&self) -> &dyn StatusMapper {
        &self.mapper
    }

    fn signature_header(&self) -> &'static str {
        "stripe-signature"
    }

    fn webhook_signature(&self) -> Option<SignatureScheme> {
        self.config
            .webhook_secret
            .as_ref()
            .map(|secret| SignatureScheme::StripeV1 {
                secret: secret.clone(),
                tolerance: Duration::from_secs(self.config.webhook_tolerance_secs),
            })
    }

    async fn create_payment_intent(&self, request: PaymentIntentRequest) -> AppResult<GatewayResult> {
        info!(
            payment_id = %request.payment_id,
            target = %request.target,
            amount = %request.amount,
            "Creating Stripe PaymentIntent"
        );

        let mut form = vec![
            ("amount".to_string(), request.amount.minor_units.to_string()),
            ("currency".to_string(), request.amount.currency.to_ascii_lowercase()),
            ("automatic_payment_methods[enabled]".to_string(), "true".to_string()),
        ];
        if let Some(metadata) = &request.metadata {
            metadata_fields(metadata, &mut form);
        }
        // Reserved keys go last so caller metadata cannot shadow them.
        form.extend([
            ("metadata[payment_id]".to_string(), request.payment_id.to_string()),
            ("metadata[target_kind]".to_string(), request.target.kind().to_string()),
            ("metadata[target_id]".to_string(), request.target.id().to_string()),
            ("metadata[user_id]".to_string(), request.user_id.to_string()),
            ("metadata[return_url]".to_string(), request.return_url.clone()),
        ]);
        if let Some(description) = &request.description {
            form.push(("description".to_string(), description.clone()));
        }
        if let Some(email) = &request.customer_email {
            form.push(("receipt_email".to_string(), email.clone()));
        }

        let idempotency_key = format!("create-{}", request.payment_id);
        let reply = self
            .make_request(
                reqwest::Method::POST,
                "/v1/payment_intents",
                Some(&form),
                Some(&idempotency_key),
                false,
            )
            .await?;

        match reply {
            StripeReply::Accepted(raw) => {
                let result = self.intent_result(&raw, raw.clone(), None)?;
                info!(
                    payment_id = %request.payment_id,
                    intent_id = ?result.gateway_transaction_id,
                    status = %result.status,
                    "Stripe PaymentIntent created"
                );
                Ok(result)
            }
            StripeReply::Rejected { message, raw } => Ok(GatewayResult::rejected(
                None,
                PaymentStatus::Failed,
                message,
                raw,
            )),
        }
    }

    async fn verify_payment(&self, intent_id: &str) -> AppResult<GatewayResult> {
        let reply = self
            .make_request(
                reqwest::Method::GET,
                &format!("/v1/payment_intents/{}", intent_id),
                None,
                None,
                true,
            )
            .await?;

        match reply {
            StripeReply::Accepted(raw) => self.intent_result(&raw, raw.clone(), None),
            StripeReply::Rejected { message, raw } => Ok(GatewayResult::rejected(
                Some(intent_id.to_string()),
                PaymentStatus::Pending,
                message,
                raw,
            )),
        }
    }

    fn process_webhook(&self, payload: &Value) -> AppResult<WebhookEvent> {
        if !payload.is_object() {
            return Err(malformed("payload is not a JSON object"));
        }
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing event type"))?;

        if !event_type.starts_with("payment_intent.") {
            return Ok(WebhookEvent::Ignored {
                event_type: event_type.to_string(),
                reason: "event carries no payment intent state".to_string(),
            });
        }

        let intent = payload
            .pointer("/data/object")
            .filter(|object| object.is_object())
            .ok_or_else(|| malformed("missing data.object"))?;
        if intent.get("id").and_then(Value::as_str).is_none() {
            return Err(malformed("data.object has no id"));
        }

        let result = self.intent_result(intent, payload.clone(), Some(event_type))?;
        Ok(WebhookEvent::Payment {
            event_type: event_type.to_string(),
            result,
        })
    }

    async fn refund_payment(&self, request: RefundRequest) -> AppResult<RefundResult> {
        info!(
            payment_id = %request.payment_id,
            intent_id = %request.gateway_transaction_id,
            amount = ?request.amount.as_ref().map(|m| m.minor_units),
            "Requesting Stripe refund"
        );

        let mut form = vec![
            ("payment_intent".to_string(), request.gateway_transaction_id.clone()),
            ("metadata[payment_id]".to_string(), request.payment_id.to_string()),
        ];
        if let Some(amount) = &request.amount {
            form.push(("amount".to_string(), amount.minor_units.to_string()));
        }
        if let Some(reason) = &request.reason {
            // Stripe's own `reason` is a closed enum; free text goes to metadata.
            form.push(("metadata[reason]".to_string(), reason.clone()));
        }

        let idempotency_key = format!("refund-{}", request.payment_id);
        let reply = self
            .make_request(
                reqwest::Method::POST,
                "/v1/refunds",
                Some(&form),
                Some(&idempotency_key),
                false,
            )
            .await?;

        Ok(match reply {
            StripeReply::Accepted(raw) => {
                let refund_status = raw.get("status").and_then(Value::as_str).unwrap_or("pending");
                let success = !matches!(refund_status, "failed" | "canceled");
                RefundResult {
                    success,
                    refund_id: raw.get("id").and_then(Value::as_str).map(str::to_string),
                    amount: raw.get("amount").and_then(Value::as_i64),
                    error: (!success).then(|| format!("refund {}", refund_status)),
                    raw_response: raw,
                }
            }
            StripeReply::Rejected { message, raw } => RefundResult {
                success: false,
                refund_id: None,
                amount: None,
                raw_response: raw,
                error: Some(message),
            },
        })
    }

    async fn cancel_payment(&self, intent_id: &str) -> AppResult<GatewayResult> {
        let idempotency_key = format!("cancel-{}", intent_id);
        let reply = self
            .make_request(
                reqwest::Method::POST,
                &format!("/v1/payment_intents/{}/cancel", intent_id),
                None,
                Some(&idempotency_key),
                false,
            )
            .await?;

        match reply {
            StripeReply::Accepted(raw) => self.intent_result(&raw, raw.clone(), None),
            // Stripe refuses once the intent has succeeded or is processing.
            StripeReply::Rejected { message, raw } => Ok(GatewayResult::rejected(
                Some(intent_id.to_string()),
                PaymentStatus::Pending,
                message,
                raw,
            )),
        }
    }

    /// A declined intent goes back to `requires_payment_method` and still accepts a new card.
    fn retryable_after_decline(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::PayableRef;
    use mockito::Matcher;
    use serde_json::json;
    use uuid::Uuid;

    fn provider(base_url: &str) -> StripeProvider {
        StripeProvider::new(StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: Some("whsec_test".to_string()),
            base_url: base_url.to_string(),
            timeout_secs: 5,
            max_retries: 1,
            webhook_tolerance_secs: 300,
        })
        .unwrap()
    }

    fn intent_request(payment_id: Uuid) -> PaymentIntentRequest {
        PaymentIntentRequest {
            payment_id,
            target: PayableRef::Order(Uuid::new_v4()),
            user_id: Uuid::new_v4(),
            amount: Money::new("EUR", 1999).unwrap(),
            description: None,
            metadata: Some(json!({ "cart": "c-1", "items": 3 })),
            customer_email: None,
            return_url: "https://shop.example.com/return".to_string(),
            webhook_url: "https://shop.example.com/payments/webhook/card".to_string(),
        }
    }

    #[tokio::test]
    async fn creates_intent_with_idempotency_key() {
        let payment_id = Uuid::new_v4();
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/payment_intents")
            .match_header("authorization", "Bearer sk_test_123")
            .match_header("idempotency-key", format!("create-{}", payment_id).as_str())
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("amount".into(), "1999".into()),
                Matcher::UrlEncoded("currency".into(), "eur".into()),
                Matcher::UrlEncoded("metadata[cart]".into(), "c-1".into()),
                Matcher::UrlEncoded("metadata[payment_id]".into(), payment_id.to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":"pi_1","status":"requires_payment_method","client_secret":"pi_1_secret","amount":1999,"currency":"eur"}"#,
            )
            .create_async()
            .await;

        let result = provider(&server.url())
            .create_payment_intent(intent_request(payment_id))
            .await
            .unwrap();

        mock.assert_async().await;
        assert!(result.success);
        assert_eq!(result.status, PaymentStatus::Pending);
        assert_eq!(result.gateway_transaction_id.as_deref(), Some("pi_1"));
        assert_eq!(result.client_secret.as_deref(), Some("pi_1_secret"));
        assert_eq!(result.amount, Some(Money::new("EUR", 1999).unwrap()));
    }

    #[tokio::test]
    async fn card_error_is_structured_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/payment_intents")
            .with_status(402)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":{"type":"card_error","code":"card_declined","message":"Your card was declined."}}"#)
            .create_async()
            .await;

        let result = provider(&server.url())
            .create_payment_intent(intent_request(Uuid::new_v4()))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Your card was declined."));
    }

    #[tokio::test]
    async fn server_errors_on_reads_are_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/payment_intents/pi_1")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let err = provider(&server.url()).verify_payment("pi_1").await.unwrap_err();
        mock.assert_async().await;
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn writes_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/refunds")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let result = provider(&server.url())
            .refund_payment(RefundRequest {
                payment_id: Uuid::new_v4(),
                gateway_transaction_id: "pi_1".to_string(),
                amount: None,
                reason: None,
            })
            .await;
        mock.assert_async().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn declined_confirmation_polls_as_failed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/payment_intents/pi_2")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":"pi_2","status":"requires_payment_method","last_payment_error":{"message":"Insufficient funds"}}"#,
            )
            .create_async()
            .await;

        let result = provider(&server.url()).verify_payment("pi_2").await.unwrap();
        assert_eq!(result.status, PaymentStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("Insufficient funds"));
    }

    #[tokio::test]
    async fn cancel_after_capture_is_structured_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/payment_intents/pi_3/cancel")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":{"message":"You cannot cancel this PaymentIntent because it has a status of succeeded."}}"#)
            .create_async()
            .await;

        let result = provider(&server.url()).cancel_payment("pi_3").await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn refund_reports_provider_refund_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/refunds")
            .match_body(Matcher::UrlEncoded("amount".into(), "500".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"re_1","amount":500,"status":"succeeded"}"#)
            .create_async()
            .await;

        let result = provider(&server.url())
            .refund_payment(RefundRequest {
                payment_id: Uuid::new_v4(),
                gateway_transaction_id: "pi_1".to_string(),
                amount: Some(Money::new("EUR", 500).unwrap()),
                reason: Some("damaged".to_string()),
            })
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.refund_id.as_deref(), Some("re_1"));
        assert_eq!(result.amount, Some(500));
    }

    #[test]
    fn succeeded_webhook_is_completed() {
        let event = provider("http://localhost")
            .process_webhook(&json!({
                "id": "evt_1",
                "type": "payment_intent.succeeded",
                "data": { "object": { "id": "pi_1", "status": "succeeded", "amount": 1999, "currency": "eur" } }
            }))
            .unwrap();
        match event {
            WebhookEvent::Payment { result, .. } => {
                assert_eq!(result.status, PaymentStatus::Completed);
                assert_eq!(result.gateway_transaction_id.as_deref(), Some("pi_1"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn payment_failed_event_is_failed() {
        let event = provider("http://localhost")
            .process_webhook(&json!({
                "type": "payment_intent.payment_failed",
                "data": { "object": { "id": "pi_1", "status": "requires_payment_method" } }
            }))
            .unwrap();
        assert!(matches!(
            event,
            WebhookEvent::Payment { result, .. } if result.status == PaymentStatus::Failed
        ));
    }

    #[test]
    fn unrelated_events_are_ignored_and_bad_shapes_rejected() {
        let provider = provider("http://localhost");
        assert!(matches!(
            provider
                .process_webhook(&json!({ "type": "customer.created", "data": { "object": {} } }))
                .unwrap(),
            WebhookEvent::Ignored { .. }
        ));
        assert!(provider.process_webhook(&json!({ "data": {} })).is_err());
        assert!(provider
            .process_webhook(&json!({ "type": "payment_intent.succeeded", "data": {} }))
            .is_err());
    }

    #[test]
    fn webhook_scheme_requires_secret() {
        let unsigned = StripeProvider::new(StripeConfig {
            secret_key: "sk".to_string(),
            ..StripeConfig::default()
        })
        .unwrap();
        assert!(unsigned.webhook_signature().is_none());
        assert!(provider("http://localhost").webhook_signature().is_some());
    }
}
