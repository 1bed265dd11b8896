//! Scripted in-process gateway.
//!
//! Behaves like a provider that accepts every request unless told otherwise, and reports
//! whatever status the test sets. Webhooks use a small JSON shape:
//! `{"event": "payment.updated", "transaction_id": "...", "status": "<canonical status>"}`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{AppResult, ExternalError, WebhookError};
use crate::payments::status::PaymentStatus;
use crate::payments::status_mapper::StatusMapper;
use crate::payments::traits::PaymentGateway;
use crate::payments::types::{
    GatewayResult, Money, PaymentIntentRequest, PaymentMethod, RefundRequest, RefundResult,
    WebhookEvent,
};
use crate::payments::webhook::{sign_hmac_sha512_hex, SignatureScheme};

#[derive(Debug, Default, Clone, Copy)]
pub struct FakeStatusMapper;

impl StatusMapper for FakeStatusMapper {
    fn provider(&self) -> &'static str {
        "fake"
    }

    fn known_statuses(&self) -> &'static [(&'static str, PaymentStatus)] {
        &[
            ("pending", PaymentStatus::Pending),
            ("processing", PaymentStatus::Processing),
            ("completed", PaymentStatus::Completed),
            ("failed", PaymentStatus::Failed),
            ("cancelled", PaymentStatus::Cancelled),
            ("refunded", PaymentStatus::Refunded),
        ]
    }
}

/// Number of calls the gateway received, per operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FakeCalls {
    pub create: usize,
    pub verify: usize,
    pub refund: usize,
    pub cancel: usize,
}

#[derive(Default)]
struct FakeState {
    intent_status: Option<PaymentStatus>,
    decline_intent: Option<String>,
    verify_status: Option<PaymentStatus>,
    verify_amount: Option<Money>,
    decline_refund: Option<String>,
    refuse_cancel: Option<String>,
    retryable_after_decline: bool,
    fail_with_infrastructure_error: bool,
    delay: Option<Duration>,
    amounts: HashMap<String, Money>,
    calls: FakeCalls,
}

pub struct FakeGateway {
    method: PaymentMethod,
    webhook_secret: Option<String>,
    mapper: FakeStatusMapper,
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new(method: PaymentMethod) -> Self {
        Self {
            method,
            webhook_secret: None,
            mapper: FakeStatusMapper,
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Sign webhooks as hex HMAC-SHA512 with `secret`.
    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    /// Transaction id the gateway assigns to a payment attempt.
    pub fn transaction_id_for(payment_id: uuid::Uuid) -> String {
        format!("fake_{}", payment_id.simple())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Status returned by intent creation (default `Pending`).
    pub fn set_intent_status(&self, status: PaymentStatus) {
        self.with_state(|s| s.intent_status = Some(status));
    }

    pub fn decline_intents(&self, message: impl Into<String>) {
        let message = message.into();
        self.with_state(|s| s.decline_intent = Some(message));
    }

    /// Status reported by `verify_payment` (default `Pending`).
    pub fn set_verify_status(&self, status: PaymentStatus) {
        self.with_state(|s| s.verify_status = Some(status));
    }

    /// Override the amount `verify_payment` reports.
    pub fn set_verify_amount(&self, amount: Money) {
        self.with_state(|s| s.verify_amount = Some(amount));
    }

    pub fn decline_refunds(&self, message: impl Into<String>) {
        let message = message.into();
        self.with_state(|s| s.decline_refund = Some(message));
    }

    pub fn refuse_cancellation(&self, message: impl Into<String>) {
        let message = message.into();
        self.with_state(|s| s.refuse_cancel = Some(message));
    }

    /// Behave like a provider whose declined transactions accept another card.
    pub fn set_retryable_after_decline(&self, retryable: bool) {
        self.with_state(|s| s.retryable_after_decline = retryable);
    }

    /// Every remote call fails as if the provider were unreachable.
    pub fn fail_with_infrastructure_error(&self, fail: bool) {
        self.with_state(|s| s.fail_with_infrastructure_error = fail);
    }

    /// Delay every remote call, for timeout tests.
    pub fn set_delay(&self, delay: Duration) {
        self.with_state(|s| s.delay = Some(delay));
    }

    pub fn calls(&self) -> FakeCalls {
        self.with_state(|s| s.calls)
    }

    /// Webhook body reporting `status` for `transaction_id`.
    pub fn webhook_body(transaction_id: &str, status: PaymentStatus) -> Vec<u8> {
        json!({
            "event": "payment.updated",
            "transaction_id": transaction_id,
            "status": status.as_str(),
        })
        .to_string()
        .into_bytes()
    }

    /// Signature header value for `body`, when a secret is configured.
    pub fn sign(&self, body: &[u8]) -> AppResult<Option<String>> {
        self.webhook_secret
            .as_deref()
            .map(|secret| sign_hmac_sha512_hex(secret, body))
            .transpose()
    }

    async fn remote_call(&self, bump: impl FnOnce(&mut FakeCalls)) -> AppResult<()> {
        let (delay, fail) = self.with_state(|s| {
            bump(&mut s.calls);
            (s.delay, s.fail_with_infrastructure_error)
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(ExternalError::PaymentProvider {
                provider: "fake".to_string(),
                message: "connection refused".to_string(),
                is_retryable: true,
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn method(&self) -> PaymentMethod {
        self.method
    }

    fn status_mapper(&self) -> &dyn StatusMapper {
        &self.mapper
    }

    fn signature_header(&self) -> &'static str {
        "x-fake-signature"
    }

    fn webhook_signature(&self) -> Option<SignatureScheme> {
        self.webhook_secret
            .as_ref()
            .map(|secret| SignatureScheme::HmacSha512Hex {
                secret: secret.clone(),
            })
    }

    async fn create_payment_intent(&self, request: PaymentIntentRequest) -> AppResult<GatewayResult> {
        self.remote_call(|c| c.create += 1).await?;

        let transaction_id = Self::transaction_id_for(request.payment_id);
        let (decline, status) = self.with_state(|s| {
            s.amounts.insert(transaction_id.clone(), request.amount.clone());
            (s.decline_intent.clone(), s.intent_status.unwrap_or(PaymentStatus::Pending))
        });

        if let Some(message) = decline {
            return Ok(GatewayResult::rejected(
                None,
                PaymentStatus::Failed,
                message,
                json!({ "declined": true }),
            ));
        }

        let mut result = GatewayResult::observed(
            transaction_id.clone(),
            status,
            json!({ "id": transaction_id, "status": status.as_str() }),
        );
        result.client_secret = Some(format!("{}_secret", transaction_id));
        result.amount = Some(request.amount);
        Ok(result)
    }

    async fn verify_payment(&self, gateway_transaction_id: &str) -> AppResult<GatewayResult> {
        self.remote_call(|c| c.verify += 1).await?;

        let (status, amount) = self.with_state(|s| {
            (
                s.verify_status.unwrap_or(PaymentStatus::Pending),
                s.verify_amount
                    .clone()
                    .or_else(|| s.amounts.get(gateway_transaction_id).cloned()),
            )
        });

        let mut result = GatewayResult::observed(
            gateway_transaction_id,
            status,
            json!({ "id": gateway_transaction_id, "status": status.as_str() }),
        );
        result.amount = amount;
        if status == PaymentStatus::Failed {
            result.error = Some("card declined".to_string());
        }
        Ok(result)
    }

    fn process_webhook(&self, payload: &Value) -> AppResult<WebhookEvent> {
        if !payload.is_object() {
            return Err(WebhookError::MalformedPayload {
                provider: self.method.to_string(),
                message: "payload is not a JSON object".to_string(),
            }
            .into());
        }

        let event = match payload.get("event").and_then(Value::as_str) {
            Some(event) if event != "ping" => event,
            _ => return Ok(WebhookEvent::TestPing),
        };
        if !event.starts_with("payment.") {
            return Ok(WebhookEvent::Ignored {
                event_type: event.to_string(),
                reason: "not a payment event".to_string(),
            });
        }

        let transaction_id = payload
            .get("transaction_id")
            .and_then(Value::as_str)
            .ok_or_else(|| WebhookError::MalformedPayload {
                provider: self.method.to_string(),
                message: "missing transaction_id".to_string(),
            })?;
        let status = self
            .mapper
            .map(payload.get("status").and_then(Value::as_str).unwrap_or_default());

        let mut result = GatewayResult::observed(transaction_id, status, payload.clone());
        result.amount = self.with_state(|s| s.amounts.get(transaction_id).cloned());
        Ok(WebhookEvent::Payment {
            event_type: event.to_string(),
            result,
        })
    }

    async fn refund_payment(&self, request: RefundRequest) -> AppResult<RefundResult> {
        self.remote_call(|c| c.refund += 1).await?;

        if let Some(message) = self.with_state(|s| s.decline_refund.clone()) {
            return Ok(RefundResult {
                success: false,
                refund_id: None,
                amount: None,
                raw_response: json!({ "declined": true }),
                error: Some(message),
            });
        }

        Ok(RefundResult {
            success: true,
            refund_id: Some(format!("refund_{}", request.payment_id.simple())),
            amount: request.amount.map(|m| m.minor_units),
            raw_response: json!({ "refunded": true }),
            error: None,
        })
    }

    async fn cancel_payment(&self, gateway_transaction_id: &str) -> AppResult<GatewayResult> {
        self.remote_call(|c| c.cancel += 1).await?;

        if let Some(message) = self.with_state(|s| s.refuse_cancel.clone()) {
            return Ok(GatewayResult::rejected(
                Some(gateway_transaction_id.to_string()),
                PaymentStatus::Completed,
                message,
                json!({ "cancelled": false }),
            ));
        }

        Ok(GatewayResult::observed(
            gateway_transaction_id,
            PaymentStatus::Cancelled,
            json!({ "cancelled": true }),
        ))
    }

    fn retryable_after_decline(&self) -> bool {
        self.with_state(|s| s.retryable_after_decline)
    }
}
