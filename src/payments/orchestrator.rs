//! Payment orchestrator
//!
//! The single writer of payment state. Polling (`verify_payment_and_update`), webhooks
//! (`process_webhook`) and cancellation all funnel into [`PaymentOrchestrator::reconcile`], which
//! applies an observed provider status to the stored attempt:
//!
//! - nothing happens when the observed status equals the stored one, or the stored one is
//!   already `Completed` (only `refund_payment` leaves `Completed`);
//! - transitions off the state graph are logged as inconsistencies and dropped;
//! - a capture reported for a failed or cancelled attempt is refunded, since the payable has
//!   already moved on from that attempt;
//! - the write itself is a compare-and-set on the stored status, so when a poll and a webhook
//!   race, exactly one of them wins and only the winner propagates to the order/membership
//!   and fires [`PaymentHooks::on_payment_completed`].
//!
//! Every provider call runs under a request-scoped timeout. A timed-out call returns an error
//! and leaves the attempt as it was.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::database::repository::{PayableStore, PaymentStore, StatusUpdate};
use crate::error::{AppError, AppResult, DomainError, ExternalError, ValidationError, WebhookError};
use crate::payments::registry::GatewayRegistry;
use crate::payments::status::PaymentStatus;
use crate::payments::types::{
    GatewayResult, Money, Payable, PayableRef, PaymentAttempt, PaymentIntentRequest,
    PaymentMethod, RefundRecord, RefundRequest, WebhookEvent,
};
use crate::payments::webhook::{replay_key, WebhookReplayGuard, WebhookVerifier};

/// Compare-and-set rounds before giving up on a heavily contended attempt.
const MAX_CAS_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Public base URL, without trailing slash
    pub base_url: String,
    pub gateway_timeout: Duration,
}

impl OrchestratorConfig {
    pub fn new(base_url: impl Into<String>, gateway_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            gateway_timeout,
        }
    }
}

/// Business side effects of a payment completing (confirmation e-mail, stock changes).
///
/// Runs once, for the caller that won the transition into `Completed`.
#[async_trait]
pub trait PaymentHooks: Send + Sync {
    async fn on_payment_completed(&self, payment: &PaymentAttempt, payable: Option<&Payable>);
}

pub struct NoopHooks;

#[async_trait]
impl PaymentHooks for NoopHooks {
    async fn on_payment_completed(&self, _payment: &PaymentAttempt, _payable: Option<&Payable>) {}
}

#[derive(Debug, Clone)]
pub struct CreatePaymentRequest {
    pub target: PayableRef,
    pub user_id: Uuid,
    pub method: PaymentMethod,
    pub amount: Money,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub return_url: Option<String>,
}

/// What the front end needs to continue the checkout.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentSummary {
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedPayment {
    pub payment: PaymentAttempt,
    pub result: IntentSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifiedPayment {
    pub payment: PaymentAttempt,
    #[serde(rename = "order")]
    pub payable: Option<Payable>,
    pub updated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RefundPaymentRequest {
    /// Minor units; `None` refunds the full amount
    pub amount: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Authentic but nothing to apply: test ping, irrelevant event, repeated delivery
    Acknowledged { reason: String },
    Processed {
        payment_id: Uuid,
        status: PaymentStatus,
        updated: bool,
    },
}

#[derive(Debug)]
struct Reconciled {
    payment: PaymentAttempt,
    updated: bool,
    /// Gave up after repeated compare-and-set losses; the observation was not applied.
    contended: bool,
}

impl Reconciled {
    fn unchanged(payment: PaymentAttempt) -> Self {
        Self {
            payment,
            updated: false,
            contended: false,
        }
    }

    fn applied(payment: PaymentAttempt) -> Self {
        Self {
            payment,
            updated: true,
            contended: false,
        }
    }
}

pub struct PaymentOrchestrator {
    registry: GatewayRegistry,
    payments: Arc<dyn PaymentStore>,
    payables: Arc<dyn PayableStore>,
    verifier: WebhookVerifier,
    hooks: Arc<dyn PaymentHooks>,
    replay_guard: Option<Arc<dyn WebhookReplayGuard>>,
    config: OrchestratorConfig,
}

impl PaymentOrchestrator {
    pub fn new(
        registry: GatewayRegistry,
        payments: Arc<dyn PaymentStore>,
        payables: Arc<dyn PayableStore>,
        verifier: WebhookVerifier,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            payments,
            payables,
            verifier,
            hooks: Arc::new(NoopHooks),
            replay_guard: None,
            config,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn PaymentHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_replay_guard(mut self, guard: Arc<dyn WebhookReplayGuard>) -> Self {
        self.replay_guard = Some(guard);
        self
    }

    pub fn registry(&self) -> &GatewayRegistry {
        &self.registry
    }

    pub fn available_methods(&self) -> Vec<PaymentMethod> {
        self.registry.available_methods()
    }

    pub async fn get_payment(&self, payment_id: Uuid) -> AppResult<PaymentAttempt> {
        self.load(payment_id).await
    }

    pub async fn list_payments_for(&self, target: PayableRef) -> AppResult<Vec<PaymentAttempt>> {
        Ok(self.payments.list_for(target).await?)
    }

    async fn load(&self, payment_id: Uuid) -> AppResult<PaymentAttempt> {
        self.payments.find_by_id(payment_id).await?.ok_or_else(|| {
            DomainError::PaymentNotFound {
                payment_id: payment_id.to_string(),
            }
            .into()
        })
    }

    async fn call_gateway<T, F>(&self, method: PaymentMethod, operation: &'static str, call: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>> + Send,
    {
        match tokio::time::timeout(self.config.gateway_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    method = %method,
                    operation,
                    timeout_secs = self.config.gateway_timeout.as_secs(),
                    "Gateway call timed out; payment left unchanged"
                );
                Err(ExternalError::Timeout {
                    service: method.to_string(),
                    seconds: self.config.gateway_timeout.as_secs(),
                }
                .into())
            }
        }
    }

    /// Open a payment attempt for a pending order or membership.
    ///
    /// Nothing is written unless the gateway accepted the intent.
    pub async fn create_payment(&self, request: CreatePaymentRequest) -> AppResult<CreatedPayment> {
        let target = request.target;
        let payable = self.payables.find(target).await?.ok_or_else(|| {
            AppError::from(DomainError::PayableNotFound {
                target: target.to_string(),
            })
        })?;

        if payable.user_id != request.user_id {
            warn!(target = %target, user_id = %request.user_id, "Payment requested for another user's payable");
            return Err(DomainError::Forbidden {
                target: target.to_string(),
            }
            .into());
        }
        if !payable.status.accepts_payment() {
            return Err(DomainError::NotPayable {
                target: target.to_string(),
                status: payable.status.to_string(),
            }
            .into());
        }
        if payable.total != request.amount {
            return Err(ValidationError::AmountMismatch {
                expected: payable.total.to_string(),
                provided: request.amount.to_string(),
            }
            .into());
        }
        if let Some(completed) = self.payments.find_completed_for(target).await? {
            warn!(target = %target, payment_id = %completed.id, "Payable already has a completed payment");
            return Err(DomainError::AlreadyPaid {
                target: target.to_string(),
            }
            .into());
        }

        let gateway = self.registry.resolve(request.method)?;
        let payment_id = Uuid::new_v4();
        let return_url = request
            .return_url
            .clone()
            .unwrap_or_else(|| format!("{}/payments/{}/return", self.config.base_url, payment_id));
        let webhook_url = format!("{}/payments/webhook/{}", self.config.base_url, request.method);

        let intent = PaymentIntentRequest {
            payment_id,
            target,
            user_id: request.user_id,
            amount: request.amount.clone(),
            description: request.description.clone(),
            metadata: request.metadata.clone(),
            customer_email: payable.customer_email.clone(),
            return_url,
            webhook_url,
        };

        let result = self
            .call_gateway(request.method, "create_payment_intent", gateway.create_payment_intent(intent))
            .await?;

        if !result.success {
            let message = result.error.unwrap_or_else(|| "payment intent rejected".to_string());
            warn!(
                payment_id = %payment_id,
                method = %request.method,
                reason = %message,
                "Gateway rejected payment intent"
            );
            return Err(ExternalError::Declined {
                provider: request.method.to_string(),
                message,
            }
            .into());
        }

        let now = Utc::now();
        let attempt = PaymentAttempt {
            id: payment_id,
            target,
            user_id: request.user_id,
            method: request.method,
            status: PaymentStatus::Pending,
            amount: request.amount,
            gateway_transaction_id: result.gateway_transaction_id.clone(),
            gateway_response: Some(result.raw_response.clone()),
            refund: None,
            failure_reason: None,
            description: request.description,
            metadata: request.metadata,
            processed_at: None,
            created_at: now,
            updated_at: now,
        };
        let attempt = self.payments.insert(&attempt).await?;
        self.payables
            .attach_payment(target, payment_id, PaymentStatus::Pending)
            .await?;

        info!(
            payment_id = %payment_id,
            target = %target,
            method = %attempt.method,
            amount = %attempt.amount,
            gateway_transaction_id = ?attempt.gateway_transaction_id,
            "Payment attempt created"
        );

        // Some providers settle synchronously; route that through the normal rule.
        let payment = if result.status != PaymentStatus::Pending {
            self.reconcile(attempt, &result, "create").await?.payment
        } else {
            attempt
        };

        Ok(CreatedPayment {
            result: IntentSummary {
                status: payment.status,
                redirect_url: result.redirect_url,
                client_secret: result.client_secret,
            },
            payment,
        })
    }

    /// Poll the provider and apply what it reports. Safe to call repeatedly.
    pub async fn verify_payment_and_update(&self, payment_id: Uuid) -> AppResult<VerifiedPayment> {
        let payment = self.load(payment_id).await?;

        let Some(transaction_id) = payment.gateway_transaction_id.clone() else {
            debug!(payment_id = %payment_id, "No gateway transaction yet, nothing to verify");
            let payable = self.payables.find(payment.target).await?;
            return Ok(VerifiedPayment {
                payment,
                payable,
                updated: false,
            });
        };

        let gateway = self.registry.resolve(payment.method)?;
        let observed = self
            .call_gateway(payment.method, "verify_payment", gateway.verify_payment(&transaction_id))
            .await?;

        if !observed.success {
            let message = observed.error.unwrap_or_else(|| "verification refused".to_string());
            warn!(payment_id = %payment_id, reason = %message, "Gateway could not verify payment");
            return Err(ExternalError::PaymentProvider {
                provider: payment.method.to_string(),
                message,
                is_retryable: false,
            }
            .into());
        }

        let reconciled = self.reconcile(payment, &observed, "verify").await?;
        let payable = self.payables.find(reconciled.payment.target).await?;

        Ok(VerifiedPayment {
            payment: reconciled.payment,
            payable,
            updated: reconciled.updated,
        })
    }

    /// Authenticate and apply one provider callback.
    ///
    /// Errors with `TransactionNotFound` for unknown transactions; the HTTP layer acknowledges
    /// those so the provider does not retry.
    pub async fn process_webhook(
        &self,
        method: PaymentMethod,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> AppResult<WebhookOutcome> {
        let gateway = self.registry.resolve(method)?;
        let scheme = gateway.webhook_signature();
        self.verifier
            .verify(method, scheme.as_ref(), raw_body, signature)?;

        let payload: serde_json::Value =
            serde_json::from_slice(raw_body).map_err(|e| WebhookError::MalformedPayload {
                provider: method.to_string(),
                message: e.to_string(),
            })?;

        let (event_type, observed) = match gateway.process_webhook(&payload)? {
            WebhookEvent::TestPing => {
                info!(method = %method, "Webhook test ping acknowledged");
                return Ok(WebhookOutcome::Acknowledged {
                    reason: "test ping".to_string(),
                });
            }
            WebhookEvent::Ignored { event_type, reason } => {
                debug!(method = %method, event_type = %event_type, reason = %reason, "Webhook event ignored");
                return Ok(WebhookOutcome::Acknowledged {
                    reason: format!("{}: {}", event_type, reason),
                });
            }
            WebhookEvent::Payment { event_type, result } => (event_type, result),
        };

        let transaction_id = observed.gateway_transaction_id.clone().ok_or_else(|| {
            AppError::from(WebhookError::MalformedPayload {
                provider: method.to_string(),
                message: "payment event without transaction id".to_string(),
            })
        })?;

        let key = replay_key(method, &transaction_id, observed.status);
        if let Some(guard) = &self.replay_guard {
            if guard.seen(&key).await {
                info!(method = %method, transaction_id = %transaction_id, "Duplicate webhook delivery skipped");
                return Ok(WebhookOutcome::Acknowledged {
                    reason: "duplicate delivery".to_string(),
                });
            }
        }

        let payment = self
            .payments
            .find_by_gateway_transaction_id(method, &transaction_id)
            .await?
            .ok_or_else(|| {
                AppError::from(DomainError::TransactionNotFound {
                    method: method.to_string(),
                    gateway_transaction_id: transaction_id.clone(),
                })
            })?;

        info!(
            payment_id = %payment.id,
            method = %method,
            event_type = %event_type,
            observed_status = %observed.status,
            "Processing payment webhook"
        );

        let reconciled = self.reconcile(payment, &observed, "webhook").await?;

        // A redelivery must still be able to apply what contention dropped.
        if !reconciled.contended {
            if let Some(guard) = &self.replay_guard {
                guard.remember(&key).await;
            }
        }

        Ok(WebhookOutcome::Processed {
            payment_id: reconciled.payment.id,
            status: reconciled.payment.status,
            updated: reconciled.updated,
        })
    }

    /// Refund a completed payment, fully or partially. The attempt moves to `Refunded`.
    pub async fn refund_payment(
        &self,
        payment_id: Uuid,
        request: RefundPaymentRequest,
    ) -> AppResult<PaymentAttempt> {
        let payment = self.load(payment_id).await?;

        if payment.status != PaymentStatus::Completed {
            return Err(DomainError::NotRefundable {
                payment_id: payment_id.to_string(),
                status: payment.status.to_string(),
            }
            .into());
        }

        let available = payment.amount.minor_units;
        let amount = request.amount.unwrap_or(available);
        if amount <= 0 {
            return Err(AppError::validation("amount", "refund amount must be positive"));
        }
        if amount > available {
            return Err(DomainError::RefundExceedsAmount {
                requested: amount,
                available,
            }
            .into());
        }

        let transaction_id = payment.gateway_transaction_id.clone().ok_or_else(|| {
            AppError::from(DomainError::NotRefundable {
                payment_id: payment_id.to_string(),
                status: "no gateway transaction".to_string(),
            })
        })?;

        let gateway = self.registry.resolve(payment.method)?;
        let partial = (amount < available).then(|| Money {
            currency: payment.amount.currency.clone(),
            minor_units: amount,
        });
        let refund_request = RefundRequest {
            payment_id,
            gateway_transaction_id: transaction_id,
            amount: partial,
            reason: request.reason.clone(),
        };

        let result = self
            .call_gateway(payment.method, "refund_payment", gateway.refund_payment(refund_request))
            .await?;

        if !result.success {
            let message = result.error.unwrap_or_else(|| "refund rejected".to_string());
            warn!(payment_id = %payment_id, reason = %message, "Gateway rejected refund");
            return Err(ExternalError::Declined {
                provider: payment.method.to_string(),
                message,
            }
            .into());
        }

        let record = RefundRecord {
            amount,
            reason: request.reason,
            refunded_at: Utc::now(),
            gateway_refund_id: result.refund_id,
        };
        let update = StatusUpdate::to(PaymentStatus::Refunded)
            .refund(record)
            .gateway_response(result.raw_response);

        match self
            .payments
            .compare_and_set_status(payment_id, PaymentStatus::Completed, update)
            .await?
        {
            Some(refunded) => {
                self.payables
                    .record_payment_outcome(refunded.target, refunded.id, PaymentStatus::Refunded)
                    .await?;
                info!(
                    payment_id = %payment_id,
                    amount,
                    currency = %refunded.amount.currency,
                    "Payment refunded"
                );
                Ok(refunded)
            }
            None => {
                let current = self.load(payment_id).await?;
                error!(
                    payment_id = %payment_id,
                    status = %current.status,
                    "Refund accepted by gateway but payment changed concurrently; manual review needed"
                );
                Err(DomainError::NotRefundable {
                    payment_id: payment_id.to_string(),
                    status: current.status.to_string(),
                }
                .into())
            }
        }
    }

    /// Cancel a payment that has not completed yet.
    pub async fn cancel_payment(&self, payment_id: Uuid) -> AppResult<PaymentAttempt> {
        let payment = self.load(payment_id).await?;

        if !matches!(payment.status, PaymentStatus::Pending | PaymentStatus::Processing) {
            return Err(DomainError::NotCancellable {
                payment_id: payment_id.to_string(),
                status: payment.status.to_string(),
            }
            .into());
        }

        let observed = match payment.gateway_transaction_id.clone() {
            None => GatewayResult {
                success: true,
                gateway_transaction_id: None,
                status: PaymentStatus::Cancelled,
                redirect_url: None,
                client_secret: None,
                amount: None,
                raw_response: json!({ "cancelled": "locally" }),
                error: None,
            },
            Some(transaction_id) => {
                let gateway = self.registry.resolve(payment.method)?;
                let result = self
                    .call_gateway(payment.method, "cancel_payment", gateway.cancel_payment(&transaction_id))
                    .await?;
                if !result.success {
                    warn!(
                        payment_id = %payment_id,
                        reason = ?result.error,
                        "Gateway refused cancellation"
                    );
                    return Err(DomainError::NotCancellable {
                        payment_id: payment_id.to_string(),
                        status: result
                            .error
                            .unwrap_or_else(|| format!("{} at provider", result.status)),
                    }
                    .into());
                }
                result
            }
        };

        let reconciled = self.reconcile(payment, &observed, "cancel").await?;
        if reconciled.payment.status != PaymentStatus::Cancelled {
            return Err(DomainError::NotCancellable {
                payment_id: payment_id.to_string(),
                status: reconciled.payment.status.to_string(),
            }
            .into());
        }
        Ok(reconciled.payment)
    }

    /// Apply an observed provider status to a stored attempt.
    async fn reconcile(
        &self,
        payment: PaymentAttempt,
        observed: &GatewayResult,
        source: &'static str,
    ) -> AppResult<Reconciled> {
        let target_status = observed.status;
        let mut current = payment;

        for _ in 0..MAX_CAS_ATTEMPTS {
            if current.status == target_status {
                if current.status == PaymentStatus::Completed {
                    self.ensure_payable_confirmed(&current).await?;
                }
                debug!(payment_id = %current.id, status = %current.status, source, "Status unchanged");
                return Ok(Reconciled::unchanged(current));
            }

            if current.status == PaymentStatus::Completed {
                info!(
                    payment_id = %current.id,
                    observed_status = %target_status,
                    source,
                    "Payment already completed; observed status not applied"
                );
                return Ok(Reconciled::unchanged(current));
            }

            if !current.status.can_transition_to(target_status) {
                if target_status == PaymentStatus::Completed
                    && matches!(current.status, PaymentStatus::Failed | PaymentStatus::Cancelled)
                {
                    return self.refund_late_capture(current, source).await;
                }
                if current.status.is_terminal() && target_status.is_settled() {
                    debug!(
                        payment_id = %current.id,
                        stored_status = %current.status,
                        observed_status = %target_status,
                        source,
                        "Payment already terminated"
                    );
                } else {
                    warn!(
                        payment_id = %current.id,
                        stored_status = %current.status,
                        observed_status = %target_status,
                        source,
                        "Status inconsistency: transition not allowed, ignoring"
                    );
                }
                return Ok(Reconciled::unchanged(current));
            }

            if target_status == PaymentStatus::Completed {
                if let Some(observed_amount) = &observed.amount {
                    if *observed_amount != current.amount {
                        error!(
                            payment_id = %current.id,
                            expected = %current.amount,
                            observed = %observed_amount,
                            source,
                            "Provider reports a different amount; completion not applied"
                        );
                        return Ok(Reconciled::unchanged(current));
                    }
                }
                if let Some(other) = self.payments.find_completed_for(current.target).await? {
                    if other.id != current.id {
                        error!(
                            payment_id = %current.id,
                            completed_payment_id = %other.id,
                            target = %current.target,
                            "Second completed payment for one payable"
                        );
                        return Err(DomainError::AlreadyPaid {
                            target: current.target.to_string(),
                        }
                        .into());
                    }
                }
            }

            let mut update = StatusUpdate::to(target_status)
                .gateway_transaction_id(observed.gateway_transaction_id.clone())
                .gateway_response(observed.raw_response.clone());
            if target_status == PaymentStatus::Failed {
                update = update.failure_reason(
                    observed
                        .error
                        .clone()
                        .or_else(|| Some("payment failed".to_string())),
                );
            }
            if target_status.is_settled() {
                update = update.processed_at(Utc::now());
            }

            let expected = current.status;
            match self
                .payments
                .compare_and_set_status(current.id, expected, update)
                .await
            {
                Ok(Some(updated)) => {
                    info!(
                        payment_id = %updated.id,
                        from = %expected,
                        to = %updated.status,
                        source,
                        "Payment status transition applied"
                    );
                    self.propagate(&updated).await?;
                    if updated.status == PaymentStatus::Failed {
                        self.void_declined_transaction(&updated).await;
                    }
                    return Ok(Reconciled::applied(updated));
                }
                Ok(None) => {
                    debug!(payment_id = %current.id, source, "Lost status race, re-reading");
                    current = self.load(current.id).await?;
                }
                Err(e) if e.is_duplicate_completion() => {
                    error!(
                        payment_id = %current.id,
                        target = %current.target,
                        "Second completed payment for one payable rejected by store"
                    );
                    return Err(DomainError::AlreadyPaid {
                        target: current.target.to_string(),
                    }
                    .into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(payment_id = %current.id, source, "Status update abandoned after repeated contention");
        Ok(Reconciled {
            contended: true,
            ..Reconciled::unchanged(current)
        })
    }

    /// Return money the provider captured for an attempt that already failed or was cancelled.
    ///
    /// The customer can still pay through a checkout page or client secret handed out before
    /// the attempt ended. The refund is recorded on the attempt, which keeps its status, and a
    /// recorded refund is never requested twice.
    async fn refund_late_capture(&self, payment: PaymentAttempt, source: &'static str) -> AppResult<Reconciled> {
        if payment.refund.is_some() {
            debug!(payment_id = %payment.id, source, "Late capture already refunded");
            return Ok(Reconciled::unchanged(payment));
        }
        let Some(transaction_id) = payment.gateway_transaction_id.clone() else {
            error!(
                payment_id = %payment.id,
                source,
                "Capture reported for an attempt without transaction id; manual review needed"
            );
            return Ok(Reconciled::unchanged(payment));
        };

        warn!(
            payment_id = %payment.id,
            stored_status = %payment.status,
            source,
            "Provider captured a terminated payment; refunding"
        );

        let reason = format!("captured after the payment was {}", payment.status);
        let gateway = self.registry.resolve(payment.method)?;
        let request = RefundRequest {
            payment_id: payment.id,
            gateway_transaction_id: transaction_id,
            amount: None,
            reason: Some(reason.clone()),
        };
        let result = self
            .call_gateway(payment.method, "refund_payment", gateway.refund_payment(request))
            .await?;

        if !result.success {
            error!(
                payment_id = %payment.id,
                reason = ?result.error,
                "Gateway rejected refund of a late capture; manual review needed"
            );
            return Ok(Reconciled::unchanged(payment));
        }

        let amount = result
            .amount
            .filter(|amount| *amount > 0 && *amount <= payment.amount.minor_units)
            .unwrap_or(payment.amount.minor_units);
        let record = RefundRecord {
            amount,
            reason: Some(reason),
            refunded_at: Utc::now(),
            gateway_refund_id: result.refund_id,
        };
        let update = StatusUpdate::to(payment.status)
            .refund(record)
            .gateway_response(result.raw_response);

        match self
            .payments
            .compare_and_set_status(payment.id, payment.status, update)
            .await?
        {
            Some(recorded) => {
                info!(payment_id = %recorded.id, amount, "Late capture refunded");
                Ok(Reconciled::applied(recorded))
            }
            None => {
                let current = self.load(payment.id).await?;
                error!(
                    payment_id = %payment.id,
                    status = %current.status,
                    "Late capture refunded but payment changed concurrently; manual review needed"
                );
                Ok(Reconciled::unchanged(current))
            }
        }
    }

    /// Close a failed transaction at providers that would otherwise accept another card for
    /// it. Best effort: a capture that slips through is refunded by `refund_late_capture`.
    async fn void_declined_transaction(&self, payment: &PaymentAttempt) {
        let Some(transaction_id) = payment.gateway_transaction_id.as_deref() else {
            return;
        };
        let gateway = match self.registry.resolve(payment.method) {
            Ok(gateway) if gateway.retryable_after_decline() => gateway,
            _ => return,
        };

        match self
            .call_gateway(payment.method, "cancel_payment", gateway.cancel_payment(transaction_id))
            .await
        {
            Ok(result) if result.success => {
                info!(payment_id = %payment.id, "Declined transaction voided at provider");
            }
            Ok(result) => warn!(
                payment_id = %payment.id,
                reason = ?result.error,
                "Provider refused to void declined transaction"
            ),
            Err(e) => warn!(
                payment_id = %payment.id,
                error = %e,
                "Failed to void declined transaction"
            ),
        }
    }

    /// Mirror a freshly applied status onto the order/membership.
    async fn propagate(&self, payment: &PaymentAttempt) -> AppResult<()> {
        let payable = self
            .payables
            .record_payment_outcome(payment.target, payment.id, payment.status)
            .await?;

        match (payment.status, &payable) {
            (PaymentStatus::Completed, _) => {
                info!(payment_id = %payment.id, target = %payment.target, "Payable confirmed");
                self.hooks.on_payment_completed(payment, payable.as_ref()).await;
            }
            (_, None) => debug!(
                payment_id = %payment.id,
                target = %payment.target,
                "Payable points at another attempt; status not mirrored"
            ),
            _ => {}
        }
        Ok(())
    }

    /// Repair a completed attempt whose payable update did not land (idempotent write, no hooks).
    async fn ensure_payable_confirmed(&self, payment: &PaymentAttempt) -> AppResult<()> {
        let mirrored = self
            .payables
            .find(payment.target)
            .await?
            .map(|p| p.payment_id == Some(payment.id) && p.payment_status == Some(PaymentStatus::Completed))
            .unwrap_or(true);

        if !mirrored {
            warn!(payment_id = %payment.id, target = %payment.target, "Repairing unconfirmed payable");
            self.payables
                .record_payment_outcome(payment.target, payment.id, PaymentStatus::Completed)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::error::DbResult;
    use crate::database::memory::InMemoryStore;
    use crate::payments::testing::FakeGateway;
    use crate::payments::types::PayableStatus;
    use crate::payments::webhook::UnsignedWebhookPolicy;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    const SECRET: &str = "whsec_fake";

    #[derive(Default)]
    struct CountingHooks {
        completed: AtomicUsize,
    }

    #[async_trait]
    impl PaymentHooks for CountingHooks {
        async fn on_payment_completed(&self, _payment: &PaymentAttempt, _payable: Option<&Payable>) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MemoryReplayGuard {
        keys: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl WebhookReplayGuard for MemoryReplayGuard {
        async fn seen(&self, key: &str) -> bool {
            self.keys.lock().await.contains(key)
        }

        async fn remember(&self, key: &str) {
            self.keys.lock().await.insert(key.to_string());
        }
    }

    struct Harness {
        orchestrator: PaymentOrchestrator,
        store: Arc<InMemoryStore>,
        gateway: Arc<FakeGateway>,
        hooks: Arc<CountingHooks>,
        target: PayableRef,
        user_id: Uuid,
    }

    /// Loses a scripted number of compare-and-set rounds, then behaves like the inner store.
    struct ContendedStore {
        inner: Arc<InMemoryStore>,
        losses: AtomicUsize,
    }

    #[async_trait]
    impl PaymentStore for ContendedStore {
        async fn insert(&self, attempt: &PaymentAttempt) -> DbResult<PaymentAttempt> {
            self.inner.insert(attempt).await
        }

        async fn find_by_id(&self, id: Uuid) -> DbResult<Option<PaymentAttempt>> {
            self.inner.find_by_id(id).await
        }

        async fn find_by_gateway_transaction_id(
            &self,
            method: PaymentMethod,
            gateway_transaction_id: &str,
        ) -> DbResult<Option<PaymentAttempt>> {
            self.inner
                .find_by_gateway_transaction_id(method, gateway_transaction_id)
                .await
        }

        async fn find_completed_for(&self, target: PayableRef) -> DbResult<Option<PaymentAttempt>> {
            self.inner.find_completed_for(target).await
        }

        async fn list_for(&self, target: PayableRef) -> DbResult<Vec<PaymentAttempt>> {
            self.inner.list_for(target).await
        }

        async fn compare_and_set_status(
            &self,
            id: Uuid,
            expected: PaymentStatus,
            update: StatusUpdate,
        ) -> DbResult<Option<PaymentAttempt>> {
            let lose = self
                .losses
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lose {
                return Ok(None);
            }
            self.inner.compare_and_set_status(id, expected, update).await
        }
    }

    impl Harness {
        async fn new() -> Self {
            let store = Arc::new(InMemoryStore::new());
            Self::with_payment_store(store.clone(), store).await
        }

        async fn with_payment_store(store: Arc<InMemoryStore>, payments: Arc<dyn PaymentStore>) -> Self {
            let gateway = Arc::new(FakeGateway::new(PaymentMethod::Card).with_webhook_secret(SECRET));
            let hooks = Arc::new(CountingHooks::default());
            let registry = GatewayRegistry::new().register(gateway.clone());

            let orchestrator = PaymentOrchestrator::new(
                registry,
                payments,
                store.clone(),
                WebhookVerifier::new(UnsignedWebhookPolicy::Reject),
                OrchestratorConfig::new("https://shop.example.com/", Duration::from_secs(5)),
            )
            .with_hooks(hooks.clone());

            let target = PayableRef::Order(Uuid::new_v4());
            let user_id = Uuid::new_v4();
            store
                .seed_payable(Payable {
                    target,
                    user_id,
                    status: PayableStatus::Pending,
                    payment_status: None,
                    payment_id: None,
                    total: Money::new("EUR", 1999).unwrap(),
                    customer_email: Some("buyer@example.com".to_string()),
                })
                .await;

            Self {
                orchestrator,
                store,
                gateway,
                hooks,
                target,
                user_id,
            }
        }

        fn request(&self) -> CreatePaymentRequest {
            CreatePaymentRequest {
                target: self.target,
                user_id: self.user_id,
                method: PaymentMethod::Card,
                amount: Money::new("EUR", 1999).unwrap(),
                description: Some("Order O1".to_string()),
                metadata: None,
                return_url: None,
            }
        }

        async fn create(&self) -> PaymentAttempt {
            self.orchestrator
                .create_payment(self.request())
                .await
                .unwrap()
                .payment
        }

        async fn deliver(&self, payment: &PaymentAttempt, status: PaymentStatus) -> AppResult<WebhookOutcome> {
            let body = FakeGateway::webhook_body(
                payment.gateway_transaction_id.as_deref().unwrap(),
                status,
            );
            let signature = self.gateway.sign(&body).unwrap();
            self.orchestrator
                .process_webhook(PaymentMethod::Card, &body, signature.as_deref())
                .await
        }

        async fn stored(&self, id: Uuid) -> PaymentAttempt {
            self.orchestrator.get_payment(id).await.unwrap()
        }

        async fn payable(&self) -> Payable {
            self.store.payable(self.target).await.unwrap()
        }

        fn completions(&self) -> usize {
            self.hooks.completed.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn checkout_webhook_replay_and_refund_scenario() {
        let h = Harness::new().await;

        let created = h.orchestrator.create_payment(h.request()).await.unwrap();
        assert_eq!(created.result.status, PaymentStatus::Pending);
        assert!(created.result.client_secret.is_some());
        let payment = created.payment;
        assert_eq!(h.payable().await.payment_status, Some(PaymentStatus::Pending));
        assert_eq!(h.payable().await.payment_id, Some(payment.id));

        let outcome = h.deliver(&payment, PaymentStatus::Completed).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Processed {
                payment_id: payment.id,
                status: PaymentStatus::Completed,
                updated: true
            }
        );
        let completed = h.stored(payment.id).await;
        assert_eq!(completed.status, PaymentStatus::Completed);
        assert!(completed.processed_at.is_some());
        let payable = h.payable().await;
        assert_eq!(payable.status, PayableStatus::Confirmed);
        assert_eq!(payable.payment_status, Some(PaymentStatus::Completed));
        assert_eq!(h.completions(), 1);

        let replay = h.deliver(&payment, PaymentStatus::Completed).await.unwrap();
        assert!(matches!(replay, WebhookOutcome::Processed { updated: false, .. }));
        let after_replay = h.stored(payment.id).await;
        assert_eq!(after_replay.processed_at, completed.processed_at);
        assert_eq!(h.completions(), 1);

        let refunded = h
            .orchestrator
            .refund_payment(
                payment.id,
                RefundPaymentRequest {
                    amount: Some(500),
                    reason: Some("damaged".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(refunded.status, PaymentStatus::Refunded);
        assert_eq!(refunded.refund.as_ref().unwrap().amount, 500);
        assert_eq!(h.payable().await.payment_status, Some(PaymentStatus::Refunded));

        let second = h
            .orchestrator
            .refund_payment(payment.id, RefundPaymentRequest { amount: Some(500), reason: None })
            .await
            .unwrap_err();
        assert_eq!(second.status_code(), axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(h.gateway.calls().refund, 1);
    }

    #[tokio::test]
    async fn replaying_a_webhook_many_times_confirms_once() {
        let h = Harness::new().await;
        let payment = h.create().await;

        for _ in 0..5 {
            h.deliver(&payment, PaymentStatus::Completed).await.unwrap();
        }
        assert_eq!(h.completions(), 1);
        assert_eq!(h.stored(payment.id).await.status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn settled_states_never_move_backward() {
        for settled in [PaymentStatus::Failed, PaymentStatus::Cancelled, PaymentStatus::Completed] {
            for attempted in PaymentStatus::ALL {
                let h = Harness::new().await;
                let payment = h.create().await;
                h.deliver(&payment, settled).await.unwrap();
                let before = h.stored(payment.id).await;
                assert_eq!(before.status, settled);

                h.deliver(&payment, attempted).await.unwrap();
                assert_eq!(
                    h.stored(payment.id).await.status,
                    settled,
                    "{} must not move to {} via webhook",
                    settled,
                    attempted
                );
            }
        }
    }

    #[tokio::test]
    async fn refunded_payments_stay_refunded() {
        let h = Harness::new().await;
        let payment = h.create().await;
        h.deliver(&payment, PaymentStatus::Completed).await.unwrap();
        h.orchestrator
            .refund_payment(payment.id, RefundPaymentRequest::default())
            .await
            .unwrap();

        for attempted in PaymentStatus::ALL {
            h.deliver(&payment, attempted).await.unwrap();
            assert_eq!(h.stored(payment.id).await.status, PaymentStatus::Refunded);
        }
    }

    #[tokio::test]
    async fn concurrent_verify_and_webhook_apply_once() {
        let h = Harness::new().await;
        let payment = h.create().await;
        h.gateway.set_verify_status(PaymentStatus::Completed);

        let (verified, webhook) = tokio::join!(
            h.orchestrator.verify_payment_and_update(payment.id),
            h.deliver(&payment, PaymentStatus::Completed)
        );
        let verified = verified.unwrap();
        let webhook_updated = match webhook.unwrap() {
            WebhookOutcome::Processed { updated, .. } => updated,
            other => panic!("unexpected outcome {:?}", other),
        };

        assert!(verified.updated ^ webhook_updated, "exactly one caller applies the transition");
        assert_eq!(h.completions(), 1);
        assert_eq!(h.stored(payment.id).await.status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn verify_is_idempotent() {
        let h = Harness::new().await;
        let payment = h.create().await;
        h.gateway.set_verify_status(PaymentStatus::Completed);

        let first = h.orchestrator.verify_payment_and_update(payment.id).await.unwrap();
        assert!(first.updated);
        assert_eq!(first.payable.unwrap().status, PayableStatus::Confirmed);

        let second = h.orchestrator.verify_payment_and_update(payment.id).await.unwrap();
        assert!(!second.updated);
        assert_eq!(h.completions(), 1);
    }

    #[tokio::test]
    async fn failed_payment_records_reason_and_leaves_order_payable() {
        let h = Harness::new().await;
        let payment = h.create().await;
        h.gateway.set_verify_status(PaymentStatus::Failed);

        let verified = h.orchestrator.verify_payment_and_update(payment.id).await.unwrap();
        assert_eq!(verified.payment.status, PaymentStatus::Failed);
        assert_eq!(verified.payment.failure_reason.as_deref(), Some("card declined"));
        assert!(verified.payment.processed_at.is_some());

        let payable = h.payable().await;
        assert_eq!(payable.status, PayableStatus::Pending);
        assert_eq!(payable.payment_status, Some(PaymentStatus::Failed));

        let retry = h.orchestrator.create_payment(h.request()).await.unwrap();
        assert_ne!(retry.payment.id, payment.id);
        assert_eq!(h.payable().await.payment_id, Some(retry.payment.id));
    }

    #[tokio::test]
    async fn completion_with_a_different_amount_is_not_applied() {
        let h = Harness::new().await;
        let payment = h.create().await;
        h.gateway.set_verify_status(PaymentStatus::Completed);
        h.gateway.set_verify_amount(Money::new("EUR", 999).unwrap());

        let verified = h.orchestrator.verify_payment_and_update(payment.id).await.unwrap();
        assert!(!verified.updated);
        assert_eq!(verified.payment.status, PaymentStatus::Pending);
        assert_eq!(h.completions(), 0);
    }

    #[tokio::test]
    async fn create_validates_the_payable() {
        let h = Harness::new().await;

        let mut wrong_user = h.request();
        wrong_user.user_id = Uuid::new_v4();
        assert_eq!(
            h.orchestrator.create_payment(wrong_user).await.unwrap_err().code(),
            "forbidden"
        );

        let mut wrong_amount = h.request();
        wrong_amount.amount = Money::new("EUR", 2000).unwrap();
        assert_eq!(
            h.orchestrator.create_payment(wrong_amount).await.unwrap_err().code(),
            "amount_mismatch"
        );

        let mut wrong_currency = h.request();
        wrong_currency.amount = Money::new("USD", 1999).unwrap();
        assert!(h.orchestrator.create_payment(wrong_currency).await.is_err());

        let mut unknown = h.request();
        unknown.target = PayableRef::Order(Uuid::new_v4());
        assert!(h
            .orchestrator
            .create_payment(unknown)
            .await
            .unwrap_err()
            .is_not_found());

        let mut unconfigured = h.request();
        unconfigured.method = PaymentMethod::Paystack;
        assert_eq!(
            h.orchestrator.create_payment(unconfigured).await.unwrap_err().code(),
            "method_not_configured"
        );

        assert_eq!(h.gateway.calls().create, 0);
        assert_eq!(h.store.payment_count().await, 0);
    }

    #[tokio::test]
    async fn paid_orders_reject_new_attempts() {
        let h = Harness::new().await;
        let payment = h.create().await;
        h.deliver(&payment, PaymentStatus::Completed).await.unwrap();

        // Confirmed orders are no longer payable at all.
        let err = h.orchestrator.create_payment(h.request()).await.unwrap_err();
        assert_eq!(err.code(), "not_payable");
    }

    #[tokio::test]
    async fn second_completion_for_one_order_is_a_conflict() {
        let h = Harness::new().await;
        let first = h.create().await;
        let second = h.create().await;

        h.deliver(&first, PaymentStatus::Completed).await.unwrap();
        let err = h.deliver(&second, PaymentStatus::Completed).await.unwrap_err();
        assert_eq!(err.code(), "already_paid");
        assert_eq!(h.stored(second.id).await.status, PaymentStatus::Pending);
        assert_eq!(h.completions(), 1);
    }

    #[tokio::test]
    async fn declined_intent_writes_nothing() {
        let h = Harness::new().await;
        h.gateway.decline_intents("card declined");

        let err = h.orchestrator.create_payment(h.request()).await.unwrap_err();
        assert_eq!(err.code(), "gateway_declined");
        assert_eq!(h.store.payment_count().await, 0);
        assert_eq!(h.payable().await.payment_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_gateway_call_leaves_payment_unchanged() {
        let h = Harness::new().await;
        let payment = h.create().await;
        h.gateway.set_verify_status(PaymentStatus::Completed);
        h.gateway.set_delay(Duration::from_secs(60));

        let err = h.orchestrator.verify_payment_and_update(payment.id).await.unwrap_err();
        assert_eq!(err.code(), "gateway_timeout");
        assert!(err.is_retryable());
        assert_eq!(h.stored(payment.id).await.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn gateway_infrastructure_errors_propagate_without_mutation() {
        let h = Harness::new().await;
        let payment = h.create().await;
        h.gateway.fail_with_infrastructure_error(true);

        let err = h.orchestrator.verify_payment_and_update(payment.id).await.unwrap_err();
        assert_eq!(err.code(), "gateway_error");
        assert_eq!(h.stored(payment.id).await.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn refund_bounds_are_enforced() {
        let h = Harness::new().await;
        let payment = h.create().await;

        let not_completed = h
            .orchestrator
            .refund_payment(payment.id, RefundPaymentRequest::default())
            .await
            .unwrap_err();
        assert_eq!(not_completed.code(), "not_refundable");

        h.deliver(&payment, PaymentStatus::Completed).await.unwrap();

        let too_much = h
            .orchestrator
            .refund_payment(payment.id, RefundPaymentRequest { amount: Some(2000), reason: None })
            .await
            .unwrap_err();
        assert_eq!(too_much.code(), "refund_exceeds_amount");
        assert_eq!(too_much.status_code(), axum::http::StatusCode::BAD_REQUEST);

        let zero = h
            .orchestrator
            .refund_payment(payment.id, RefundPaymentRequest { amount: Some(0), reason: None })
            .await;
        assert!(zero.is_err());

        let stored = h.stored(payment.id).await;
        assert_eq!(stored.status, PaymentStatus::Completed);
        assert!(stored.refund.is_none());
        assert_eq!(h.gateway.calls().refund, 0);

        let full = h
            .orchestrator
            .refund_payment(payment.id, RefundPaymentRequest { amount: Some(1999), reason: None })
            .await
            .unwrap();
        assert_eq!(full.refund.unwrap().amount, 1999);
    }

    #[tokio::test]
    async fn declined_refund_keeps_payment_completed() {
        let h = Harness::new().await;
        let payment = h.create().await;
        h.deliver(&payment, PaymentStatus::Completed).await.unwrap();
        h.gateway.decline_refunds("insufficient balance");

        let err = h
            .orchestrator
            .refund_payment(payment.id, RefundPaymentRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "gateway_declined");
        assert_eq!(h.stored(payment.id).await.status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_pending_payment() {
        let h = Harness::new().await;
        let payment = h.create().await;

        let cancelled = h.orchestrator.cancel_payment(payment.id).await.unwrap();
        assert_eq!(cancelled.status, PaymentStatus::Cancelled);
        assert!(cancelled.processed_at.is_some());

        let payable = h.payable().await;
        assert_eq!(payable.status, PayableStatus::Pending);
        assert_eq!(payable.payment_status, Some(PaymentStatus::Cancelled));

        let again = h.orchestrator.cancel_payment(payment.id).await.unwrap_err();
        assert_eq!(again.code(), "not_cancellable");
    }

    #[tokio::test]
    async fn cancel_is_rejected_for_completed_payments() {
        let h = Harness::new().await;
        let payment = h.create().await;
        h.deliver(&payment, PaymentStatus::Completed).await.unwrap();

        let err = h.orchestrator.cancel_payment(payment.id).await.unwrap_err();
        assert_eq!(err.code(), "not_cancellable");
        assert_eq!(h.gateway.calls().cancel, 0);
    }

    #[tokio::test]
    async fn provider_refusing_cancellation_is_structured() {
        let h = Harness::new().await;
        let payment = h.create().await;
        h.gateway.refuse_cancellation("already captured");

        let err = h.orchestrator.cancel_payment(payment.id).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(h.stored(payment.id).await.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn forged_webhooks_never_mutate() {
        let h = Harness::new().await;
        let payment = h.create().await;
        let body = FakeGateway::webhook_body(
            payment.gateway_transaction_id.as_deref().unwrap(),
            PaymentStatus::Completed,
        );

        let forged = h
            .orchestrator
            .process_webhook(PaymentMethod::Card, &body, Some("00ff"))
            .await
            .unwrap_err();
        assert!(forged.is_webhook_authenticity());

        let unsigned = h
            .orchestrator
            .process_webhook(PaymentMethod::Card, &body, None)
            .await
            .unwrap_err();
        assert!(unsigned.is_webhook_authenticity());

        assert_eq!(h.stored(payment.id).await.status, PaymentStatus::Pending);
        assert_eq!(h.completions(), 0);
    }

    #[tokio::test]
    async fn test_pings_and_unknown_transactions_are_harmless() {
        let h = Harness::new().await;

        let ping = br#"{"event":"ping"}"#;
        let signature = h.gateway.sign(ping).unwrap();
        let outcome = h
            .orchestrator
            .process_webhook(PaymentMethod::Card, ping, signature.as_deref())
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Acknowledged { .. }));

        let unknown = FakeGateway::webhook_body("fake_unknown", PaymentStatus::Completed);
        let signature = h.gateway.sign(&unknown).unwrap();
        let err = h
            .orchestrator
            .process_webhook(PaymentMethod::Card, &unknown, signature.as_deref())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let garbage = b"not json";
        let signature = h.gateway.sign(garbage).unwrap();
        let err = h
            .orchestrator
            .process_webhook(PaymentMethod::Card, garbage, signature.as_deref())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "malformed_webhook");
    }

    #[tokio::test]
    async fn replay_guard_short_circuits_known_deliveries() {
        let mut h = Harness::new().await;
        let guard = Arc::new(MemoryReplayGuard::default());
        h.orchestrator = h.orchestrator.with_replay_guard(guard.clone());

        let payment = h.create().await;
        h.deliver(&payment, PaymentStatus::Completed).await.unwrap();
        let second = h.deliver(&payment, PaymentStatus::Completed).await.unwrap();

        assert_eq!(
            second,
            WebhookOutcome::Acknowledged {
                reason: "duplicate delivery".to_string()
            }
        );
        assert_eq!(h.completions(), 1);
    }

    #[tokio::test]
    async fn unknown_gateway_status_keeps_payment_pending() {
        let h = Harness::new().await;
        let payment = h.create().await;

        let body = serde_json::json!({
            "event": "payment.updated",
            "transaction_id": payment.gateway_transaction_id,
            "status": "teleported",
        })
        .to_string();
        let signature = h.gateway.sign(body.as_bytes()).unwrap();
        let outcome = h
            .orchestrator
            .process_webhook(PaymentMethod::Card, body.as_bytes(), signature.as_deref())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            WebhookOutcome::Processed { status: PaymentStatus::Pending, updated: false, .. }
        ));
    }

    #[tokio::test]
    async fn synchronous_completion_at_creation_confirms_order() {
        let h = Harness::new().await;
        h.gateway.set_intent_status(PaymentStatus::Completed);

        let created = h.orchestrator.create_payment(h.request()).await.unwrap();
        assert_eq!(created.payment.status, PaymentStatus::Completed);
        assert_eq!(created.result.status, PaymentStatus::Completed);
        assert_eq!(h.payable().await.status, PayableStatus::Confirmed);
        assert_eq!(h.completions(), 1);
    }

    #[tokio::test]
    async fn payments_are_listed_per_payable() {
        let h = Harness::new().await;
        let first = h.create().await;
        let second = h.create().await;

        let listed = h.orchestrator.list_payments_for(h.target).await.unwrap();
        let ids: HashSet<Uuid> = listed.iter().map(|p| p.id).collect();
        assert_eq!(ids, HashSet::from([first.id, second.id]));
    }

    #[tokio::test]
    async fn declined_transaction_is_voided_when_the_provider_accepts_another_card() {
        let h = Harness::new().await;
        h.gateway.set_retryable_after_decline(true);
        let payment = h.create().await;

        let outcome = h.deliver(&payment, PaymentStatus::Failed).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Processed {
                payment_id: payment.id,
                status: PaymentStatus::Failed,
                updated: true
            }
        );
        assert_eq!(h.gateway.calls().cancel, 1);

        // The provider's own cancellation event for the void changes nothing.
        let echoed = h.deliver(&payment, PaymentStatus::Cancelled).await.unwrap();
        assert!(matches!(
            echoed,
            WebhookOutcome::Processed { status: PaymentStatus::Failed, updated: false, .. }
        ));
    }

    #[tokio::test]
    async fn capture_after_a_decline_is_refunded() {
        let h = Harness::new().await;
        h.gateway.set_retryable_after_decline(true);
        // The customer's second card went through before the void reached the provider.
        h.gateway.refuse_cancellation("intent already succeeded");
        let payment = h.create().await;

        h.deliver(&payment, PaymentStatus::Failed).await.unwrap();
        let outcome = h.deliver(&payment, PaymentStatus::Completed).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Processed {
                payment_id: payment.id,
                status: PaymentStatus::Failed,
                updated: true
            }
        );

        let stored = h.stored(payment.id).await;
        let refund = stored.refund.expect("late capture refund recorded");
        assert_eq!(refund.amount, 1999);
        assert_eq!(refund.reason.as_deref(), Some("captured after the payment was failed"));
        assert_eq!(h.gateway.calls().refund, 1);
        assert_eq!(h.payable().await.status, PayableStatus::Pending);
        assert_eq!(h.completions(), 0);

        // Later observations of the same capture do not refund again.
        h.gateway.set_verify_status(PaymentStatus::Completed);
        let verified = h.orchestrator.verify_payment_and_update(payment.id).await.unwrap();
        assert!(!verified.updated);
        assert_eq!(h.gateway.calls().refund, 1);
    }

    #[tokio::test]
    async fn payment_made_after_cancellation_is_refunded() {
        let h = Harness::new().await;
        let payment = h.create().await;
        h.orchestrator.cancel_payment(payment.id).await.unwrap();

        let outcome = h.deliver(&payment, PaymentStatus::Completed).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Processed {
                payment_id: payment.id,
                status: PaymentStatus::Cancelled,
                updated: true
            }
        );

        let stored = h.stored(payment.id).await;
        assert_eq!(stored.status, PaymentStatus::Cancelled);
        assert_eq!(stored.refund.map(|r| r.amount), Some(1999));
        assert_eq!(h.gateway.calls().refund, 1);
        assert_eq!(h.payable().await.status, PayableStatus::Pending);

        // The order stays payable through a fresh attempt.
        let retry = h.orchestrator.create_payment(h.request()).await.unwrap();
        h.deliver(&retry.payment, PaymentStatus::Completed).await.unwrap();
        assert_eq!(h.payable().await.status, PayableStatus::Confirmed);
        assert_eq!(h.completions(), 1);
    }

    #[tokio::test]
    async fn rejected_late_capture_refund_leaves_the_attempt_untouched() {
        let h = Harness::new().await;
        let payment = h.create().await;
        h.orchestrator.cancel_payment(payment.id).await.unwrap();
        h.gateway.decline_refunds("balance too low");

        let outcome = h.deliver(&payment, PaymentStatus::Completed).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Processed { updated: false, .. }));
        assert!(h.stored(payment.id).await.refund.is_none());
    }

    #[tokio::test]
    async fn contended_webhook_is_applied_on_redelivery() {
        let store = Arc::new(InMemoryStore::new());
        let contended = Arc::new(ContendedStore {
            inner: store.clone(),
            losses: AtomicUsize::new(0),
        });
        let mut h = Harness::with_payment_store(store, contended.clone()).await;
        h.orchestrator = h
            .orchestrator
            .with_replay_guard(Arc::new(MemoryReplayGuard::default()));
        let payment = h.create().await;

        contended.losses.store(MAX_CAS_ATTEMPTS, Ordering::SeqCst);
        let dropped = h.deliver(&payment, PaymentStatus::Completed).await.unwrap();
        assert_eq!(
            dropped,
            WebhookOutcome::Processed {
                payment_id: payment.id,
                status: PaymentStatus::Pending,
                updated: false
            }
        );

        let redelivered = h.deliver(&payment, PaymentStatus::Completed).await.unwrap();
        assert_eq!(
            redelivered,
            WebhookOutcome::Processed {
                payment_id: payment.id,
                status: PaymentStatus::Completed,
                updated: true
            }
        );
        assert_eq!(h.completions(), 1);
    }
}
