//! Payment gateway trait definitions
//!
//! Defines the common interface that all payment gateways must implement.

use crate::error::AppResult;
use crate::payments::status_mapper::StatusMapper;
use crate::payments::types::{
    GatewayResult, PaymentIntentRequest, PaymentMethod, RefundRequest, RefundResult, WebhookEvent,
};
use crate::payments::webhook::SignatureScheme;
use async_trait::async_trait;

/// Trait for payment gateway implementations
///
/// Card (Stripe) and Paystack adapters implement this trait so the orchestrator never branches
/// on provider identity. Ordinary provider-reported failures (declined card, refused
/// cancellation) are returned as `Ok` results with `success == false`. `Err` is reserved for
/// infrastructure faults: network errors, bad credentials, unreadable responses.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Payment method this gateway serves
    fn method(&self) -> PaymentMethod;

    /// Translator from the provider's native status vocabulary
    fn status_mapper(&self) -> &dyn StatusMapper;

    /// Header carrying the webhook signature
    fn signature_header(&self) -> &'static str;

    /// How webhooks are signed, or `None` when no signing secret is configured
    fn webhook_signature(&self) -> Option<SignatureScheme>;

    /// Open a payment with the provider
    ///
    /// # Returns
    /// * `GatewayResult` - transaction id, canonical status and either a redirect URL or a
    ///   client secret for the front end
    async fn create_payment_intent(&self, request: PaymentIntentRequest)
        -> AppResult<GatewayResult>;

    /// Poll the current provider-side status of a transaction
    async fn verify_payment(&self, gateway_transaction_id: &str) -> AppResult<GatewayResult>;

    /// Classify an already-authenticated webhook payload
    ///
    /// Pure: no I/O, so replaying the same payload always yields the same event.
    fn process_webhook(&self, payload: &serde_json::Value) -> AppResult<WebhookEvent>;

    /// Refund a captured payment, partially when `request.amount` is set
    async fn refund_payment(&self, request: RefundRequest) -> AppResult<RefundResult>;

    /// Cancel a payment that has not been captured yet
    async fn cancel_payment(&self, gateway_transaction_id: &str) -> AppResult<GatewayResult>;

    /// The customer can retry a declined payment against the same transaction.
    ///
    /// When true, a recorded failure is voided with [`cancel_payment`](Self::cancel_payment)
    /// so the transaction cannot be captured afterwards.
    fn retryable_after_decline(&self) -> bool {
        false
    }
}
