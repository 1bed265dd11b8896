use crate::database::error::DbResult;
use crate::payments::status::PaymentStatus;
use crate::payments::types::{Payable, PayableRef, PaymentAttempt, PaymentMethod, RefundRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Fields written together with a status transition.
///
/// `None` leaves the stored value untouched. A stored `gateway_transaction_id` is never
/// overwritten.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: PaymentStatus,
    pub gateway_transaction_id: Option<String>,
    pub gateway_response: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub refund: Option<RefundRecord>,
}

impl StatusUpdate {
    pub fn to(status: PaymentStatus) -> Self {
        Self {
            status,
            gateway_transaction_id: None,
            gateway_response: None,
            failure_reason: None,
            processed_at: None,
            refund: None,
        }
    }

    pub fn gateway_transaction_id(mut self, id: Option<String>) -> Self {
        self.gateway_transaction_id = id;
        self
    }

    pub fn gateway_response(mut self, response: serde_json::Value) -> Self {
        self.gateway_response = Some(response);
        self
    }

    pub fn failure_reason(mut self, reason: Option<String>) -> Self {
        self.failure_reason = reason;
        self
    }

    pub fn processed_at(mut self, at: DateTime<Utc>) -> Self {
        self.processed_at = Some(at);
        self
    }

    pub fn refund(mut self, refund: RefundRecord) -> Self {
        self.refund = Some(refund);
        self
    }
}

/// Storage for payment attempts.
///
/// Implementations must make [`compare_and_set_status`](PaymentStore::compare_and_set_status)
/// a single atomic operation and enforce two uniqueness rules: one `(method,
/// gateway_transaction_id)` per attempt and at most one `Completed` attempt per payable.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn insert(&self, attempt: &PaymentAttempt) -> DbResult<PaymentAttempt>;

    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<PaymentAttempt>>;

    async fn find_by_gateway_transaction_id(
        &self,
        method: PaymentMethod,
        gateway_transaction_id: &str,
    ) -> DbResult<Option<PaymentAttempt>>;

    async fn find_completed_for(&self, target: PayableRef) -> DbResult<Option<PaymentAttempt>>;

    /// All attempts for a payable, newest first.
    async fn list_for(&self, target: PayableRef) -> DbResult<Vec<PaymentAttempt>>;

    /// Apply `update` only if the stored status still equals `expected`.
    ///
    /// Returns `None` when another writer changed the status first.
    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        update: StatusUpdate,
    ) -> DbResult<Option<PaymentAttempt>>;
}

/// The order/membership fields owned by this subsystem.
#[async_trait]
pub trait PayableStore: Send + Sync {
    async fn find(&self, target: PayableRef) -> DbResult<Option<Payable>>;

    /// Point the payable at a freshly created attempt.
    async fn attach_payment(
        &self,
        target: PayableRef,
        payment_id: Uuid,
        payment_status: PaymentStatus,
    ) -> DbResult<Payable>;

    /// Mirror an attempt's new status onto the payable.
    ///
    /// `Completed` takes over `payment_id` and moves a pending workflow status to `Confirmed`.
    /// Any other status is written only while `payment_id` still points at this attempt, so a
    /// stale attempt cannot overwrite the state of a newer one. Returns `None` when nothing
    /// was written.
    async fn record_payment_outcome(
        &self,
        target: PayableRef,
        payment_id: Uuid,
        status: PaymentStatus,
    ) -> DbResult<Option<Payable>>;
}
