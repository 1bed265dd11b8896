//! In-process store implementing the same contract as the Postgres repositories.
//!
//! Every operation runs under one write lock, which gives compare-and-set the same
//! atomicity as the single-statement `UPDATE ... WHERE status = $expected` in Postgres.
//! Used by tests and by local runs without a database.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::database::error::{
    DatabaseError, DbResult, ONE_COMPLETED_PER_TARGET, ONE_PAYMENT_PER_TRANSACTION,
};
use crate::database::repository::{PayableStore, PaymentStore, StatusUpdate};
use crate::payments::status::PaymentStatus;
use crate::payments::types::{Payable, PayableRef, PayableStatus, PaymentAttempt, PaymentMethod};


#[derive(Default)]
pub struct InMemoryStore {
    payments: RwLock<HashMap<Uuid, PaymentAttempt>>,
    payables: RwLock<HashMap<PayableRef, Payable>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stand-in for the collaborator that creates orders and memberships.
    pub async fn seed_payable(&self, payable: Payable) {
        self.payables.write().await.insert(payable.target, payable);
    }

    pub async fn payable(&self, target: PayableRef) -> Option<Payable> {
        self.payables.read().await.get(&target).cloned()
    }

    pub async fn payment_count(&self) -> usize {
        self.payments.read().await.len()
    }
}

fn transaction_taken(
    payments: &HashMap<Uuid, PaymentAttempt>,
    own_id: Uuid,
    method: PaymentMethod,
    gateway_transaction_id: &str,
) -> bool {
    payments.values().any(|p| {
        p.id != own_id
            && p.method == method
            && p.gateway_transaction_id.as_deref() == Some(gateway_transaction_id)
    })
}

#[async_trait]
impl PaymentStore for InMemoryStore {
    async fn insert(&self, attempt: &PaymentAttempt) -> DbResult<PaymentAttempt> {
        let mut payments = self.payments.write().await;

        if payments.contains_key(&attempt.id) {
            return Err(DatabaseError::unique_violation("payments_pkey"));
        }
        if let Some(tx_id) = &attempt.gateway_transaction_id {
            if transaction_taken(&payments, attempt.id, attempt.method, tx_id) {
                return Err(DatabaseError::unique_violation(ONE_PAYMENT_PER_TRANSACTION));
            }
        }
        if attempt.status == PaymentStatus::Completed
            && payments
                .values()
                .any(|p| p.target == attempt.target && p.status == PaymentStatus::Completed)
        {
            return Err(DatabaseError::unique_violation(ONE_COMPLETED_PER_TARGET));
        }

        payments.insert(attempt.id, attempt.clone());
        Ok(attempt.clone())
    }

    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<PaymentAttempt>> {
        Ok(self.payments.read().await.get(&id).cloned())
    }

    async fn find_by_gateway_transaction_id(
        &self,
        method: PaymentMethod,
        gateway_transaction_id: &str,
    ) -> DbResult<Option<PaymentAttempt>> {
        Ok(self
            .payments
            .read()
            .await
            .values()
            .find(|p| {
                p.method == method && p.gateway_transaction_id.as_deref() == Some(gateway_transaction_id)
            })
            .cloned())
    }

    async fn find_completed_for(&self, target: PayableRef) -> DbResult<Option<PaymentAttempt>> {
        Ok(self
            .payments
            .read()
            .await
            .values()
            .find(|p| p.target == target && p.status == PaymentStatus::Completed)
            .cloned())
    }

    async fn list_for(&self, target: PayableRef) -> DbResult<Vec<PaymentAttempt>> {
        let mut attempts: Vec<PaymentAttempt> = self
            .payments
            .read()
            .await
            .values()
            .filter(|p| p.target == target)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(attempts)
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        update: StatusUpdate,
    ) -> DbResult<Option<PaymentAttempt>> {
        let mut payments = self.payments.write().await;

        let current = payments
            .get(&id)
            .ok_or_else(|| DatabaseError::not_found("Payment", id.to_string()))?;
        if current.status != expected {
            return Ok(None);
        }

        if update.status == PaymentStatus::Completed
            && payments.values().any(|p| {
                p.id != id && p.target == current.target && p.status == PaymentStatus::Completed
            })
        {
            return Err(DatabaseError::unique_violation(ONE_COMPLETED_PER_TARGET));
        }

        let gateway_transaction_id = current
            .gateway_transaction_id
            .clone()
            .or(update.gateway_transaction_id);
        if let Some(tx_id) = &gateway_transaction_id {
            if transaction_taken(&payments, id, current.method, tx_id) {
                return Err(DatabaseError::unique_violation(ONE_PAYMENT_PER_TRANSACTION));
            }
        }

        let Some(payment) = payments.get_mut(&id) else {
            return Err(DatabaseError::not_found("Payment", id.to_string()));
        };
        payment.status = update.status;
        payment.gateway_transaction_id = gateway_transaction_id;
        if update.gateway_response.is_some() {
            payment.gateway_response = update.gateway_response;
        }
        if update.failure_reason.is_some() {
            payment.failure_reason = update.failure_reason;
        }
        if payment.processed_at.is_none() {
            payment.processed_at = update.processed_at;
        }
        if update.refund.is_some() {
            payment.refund = update.refund;
        }
        payment.updated_at = Utc::now();

        Ok(Some(payment.clone()))
    }
}

#[async_trait]
impl PayableStore for InMemoryStore {
    async fn find(&self, target: PayableRef) -> DbResult<Option<Payable>> {
        Ok(self.payables.read().await.get(&target).cloned())
    }

    async fn attach_payment(
        &self,
        target: PayableRef,
        payment_id: Uuid,
        payment_status: PaymentStatus,
    ) -> DbResult<Payable> {
        let mut payables = self.payables.write().await;
        let payable = payables
            .get_mut(&target)
            .ok_or_else(|| DatabaseError::not_found(target.kind(), target.id().to_string()))?;
        payable.payment_id = Some(payment_id);
        payable.payment_status = Some(payment_status);
        Ok(payable.clone())
    }

    async fn record_payment_outcome(
        &self,
        target: PayableRef,
        payment_id: Uuid,
        status: PaymentStatus,
    ) -> DbResult<Option<Payable>> {
        let mut payables = self.payables.write().await;
        let payable = payables
            .get_mut(&target)
            .ok_or_else(|| DatabaseError::not_found(target.kind(), target.id().to_string()))?;

        if status == PaymentStatus::Completed {
            payable.payment_id = Some(payment_id);
            payable.payment_status = Some(status);
            if payable.status == PayableStatus::Pending {
                payable.status = PayableStatus::Confirmed;
            }
            return Ok(Some(payable.clone()));
        }

        if payable.payment_id != Some(payment_id) {
            return Ok(None);
        }
        payable.payment_status = Some(status);
        Ok(Some(payable.clone()))
    }
}
