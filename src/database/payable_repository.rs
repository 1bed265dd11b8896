use crate::database::error::{DatabaseError, DbResult};
use crate::database::repository::PayableStore;
use crate::payments::status::PaymentStatus;
use crate::payments::types::{Money, Payable, PayableRef, PayableStatus};
use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

const PAYABLE_COLUMNS: &str =
    "id, user_id, status, payment_status, payment_id, total_amount, total_currency, customer_email";

#[derive(Debug, Clone, FromRow)]
struct PayableRow {
    id: Uuid,
    user_id: Uuid,
    status: String,
    payment_status: Option<String>,
    payment_id: Option<Uuid>,
    total_amount: i64,
    total_currency: String,
    customer_email: Option<String>,
}

impl PayableRow {
    fn into_payable(self, target: PayableRef) -> DbResult<Payable> {
        let corrupt = |message: String| DatabaseError::corrupt(target.kind(), message).with_context(self.id.to_string());

        let status: PayableStatus = self.status.parse().map_err(corrupt)?;
        let payment_status = self
            .payment_status
            .as_deref()
            .map(str::parse::<PaymentStatus>)
            .transpose()
            .map_err(corrupt)?;
        let total = Money::new(self.total_currency.trim(), self.total_amount).map_err(|e| corrupt(e.to_string()))?;

        Ok(Payable {
            target,
            user_id: self.user_id,
            status,
            payment_status,
            payment_id: self.payment_id,
            total,
            customer_email: self.customer_email,
        })
    }
}

/// Reads and writes the payment columns of the `orders` and `memberships` tables
pub struct PayableRepository {
    pool: PgPool,
}

impl PayableRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn table(target: PayableRef) -> &'static str {
        match target {
            PayableRef::Order(_) => "orders",
            PayableRef::Membership(_) => "memberships",
        }
    }
}

#[async_trait]
impl PayableStore for PayableRepository {
    async fn find(&self, target: PayableRef) -> DbResult<Option<Payable>> {
        let row = sqlx::query_as::<_, PayableRow>(&format!(
            "SELECT {} FROM {} WHERE id = $1",
            PAYABLE_COLUMNS,
            Self::table(target)
        ))
        .bind(target.id())
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        row.map(|row| row.into_payable(target)).transpose()
    }

    async fn attach_payment(
        &self,
        target: PayableRef,
        payment_id: Uuid,
        payment_status: PaymentStatus,
    ) -> DbResult<Payable> {
        let row = sqlx::query_as::<_, PayableRow>(&format!(
            "UPDATE {} SET payment_id = $2, payment_status = $3, updated_at = NOW() \
             WHERE id = $1 RETURNING {}",
            Self::table(target),
            PAYABLE_COLUMNS
        ))
        .bind(target.id())
        .bind(payment_id)
        .bind(payment_status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .ok_or_else(|| DatabaseError::not_found(target.kind(), target.id().to_string()))?;

        row.into_payable(target)
    }

    async fn record_payment_outcome(
        &self,
        target: PayableRef,
        payment_id: Uuid,
        status: PaymentStatus,
    ) -> DbResult<Option<Payable>> {
        let query = if status == PaymentStatus::Completed {
            format!(
                "UPDATE {} SET payment_id = $2, payment_status = $3, \
                     status = CASE WHEN status = 'pending' THEN 'confirmed' ELSE status END, \
                     updated_at = NOW() \
                 WHERE id = $1 RETURNING {}",
                Self::table(target),
                PAYABLE_COLUMNS
            )
        } else {
            format!(
                "UPDATE {} SET payment_status = $3, updated_at = NOW() \
                 WHERE id = $1 AND payment_id = $2 RETURNING {}",
                Self::table(target),
                PAYABLE_COLUMNS
            )
        };

        let row = sqlx::query_as::<_, PayableRow>(&query)
            .bind(target.id())
            .bind(payment_id)
            .bind(status.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        row.map(|row| row.into_payable(target)).transpose()
    }
}
