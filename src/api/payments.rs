//! Payment routes
//!
//! Amounts cross the wire as `{ "value": <minor units>, "currency": "EUR" }`.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::payments::orchestrator::{
    CreatePaymentRequest, CreatedPayment, RefundPaymentRequest, VerifiedPayment, WebhookOutcome,
};
use crate::payments::types::{Money, PayableRef, PaymentAttempt, PaymentMethod};
use crate::payments::PaymentStatus;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/payments", post(create_payment).get(list_payments))
        .route("/payments/methods", get(list_methods))
        .route("/payments/webhook/:payment_method", post(handle_webhook))
        .route("/payments/:id", get(get_payment))
        .route("/payments/:id/verify", post(verify_payment))
        .route("/payments/:id/refund", post(refund_payment))
        .route("/payments/:id/cancel", post(cancel_payment))
}

#[derive(Debug, Deserialize)]
pub struct AmountBody {
    pub value: i64,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentBody {
    pub order_id: Option<Uuid>,
    pub membership_id: Option<Uuid>,
    pub user_id: Uuid,
    pub payment_method: String,
    pub amount: AmountBody,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub return_url: Option<String>,
}

/// Exactly one of the two ids names the payable.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetQuery {
    pub order_id: Option<Uuid>,
    pub membership_id: Option<Uuid>,
}

impl TargetQuery {
    fn target(&self) -> AppResult<PayableRef> {
        match (self.order_id, self.membership_id) {
            (Some(id), None) => Ok(PayableRef::Order(id)),
            (None, Some(id)) => Ok(PayableRef::Membership(id)),
            _ => Err(AppError::validation(
                "orderId",
                "exactly one of orderId or membershipId is required",
            )),
        }
    }
}

impl CreatePaymentBody {
    fn into_request(self) -> AppResult<CreatePaymentRequest> {
        let target = TargetQuery {
            order_id: self.order_id,
            membership_id: self.membership_id,
        }
        .target()?;

        Ok(CreatePaymentRequest {
            target,
            user_id: self.user_id,
            method: self.payment_method.parse()?,
            amount: Money::new(&self.amount.currency, self.amount.value)?,
            description: self.description,
            metadata: self.metadata,
            return_url: self.return_url,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RefundBody {
    pub amount: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodsResponse {
    pub methods: Vec<PaymentMethod>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub received: bool,
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PaymentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WebhookAck {
    fn acknowledged(reason: impl Into<String>) -> Self {
        Self {
            received: true,
            processed: false,
            payment_id: None,
            status: None,
            updated: None,
            reason: Some(reason.into()),
        }
    }
}

impl From<WebhookOutcome> for WebhookAck {
    fn from(outcome: WebhookOutcome) -> Self {
        match outcome {
            WebhookOutcome::Acknowledged { reason } => Self::acknowledged(reason),
            WebhookOutcome::Processed {
                payment_id,
                status,
                updated,
            } => Self {
                received: true,
                processed: true,
                payment_id: Some(payment_id),
                status: Some(status),
                updated: Some(updated),
                reason: None,
            },
        }
    }
}

async fn list_methods(State(state): State<AppState>) -> Json<MethodsResponse> {
    Json(MethodsResponse {
        methods: state.orchestrator.available_methods(),
    })
}

async fn create_payment(
    State(state): State<AppState>,
    Json(body): Json<CreatePaymentBody>,
) -> AppResult<(StatusCode, Json<CreatedPayment>)> {
    let request = body.into_request()?;
    let created = state.orchestrator.create_payment(request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_payments(
    State(state): State<AppState>,
    Query(query): Query<TargetQuery>,
) -> AppResult<Json<Vec<PaymentAttempt>>> {
    let target = query.target()?;
    Ok(Json(state.orchestrator.list_payments_for(target).await?))
}

async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<PaymentAttempt>> {
    Ok(Json(state.orchestrator.get_payment(id).await?))
}

async fn verify_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<VerifiedPayment>> {
    Ok(Json(state.orchestrator.verify_payment_and_update(id).await?))
}

/// Body is optional; an empty body refunds the full amount.
async fn refund_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> AppResult<Json<PaymentAttempt>> {
    let body: RefundBody = if body.iter().all(u8::is_ascii_whitespace) {
        RefundBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::validation("body", e.to_string()))?
    };

    let refunded = state
        .orchestrator
        .refund_payment(
            id,
            RefundPaymentRequest {
                amount: body.amount,
                reason: body.reason,
            },
        )
        .await?;
    Ok(Json(refunded))
}

async fn cancel_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<PaymentAttempt>> {
    Ok(Json(state.orchestrator.cancel_payment(id).await?))
}

/// Provider callbacks. Authentic but irrelevant deliveries, unknown transactions included,
/// are acknowledged with 200 so providers do not retry them.
async fn handle_webhook(
    State(state): State<AppState>,
    Path(payment_method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    let method: PaymentMethod = payment_method.parse()?;
    let gateway = state.orchestrator.registry().resolve(method)?;
    let signature = headers
        .get(gateway.signature_header())
        .and_then(|value| value.to_str().ok());

    match state.orchestrator.process_webhook(method, &body, signature).await {
        Ok(outcome) => Ok(Json(outcome.into())),
        Err(e) if e.is_not_found() => {
            info!(method = %method, error = %e, "Webhook for unknown transaction acknowledged");
            Ok(Json(WebhookAck::acknowledged("unknown transaction")))
        }
        Err(e) => {
            if e.is_webhook_authenticity() {
                warn!(method = %method, "Webhook rejected: authenticity check failed");
            }
            Err(e)
        }
    }
}
