//! Application error taxonomy
//!
//! Every fallible operation in the payment subsystem returns [`AppResult`]. Errors are grouped
//! by who is at fault (caller input, business state, external provider, our own infrastructure,
//! inbound webhook authenticity) so the HTTP layer can map each group onto one status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;
use thiserror::Error;

use crate::database::error::DatabaseError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub context: Option<String>,
}

#[derive(Debug, Error)]
pub enum AppErrorKind {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    External(#[from] ExternalError),
    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

/// Bad caller input. Never retried automatically.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid {field}: {message}")]
    InvalidField { field: String, message: String },

    #[error("Amount mismatch: expected {expected}, got {provided}")]
    AmountMismatch { expected: String, provided: String },
}

/// Business state does not allow the requested operation.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Payment '{payment_id}' not found")]
    PaymentNotFound { payment_id: String },

    #[error("No payment for {method} transaction '{gateway_transaction_id}'")]
    TransactionNotFound {
        method: String,
        gateway_transaction_id: String,
    },

    #[error("{target} not found")]
    PayableNotFound { target: String },

    #[error("{target} does not belong to the requesting user")]
    Forbidden { target: String },

    #[error("{target} is not payable in status '{status}'")]
    NotPayable { target: String, status: String },

    #[error("{target} already has a completed payment")]
    AlreadyPaid { target: String },

    #[error("Payment '{payment_id}' cannot be refunded in status '{status}'")]
    NotRefundable { payment_id: String, status: String },

    #[error("Refund of {requested} exceeds the refundable amount {available}")]
    RefundExceedsAmount { requested: i64, available: i64 },

    #[error("Payment '{payment_id}' cannot be cancelled in status '{status}'")]
    NotCancellable { payment_id: String, status: String },

    #[error("Payment method '{method}' is not configured")]
    MethodNotConfigured { method: String },
}

/// Failures reported by, or while talking to, an external payment provider.
#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("{provider} error: {message}")]
    PaymentProvider {
        provider: String,
        message: String,
        is_retryable: bool,
    },

    #[error("{provider} declined the request: {message}")]
    Declined { provider: String, message: String },

    #[error("Rate limited by {service}")]
    RateLimit {
        service: String,
        retry_after: Option<u64>,
    },

    #[error("{service} did not respond within {seconds} seconds")]
    Timeout { service: String, seconds: u64 },
}

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Database error: {message}")]
    Database { message: String, is_retryable: bool },

    #[error("Cache error: {message}")]
    Cache { message: String },
}

/// Inbound callback could not be trusted or read.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Missing {provider} webhook signature")]
    MissingSignature { provider: String },

    #[error("Invalid {provider} webhook signature: {reason}")]
    InvalidSignature { provider: String, reason: String },

    #[error("Malformed {provider} webhook payload: {message}")]
    MalformedPayload { provider: String, message: String },
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }

    pub fn with_context<S: Into<String>>(mut self, context: S) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError::InvalidField {
            field: field.into(),
            message: message.into(),
        }
        .into()
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        InfrastructureError::Configuration {
            message: message.into(),
        }
        .into()
    }

    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::External(ExternalError::PaymentProvider { is_retryable, .. }) => {
                *is_retryable
            }
            AppErrorKind::External(ExternalError::RateLimit { .. })
            | AppErrorKind::External(ExternalError::Timeout { .. }) => true,
            AppErrorKind::Infrastructure(InfrastructureError::Database { is_retryable, .. }) => {
                *is_retryable
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.kind,
            AppErrorKind::Domain(
                DomainError::PaymentNotFound { .. }
                    | DomainError::TransactionNotFound { .. }
                    | DomainError::PayableNotFound { .. }
            )
        )
    }

    pub fn is_webhook_authenticity(&self) -> bool {
        matches!(
            self.kind,
            AppErrorKind::Webhook(
                WebhookError::MissingSignature { .. } | WebhookError::InvalidSignature { .. }
            )
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match &self.kind {
            AppErrorKind::Validation(_) => StatusCode::BAD_REQUEST,
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { .. }
                | DomainError::TransactionNotFound { .. }
                | DomainError::PayableNotFound { .. } => StatusCode::NOT_FOUND,
                DomainError::Forbidden { .. } => StatusCode::FORBIDDEN,
                DomainError::AlreadyPaid { .. } => StatusCode::CONFLICT,
                DomainError::NotPayable { .. }
                | DomainError::NotRefundable { .. }
                | DomainError::RefundExceedsAmount { .. }
                | DomainError::NotCancellable { .. }
                | DomainError::MethodNotConfigured { .. } => StatusCode::BAD_REQUEST,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                ExternalError::RateLimit { .. } => StatusCode::SERVICE_UNAVAILABLE,
                ExternalError::Declined { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                ExternalError::PaymentProvider { .. } => StatusCode::BAD_GATEWAY,
            },
            AppErrorKind::Infrastructure(InfrastructureError::Database {
                is_retryable: true,
                ..
            }) => StatusCode::SERVICE_UNAVAILABLE,
            AppErrorKind::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppErrorKind::Webhook(WebhookError::MalformedPayload { .. }) => {
                StatusCode::BAD_REQUEST
            }
            AppErrorKind::Webhook(_) => StatusCode::UNAUTHORIZED,
        }
    }

    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match &self.kind {
            AppErrorKind::Validation(ValidationError::InvalidField { .. }) => "invalid_field",
            AppErrorKind::Validation(ValidationError::AmountMismatch { .. }) => "amount_mismatch",
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { .. } => "payment_not_found",
                DomainError::TransactionNotFound { .. } => "transaction_not_found",
                DomainError::PayableNotFound { .. } => "payable_not_found",
                DomainError::Forbidden { .. } => "forbidden",
                DomainError::NotPayable { .. } => "not_payable",
                DomainError::AlreadyPaid { .. } => "already_paid",
                DomainError::NotRefundable { .. } => "not_refundable",
                DomainError::RefundExceedsAmount { .. } => "refund_exceeds_amount",
                DomainError::NotCancellable { .. } => "not_cancellable",
                DomainError::MethodNotConfigured { .. } => "method_not_configured",
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => "gateway_error",
                ExternalError::Declined { .. } => "gateway_declined",
                ExternalError::RateLimit { .. } => "gateway_rate_limited",
                ExternalError::Timeout { .. } => "gateway_timeout",
            },
            AppErrorKind::Infrastructure(_) => "internal_error",
            AppErrorKind::Webhook(WebhookError::MalformedPayload { .. }) => "malformed_webhook",
            AppErrorKind::Webhook(_) => "webhook_signature_invalid",
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{} ({})", self.kind, context),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

macro_rules! impl_from_kind {
    ($($source:ty),* $(,)?) => {
        $(
            impl From<$source> for AppError {
                fn from(err: $source) -> Self {
                    AppError::new(err.into())
                }
            }
        )*
    };
}

impl_from_kind!(
    AppErrorKind,
    ValidationError,
    DomainError,
    ExternalError,
    InfrastructureError,
    WebhookError,
    DatabaseError,
);

impl From<DatabaseError> for AppErrorKind {
    fn from(err: DatabaseError) -> Self {
        use crate::database::error::DatabaseErrorKind;

        match &err.kind {
            DatabaseErrorKind::NotFound { entity, id } if entity == "Payment" => {
                AppErrorKind::Domain(DomainError::PaymentNotFound {
                    payment_id: id.clone(),
                })
            }
            DatabaseErrorKind::NotFound { entity, id } => {
                AppErrorKind::Domain(DomainError::PayableNotFound {
                    target: format!("{} {}", entity, id),
                })
            }
            _ if err.is_duplicate_completion() => AppErrorKind::Domain(DomainError::AlreadyPaid {
                target: err.context.clone().unwrap_or_else(|| "payable".to_string()),
            }),
            _ => AppErrorKind::Infrastructure(InfrastructureError::Database {
                message: err.to_string(),
                is_retryable: err.is_retryable(),
            }),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal details stay in the logs.
        let message = if status.is_server_error() && !matches!(self.kind, AppErrorKind::External(_))
        {
            tracing::error!(error = %self, "Request failed with internal error");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        });

        (status, Json(body)).into_response()
    }
}
