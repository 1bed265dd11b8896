//! Payment types and data structures
//!
//! The canonical records shared by the orchestrator, the stores and every gateway adapter.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::payments::status::PaymentStatus;

/// Supported payment gateways, one adapter each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    /// Card-network processor (Stripe PaymentIntents)
    Card,
    /// Redirect-based local processor (Paystack)
    Paystack,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 2] = [PaymentMethod::Card, PaymentMethod::Paystack];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::Paystack => "paystack",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PaymentMethod::ALL
            .into_iter()
            .find(|method| method.as_str() == s)
            .ok_or_else(|| AppError::validation("paymentMethod", format!("unsupported method '{}'", s)))
    }
}

fn currency_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Z]{3}$").expect("static currency pattern"))
}

/// An amount in the smallest unit of its currency (cents, kobo, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Money {
    pub currency: String,
    pub minor_units: i64,
}

impl Money {
    /// Validated constructor. Currency codes are upper-cased ISO 4217 codes.
    pub fn new(currency: impl AsRef<str>, minor_units: i64) -> AppResult<Self> {
        let currency = currency.as_ref().trim().to_ascii_uppercase();
        if !currency_pattern().is_match(&currency) {
            return Err(AppError::validation(
                "currency",
                format!("'{}' is not an ISO 4217 code", currency),
            ));
        }
        if minor_units < 0 {
            return Err(AppError::validation("amount", "must not be negative"));
        }
        Ok(Self {
            currency,
            minor_units,
        })
    }

    /// Number of decimal places the currency uses for display.
    pub fn exponent(&self) -> u32 {
        match self.currency.as_str() {
            "BIF" | "CLP" | "DJF" | "GNF" | "ISK" | "JPY" | "KMF" | "KRW" | "PYG" | "RWF"
            | "UGX" | "VND" | "VUV" | "XAF" | "XOF" | "XPF" => 0,
            "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 3,
            _ => 2,
        }
    }

    /// Human-readable form, e.g. `19.99 EUR`. Display only, never parsed back.
    pub fn to_display_string(&self) -> String {
        let exponent = self.exponent();
        if exponent == 0 {
            return format!("{} {}", self.minor_units, self.currency);
        }
        let divisor = 10_i64.pow(exponent);
        format!(
            "{}.{:0width$} {}",
            self.minor_units / divisor,
            self.minor_units % divisor,
            self.currency,
            width = exponent as usize
        )
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

/// What a payment attempt pays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum PayableRef {
    Order(Uuid),
    Membership(Uuid),
}

impl PayableRef {
    pub fn kind(&self) -> &'static str {
        match self {
            PayableRef::Order(_) => "order",
            PayableRef::Membership(_) => "membership",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            PayableRef::Order(id) | PayableRef::Membership(id) => *id,
        }
    }

    pub fn from_parts(kind: &str, id: Uuid) -> Option<Self> {
        match kind {
            "order" => Some(PayableRef::Order(id)),
            "membership" => Some(PayableRef::Membership(id)),
            _ => None,
        }
    }
}

impl fmt::Display for PayableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())
    }
}

/// Business workflow status of an order or membership, owned by the surrounding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayableStatus {
    Pending,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    Expired,
}

impl PayableStatus {
    /// Only pending orders/memberships accept a new payment attempt.
    pub fn accepts_payment(&self) -> bool {
        matches!(self, PayableStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PayableStatus::Pending => "pending",
            PayableStatus::Confirmed => "confirmed",
            PayableStatus::Processing => "processing",
            PayableStatus::Shipped => "shipped",
            PayableStatus::Delivered => "delivered",
            PayableStatus::Cancelled => "cancelled",
            PayableStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for PayableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayableStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PayableStatus::Pending),
            "confirmed" => Ok(PayableStatus::Confirmed),
            "processing" => Ok(PayableStatus::Processing),
            "shipped" => Ok(PayableStatus::Shipped),
            "delivered" => Ok(PayableStatus::Delivered),
            "cancelled" => Ok(PayableStatus::Cancelled),
            "expired" => Ok(PayableStatus::Expired),
            other => Err(format!("unknown workflow status '{}'", other)),
        }
    }
}

/// The order/membership fields this subsystem reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payable {
    pub target: PayableRef,
    pub user_id: Uuid,
    pub status: PayableStatus,
    pub payment_status: Option<PaymentStatus>,
    pub payment_id: Option<Uuid>,
    pub total: Money,
    pub customer_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRecord {
    pub amount: i64,
    pub reason: Option<String>,
    pub refunded_at: DateTime<Utc>,
    pub gateway_refund_id: Option<String>,
}

/// One attempt to collect money against an order or membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAttempt {
    pub id: Uuid,
    pub target: PayableRef,
    pub user_id: Uuid,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub amount: Money,
    pub gateway_transaction_id: Option<String>,
    /// Last raw provider response, kept for audit only.
    pub gateway_response: Option<serde_json::Value>,
    pub refund: Option<RefundRecord>,
    pub failure_reason: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical request to open a payment with a provider.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntentRequest {
    /// Our payment attempt id, reused as the provider-side idempotency key/reference
    pub payment_id: Uuid,
    pub target: PayableRef,
    pub user_id: Uuid,
    pub amount: Money,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub customer_email: Option<String>,
    pub return_url: String,
    pub webhook_url: String,
}

/// Canonical outcome of any gateway call that reports payment state.
///
/// Provider-reported business failures (declines, refused cancellation) come back as
/// `success == false` with `error` set; only infrastructure faults are `Err`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayResult {
    pub success: bool,
    pub gateway_transaction_id: Option<String>,
    pub status: PaymentStatus,
    pub redirect_url: Option<String>,
    pub client_secret: Option<String>,
    /// Amount the provider reports, when it reports one
    pub amount: Option<Money>,
    pub raw_response: serde_json::Value,
    pub error: Option<String>,
}

impl GatewayResult {
    pub fn observed(
        gateway_transaction_id: impl Into<String>,
        status: PaymentStatus,
        raw_response: serde_json::Value,
    ) -> Self {
        Self {
            success: true,
            gateway_transaction_id: Some(gateway_transaction_id.into()),
            status,
            redirect_url: None,
            client_secret: None,
            amount: None,
            raw_response,
            error: None,
        }
    }

    pub fn rejected(
        gateway_transaction_id: Option<String>,
        status: PaymentStatus,
        error: impl Into<String>,
        raw_response: serde_json::Value,
    ) -> Self {
        Self {
            success: false,
            gateway_transaction_id,
            status,
            redirect_url: None,
            client_secret: None,
            amount: None,
            raw_response,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub payment_id: Uuid,
    pub gateway_transaction_id: String,
    /// Partial refund amount; `None` refunds everything
    pub amount: Option<Money>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefundResult {
    pub success: bool,
    pub refund_id: Option<String>,
    pub amount: Option<i64>,
    pub raw_response: serde_json::Value,
    pub error: Option<String>,
}

/// What an inbound provider callback turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    /// Connectivity check from the provider dashboard; acknowledge, mutate nothing
    TestPing,
    /// Real event that carries no payment state we track
    Ignored { event_type: String, reason: String },
    /// Payment state report for one transaction
    Payment {
        event_type: String,
        result: GatewayResult,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_rejects_negative_amounts() {
        assert!(Money::new("EUR", -1).is_err());
        assert!(Money::new("EUR", 0).is_ok());
    }

    #[test]
    fn money_normalises_currency_codes() {
        let money = Money::new(" eur", 1999).unwrap();
        assert_eq!(money.currency, "EUR");
        assert!(Money::new("EURO", 1).is_err());
        assert!(Money::new("E1R", 1).is_err());
    }

    #[test]
    fn display_uses_currency_exponent() {
        assert_eq!(Money::new("EUR", 1999).unwrap().to_string(), "19.99 EUR");
        assert_eq!(Money::new("NGN", 5).unwrap().to_string(), "0.05 NGN");
        assert_eq!(Money::new("JPY", 500).unwrap().to_string(), "500 JPY");
        assert_eq!(Money::new("KWD", 1005).unwrap().to_string(), "1.005 KWD");
    }

    #[test]
    fn payable_ref_serializes_with_kind_tag() {
        let id = Uuid::nil();
        let value = serde_json::to_value(PayableRef::Membership(id)).unwrap();
        assert_eq!(value["kind"], "membership");
        assert_eq!(value["id"], id.to_string());
        assert_eq!(PayableRef::from_parts("order", id), Some(PayableRef::Order(id)));
        assert_eq!(PayableRef::from_parts("invoice", id), None);
    }

    #[test]
    fn only_pending_payables_accept_payment() {
        assert!(PayableStatus::Pending.accepts_payment());
        assert!(!PayableStatus::Confirmed.accepts_payment());
        assert!(!PayableStatus::Cancelled.accepts_payment());
    }

    #[test]
    fn unknown_method_is_a_validation_error() {
        assert_eq!("card".parse::<PaymentMethod>().unwrap(), PaymentMethod::Card);
        assert!("bitcoin".parse::<PaymentMethod>().is_err());
    }
}
