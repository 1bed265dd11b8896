//! Webhook authenticity checks
//!
//! Every inbound callback passes through [`WebhookVerifier::verify`] before its payload is even
//! parsed. Providers that sign callbacks are checked against the raw body with a constant-time
//! MAC comparison. Providers without a configured secret are handled by an explicit
//! [`UnsignedWebhookPolicy`] chosen at startup.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use std::time::Duration;
use tracing::warn;

use crate::error::{AppError, AppResult, WebhookError};
use crate::payments::status::PaymentStatus;
use crate::payments::types::PaymentMethod;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

const SECURITY_TARGET: &str = "payment_orchestrator::webhook::security";

/// How a provider signs its callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureScheme {
    /// Hex HMAC-SHA512 of the raw body (Paystack `x-paystack-signature`).
    HmacSha512Hex { secret: String },
    /// `t=<unix>,v1=<hex hmac-sha256("<t>.<body>")>` with a freshness window (Stripe).
    StripeV1 { secret: String, tolerance: Duration },
}

/// What to do with callbacks from a provider that has no signing secret configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsignedWebhookPolicy {
    Reject,
    /// Accept with a warning on every delivery. Never enabled in production.
    WarnAndProceed,
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Signed,
    Unsigned,
}

#[derive(Debug, Clone)]
pub struct WebhookVerifier {
    unsigned_policy: UnsignedWebhookPolicy,
}

impl WebhookVerifier {
    pub fn new(unsigned_policy: UnsignedWebhookPolicy) -> Self {
        Self { unsigned_policy }
    }

    pub fn unsigned_policy(&self) -> UnsignedWebhookPolicy {
        self.unsigned_policy
    }

    pub fn verify(
        &self,
        method: PaymentMethod,
        scheme: Option<&SignatureScheme>,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> AppResult<Verification> {
        self.verify_at(method, scheme, raw_body, signature, chrono::Utc::now().timestamp())
    }

    /// Same as [`verify`](Self::verify) with an explicit clock, in unix seconds.
    pub fn verify_at(
        &self,
        method: PaymentMethod,
        scheme: Option<&SignatureScheme>,
        raw_body: &[u8],
        signature: Option<&str>,
        now: i64,
    ) -> AppResult<Verification> {
        let Some(scheme) = scheme else {
            return match self.unsigned_policy {
                UnsignedWebhookPolicy::WarnAndProceed => {
                    warn!(
                        target: SECURITY_TARGET,
                        method = %method,
                        "Accepting UNSIGNED webhook: no signing secret configured for this method"
                    );
                    Ok(Verification::Unsigned)
                }
                UnsignedWebhookPolicy::Reject => {
                    warn!(
                        target: SECURITY_TARGET,
                        method = %method,
                        "Rejecting webhook: no signing secret configured and unsigned webhooks are disabled"
                    );
                    Err(WebhookError::InvalidSignature {
                        provider: method.to_string(),
                        reason: "signing is not configured for this method".to_string(),
                    }
                    .into())
                }
            };
        };

        let signature = match signature.map(str::trim).filter(|s| !s.is_empty()) {
            Some(signature) => signature,
            None => {
                warn!(target: SECURITY_TARGET, method = %method, "Webhook without signature header");
                return Err(WebhookError::MissingSignature {
                    provider: method.to_string(),
                }
                .into());
            }
        };

        let result = match scheme {
            SignatureScheme::HmacSha512Hex { secret } => {
                verify_hmac_sha512_hex(secret, raw_body, signature)
            }
            SignatureScheme::StripeV1 { secret, tolerance } => {
                verify_stripe_v1(secret, *tolerance, raw_body, signature, now)
            }
        };

        match result {
            Ok(()) => Ok(Verification::Signed),
            Err(reason) => {
                warn!(
                    target: SECURITY_TARGET,
                    method = %method,
                    reason = %reason,
                    body_len = raw_body.len(),
                    "Webhook signature verification failed"
                );
                Err(WebhookError::InvalidSignature {
                    provider: method.to_string(),
                    reason,
                }
                .into())
            }
        }
    }
}

fn verify_hmac_sha512_hex(secret: &str, raw_body: &[u8], signature: &str) -> Result<(), String> {
    let expected = hex::decode(signature).map_err(|_| "signature is not hex".to_string())?;
    let mut mac =
        HmacSha512::new_from_slice(secret.as_bytes()).map_err(|e| format!("bad key: {}", e))?;
    mac.update(raw_body);
    mac.verify_slice(&expected)
        .map_err(|_| "signature mismatch".to_string())
}

fn verify_stripe_v1(
    secret: &str,
    tolerance: Duration,
    raw_body: &[u8],
    header: &str,
    now: i64,
) -> Result<(), String> {
    let mut timestamp = None;
    let mut candidates = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| "missing or invalid timestamp".to_string())?;
    if candidates.is_empty() {
        return Err("no v1 signature".to_string());
    }

    let age = now.saturating_sub(timestamp).unsigned_abs();
    if age > tolerance.as_secs() {
        return Err(format!("timestamp outside tolerance ({}s)", age));
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| format!("bad key: {}", e))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_body);

    // Several v1 entries are sent while a secret is being rolled.
    let matched = candidates.into_iter().any(|candidate| {
        hex::decode(candidate)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });

    if matched {
        Ok(())
    } else {
        Err("signature mismatch".to_string())
    }
}

/// Header value Paystack would send for `raw_body`.
pub fn sign_hmac_sha512_hex(secret: &str, raw_body: &[u8]) -> AppResult<String> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::configuration(format!("invalid webhook secret: {}", e)))?;
    mac.update(raw_body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Header value Stripe would send for `raw_body` at `timestamp`.
pub fn sign_stripe_v1(secret: &str, timestamp: i64, raw_body: &[u8]) -> AppResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::configuration(format!("invalid webhook secret: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Short-circuits webhook deliveries that were already applied.
///
/// Purely an optimisation in front of the compare-and-set: implementations swallow their own
/// backend errors and report "not seen" so an outage never blocks processing.
#[async_trait]
pub trait WebhookReplayGuard: Send + Sync {
    async fn seen(&self, key: &str) -> bool;
    async fn remember(&self, key: &str);
}

pub fn replay_key(method: PaymentMethod, gateway_transaction_id: &str, status: PaymentStatus) -> String {
    format!("v1:webhook:{}:{}:{}", method, gateway_transaction_id, status)
}
