//! Per-provider translation of raw status strings into [`PaymentStatus`].
//!
//! Mappers are total: a status the provider adds later maps to `Pending` and is logged, so
//! an unrecognised value can never complete or fail a payment on its own.

use crate::payments::status::PaymentStatus;
use tracing::warn;

pub trait StatusMapper: Send + Sync {
    /// Provider name used in logs.
    fn provider(&self) -> &'static str;

    /// Known raw status (or event) name and the canonical status it maps to.
    fn known_statuses(&self) -> &'static [(&'static str, PaymentStatus)];

    fn map(&self, raw_status: &str) -> PaymentStatus {
        let normalized = raw_status.trim().to_ascii_lowercase();
        match self
            .known_statuses()
            .iter()
            .find(|(name, _)| *name == normalized)
        {
            Some((_, status)) => *status,
            None => {
                warn!(
                    provider = self.provider(),
                    raw_status = %raw_status,
                    "Unrecognised provider status, treating as pending"
                );
                PaymentStatus::Pending
            }
        }
    }
}

/// Stripe PaymentIntent statuses.
#[derive(Debug, Default, Clone, Copy)]
pub struct StripeStatusMapper;

/// Event emitted when a confirmation attempt fails. The intent itself goes back to
/// `requires_payment_method`, but the attempt we recorded has failed.
pub const STRIPE_PAYMENT_FAILED_EVENT: &str = "payment_intent.payment_failed";

impl StatusMapper for StripeStatusMapper {
    fn provider(&self) -> &'static str {
        "stripe"
    }

    fn known_statuses(&self) -> &'static [(&'static str, PaymentStatus)] {
        &[
            ("requires_payment_method", PaymentStatus::Pending),
            ("requires_confirmation", PaymentStatus::Pending),
            ("requires_action", PaymentStatus::Pending),
            ("processing", PaymentStatus::Processing),
            ("requires_capture", PaymentStatus::Processing),
            ("succeeded", PaymentStatus::Completed),
            ("canceled", PaymentStatus::Cancelled),
            (STRIPE_PAYMENT_FAILED_EVENT, PaymentStatus::Failed),
        ]
    }
}

/// Paystack transaction statuses.
#[derive(Debug, Default, Clone, Copy)]
pub struct PaystackStatusMapper;

impl StatusMapper for PaystackStatusMapper {
    fn provider(&self) -> &'static str {
        "paystack"
    }

    fn known_statuses(&self) -> &'static [(&'static str, PaymentStatus)] {
        &[
            ("success", PaymentStatus::Completed),
            ("failed", PaymentStatus::Failed),
            ("reversed", PaymentStatus::Refunded),
            // abandoned means the customer left the checkout page; they may still return
            ("abandoned", PaymentStatus::Pending),
            ("pending", PaymentStatus::Pending),
            ("ongoing", PaymentStatus::Pending),
            ("processing", PaymentStatus::Processing),
            ("queued", PaymentStatus::Processing),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripe_statuses_map_to_canonical() {
        let mapper = StripeStatusMapper;
        assert_eq!(mapper.map("succeeded"), PaymentStatus::Completed);
        assert_eq!(mapper.map("requires_action"), PaymentStatus::Pending);
        assert_eq!(mapper.map("requires_capture"), PaymentStatus::Processing);
        assert_eq!(mapper.map("canceled"), PaymentStatus::Cancelled);
        assert_eq!(mapper.map(STRIPE_PAYMENT_FAILED_EVENT), PaymentStatus::Failed);
    }

    #[test]
    fn paystack_statuses_map_to_canonical() {
        let mapper = PaystackStatusMapper;
        assert_eq!(mapper.map("success"), PaymentStatus::Completed);
        assert_eq!(mapper.map("failed"), PaymentStatus::Failed);
        assert_eq!(mapper.map("reversed"), PaymentStatus::Refunded);
        assert_eq!(mapper.map("abandoned"), PaymentStatus::Pending);
        assert_eq!(mapper.map("queued"), PaymentStatus::Processing);
    }

    #[test]
    fn matching_ignores_case_and_whitespace() {
        assert_eq!(StripeStatusMapper.map(" Succeeded "), PaymentStatus::Completed);
        assert_eq!(PaystackStatusMapper.map("SUCCESS"), PaymentStatus::Completed);
    }

    #[test]
    fn unknown_statuses_fall_back_to_pending() {
        assert_eq!(StripeStatusMapper.map("teleported"), PaymentStatus::Pending);
        assert_eq!(PaystackStatusMapper.map(""), PaymentStatus::Pending);
    }

    #[test]
    fn every_canonical_status_is_reachable_only_through_known_names() {
        for mapper in [
            &StripeStatusMapper as &dyn StatusMapper,
            &PaystackStatusMapper as &dyn StatusMapper,
        ] {
            for (name, status) in mapper.known_statuses() {
                assert_eq!(mapper.map(name), *status, "{}:{}", mapper.provider(), name);
            }
        }
    }
}
