//! Payment gateway implementations
//!
//! Concrete implementations of the PaymentGateway trait, one per provider.

pub mod paystack;
pub mod stripe;

pub use paystack::{PaystackConfig, PaystackProvider};
pub use stripe::{StripeConfig, StripeProvider};
