//! Payment orchestration for orders and memberships.
//!
//! Provider adapters ([`payments::providers`]) translate Stripe and Paystack into one canonical
//! status model; [`payments::PaymentOrchestrator`] is the only component that moves a payment
//! attempt through that model and mirrors the outcome onto the order or membership it pays for.

pub mod api;
#[cfg(feature = "cache")]
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod payments;
pub mod telemetry;

pub use error::{AppError, AppResult};
