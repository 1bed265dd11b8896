//! Payment orchestration
//!
//! External payment providers sit behind the [`traits::PaymentGateway`] contract and are looked
//! up through the [`registry::GatewayRegistry`]. The [`orchestrator::PaymentOrchestrator`] is the
//! only writer of payment state: it creates attempts, reconciles polls and webhooks against the
//! stored record, and issues refunds and cancellations.

pub mod orchestrator;
pub mod providers;
pub mod registry;
pub mod status;
pub mod status_mapper;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod traits;
pub mod types;
pub mod webhook;

pub use orchestrator::{PaymentOrchestrator, PaymentHooks, WebhookOutcome};
pub use registry::GatewayRegistry;
pub use status::PaymentStatus;
pub use traits::PaymentGateway;
pub use types::{PayableRef, PaymentAttempt, PaymentMethod};
