//! Lookup table from payment method to gateway adapter.
//!
//! Built once at startup and read-only afterwards. Methods without credentials are simply
//! absent, so a request for them fails with `MethodNotConfigured` instead of reaching a
//! half-configured adapter.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::PaymentsConfig;
use crate::error::{AppResult, DomainError};
use crate::payments::providers::{PaystackProvider, StripeProvider};
use crate::payments::traits::PaymentGateway;
use crate::payments::types::PaymentMethod;

#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<PaymentMethod, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a gateway, replacing any previous one for the same method.
    pub fn register(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        let method = gateway.method();
        if self.gateways.insert(method, gateway).is_some() {
            tracing::warn!(method = %method, "Replacing already registered payment gateway");
        }
        self
    }

    pub fn from_config(config: &PaymentsConfig) -> AppResult<Self> {
        let mut registry = Self::new();

        match &config.stripe {
            Some(stripe) => {
                registry = registry.register(Arc::new(StripeProvider::new(stripe.clone())?));
            }
            None => info!(method = %PaymentMethod::Card, "Payment method not configured, skipping"),
        }

        match &config.paystack {
            Some(paystack) => {
                registry = registry.register(Arc::new(PaystackProvider::new(paystack.clone())?));
            }
            None => {
                info!(method = %PaymentMethod::Paystack, "Payment method not configured, skipping")
            }
        }

        info!(methods = ?registry.available_methods(), "Gateway registry initialised");
        Ok(registry)
    }

    /// Configured methods in a stable order.
    pub fn available_methods(&self) -> Vec<PaymentMethod> {
        let mut methods: Vec<PaymentMethod> = self.gateways.keys().copied().collect();
        methods.sort();
        methods
    }

    pub fn is_available(&self, method: PaymentMethod) -> bool {
        self.gateways.contains_key(&method)
    }

    pub fn resolve(&self, method: PaymentMethod) -> AppResult<Arc<dyn PaymentGateway>> {
        self.gateways.get(&method).cloned().ok_or_else(|| {
            DomainError::MethodNotConfigured {
                method: method.to_string(),
            }
            .into()
        })
    }
}

impl std::fmt::Debug for GatewayRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRegistry")
            .field("methods", &self.available_methods())
            .finish()
    }
}
