use anyhow::{anyhow, Context, Result};
use std::env;
use std::time::Duration;

use crate::payments::providers::{PaystackConfig, StripeConfig};
use crate::payments::webhook::UnsignedWebhookPolicy;
use crate::telemetry::LogFormat;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub payments: PaymentsConfig,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
}

impl ServerConfig {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct PaymentsConfig {
    /// Public base URL used to build return and webhook callback URLs
    pub base_url: String,
    pub gateway_timeout_secs: u64,
    pub allow_unsigned_webhooks: bool,
    pub stripe: Option<StripeConfig>,
    pub paystack: Option<PaystackConfig>,
}

impl PaymentsConfig {
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn unsigned_webhook_policy(&self) -> UnsignedWebhookPolicy {
        if self.allow_unsigned_webhooks {
            UnsignedWebhookPolicy::WarnAndProceed
        } else {
            UnsignedWebhookPolicy::Reject
        }
    }
}

fn is_set(key: &str) -> bool {
    env::var(key).map(|v| !v.trim().is_empty()).unwrap_or(false)
}

fn parse_bool(key: &str) -> Result<bool> {
    match env::var(key) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" | "" => Ok(false),
            other => Err(anyhow!("{} must be true or false, got {}", key, other)),
        },
        Err(_) => Ok(false),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let server = ServerConfig {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .context("PORT not set")?
                .parse()
                .context("PORT must be a valid number")?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        };

        let database = DatabaseConfig {
            url: env::var("DATABASE_URL").context("DATABASE_URL not set")?,
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .context("DATABASE_MAX_CONNECTIONS must be a valid number")?,
        };

        // Redis only backs the webhook replay guard, so it is optional.
        let redis = env::var("REDIS_URL").ok().map(|url| RedisConfig { url });

        // A provider is registered only when its secret key is present.
        let stripe = if is_set("STRIPE_SECRET_KEY") {
            Some(StripeConfig::from_env().context("invalid Stripe configuration")?)
        } else {
            None
        };
        let paystack = if is_set("PAYSTACK_SECRET_KEY") {
            Some(PaystackConfig::from_env().context("invalid Paystack configuration")?)
        } else {
            None
        };

        let payments = PaymentsConfig {
            base_url: env::var("APP_BASE_URL").context("APP_BASE_URL not set")?,
            gateway_timeout_secs: env::var("GATEWAY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("GATEWAY_TIMEOUT_SECS must be a valid number")?,
            allow_unsigned_webhooks: parse_bool("WEBHOOK_ALLOW_UNSIGNED")?,
            stripe,
            paystack,
        };

        let log_format = env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "pretty".to_string())
            .parse()
            .map_err(|e: String| anyhow!(e))?;

        let config = Config {
            server,
            database,
            redis,
            payments,
            log_format,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port < 1024 {
            return Err(anyhow!(
                "Port must be at least 1024, got {}",
                self.server.port
            ));
        }

        let valid_environments = ["development", "staging", "production"];
        if !valid_environments.contains(&self.server.environment.as_str()) {
            return Err(anyhow!(
                "Environment must be one of: {:?}, got {}",
                valid_environments,
                self.server.environment
            ));
        }

        if self.database.url.trim().is_empty() {
            return Err(anyhow!("DATABASE_URL cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(anyhow!("DATABASE_MAX_CONNECTIONS must be greater than 0"));
        }

        if let Some(redis) = &self.redis {
            if redis.url.trim().is_empty() {
                return Err(anyhow!("REDIS_URL cannot be empty when set"));
            }
        }

        let base_url = self.payments.base_url.trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(anyhow!(
                "APP_BASE_URL must be an absolute http(s) URL, got {}",
                self.payments.base_url
            ));
        }

        if self.payments.gateway_timeout_secs == 0 {
            return Err(anyhow!("GATEWAY_TIMEOUT_SECS must be greater than 0"));
        }

        if self.payments.allow_unsigned_webhooks && self.server.is_production() {
            return Err(anyhow!(
                "WEBHOOK_ALLOW_UNSIGNED cannot be enabled in production"
            ));
        }

        if self.payments.stripe.is_none() && self.payments.paystack.is_none() {
            tracing::warn!("No payment gateway configured; every payment request will be rejected");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                environment: "development".to_string(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/payments".to_string(),
                max_connections: 20,
            },
            redis: None,
            payments: PaymentsConfig {
                base_url: "https://shop.example.com".to_string(),
                gateway_timeout_secs: 30,
                allow_unsigned_webhooks: false,
                stripe: None,
                paystack: Some(PaystackConfig {
                    secret_key: "sk_test_key".to_string(),
                    ..PaystackConfig::default()
                }),
            },
            log_format: LogFormat::Pretty,
        }
    }

    #[test]
    fn accepts_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn rejects_privileged_port() {
        let mut config = valid_config();
        config.server.port = 80;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_relative_base_url() {
        let mut config = valid_config();
        config.payments.base_url = "shop.example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unsigned_webhooks_are_never_allowed_in_production() {
        let mut config = valid_config();
        config.payments.allow_unsigned_webhooks = true;
        assert!(config.validate().is_ok());
        assert_eq!(
            config.payments.unsigned_webhook_policy(),
            UnsignedWebhookPolicy::WarnAndProceed
        );

        config.server.environment = "production".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_gateway_timeout_is_invalid() {
        let mut config = valid_config();
        config.payments.gateway_timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
