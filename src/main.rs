use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use payment_orchestrator::api::{self, AppState};
use payment_orchestrator::config::Config;
use payment_orchestrator::database::payable_repository::PayableRepository;
use payment_orchestrator::database::payment_repository::PaymentRepository;
use payment_orchestrator::database::{init_pool, run_migrations, PoolConfig};
use payment_orchestrator::payments::orchestrator::OrchestratorConfig;
use payment_orchestrator::payments::webhook::WebhookVerifier;
use payment_orchestrator::payments::{GatewayRegistry, PaymentOrchestrator};
use payment_orchestrator::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::from_env()?;
    telemetry::init(config.log_format);

    info!(
        environment = %config.server.environment,
        version = env!("CARGO_PKG_VERSION"),
        "Starting payment orchestrator"
    );

    let pool = init_pool(&config.database.url, Some(PoolConfig::from(&config.database)))
        .await
        .context("failed to connect to the database")?;
    run_migrations(&pool).await.context("failed to run migrations")?;

    let registry = GatewayRegistry::from_config(&config.payments)?;
    let verifier = WebhookVerifier::new(config.payments.unsigned_webhook_policy());
    if config.payments.allow_unsigned_webhooks {
        warn!("Unsigned webhooks are accepted for providers without a signing secret");
    }

    let orchestrator = PaymentOrchestrator::new(
        registry,
        Arc::new(PaymentRepository::new(pool.clone())),
        Arc::new(PayableRepository::new(pool)),
        verifier,
        OrchestratorConfig::new(&config.payments.base_url, config.payments.gateway_timeout()),
    );
    let orchestrator = with_replay_guard(orchestrator, &config).await;

    let app = api::router(AppState::new(
        Arc::new(orchestrator),
        config.server.environment.clone(),
    ));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("HOST and PORT do not form a valid socket address")?;
    info!(%addr, "Server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

#[cfg(feature = "cache")]
async fn with_replay_guard(orchestrator: PaymentOrchestrator, config: &Config) -> PaymentOrchestrator {
    use payment_orchestrator::cache::{init_cache_pool, CacheConfig, RedisReplayGuard};

    let Some(redis) = &config.redis else {
        info!("REDIS_URL not set, webhook replay guard disabled");
        return orchestrator;
    };

    match init_cache_pool(CacheConfig::new(&redis.url)).await {
        Ok(pool) => orchestrator.with_replay_guard(Arc::new(RedisReplayGuard::new(pool))),
        Err(e) => {
            warn!(error = %e, "Redis unavailable, webhook replay guard disabled");
            orchestrator
        }
    }
}

#[cfg(not(feature = "cache"))]
async fn with_replay_guard(orchestrator: PaymentOrchestrator, _config: &Config) -> PaymentOrchestrator {
    orchestrator
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
