//! Redis-backed [`WebhookReplayGuard`]
//!
//! Keys expire after a TTL; the guard only spares work, the compare-and-set in the
//! orchestrator stays authoritative. Every Redis failure degrades to "not seen".

use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, warn};

use super::error::CacheResult;
use super::RedisPool;
use crate::payments::webhook::WebhookReplayGuard;

pub const DEFAULT_REPLAY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct RedisReplayGuard {
    pool: RedisPool,
    ttl: Duration,
}

impl RedisReplayGuard {
    pub fn new(pool: RedisPool) -> Self {
        Self {
            pool,
            ttl: DEFAULT_REPLAY_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.pool.get().await?;
        let found: i32 = conn.exists(key).await?;
        Ok(found > 0)
    }

    async fn store(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.pool.get().await?;
        let _: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1u8)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WebhookReplayGuard for RedisReplayGuard {
    async fn seen(&self, key: &str) -> bool {
        match self.exists(key).await {
            Ok(found) => {
                if found {
                    debug!(key, "Replay key present");
                }
                found
            }
            Err(e) => {
                warn!(key, error = %e, "Replay guard lookup failed, processing delivery");
                false
            }
        }
    }

    async fn remember(&self, key: &str) {
        if let Err(e) = self.store(key).await {
            warn!(key, error = %e, "Failed to record replay key");
        }
    }
}
