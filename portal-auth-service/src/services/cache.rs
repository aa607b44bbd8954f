use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Short-lived shared state: logged-out access tokens and per-key cooldowns.
#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn blacklist_token(&self, token_jti: &str, expiry_seconds: i64)
        -> Result<(), anyhow::Error>;
    async fn is_blacklisted(&self, token_jti: &str) -> Result<bool, anyhow::Error>;
    /// Atomically claims `key` for `seconds`. Returns false while an earlier claim is live.
    async fn claim_cooldown(&self, key: &str, seconds: u64) -> Result<bool, anyhow::Error>;
    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisService {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisService {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!(url = %config.url, "Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // Use ConnectionManager for automatic reconnection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

#[async_trait]
impl SessionCache for RedisService {
    async fn blacklist_token(
        &self,
        token_jti: &str,
        expiry_seconds: i64,
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = format!("blacklist:{}", token_jti);

        redis::cmd("SET")
            .arg(&key)
            .arg("revoked")
            .arg("EX")
            .arg(expiry_seconds.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to blacklist token: {}", e))
    }

    async fn is_blacklisted(&self, token_jti: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = format!("blacklist:{}", token_jti);

        let exists: bool = redis::cmd("EXISTS")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to check blacklist: {}", e))?;

        Ok(exists)
    }

    async fn claim_cooldown(&self, key: &str, seconds: u64) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = format!("cooldown:{}", key);

        // SET NX replies OK when the key was set, nil when it already existed
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(seconds.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to claim cooldown: {}", e))?;

        Ok(reply.is_some())
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

/// In-process cache for tests and local runs; entries expire lazily on read.
#[derive(Default)]
pub struct MockSessionCache {
    blacklisted_tokens: Mutex<HashMap<String, Instant>>,
    cooldowns: Mutex<HashMap<String, Instant>>,
    unavailable: AtomicBool,
}

impl MockSessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail, as an unreachable Redis would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), anyhow::Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("mock cache unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl SessionCache for MockSessionCache {
    async fn blacklist_token(
        &self,
        token_jti: &str,
        expiry_seconds: i64,
    ) -> Result<(), anyhow::Error> {
        self.check_available()?;
        let until = Instant::now() + Duration::from_secs(expiry_seconds.max(1) as u64);
        self.blacklisted_tokens
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock blacklist mutex poisoned: {}", e))?
            .insert(token_jti.to_string(), until);
        Ok(())
    }

    async fn is_blacklisted(&self, token_jti: &str) -> Result<bool, anyhow::Error> {
        self.check_available()?;
        let tokens = self
            .blacklisted_tokens
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock blacklist mutex poisoned: {}", e))?;
        Ok(tokens
            .get(token_jti)
            .map(|until| *until > Instant::now())
            .unwrap_or(false))
    }

    async fn claim_cooldown(&self, key: &str, seconds: u64) -> Result<bool, anyhow::Error> {
        self.check_available()?;
        let mut cooldowns = self
            .cooldowns
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock cooldown mutex poisoned: {}", e))?;
        let now = Instant::now();
        match cooldowns.get(key) {
            Some(until) if *until > now => Ok(false),
            _ => {
                cooldowns.insert(key.to_string(), now + Duration::from_secs(seconds.max(1)));
                Ok(true)
            }
        }
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cooldown_is_claimed_once() {
        let cache = MockSessionCache::new();
        assert!(cache.claim_cooldown("resend:a", 60).await.unwrap());
        assert!(!cache.claim_cooldown("resend:a", 60).await.unwrap());
        assert!(cache.claim_cooldown("resend:b", 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_blacklist_round_trip() {
        let cache = MockSessionCache::new();
        assert!(!cache.is_blacklisted("jti-1").await.unwrap());
        cache.blacklist_token("jti-1", 900).await.unwrap();
        assert!(cache.is_blacklisted("jti-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_mock_fails_every_call() {
        let cache = MockSessionCache::new();
        cache.set_unavailable(true);
        assert!(cache.is_blacklisted("jti-1").await.is_err());
        assert!(cache.health_check().await.is_err());

        cache.set_unavailable(false);
        assert!(cache.health_check().await.is_ok());
    }
}
