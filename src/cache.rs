//! Two-tier validity cache for connectivity and payout checks
//!
//! The in-process tier is consulted first. The optional shared tier (Redis)
//! survives restarts and is visible to cooperating instances. Entries are
//! advisory: any shared-tier error is logged and treated as a miss.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Connectivity,
    Payout(String),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Connectivity => f.write_str("connectivity"),
            CacheKey::Payout(symbol) => write!(f, "payout:{}", symbol),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheValue {
    Connectivity { live: bool },
    /// `symbol` is the endpoint spelling that matched
    Payout { symbol: String, payout: f64 },
}

/// Entry as stored in the shared tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: CacheValue,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Shared cache storage
#[async_trait]
pub trait SharedTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;
    async fn set(&self, entry: &CacheEntry, ttl: Duration) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Redis-backed shared tier
pub struct RedisTier {
    client: redis::Client,
    prefix: String,
}

impl RedisTier {
    /// Connect to Redis with timeout
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        use tokio::time::timeout;

        let client = redis::Client::open(url).context("Failed to create Redis client")?;

        let mut conn = match timeout(Duration::from_secs(10), client.get_multiplexed_async_connection()).await {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => anyhow::bail!("Redis connection failed: {}", e),
            Err(_) => anyhow::bail!("Redis connection timeout after 10s"),
        };

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING failed")?;

        info!("Connected to Redis for shared validity cache");
        Ok(Self { client, prefix: prefix.to_string() })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl SharedTier for RedisTier {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.conn().await?;
        let data: Option<String> = conn.get(self.full_key(key)).await?;

        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(entry)?;
        let secs = ttl.as_secs().max(1);
        let _: () = redis::cmd("SET")
            .arg(self.full_key(&entry.key))
            .arg(json)
            .arg("EX")
            .arg(secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(self.full_key(key)).await?;
        Ok(())
    }
}

struct LocalEntry {
    value: CacheValue,
    expires: Instant,
}

pub struct ValidityCache {
    local: RwLock<HashMap<String, LocalEntry>>,
    shared: Option<Arc<dyn SharedTier>>,
    connectivity_ttl: Duration,
    payout_ttl: Duration,
}

impl ValidityCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            shared: None,
            connectivity_ttl: config.connectivity_ttl(),
            payout_ttl: config.payout_ttl(),
        }
    }

    pub fn with_shared(mut self, shared: Arc<dyn SharedTier>) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Default TTL for a key's concern
    pub fn ttl_for(&self, key: &CacheKey) -> Duration {
        match key {
            CacheKey::Connectivity => self.connectivity_ttl,
            CacheKey::Payout(_) => self.payout_ttl,
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        let key_str = key.to_string();

        {
            let mut local = self.local.write().await;
            match local.get(&key_str) {
                Some(entry) if entry.expires > Instant::now() => {
                    debug!("Cache hit (local): {}", key_str);
                    return Some(entry.value.clone());
                }
                Some(_) => {
                    local.remove(&key_str);
                }
                None => {}
            }
        }

        let shared = self.shared.as_ref()?;
        let entry = match shared.get(&key_str).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!("Shared cache read failed for {}: {}", key_str, e);
                return None;
            }
        };

        let remaining = (entry.expires_at - Utc::now()).to_std().ok()?;
        if remaining.is_zero() {
            return None;
        }
        debug!("Cache hit (shared): {}", key_str);

        self.local.write().await.insert(
            key_str,
            LocalEntry { value: entry.value.clone(), expires: Instant::now() + remaining },
        );
        Some(entry.value)
    }

    pub async fn set(&self, key: &CacheKey, value: CacheValue, ttl: Duration) {
        let key_str = key.to_string();

        self.local.write().await.insert(
            key_str.clone(),
            LocalEntry { value: value.clone(), expires: Instant::now() + ttl },
        );

        if let Some(shared) = &self.shared {
            let expires_at = Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
            let entry = CacheEntry { key: key_str.clone(), value, expires_at };
            if let Err(e) = shared.set(&entry, ttl).await {
                warn!("Shared cache write failed for {}: {}", key_str, e);
            }
        }
    }

    /// Store with the key's default TTL
    pub async fn put(&self, key: &CacheKey, value: CacheValue) {
        let ttl = self.ttl_for(key);
        self.set(key, value, ttl).await;
    }

    /// Drop a key from both tiers after a fresh negative check
    pub async fn invalidate(&self, key: &CacheKey) {
        let key_str = key.to_string();
        self.local.write().await.remove(&key_str);

        if let Some(shared) = &self.shared {
            if let Err(e) = shared.remove(&key_str).await {
                warn!("Shared cache delete failed for {}: {}", key_str, e);
            }
        }
    }
}
