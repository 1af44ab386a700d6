use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::{aio::ConnectionManager, Client};
use uuid::Uuid;

use super::{BlacklistStore, StoreError};
use crate::models::BlacklistEntry;

/// Token blacklist kept in Redis.
///
/// Keys carry a TTL matching the entry's expiry, so Redis drops stale entries on its own.
#[derive(Clone)]
pub struct RedisBlacklist {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisBlacklist {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(url)?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            StoreError::Redis(e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    fn token_key(token_hash: &str) -> String {
        format!("blacklist:{}", token_hash)
    }

    fn user_key(user_id: Uuid) -> String {
        format!("blacklist:user:{}", user_id)
    }
}

fn ttl_seconds(expires_at: DateTime<Utc>) -> i64 {
    (expires_at - Utc::now()).num_seconds().max(1)
}

#[async_trait]
impl BlacklistStore for RedisBlacklist {
    async fn insert_blacklist_entry(&self, entry: &BlacklistEntry) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let ttl = ttl_seconds(entry.expires_at);

        if entry.is_user_marker() {
            if let Some(user_id) = entry.user_id {
                redis::cmd("SET")
                    .arg(Self::user_key(user_id))
                    .arg(entry.created_at.timestamp_micros())
                    .arg("EX")
                    .arg(ttl)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
            }
        }

        redis::cmd("SET")
            .arg(Self::token_key(&entry.token_hash))
            .arg(&entry.reason)
            .arg("EX")
            .arg(ttl)
            .arg("NX")
            .query_async::<_, Option<String>>(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_hash_blacklisted(
        &self,
        token_hash: &str,
        _now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(Self::token_key(token_hash))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn latest_user_marker(
        &self,
        user_id: Uuid,
        _now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut conn = self.manager.clone();
        let micros: Option<i64> = redis::cmd("GET")
            .arg(Self::user_key(user_id))
            .query_async(&mut conn)
            .await?;
        Ok(micros.and_then(|m| Utc.timestamp_micros(m).single()))
    }

    async fn delete_expired_blacklist(&self, _now: DateTime<Utc>) -> Result<u64, StoreError> {
        // Expiry is handled by key TTLs.
        Ok(0)
    }
}
