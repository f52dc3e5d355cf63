//! Redis implementation of the [`Broker`] trait.
//!
//! Uses a [`ConnectionManager`] so that dropped connections are re-established
//! transparently; each call clones the manager, which is cheap and lets the
//! broker be shared across workers behind an `Arc`.

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use async_trait::async_trait;

use super::{Broker, BrokerError};

/// Broker backed by a Redis server.
#[derive(Clone)]
pub struct RedisBroker {
    redis: ConnectionManager,
}

impl RedisBroker {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, BrokerError> {
        let client = ::redis::Client::open(redis_url)
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        Ok(Self { redis })
    }

    /// Creates a broker from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let pong: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(BrokerError::UnexpectedResponse(pong));
        }
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<u64, BrokerError> {
        let mut conn = self.redis.clone();
        let removed: u64 = ::redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        ::redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn zpopmax(&self, key: &str) -> Result<Option<(String, f64)>, BrokerError> {
        let mut conn = self.redis.clone();
        // Reply is a flat [member, score] array, empty when the set is empty.
        let popped: Vec<(String, f64)> = ::redis::cmd("ZPOPMAX")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(popped.into_iter().next())
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, BrokerError> {
        let mut conn = self.redis.clone();
        let entries: Vec<(String, f64)> = ::redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(score_bound(min))
            .arg(score_bound(max))
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(entries)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<u64, BrokerError> {
        let mut conn = self.redis.clone();
        let removed: u64 = ::redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<u64, BrokerError> {
        let mut conn = self.redis.clone();
        let len: u64 = ::redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        ::redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, BrokerError> {
        let mut conn = self.redis.clone();
        let removed: u64 = ::redis::cmd("LREM")
            .arg(key)
            .arg(count)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn llen(&self, key: &str) -> Result<u64, BrokerError> {
        let mut conn = self.redis.clone();
        let len: u64 = ::redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.redis.clone();
        let values: Vec<String> = ::redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }
}

/// Formats a sorted-set score bound, mapping infinities to Redis' `-inf`/`+inf`.
fn score_bound(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_bound() {
        assert_eq!(score_bound(f64::INFINITY), "+inf");
        assert_eq!(score_bound(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_bound(3.0), "3");
        assert_eq!(score_bound(1700000000.5), "1700000000.5");
    }
}
