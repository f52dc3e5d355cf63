//! Broker adapter: the shared key/value + sorted-set + list store backing the queue.
//!
//! The queue never talks to Redis directly. Everything goes through the
//! [`Broker`] trait so that the same queue logic runs against a real Redis
//! server ([`RedisBroker`]) or an in-process store ([`MemoryBroker`]) used in
//! tests and local development.
//!
//! Every method maps onto exactly one Redis command. Coordination between
//! workers relies on the atomicity of those commands (`ZPOPMAX`, `ZREM`,
//! `LREM`), never on read-then-write pairs.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

/// Errors raised by broker implementations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Failed to connect to the broker.
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    /// A Redis command failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// The broker returned a value the adapter could not interpret.
    #[error("Unexpected broker response: {0}")]
    UnexpectedResponse(String),
}

/// Minimal command surface the queue needs from its backing store.
#[async_trait]
pub trait Broker: Send + Sync {
    /// `PING`: checks the broker is reachable.
    async fn ping(&self) -> Result<(), BrokerError>;

    /// `SET key value EX ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError>;

    /// `GET key`.
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;

    /// `DEL key`, returning the number of removed keys.
    async fn del(&self, key: &str) -> Result<u64, BrokerError>;

    /// `ZADD key score member`.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), BrokerError>;

    /// `ZPOPMAX key`: atomically removes and returns the highest scored member.
    async fn zpopmax(&self, key: &str) -> Result<Option<(String, f64)>, BrokerError>;

    /// `ZRANGEBYSCORE key min max WITHSCORES`, ascending by score.
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, BrokerError>;

    /// `ZREM key member`, returning the number of removed members.
    async fn zrem(&self, key: &str, member: &str) -> Result<u64, BrokerError>;

    /// `ZCARD key`.
    async fn zcard(&self, key: &str) -> Result<u64, BrokerError>;

    /// `LPUSH key value`.
    async fn lpush(&self, key: &str, value: &str) -> Result<(), BrokerError>;

    /// `LREM key count value`, returning the number of removed elements.
    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, BrokerError>;

    /// `LLEN key`.
    async fn llen(&self, key: &str) -> Result<u64, BrokerError>;

    /// `LRANGE key 0 -1`.
    async fn lrange_all(&self, key: &str) -> Result<Vec<String>, BrokerError>;
}
