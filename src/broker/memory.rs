//! In-process implementation of the [`Broker`] trait.
//!
//! Mirrors the Redis semantics the queue relies on (expiring keys, sorted-set
//! ordering, list removal) behind a single async mutex, which makes every
//! operation atomic with respect to the others. Intended for tests and
//! single-process development setups; state is lost when the broker is dropped.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Broker, BrokerError};

#[derive(Debug)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    strings: HashMap<String, StoredValue>,
    sorted_sets: HashMap<String, HashMap<String, f64>>,
    lists: HashMap<String, VecDeque<String>>,
}

/// Broker holding all data in memory.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Redis orders equal scores by member, lexicographically.
fn by_score_then_member(a: &(String, f64), b: &(String, f64)) -> Ordering {
    a.1.partial_cmp(&b.1)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.0.cmp(&b.0))
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.strings.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if state.strings.get(key).is_some_and(|v| v.is_expired(now)) {
            state.strings.remove(key);
            return Ok(None);
        }
        Ok(state.strings.get(key).map(|v| v.value.clone()))
    }

    async fn del(&self, key: &str) -> Result<u64, BrokerError> {
        let mut state = self.state.lock().await;
        let removed = state.strings.remove(key).is_some() as u64
            + state.sorted_sets.remove(key).is_some() as u64
            + state.lists.remove(key).is_some() as u64;
        Ok(removed)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state
            .sorted_sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zpopmax(&self, key: &str) -> Result<Option<(String, f64)>, BrokerError> {
        let mut state = self.state.lock().await;
        let Some(set) = state.sorted_sets.get_mut(key) else {
            return Ok(None);
        };

        let top = set
            .iter()
            .map(|(member, score)| (member.clone(), *score))
            .max_by(by_score_then_member);

        if let Some((member, _)) = &top {
            set.remove(member);
        }
        if set.is_empty() {
            state.sorted_sets.remove(key);
        }
        Ok(top)
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, BrokerError> {
        let state = self.state.lock().await;
        let mut entries: Vec<(String, f64)> = state
            .sorted_sets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(member, score)| (member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(by_score_then_member);
        Ok(entries)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<u64, BrokerError> {
        let mut state = self.state.lock().await;
        let Some(set) = state.sorted_sets.get_mut(key) else {
            return Ok(0);
        };
        let removed = set.remove(member).is_some() as u64;
        if set.is_empty() {
            state.sorted_sets.remove(key);
        }
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<u64, BrokerError> {
        let state = self.state.lock().await;
        Ok(state.sorted_sets.get(key).map_or(0, |set| set.len() as u64))
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, BrokerError> {
        let mut state = self.state.lock().await;
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(0);
        };

        let limit = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs() as usize
        };
        let mut removed = 0usize;

        // Positive counts remove from the head, negative ones from the tail.
        if count >= 0 {
            let mut i = 0;
            while i < list.len() && removed < limit {
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                } else {
                    i += 1;
                }
            }
        } else {
            let mut i = list.len();
            while i > 0 && removed < limit {
                i -= 1;
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                }
            }
        }

        if list.is_empty() {
            state.lists.remove(key);
        }
        Ok(removed as u64)
    }

    async fn llen(&self, key: &str) -> Result<u64, BrokerError> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map_or(0, |list| list.len() as u64))
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }
}
