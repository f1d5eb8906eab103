//! Test doubles for the counter stores.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::remote::SLIDING_LOG_SCRIPT;
use super::transport::{Command, CommandTransport};
use super::{CounterStore, StoreError};
use crate::ratelimit::{CounterKey, Decision};

#[derive(Debug, Default)]
struct Keyspace {
    /// Sorted by (score, member)
    sets: HashMap<String, Vec<(i64, String)>>,
    ttls: HashMap<String, u64>,
}

impl Keyspace {
    fn zremrangebyscore(&mut self, key: &str, min: f64, max: f64) -> u64 {
        let set = self.sets.entry(key.to_string()).or_default();
        let before = set.len();
        set.retain(|(score, _)| !((*score as f64) >= min && (*score as f64) <= max));
        (before - set.len()) as u64
    }

    fn zadd(&mut self, key: &str, score: i64, member: &str) -> u64 {
        let set = self.sets.entry(key.to_string()).or_default();
        if let Some(existing) = set.iter_mut().find(|(_, m)| m == member) {
            existing.0 = score;
            set.sort();
            return 0;
        }
        set.push((score, member.to_string()));
        set.sort();
        1
    }

    fn zrem(&mut self, key: &str, member: &str) -> u64 {
        let set = self.sets.entry(key.to_string()).or_default();
        let before = set.len();
        set.retain(|(_, m)| m != member);
        (before - set.len()) as u64
    }

    fn zcard(&self, key: &str) -> u64 {
        self.sets.get(key).map(|s| s.len() as u64).unwrap_or(0)
    }

    fn first_with_score(&self, key: &str) -> Value {
        match self.sets.get(key).and_then(|s| s.first()) {
            Some((score, member)) => Value::from(vec![member.clone(), score.to_string()]),
            None => Value::Array(Vec::new()),
        }
    }

    fn run(&mut self, cmd: &Command) -> Result<Value, StoreError> {
        let arg = |i: usize| -> Result<&str, StoreError> {
            cmd.get(i)
                .map(String::as_str)
                .ok_or_else(|| StoreError::Backend(format!("ERR wrong number of arguments: {:?}", cmd)))
        };
        let num = |i: usize| -> Result<f64, StoreError> {
            let raw = arg(i)?;
            match raw {
                "-inf" => Ok(f64::NEG_INFINITY),
                "+inf" => Ok(f64::INFINITY),
                _ => raw
                    .parse()
                    .map_err(|_| StoreError::Backend(format!("ERR not a number: {}", raw))),
            }
        };

        match arg(0)?.to_ascii_uppercase().as_str() {
            "ZREMRANGEBYSCORE" => Ok(Value::from(self.zremrangebyscore(arg(1)?, num(2)?, num(3)?))),
            "ZADD" => Ok(Value::from(self.zadd(arg(1)?, num(2)? as i64, arg(3)?))),
            "ZREM" => Ok(Value::from(self.zrem(arg(1)?, arg(2)?))),
            "ZCARD" => Ok(Value::from(self.zcard(arg(1)?))),
            "EXPIRE" => {
                self.ttls.insert(arg(1)?.to_string(), num(2)? as u64);
                Ok(Value::from(1))
            }
            "ZRANGE" => Ok(self.first_with_score(arg(1)?)),
            "EVAL" if arg(1)? == SLIDING_LOG_SCRIPT => {
                let key = arg(3)?;
                let now = num(4)? as i64;
                let window = num(5)? as i64;
                let limit = num(6)? as u64;
                let member = arg(7)?;
                let ttl = num(8)? as u64;

                self.zremrangebyscore(key, f64::NEG_INFINITY, (now - window) as f64);
                let mut current = self.zcard(key);
                let mut allowed = 0;
                if current < limit {
                    self.zadd(key, now, member);
                    self.ttls.insert(key.to_string(), ttl);
                    current += 1;
                    allowed = 1;
                }
                let oldest = self
                    .sets
                    .get(key)
                    .and_then(|s| s.first())
                    .map(|(score, _)| *score)
                    .unwrap_or(now);
                Ok(Value::from(vec![allowed, current as i64, oldest]))
            }
            "EVAL" => Err(StoreError::Backend("NOSCRIPT unknown script".into())),
            other => Err(StoreError::Backend(format!("ERR unknown command '{}'", other))),
        }
    }
}

/// In-memory stand-in for the shared command service.
///
/// Each command runs under the keyspace lock on its own, so plain pipelines
/// may interleave with other callers while a script runs as one unit.
#[derive(Debug, Default)]
pub struct MemoryCommandService {
    keyspace: Mutex<Keyspace>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
    calls: AtomicU64,
}

impl MemoryCommandService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn members(&self, key: &str) -> Vec<(i64, String)> {
        self.keyspace.lock().sets.get(key).cloned().unwrap_or_default()
    }

    pub fn ttl(&self, key: &str) -> Option<u64> {
        self.keyspace.lock().ttls.get(key).copied()
    }
}

#[async_trait]
impl CommandTransport for MemoryCommandService {
    async fn execute(&self, commands: &[Command]) -> Result<Vec<Value>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("ERR service unavailable".into()));
        }

        let mut results = Vec::with_capacity(commands.len());
        for cmd in commands {
            let value = self.keyspace.lock().run(cmd)?;
            results.push(value);
        }
        Ok(results)
    }
}

/// A counter store that always faults.
#[derive(Debug, Default)]
pub struct FailingStore {
    calls: AtomicU64,
}

impl FailingStore {
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CounterStore for FailingStore {
    async fn record_and_check(
        &self,
        _key: &CounterKey,
        _window: Duration,
        _limit: u64,
        _now_ms: u64,
    ) -> Result<Decision, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection refused".into()))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}
