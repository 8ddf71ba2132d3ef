//! Small key-value abstraction for the shared counter and token tables.
//!
//! A single-process map and a distributed cache implement the same trait, so
//! the rate limiter and CSRF guard scale horizontally by swapping the backend.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

/// Counter state after an atomic fixed-window increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Live entry for `key`; expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError>;

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically bump the counter for `key`.
    ///
    /// Starts a fresh window with count 1 when no window exists or
    /// `now >= reset_at`; otherwise increments inside the current window.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCounter, StoreError>;
}

#[derive(Debug, Clone)]
enum Slot {
    Value(KvEntry),
    Counter(WindowCounter),
}

impl Slot {
    fn expires_at(&self) -> DateTime<Utc> {
        match self {
            Slot::Value(entry) => entry.expires_at,
            Slot::Counter(counter) => counter.reset_at,
        }
    }
}

/// In-process store. Every operation holds one mutex, which makes
/// check-then-increment atomic for concurrent callers on the same key.
#[derive(Clone)]
pub struct MemoryKvStore {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryKvStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Slot>>, StoreError> {
        self.slots
            .lock()
            .map_err(|_| StoreError::Unavailable("kv mutex poisoned".to_string()))
    }

    fn sweep_expired(slots: &mut HashMap<String, Slot>, now: DateTime<Utc>) {
        slots.retain(|_, slot| slot.expires_at() > now);
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        let now = self.clock.now();
        let mut slots = self.lock()?;
        Self::sweep_expired(&mut slots, now);

        match slots.get(key) {
            Some(Slot::Value(entry)) => Ok(Some(entry.clone())),
            Some(Slot::Counter(counter)) => Ok(Some(KvEntry {
                value: counter.count.to_string(),
                expires_at: counter.reset_at,
            })),
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut slots = self.lock()?;
        Self::sweep_expired(&mut slots, now);
        slots.insert(
            key.to_string(),
            Slot::Value(KvEntry {
                value,
                expires_at: now + ttl,
            }),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCounter, StoreError> {
        let now = self.clock.now();
        let mut slots = self.lock()?;

        let next = match slots.get(key) {
            Some(Slot::Counter(counter)) if now < counter.reset_at => WindowCounter {
                count: counter.count.saturating_add(1),
                reset_at: counter.reset_at,
            },
            _ => WindowCounter {
                count: 1,
                reset_at: now + window,
            },
        };
        slots.insert(key.to_string(), Slot::Counter(next));
        Self::sweep_expired(&mut slots, now);

        Ok(next)
    }
}
