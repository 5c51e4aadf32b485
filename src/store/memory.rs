//! In-process counter store.
//!
//! Mirrors the Redis key model (counters, timestamps, sets and flags with
//! TTLs) inside one process. Suitable for tests and single-instance
//! deployments; state is not shared between processes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use super::{AdmissionKeys, CounterSnapshot, CounterStore, DailyKeys, DailyTotals, KeyTtls};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::ratelimit::{evaluate, Admission, AdmissionLimits};

#[derive(Debug, Clone)]
enum Value {
    Counter(u64),
    Timestamp(i64),
    Set(HashSet<String>),
    Flag,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

/// Counter store held in process memory.
///
/// Keys expire against the injected clock. Batched writes and
/// `try_admit` run under one lock so readers never observe half a batch.
#[derive(Debug)]
pub struct InMemoryCounterStore {
    entries: DashMap<String, Entry>,
    batch: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCounterStore {
    /// Create a store that expires keys against the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store that expires keys against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            batch: Mutex::new(()),
            clock,
        }
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = self.clock.now();
        self.entries.retain(|_, entry| entry.is_live(now));
        self.entries.len()
    }

    /// Drop every key.
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn read<T>(&self, key: &str, f: impl FnOnce(&Value) -> Option<T>) -> Option<T> {
        let now = self.clock.now();
        match self.entries.get(key) {
            None => return None,
            Some(entry) if entry.is_live(now) => return f(&entry.value),
            Some(_) => {}
        }
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        None
    }

    fn counter(&self, key: &str) -> u64 {
        self.read(key, |value| match value {
            Value::Counter(n) => Some(*n),
            _ => None,
        })
        .unwrap_or(0)
    }

    fn timestamp(&self, key: &str) -> Option<i64> {
        self.read(key, |value| match value {
            Value::Timestamp(ms) => Some(*ms),
            _ => None,
        })
    }

    fn set_stats(&self, key: &str, member: &str) -> (u64, bool) {
        self.read(key, |value| match value {
            Value::Set(members) => Some((members.len() as u64, members.contains(member))),
            _ => None,
        })
        .unwrap_or((0, false))
    }

    fn flag(&self, key: &str) -> bool {
        self.read(key, |value| Some(matches!(value, Value::Flag)))
            .unwrap_or(false)
    }

    /// Write `key`, starting from `fresh` when it is absent or expired.
    fn upsert(&self, key: &str, ttl: Duration, fresh: Value, update: impl FnOnce(&mut Value)) {
        let now = self.clock.now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: fresh.clone(),
            expires_at: None,
        });
        if !entry.is_live(now) {
            entry.value = fresh;
        }
        update(&mut entry.value);
        entry.expires_at = expiry(now, ttl);
    }

    fn incr(&self, key: &str, ttl: Duration) {
        self.upsert(key, ttl, Value::Counter(0), |value| match value {
            Value::Counter(n) => *n += 1,
            other => *other = Value::Counter(1),
        });
    }

    fn snapshot_unlocked(&self, keys: &AdmissionKeys) -> CounterSnapshot {
        let (contacted_today, already_contacted) =
            self.set_stats(&keys.contacted, &keys.recipient);
        CounterSnapshot {
            window_count: self.counter(&keys.window),
            last_sent_ms: self.timestamp(&keys.last_send),
            already_contacted,
            contacted_today,
            suppressed: self.flag(&keys.suppression),
        }
    }

    fn record_unlocked(&self, keys: &AdmissionKeys, sent_at_ms: i64, ttls: &KeyTtls) {
        self.incr(&keys.window, ttls.window);
        self.upsert(
            &keys.last_send,
            ttls.last_send,
            Value::Timestamp(sent_at_ms),
            |value| *value = Value::Timestamp(sent_at_ms),
        );
        self.upsert(
            &keys.contacted,
            ttls.daily,
            Value::Set(HashSet::new()),
            |value| match value {
                Value::Set(members) => {
                    members.insert(keys.recipient.clone());
                }
                other => *other = Value::Set(HashSet::from([keys.recipient.clone()])),
            },
        );
        self.incr(&keys.daily_sends, ttls.daily);
    }

    fn snapshot_locked(&self, keys: &AdmissionKeys) -> CounterSnapshot {
        let _batch = self.batch.lock();
        self.snapshot_unlocked(keys)
    }

    fn record_locked(&self, keys: &AdmissionKeys, sent_at_ms: i64, ttls: &KeyTtls) {
        let _batch = self.batch.lock();
        self.record_unlocked(keys, sent_at_ms, ttls);
    }

    fn try_admit_locked(
        &self,
        keys: &AdmissionKeys,
        now_ms: i64,
        limits: &AdmissionLimits,
        ttls: &KeyTtls,
    ) -> Admission {
        let _batch = self.batch.lock();
        let snapshot = self.snapshot_unlocked(keys);
        let admission = evaluate(&snapshot, now_ms, limits);
        if admission.is_allowed() {
            self.record_unlocked(keys, now_ms, ttls);
        }
        admission
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn snapshot(&self, keys: &AdmissionKeys) -> Result<CounterSnapshot> {
        Ok(self.snapshot_locked(keys))
    }

    async fn record(&self, keys: &AdmissionKeys, sent_at_ms: i64, ttls: &KeyTtls) -> Result<()> {
        trace!(recipient = %keys.recipient, sent_at_ms, "Recording send in memory");
        self.record_locked(keys, sent_at_ms, ttls);
        Ok(())
    }

    async fn try_admit(
        &self,
        keys: &AdmissionKeys,
        now_ms: i64,
        limits: &AdmissionLimits,
        ttls: &KeyTtls,
    ) -> Result<Admission> {
        Ok(self.try_admit_locked(keys, now_ms, limits, ttls))
    }

    async fn daily_totals(&self, keys: &DailyKeys) -> Result<DailyTotals> {
        let (contacted, _) = self.set_stats(&keys.contacted, "");
        Ok(DailyTotals {
            contacted,
            total_sends: self.counter(&keys.daily_sends),
        })
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<()> {
        self.upsert(key, ttl, Value::Flag, |value| *value = Value::Flag);
        Ok(())
    }

    async fn clear_flag(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
