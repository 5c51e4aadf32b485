//! Shared counter store port and adapters.
//!
//! The store is the only shared mutable resource of the pipeline. Every key
//! carries a TTL, so an absent key and a freshly reset counter read the same.

mod keys;
mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::{Admission, AdmissionLimits};

pub use keys::{day_label, normalize_recipient, AdmissionKeys, DailyKeys, KeySpace};
pub use memory::InMemoryCounterStore;
pub use redis_store::RedisCounterStore;

/// Lifetime of a one-second epoch counter.
pub const WINDOW_TTL: Duration = Duration::from_secs(2);
/// Lifetime of daily sets, counters and flags.
pub const DAILY_TTL: Duration = Duration::from_secs(48 * 3600);

/// Point-in-time view of the counters relevant to one recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Admissions recorded in the current epoch
    pub window_count: u64,
    /// Last send to the recipient, in milliseconds since the Unix epoch
    pub last_sent_ms: Option<i64>,
    /// Whether the recipient is already in today's contacted set
    pub already_contacted: bool,
    /// Cardinality of today's contacted set
    pub contacted_today: u64,
    /// Whether today's suppression flag is set
    pub suppressed: bool,
}

/// Totals read by the daily usage report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DailyTotals {
    pub contacted: u64,
    pub total_sends: u64,
}

/// Expiry applied to each key family when a send is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTtls {
    pub window: Duration,
    pub last_send: Duration,
    pub daily: Duration,
}

impl KeyTtls {
    /// TTLs for a given per-recipient interval: the last-send key lives
    /// twice the interval, never less than one second.
    pub fn for_interval(min_interval: Duration) -> Self {
        Self {
            window: WINDOW_TTL,
            last_send: min_interval.saturating_mul(2).max(Duration::from_secs(1)),
            daily: DAILY_TTL,
        }
    }
}

/// Trait for counter store implementations.
///
/// Single-key operations rely on the store's per-key atomicity. `record`
/// applies its four updates as one batch; `try_admit` evaluates and records
/// inside one store-side transaction.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read every counter the admission checks need.
    async fn snapshot(&self, keys: &AdmissionKeys) -> Result<CounterSnapshot>;

    /// Record one admitted send: bump the epoch counter, stamp the
    /// recipient, add it to today's set and bump today's send total.
    async fn record(&self, keys: &AdmissionKeys, sent_at_ms: i64, ttls: &KeyTtls) -> Result<()>;

    /// Evaluate the checks and, if they pass, record the send in the same
    /// transaction.
    async fn try_admit(
        &self,
        keys: &AdmissionKeys,
        now_ms: i64,
        limits: &AdmissionLimits,
        ttls: &KeyTtls,
    ) -> Result<Admission>;

    /// Read today's contacted count and send total.
    async fn daily_totals(&self, keys: &DailyKeys) -> Result<DailyTotals>;

    /// Set a boolean flag with an expiry.
    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Remove a flag.
    async fn clear_flag(&self, key: &str) -> Result<()>;
}
