//! Redis-backed counter store.
//!
//! State layout:
//! - `{prefix}global:{epoch}`: INCR counter, 2 s TTL
//! - `{prefix}last:{recipient}`: last send in ms, TTL twice the interval
//! - `{prefix}contacts:{day}`: SET of recipients, 48 h TTL
//! - `{prefix}sends:{day}`: INCR counter, 48 h TTL
//! - `{prefix}suppress:{day}`: flag set out-of-band
//!
//! Reads are pipelined into one round trip. Recording a send is one
//! MULTI/EXEC transaction. `try_admit` runs as a Lua script so the checks
//! and the writes cannot interleave with another caller.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{AdmissionKeys, CounterSnapshot, CounterStore, DailyKeys, DailyTotals, KeyTtls};
use crate::config::StoreConfig;
use crate::error::{GovernanceError, Result};
use crate::ratelimit::{Admission, AdmissionLimits, DenyReason};

/// Server-side admission: same checks, same order as `ratelimit::evaluate`.
///
/// Returns `{code, detail}`: 0 admitted, 1 global ceiling (detail = count),
/// 2 pacing (detail = retry ms), 3 daily cap (detail = contacted), 4 suppressed.
const TRY_ADMIT_SCRIPT: &str = r#"
local window = tonumber(redis.call('GET', KEYS[1]) or '0')
if window >= tonumber(ARGV[3]) then
    return {1, window}
end

local now = tonumber(ARGV[2])
local interval = tonumber(ARGV[4])
local last = redis.call('GET', KEYS[2])
if last then
    local elapsed = now - tonumber(last)
    if elapsed < interval then
        return {2, interval - elapsed}
    end
end

if redis.call('SISMEMBER', KEYS[3], ARGV[1]) == 0 then
    local contacted = redis.call('SCARD', KEYS[3])
    if contacted >= tonumber(ARGV[5]) then
        return {3, contacted}
    end
end

if ARGV[6] == '1' and redis.call('EXISTS', KEYS[5]) == 1 then
    return {4, 0}
end

redis.call('INCR', KEYS[1])
redis.call('EXPIRE', KEYS[1], ARGV[7])
redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[8])
redis.call('SADD', KEYS[3], ARGV[1])
redis.call('EXPIRE', KEYS[3], ARGV[9])
redis.call('INCR', KEYS[4])
redis.call('EXPIRE', KEYS[4], ARGV[9])
return {0, 0}
"#;

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Reconnect attempts per connection establishment. Each attempt is capped by
/// the store operation timeout.
const CONNECT_RETRIES: usize = 1;

/// Counter store shared by every process through Redis.
///
/// The connection is established on first use, so building the store never
/// waits on the network. Until Redis answers, every call fails and the rate
/// limiter applies its degraded-mode policy.
pub struct RedisCounterStore {
    client: Client,
    manager_config: ConnectionManagerConfig,
    manager: OnceCell<ConnectionManager>,
    try_admit_script: Script,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("connected", &self.manager.initialized())
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Create a store for `config.url` without connecting.
    ///
    /// # Errors
    /// Returns error if the URL is invalid.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let timeout = config.operation_timeout();
        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(CONNECT_RETRIES)
            .set_connection_timeout(timeout)
            .set_response_timeout(timeout);

        Ok(Self {
            client,
            manager_config,
            manager: OnceCell::new(),
            try_admit_script: Script::new(TRY_ADMIT_SCRIPT),
        })
    }

    /// Create a store and require Redis to answer a PING.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or Redis is unreachable.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let store = Self::open(config)?;
        store.ping().await?;
        Ok(store)
    }

    /// Round-trip a PING.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Shared connection handle, connecting first if needed. A failed
    /// attempt leaves the store unconnected so the next call retries.
    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new_with_config(
                    self.client.clone(),
                    self.manager_config.clone(),
                )
                .await?;
                info!("Connected to counter store");
                Ok::<_, GovernanceError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }
}

fn script_verdict(code: i64, detail: i64, limits: &AdmissionLimits) -> Result<Admission> {
    let detail = detail.max(0) as u64;
    let admission = match code {
        0 => Admission::Allowed,
        1 => Admission::Denied(DenyReason::GlobalCeiling {
            count: detail,
            ceiling: limits.global_per_second_ceiling,
        }),
        2 => Admission::Denied(DenyReason::RecipientPacing {
            retry_after_ms: detail,
        }),
        3 => Admission::Denied(DenyReason::DailyCap {
            contacted: detail,
            ceiling: limits.daily_unique_contact_ceiling,
        }),
        4 => Admission::Denied(DenyReason::Suppressed),
        other => {
            return Err(GovernanceError::StoreUnavailable(format!(
                "unexpected admission script code {}",
                other
            )))
        }
    };
    Ok(admission)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn snapshot(&self, keys: &AdmissionKeys) -> Result<CounterSnapshot> {
        let mut conn = self.connection().await?;
        let (window_count, last_sent_ms, already_contacted, contacted_today, suppressed): (
            Option<u64>,
            Option<i64>,
            bool,
            u64,
            bool,
        ) = redis::pipe()
            .get(&keys.window)
            .get(&keys.last_send)
            .sismember(&keys.contacted, &keys.recipient)
            .scard(&keys.contacted)
            .exists(&keys.suppression)
            .query_async(&mut conn)
            .await?;

        Ok(CounterSnapshot {
            window_count: window_count.unwrap_or(0),
            last_sent_ms,
            already_contacted,
            contacted_today,
            suppressed,
        })
    }

    async fn record(&self, keys: &AdmissionKeys, sent_at_ms: i64, ttls: &KeyTtls) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .incr(&keys.window, 1)
            .ignore()
            .expire(&keys.window, ttl_secs(ttls.window) as i64)
            .ignore()
            .set_ex(&keys.last_send, sent_at_ms, ttl_secs(ttls.last_send))
            .ignore()
            .sadd(&keys.contacted, &keys.recipient)
            .ignore()
            .expire(&keys.contacted, ttl_secs(ttls.daily) as i64)
            .ignore()
            .incr(&keys.daily_sends, 1)
            .ignore()
            .expire(&keys.daily_sends, ttl_secs(ttls.daily) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(recipient = %keys.recipient, sent_at_ms, "Recorded send");
        Ok(())
    }

    async fn try_admit(
        &self,
        keys: &AdmissionKeys,
        now_ms: i64,
        limits: &AdmissionLimits,
        ttls: &KeyTtls,
    ) -> Result<Admission> {
        let mut conn = self.connection().await?;
        let (code, detail): (i64, i64) = self
            .try_admit_script
            .key(&keys.window)
            .key(&keys.last_send)
            .key(&keys.contacted)
            .key(&keys.daily_sends)
            .key(&keys.suppression)
            .arg(&keys.recipient)
            .arg(now_ms)
            .arg(limits.global_per_second_ceiling)
            .arg(u64::try_from(limits.min_interval.as_millis()).unwrap_or(u64::MAX))
            .arg(limits.daily_unique_contact_ceiling)
            .arg(if limits.suppression_enabled { "1" } else { "0" })
            .arg(ttl_secs(ttls.window))
            .arg(ttl_secs(ttls.last_send))
            .arg(ttl_secs(ttls.daily))
            .invoke_async(&mut conn)
            .await?;

        script_verdict(code, detail, limits)
    }

    async fn daily_totals(&self, keys: &DailyKeys) -> Result<DailyTotals> {
        let mut conn = self.connection().await?;
        let (contacted, total_sends): (u64, Option<u64>) = redis::pipe()
            .scard(&keys.contacted)
            .get(&keys.daily_sends)
            .query_async(&mut conn)
            .await?;

        Ok(DailyTotals {
            contacted,
            total_sends: total_sends.unwrap_or(0),
        })
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.set_ex(key, "1", ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn clear_flag(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KeySpace;
    use chrono::Utc;

    // Note: tests marked #[ignore] need a Redis instance on 127.0.0.1:6379
    // Run with: cargo test -- --ignored

    #[test]
    fn test_script_verdict_codes() {
        let limits = AdmissionLimits::default();

        assert_eq!(script_verdict(0, 0, &limits).unwrap(), Admission::Allowed);
        assert_eq!(
            script_verdict(1, 80, &limits).unwrap(),
            Admission::Denied(DenyReason::GlobalCeiling { count: 80, ceiling: 80 })
        );
        assert_eq!(
            script_verdict(2, 2500, &limits).unwrap(),
            Admission::Denied(DenyReason::RecipientPacing { retry_after_ms: 2500 })
        );
        assert_eq!(
            script_verdict(3, 1000, &limits).unwrap(),
            Admission::Denied(DenyReason::DailyCap { contacted: 1000, ceiling: 1000 })
        );
        assert_eq!(
            script_verdict(4, 0, &limits).unwrap(),
            Admission::Denied(DenyReason::Suppressed)
        );
        assert!(script_verdict(9, 0, &limits).is_err());
    }

    #[test]
    fn test_ttl_secs_floor() {
        assert_eq!(ttl_secs(Duration::from_millis(300)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(12)), 12);
    }

    #[tokio::test]
    async fn test_open_does_not_connect() {
        let config = StoreConfig {
            url: "redis://127.0.0.1:1/".to_string(),
            operation_timeout_ms: 50,
            ..Default::default()
        };
        let store = RedisCounterStore::open(&config).unwrap();
        assert!(!store.manager.initialized());

        let keys = KeySpace::new("test:").admission("alice", Utc::now());
        let result = tokio::time::timeout(Duration::from_secs(5), store.snapshot(&keys)).await;
        assert!(matches!(result, Ok(Err(_))), "dead store must fail, not hang");
        assert!(store.ping().await.is_err());
    }

    #[test]
    fn test_open_rejects_invalid_url() {
        let config = StoreConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(RedisCounterStore::open(&config).is_err());
    }

    fn unique_space() -> KeySpace {
        KeySpace::new(format!("outbound-test:{}:", Utc::now().timestamp_nanos_opt().unwrap_or(0)))
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_record_and_snapshot() {
        let store = RedisCounterStore::connect(&StoreConfig::default()).await.unwrap();
        let space = unique_space();
        let now = Utc::now();
        let keys = space.admission("5511999990000", now);
        let ttls = KeyTtls::for_interval(Duration::from_secs(6));

        store.record(&keys, now.timestamp_millis(), &ttls).await.unwrap();

        let snapshot = store.snapshot(&keys).await.unwrap();
        assert!(snapshot.window_count >= 1);
        assert_eq!(snapshot.last_sent_ms, Some(now.timestamp_millis()));
        assert!(snapshot.already_contacted);
        assert_eq!(snapshot.contacted_today, 1);

        let totals = store.daily_totals(&space.daily(now.date_naive())).await.unwrap();
        assert_eq!(totals.total_sends, 1);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_try_admit_script() {
        let store = RedisCounterStore::connect(&StoreConfig::default()).await.unwrap();
        let space = unique_space();
        let now = Utc::now();
        let keys = space.admission("5511999990001", now);
        let limits = AdmissionLimits::default();
        let ttls = KeyTtls::for_interval(limits.min_interval);

        let first = store
            .try_admit(&keys, now.timestamp_millis(), &limits, &ttls)
            .await
            .unwrap();
        assert_eq!(first, Admission::Allowed);

        let second = store
            .try_admit(&keys, now.timestamp_millis() + 1000, &limits, &ttls)
            .await
            .unwrap();
        assert_eq!(
            second,
            Admission::Denied(DenyReason::RecipientPacing { retry_after_ms: 5000 })
        );
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_suppression_flag() {
        let store = RedisCounterStore::connect(&StoreConfig::default()).await.unwrap();
        let space = unique_space();
        let now = Utc::now();
        let keys = space.admission("5511999990002", now);

        store.set_flag(&keys.suppression, Duration::from_secs(60)).await.unwrap();
        assert!(store.snapshot(&keys).await.unwrap().suppressed);

        store.clear_flag(&keys.suppression).await.unwrap();
        assert!(!store.snapshot(&keys).await.unwrap().suppressed);
    }
}
