//! Core rate limiter implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, trace, warn};

use super::checks::{evaluate, Admission, AdmissionLimits, DenyReason};
use super::usage::UsageReport;
use crate::clock::{Clock, SystemClock};
use crate::config::{DegradedMode, GovernanceConfig};
use crate::error::{GovernanceError, Result};
use crate::store::{normalize_recipient, CounterStore, KeySpace, KeyTtls, DAILY_TTL};

/// Decides whether a recipient may be contacted now and records sends.
///
/// Constructed once per process with its configuration and a handle to the
/// shared counter store, then shared by reference. Holds no counters
/// itself, so any number of callers may use it concurrently.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    keys: KeySpace,
    limits: AdmissionLimits,
    ttls: KeyTtls,
    degraded_mode: DegradedMode,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("keys", &self.keys)
            .field("limits", &self.limits)
            .field("degraded_mode", &self.degraded_mode)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a rate limiter that reads the system clock.
    pub fn new(store: Arc<dyn CounterStore>, config: &GovernanceConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock::new()))
    }

    /// Create a rate limiter with an explicit clock.
    pub fn with_clock(
        store: Arc<dyn CounterStore>,
        config: &GovernanceConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limits = AdmissionLimits::from(&config.rate_limit);
        Self {
            store,
            keys: KeySpace::new(config.store.key_prefix.clone()),
            ttls: KeyTtls::for_interval(limits.min_interval),
            limits,
            degraded_mode: config.rate_limit.degraded_mode,
            timeout: config.store.operation_timeout(),
            clock,
        }
    }

    /// The limits this instance enforces.
    pub fn limits(&self) -> &AdmissionLimits {
        &self.limits
    }

    /// Whether a message to `recipient` may be sent right now.
    ///
    /// Never fails: store trouble is resolved by the degraded-mode policy.
    pub async fn can_send(&self, recipient: &str) -> bool {
        self.check(recipient).await.is_allowed()
    }

    /// Like [`can_send`](Self::can_send), reporting which check failed.
    ///
    /// Has no side effects.
    pub async fn check(&self, recipient: &str) -> Admission {
        let Some(recipient) = normalize_recipient(recipient) else {
            debug!("Denied admission for empty recipient");
            return Admission::Denied(DenyReason::InvalidRecipient);
        };

        let now = self.clock.now();
        let keys = self.keys.admission(&recipient, now);

        trace!(recipient = %recipient, window = %keys.window, "Checking admission");

        let admission = match self.bounded(self.store.snapshot(&keys)).await {
            Ok(snapshot) => evaluate(&snapshot, now.timestamp_millis(), &self.limits),
            Err(e) => return self.degraded(&recipient, &e),
        };

        if let Admission::Denied(ref reason) = admission {
            debug!(recipient = %recipient, reason = %reason, "Admission denied");
        }
        admission
    }

    /// Record a send that the transport completed.
    ///
    /// Updates the epoch counter, the recipient's last-send time, today's
    /// contacted set and today's send total as one batch. Store failures
    /// are logged and otherwise ignored.
    pub async fn record_sent(&self, recipient: &str) {
        let Some(recipient) = normalize_recipient(recipient) else {
            debug!("Ignoring record for empty recipient");
            return;
        };

        let now = self.clock.now();
        let keys = self.keys.admission(&recipient, now);

        if let Err(e) = self
            .bounded(self.store.record(&keys, now.timestamp_millis(), &self.ttls))
            .await
        {
            warn!(
                recipient = %recipient,
                error = %e,
                "Counter store unavailable, send not recorded"
            );
        }
    }

    /// Check and record in one store-side transaction.
    ///
    /// Closes the window between [`check`](Self::check) and
    /// [`record_sent`](Self::record_sent) in which concurrent callers can
    /// both pass pacing for the same recipient. An allowed result has
    /// already been recorded; do not call `record_sent` for it.
    pub async fn try_admit(&self, recipient: &str) -> Admission {
        let Some(recipient) = normalize_recipient(recipient) else {
            return Admission::Denied(DenyReason::InvalidRecipient);
        };

        let now = self.clock.now();
        let keys = self.keys.admission(&recipient, now);

        let result = self
            .bounded(
                self.store
                    .try_admit(&keys, now.timestamp_millis(), &self.limits, &self.ttls),
            )
            .await;

        match result {
            Ok(admission) => {
                if let Admission::Denied(ref reason) = admission {
                    debug!(recipient = %recipient, reason = %reason, "Atomic admission denied");
                }
                admission
            }
            Err(e) => self.degraded(&recipient, &e),
        }
    }

    /// Report today's contact budget. Read-only; never denies.
    pub async fn daily_usage(&self) -> UsageReport {
        let today = self.clock.today();
        let cap = self.limits.daily_unique_contact_ceiling;

        match self.bounded(self.store.daily_totals(&self.keys.daily(today))).await {
            Ok(totals) => UsageReport::new(today, totals, cap),
            Err(e) => {
                warn!(error = %e, "Counter store unavailable, usage report is empty");
                UsageReport::unreachable(today, cap)
            }
        }
    }

    /// Turn the blackout flag for `day` on or off.
    ///
    /// An operator action, so unlike the admission path it reports store
    /// errors to the caller.
    pub async fn set_suppression(&self, day: NaiveDate, active: bool) -> Result<()> {
        let key = self.keys.suppression(day);
        if active {
            self.bounded(self.store.set_flag(&key, DAILY_TTL)).await?;
        } else {
            self.bounded(self.store.clear_flag(&key)).await?;
        }
        debug!(day = %day, active, "Suppression flag updated");
        Ok(())
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(GovernanceError::Timeout(self.timeout)),
        }
    }

    fn degraded(&self, recipient: &str, error: &GovernanceError) -> Admission {
        match self.degraded_mode {
            DegradedMode::FailOpen => {
                warn!(
                    recipient = %recipient,
                    error = %error,
                    "Counter store unavailable, admitting (fail-open)"
                );
                Admission::AllowedDegraded
            }
            DegradedMode::FailClosed => {
                warn!(
                    recipient = %recipient,
                    error = %error,
                    "Counter store unavailable, denying (fail-closed)"
                );
                Admission::Denied(DenyReason::StoreUnavailable)
            }
        }
    }
}
