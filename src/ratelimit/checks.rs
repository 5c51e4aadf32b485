//! Admission checks evaluated over a counter snapshot.
//!
//! The four checks are logically independent; they run in a fixed order
//! only so that the reported reason is deterministic.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::config::RateLimitConfig;
use crate::store::CounterSnapshot;

/// Limits applied by the admission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    /// Admitted sends per one-second epoch
    pub global_per_second_ceiling: u64,
    /// Minimum spacing between sends to one recipient
    pub min_interval: Duration,
    /// Distinct recipients per UTC day
    pub daily_unique_contact_ceiling: u64,
    /// Whether the suppression flag is honoured
    pub suppression_enabled: bool,
}

impl From<&RateLimitConfig> for AdmissionLimits {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            global_per_second_ceiling: config.global_per_second_ceiling,
            min_interval: config.min_interval(),
            daily_unique_contact_ceiling: config.daily_unique_contact_ceiling,
            suppression_enabled: config.suppression_window_enabled,
        }
    }
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self::from(&RateLimitConfig::default())
    }
}

/// Why a send was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    /// The recipient identifier was empty
    InvalidRecipient,
    /// The current one-second epoch is full
    GlobalCeiling { count: u64, ceiling: u64 },
    /// The recipient was contacted too recently
    RecipientPacing { retry_after_ms: u64 },
    /// Today's distinct-recipient budget is spent and this recipient is new
    DailyCap { contacted: u64, ceiling: u64 },
    /// A blackout period is active today
    Suppressed,
    /// The counter store was unreachable and the limiter fails closed
    StoreUnavailable,
}

impl DenyReason {
    /// How long to wait before the same recipient can pass pacing, if that is the reason.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DenyReason::RecipientPacing { retry_after_ms } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::InvalidRecipient => write!(f, "recipient identifier is empty"),
            DenyReason::GlobalCeiling { count, ceiling } => {
                write!(f, "global ceiling reached ({}/{} this second)", count, ceiling)
            }
            DenyReason::RecipientPacing { retry_after_ms } => {
                write!(f, "recipient contacted too recently (retry in {} ms)", retry_after_ms)
            }
            DenyReason::DailyCap { contacted, ceiling } => {
                write!(f, "daily unique-contact cap reached ({}/{})", contacted, ceiling)
            }
            DenyReason::Suppressed => write!(f, "suppression window active"),
            DenyReason::StoreUnavailable => write!(f, "counter store unavailable"),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "admission", rename_all = "snake_case")]
pub enum Admission {
    /// All checks passed
    Allowed,
    /// The store could not be consulted and the limiter fails open
    AllowedDegraded,
    /// A check failed
    Denied(DenyReason),
}

impl Admission {
    /// Whether the message may be sent.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Denied(_))
    }

    /// The deny reason, if any.
    pub fn reason(&self) -> Option<&DenyReason> {
        match self {
            Admission::Denied(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Run the checks in order: global epoch, recipient pacing, daily cap, suppression.
pub fn evaluate(snapshot: &CounterSnapshot, now_ms: i64, limits: &AdmissionLimits) -> Admission {
    if snapshot.window_count >= limits.global_per_second_ceiling {
        return Admission::Denied(DenyReason::GlobalCeiling {
            count: snapshot.window_count,
            ceiling: limits.global_per_second_ceiling,
        });
    }

    if let Some(last_sent_ms) = snapshot.last_sent_ms {
        let interval_ms = i64::try_from(limits.min_interval.as_millis()).unwrap_or(i64::MAX);
        let elapsed_ms = now_ms.saturating_sub(last_sent_ms);
        if elapsed_ms < interval_ms {
            let remaining = interval_ms.saturating_sub(elapsed_ms);
            return Admission::Denied(DenyReason::RecipientPacing {
                retry_after_ms: u64::try_from(remaining).unwrap_or(u64::MAX),
            });
        }
    }

    if !snapshot.already_contacted
        && snapshot.contacted_today >= limits.daily_unique_contact_ceiling
    {
        return Admission::Denied(DenyReason::DailyCap {
            contacted: snapshot.contacted_today,
            ceiling: limits.daily_unique_contact_ceiling,
        });
    }

    if limits.suppression_enabled && snapshot.suppressed {
        return Admission::Denied(DenyReason::Suppressed);
    }

    Admission::Allowed
}
