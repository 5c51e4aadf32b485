//! Daily usage reporting.

use chrono::NaiveDate;
use serde::Serialize;

use crate::store::DailyTotals;

/// Snapshot of today's contact budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    /// UTC day the report covers
    pub date: NaiveDate,
    /// Distinct recipients contacted today
    pub contacted_count: u64,
    /// Configured daily unique-contact ceiling
    pub cap: u64,
    /// Admitted sends recorded today
    pub total_sends: u64,
    /// `contacted_count / cap`, as a percentage with two decimals
    pub cap_usage_percent: f64,
    /// Whether the counter store answered
    pub store_reachable: bool,
}

impl UsageReport {
    /// Build a report from store totals.
    pub fn new(date: NaiveDate, totals: DailyTotals, cap: u64) -> Self {
        let percent = if cap == 0 {
            0.0
        } else {
            (totals.contacted as f64 / cap as f64 * 10_000.0).round() / 100.0
        };
        Self {
            date,
            contacted_count: totals.contacted,
            cap,
            total_sends: totals.total_sends,
            cap_usage_percent: percent,
            store_reachable: true,
        }
    }

    /// A zeroed report for when the store could not be read.
    pub fn unreachable(date: NaiveDate, cap: u64) -> Self {
        Self {
            store_reachable: false,
            ..Self::new(date, DailyTotals::default(), cap)
        }
    }
}
