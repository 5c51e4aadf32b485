//! Counter key naming and recipient normalization.
//!
//! Every piece of rate-limit state lives under a key derived here, so all
//! processes sharing a store agree on where a counter is kept.

use chrono::{DateTime, NaiveDate, Utc};

/// Punctuation dropped from phone-number recipients.
const PHONE_NOISE: &[char] = &['+', '-', '(', ')'];

/// Whether `raw` looks like a phone number: digits, whitespace and phone
/// punctuation only, with at least one digit.
fn is_phone_shaped(raw: &str) -> bool {
    raw.chars().any(|c| c.is_ascii_digit())
        && raw
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_whitespace() || PHONE_NOISE.contains(&c))
}

/// Normalize a recipient identifier for use in counter keys.
///
/// Phone numbers lose whitespace and punctuation, so `+55 (11) 99999-0000`
/// and `5511999990000` share one pacing timer and one daily slot. Any other
/// identifier is only trimmed and lower-cased. Returns `None` if nothing is
/// left.
pub fn normalize_recipient(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let normalized: String = if is_phone_shaped(trimmed) {
        trimmed
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect()
    } else {
        trimmed.to_lowercase()
    };

    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Format a calendar day the way it appears in daily keys.
pub fn day_label(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// Builds store keys under a fixed prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Create a key space. The prefix is used verbatim.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Global admission counter for one one-second epoch.
    /// Format: "{prefix}global:{epoch_seconds}"
    pub fn window(&self, epoch_secs: i64) -> String {
        format!("{}global:{}", self.prefix, epoch_secs)
    }

    /// Last-send timestamp of a normalized recipient.
    pub fn last_send(&self, recipient: &str) -> String {
        format!("{}last:{}", self.prefix, recipient)
    }

    /// Set of recipients contacted on `day`.
    pub fn contacted(&self, day: NaiveDate) -> String {
        format!("{}contacts:{}", self.prefix, day_label(day))
    }

    /// Total admitted sends on `day`.
    pub fn daily_sends(&self, day: NaiveDate) -> String {
        format!("{}sends:{}", self.prefix, day_label(day))
    }

    /// Blackout flag for `day`.
    pub fn suppression(&self, day: NaiveDate) -> String {
        format!("{}suppress:{}", self.prefix, day_label(day))
    }

    /// All keys touched when checking or recording a send to `recipient` at `now`.
    ///
    /// `recipient` must already be normalized.
    pub fn admission(&self, recipient: &str, now: DateTime<Utc>) -> AdmissionKeys {
        let day = now.date_naive();
        AdmissionKeys {
            recipient: recipient.to_string(),
            window: self.window(now.timestamp()),
            last_send: self.last_send(recipient),
            contacted: self.contacted(day),
            daily_sends: self.daily_sends(day),
            suppression: self.suppression(day),
        }
    }

    /// Keys read by the daily usage report.
    pub fn daily(&self, day: NaiveDate) -> DailyKeys {
        DailyKeys {
            contacted: self.contacted(day),
            daily_sends: self.daily_sends(day),
        }
    }
}

/// Keys for one admission check or one recorded send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionKeys {
    /// Normalized recipient, also the member added to the contacted set
    pub recipient: String,
    /// Current-epoch global counter
    pub window: String,
    /// Per-recipient last-send timestamp
    pub last_send: String,
    /// Today's contacted set
    pub contacted: String,
    /// Today's total-send counter
    pub daily_sends: String,
    /// Today's suppression flag
    pub suppression: String,
}

/// Keys for the daily usage report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyKeys {
    pub contacted: String,
    pub daily_sends: String,
}
