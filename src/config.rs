//! Configuration management for the governance pipeline.
//!
//! One fully-typed structure with documented defaults. It is built once at
//! process start and handed to the service objects, which never mutate it.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::compliance::rules;
use crate::error::{GovernanceError, Result};

/// Prefix for environment variable overrides (`OUTBOUND_GATE__RATE_LIMIT__MIN_INTERVAL_SECS`).
pub const ENV_PREFIX: &str = "OUTBOUND_GATE";

/// Main configuration for the governance pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Shared counter store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Admission limits
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Content rules and disclosures
    #[serde(default)]
    pub compliance: ComplianceConfig,
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection string of the counter store
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix applied to every key this crate writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound for a single store call, in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            operation_timeout_ms: default_operation_timeout(),
        }
    }
}

impl StoreConfig {
    /// The per-call store timeout as a `Duration`.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_key_prefix() -> String {
    "outbound:".to_string()
}

fn default_operation_timeout() -> u64 {
    250
}

/// What the rate limiter answers when the counter store cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedMode {
    /// Admit the message and log a warning (availability over strictness).
    #[default]
    FailOpen,
    /// Deny the message until the store is reachable again.
    FailClosed,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Admitted sends allowed within one one-second epoch, across all recipients
    #[serde(default = "default_global_ceiling")]
    pub global_per_second_ceiling: u64,

    /// Minimum spacing between two sends to the same recipient
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,

    /// Distinct recipients that may be contacted per UTC day
    #[serde(default = "default_daily_ceiling")]
    pub daily_unique_contact_ceiling: u64,

    /// Honour the per-day suppression flag
    #[serde(default = "default_true")]
    pub suppression_window_enabled: bool,

    /// Behaviour while the counter store is unreachable
    #[serde(default)]
    pub degraded_mode: DegradedMode,

    /// Admit and record in one store-side transaction when sending through the pipeline
    #[serde(default)]
    pub atomic_admission: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_per_second_ceiling: default_global_ceiling(),
            min_interval_secs: default_min_interval(),
            daily_unique_contact_ceiling: default_daily_ceiling(),
            suppression_window_enabled: default_true(),
            degraded_mode: DegradedMode::default(),
            atomic_admission: false,
        }
    }
}

impl RateLimitConfig {
    /// Minimum per-recipient spacing as a `Duration`.
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }
}

/// Longest accepted per-recipient interval: one day.
pub const MAX_MIN_INTERVAL_SECS: u64 = 24 * 3600;

fn default_global_ceiling() -> u64 {
    80
}

fn default_min_interval() -> u64 {
    6
}

fn default_daily_ceiling() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

/// A named hard-block pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRuleConfig {
    /// Short label reported as the block reason
    pub name: String,
    /// Regular expression, matched case-insensitively anywhere in the text
    pub pattern: String,
}

/// Compliance gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceConfig {
    /// AI disclosure appended to every outbound text
    #[serde(default = "default_disclaimer")]
    pub disclaimer: String,

    /// Token whose presence means the disclosure is already there
    #[serde(default = "default_disclaimer_marker")]
    pub disclaimer_marker: String,

    /// Legal identification footer; `{client_label}` is substituted
    #[serde(default = "default_identification_template")]
    pub identification_template: String,

    /// Registration token whose presence means the footer is already there
    #[serde(default = "default_identification_marker")]
    pub identification_marker: String,

    /// Patterns that block a message outright
    #[serde(default = "default_hard_block")]
    pub hard_block: Vec<BlockRuleConfig>,

    /// Terms that raise an alert without blocking
    #[serde(default = "default_soft_alerts")]
    pub soft_alerts: Vec<String>,

    /// Whole-message keywords a recipient sends to stop contact
    #[serde(default = "default_opt_out_keywords")]
    pub opt_out_keywords: Vec<String>,

    /// Characters of text kept in each audit entry
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            disclaimer: default_disclaimer(),
            disclaimer_marker: default_disclaimer_marker(),
            identification_template: default_identification_template(),
            identification_marker: default_identification_marker(),
            hard_block: default_hard_block(),
            soft_alerts: default_soft_alerts(),
            opt_out_keywords: default_opt_out_keywords(),
            preview_chars: default_preview_chars(),
        }
    }
}

fn default_disclaimer() -> String {
    rules::AI_DISCLAIMER.to_string()
}

fn default_disclaimer_marker() -> String {
    rules::AI_DISCLAIMER_MARKER.to_string()
}

fn default_identification_template() -> String {
    rules::LEGAL_IDENTIFICATION_TEMPLATE.to_string()
}

fn default_identification_marker() -> String {
    rules::LEGAL_IDENTIFICATION_MARKER.to_string()
}

fn default_hard_block() -> Vec<BlockRuleConfig> {
    rules::HARD_BLOCK_PATTERNS
        .iter()
        .map(|(name, pattern)| BlockRuleConfig {
            name: name.to_string(),
            pattern: pattern.to_string(),
        })
        .collect()
}

fn default_soft_alerts() -> Vec<String> {
    rules::SOFT_ALERT_TERMS.iter().map(|t| t.to_string()).collect()
}

fn default_opt_out_keywords() -> Vec<String> {
    rules::OPT_OUT_KEYWORDS.iter().map(|k| k.to_string()).collect()
}

fn default_preview_chars() -> usize {
    100
}

impl GovernanceConfig {
    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GovernanceConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GovernanceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading governance configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional YAML file layered with
    /// `OUTBOUND_GATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading governance configuration");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: GovernanceConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("compliance.soft_alerts")
                    .with_list_parse_key("compliance.opt_out_keywords")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the limiter cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.store.url.trim().is_empty() {
            return Err(GovernanceError::Config("store.url must not be empty".into()));
        }
        if self.store.key_prefix.is_empty() {
            return Err(GovernanceError::Config(
                "store.key_prefix must not be empty".into(),
            ));
        }
        if self.store.operation_timeout_ms == 0 {
            return Err(GovernanceError::Config(
                "store.operation_timeout_ms must be at least 1".into(),
            ));
        }
        if self.rate_limit.global_per_second_ceiling == 0 {
            return Err(GovernanceError::Config(
                "rate_limit.global_per_second_ceiling must be at least 1".into(),
            ));
        }
        if self.rate_limit.min_interval_secs > MAX_MIN_INTERVAL_SECS {
            return Err(GovernanceError::Config(format!(
                "rate_limit.min_interval_secs must be at most {}",
                MAX_MIN_INTERVAL_SECS
            )));
        }
        if self.rate_limit.daily_unique_contact_ceiling == 0 {
            return Err(GovernanceError::Config(
                "rate_limit.daily_unique_contact_ceiling must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
