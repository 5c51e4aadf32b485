//! Governance pipeline: one call that runs both gates in the right order.
//!
//! Compliance first, then admission. The pipeline never talks to the
//! transport and never records a send on its own (unless atomic admission
//! is enabled): only the caller knows whether delivery succeeded, so the
//! caller reports it through [`GovernancePipeline::confirm_sent`].

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::compliance::{AuditSink, ComplianceGate, PrepareOptions};
use crate::config::GovernanceConfig;
use crate::error::Result;
use crate::ratelimit::{Admission, RateLimiter};
use crate::store::{CounterStore, RedisCounterStore};

/// Final decision for one candidate message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Approved and admitted; the caller may send `final_text`
    SentAllowed,
    /// Stopped by the compliance gate; must not be sent
    BlockedCompliance,
    /// Approved but not admitted right now; retry later with `final_text`
    DeniedRateLimit,
}

/// What the caller gets back from [`GovernancePipeline::send`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineResult {
    pub outcome: Outcome,
    /// Text to hand to the transport (the untouched input when blocked)
    pub final_text: String,
    /// Non-blocking compliance notes
    pub alerts: Vec<String>,
    /// Compliance block reason
    pub block_reason: Option<String>,
    /// Rate limiter verdict; absent when compliance blocked the message
    pub admission: Option<Admission>,
    /// The send was already recorded by atomic admission; do not call
    /// `confirm_sent` for it
    pub recorded: bool,
}

impl PipelineResult {
    /// Whether the caller may hand `final_text` to the transport.
    pub fn may_send(&self) -> bool {
        self.outcome == Outcome::SentAllowed
    }
}

/// A caller-owned outbound message. The pipeline reads `recipient_id` and
/// `raw_text` and writes `final_text`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub recipient_id: String,
    pub raw_text: String,
    pub final_text: Option<String>,
}

impl OutboundMessage {
    pub fn new(recipient_id: impl Into<String>, raw_text: impl Into<String>) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            raw_text: raw_text.into(),
            final_text: None,
        }
    }
}

/// Sequences the compliance gate and the rate limiter around one message.
#[derive(Debug)]
pub struct GovernancePipeline {
    gate: ComplianceGate,
    limiter: Arc<RateLimiter>,
    atomic_admission: bool,
}

impl GovernancePipeline {
    /// Assemble a pipeline from already-built gates.
    pub fn new(gate: ComplianceGate, limiter: Arc<RateLimiter>, atomic_admission: bool) -> Self {
        Self {
            gate,
            limiter,
            atomic_admission,
        }
    }

    /// Build both gates from configuration over an existing store.
    pub fn from_config(
        config: &GovernanceConfig,
        store: Arc<dyn CounterStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        config.validate()?;
        let gate = ComplianceGate::new(&config.compliance, audit)?;
        let limiter = Arc::new(RateLimiter::new(store, config));
        Ok(Self::new(gate, limiter, config.rate_limit.atomic_admission))
    }

    /// Build both gates over the configured Redis store.
    ///
    /// Does not wait for Redis: the connection is made on first use, and
    /// until then admissions follow the degraded-mode policy.
    pub fn open(config: &GovernanceConfig, audit: Arc<dyn AuditSink>) -> Result<Self> {
        let store = RedisCounterStore::open(&config.store)?;
        let pipeline = Self::from_config(config, Arc::new(store), audit)?;
        info!(
            atomic_admission = pipeline.atomic_admission,
            limits = ?pipeline.limiter.limits(),
            "Governance pipeline initialized"
        );
        Ok(pipeline)
    }

    /// The compliance gate.
    pub fn gate(&self) -> &ComplianceGate {
        &self.gate
    }

    /// The rate limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Run a candidate message through both gates with both disclosures.
    pub async fn send(
        &self,
        candidate_text: &str,
        recipient_id: &str,
        client_label: &str,
    ) -> PipelineResult {
        self.send_with(candidate_text, recipient_id, client_label, PrepareOptions::default())
            .await
    }

    /// Run a candidate message through both gates.
    pub async fn send_with(
        &self,
        candidate_text: &str,
        recipient_id: &str,
        client_label: &str,
        options: PrepareOptions,
    ) -> PipelineResult {
        let prepared = self
            .gate
            .prepare_outbound(candidate_text, client_label, options);

        if prepared.blocked {
            debug!(recipient = %recipient_id, "Message blocked by compliance");
            return PipelineResult {
                outcome: Outcome::BlockedCompliance,
                final_text: prepared.final_text,
                alerts: prepared.alerts,
                block_reason: prepared.reason,
                admission: None,
                recorded: false,
            };
        }

        self.admit(prepared.final_text, prepared.alerts, recipient_id)
            .await
    }

    /// Re-submit a text that already passed compliance; only the rate
    /// limiter runs.
    pub async fn retry(&self, final_text: &str, recipient_id: &str) -> PipelineResult {
        self.admit(final_text.to_string(), Vec::new(), recipient_id)
            .await
    }

    /// Run `message` through both gates, storing the sendable text in
    /// `message.final_text` (left `None` when blocked).
    pub async fn govern(&self, message: &mut OutboundMessage, client_label: &str) -> PipelineResult {
        let result = self
            .send(&message.raw_text, &message.recipient_id, client_label)
            .await;
        message.final_text = match result.outcome {
            Outcome::BlockedCompliance => None,
            _ => Some(result.final_text.clone()),
        };
        result
    }

    /// Report that the transport delivered a message to `recipient_id`.
    pub async fn confirm_sent(&self, recipient_id: &str) {
        self.limiter.record_sent(recipient_id).await;
    }

    async fn admit(
        &self,
        final_text: String,
        alerts: Vec<String>,
        recipient_id: &str,
    ) -> PipelineResult {
        let admission = if self.atomic_admission {
            self.limiter.try_admit(recipient_id).await
        } else {
            self.limiter.check(recipient_id).await
        };

        let outcome = if admission.is_allowed() {
            Outcome::SentAllowed
        } else {
            Outcome::DeniedRateLimit
        };
        let recorded = self.atomic_admission && admission == Admission::Allowed;

        debug!(recipient = %recipient_id, outcome = ?outcome, "Pipeline decision");

        PipelineResult {
            outcome,
            final_text,
            alerts,
            block_reason: None,
            admission: Some(admission),
            recorded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::compliance::MemoryAuditSink;
    use crate::ratelimit::DenyReason;
    use crate::store::InMemoryCounterStore;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryCounterStore>,
        audit: Arc<MemoryAuditSink>,
        pipeline: GovernancePipeline,
    }

    fn create_test_pipeline(config: &GovernanceConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 10, 6, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryCounterStore::with_clock(clock.clone()));
        let audit = Arc::new(MemoryAuditSink::new());
        let gate = ComplianceGate::with_clock(&config.compliance, audit.clone(), clock.clone())
            .unwrap();
        let limiter = Arc::new(RateLimiter::with_clock(store.clone(), config, clock.clone()));
        let pipeline = GovernancePipeline::new(gate, limiter, config.rate_limit.atomic_admission);
        Harness {
            clock,
            store,
            audit,
            pipeline,
        }
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let h = create_test_pipeline(&GovernanceConfig::default());
        let text = "Olá! Conto com você no domingo.";

        let first = h.pipeline.send(text, "5511999990000", "Comitê 45").await;
        assert_eq!(first.outcome, Outcome::SentAllowed);
        assert!(first.may_send());
        assert!(!first.recorded);

        // Pacing only applies after a recorded send
        let second = h.pipeline.send(text, "5511999990000", "Comitê 45").await;
        assert_eq!(second.outcome, Outcome::SentAllowed);

        h.pipeline.confirm_sent("5511999990000").await;
        h.clock.advance(Duration::from_secs(1));

        let third = h.pipeline.send(text, "5511999990000", "Comitê 45").await;
        assert_eq!(third.outcome, Outcome::DeniedRateLimit);
        assert!(matches!(
            third.admission,
            Some(Admission::Denied(DenyReason::RecipientPacing { .. }))
        ));
        assert_eq!(third.final_text, first.final_text);
    }

    #[tokio::test]
    async fn test_blocked_message_skips_rate_limiter() {
        let h = create_test_pipeline(&GovernanceConfig::default());

        let result = h
            .pipeline
            .send("compro seu voto", "5511999990000", "Comitê 45")
            .await;

        assert_eq!(result.outcome, Outcome::BlockedCompliance);
        assert!(!result.may_send());
        assert_eq!(result.final_text, "compro seu voto");
        assert!(result.block_reason.is_some());
        assert_eq!(result.admission, None);
        assert_eq!(h.store.key_count(), 0);
        assert_eq!(h.audit.len(), 1);
    }

    #[tokio::test]
    async fn test_denied_text_can_be_retried_without_compliance() {
        let h = create_test_pipeline(&GovernanceConfig::default());

        let first = h.pipeline.send("Bom dia!", "alice", "Comitê 45").await;
        h.pipeline.confirm_sent("alice").await;

        let denied = h.pipeline.send("Bom dia!", "alice", "Comitê 45").await;
        assert_eq!(denied.outcome, Outcome::DeniedRateLimit);
        let audited = h.audit.len();

        h.clock.advance(Duration::from_secs(6));
        let retried = h.pipeline.retry(&denied.final_text, "alice").await;
        assert_eq!(retried.outcome, Outcome::SentAllowed);
        assert_eq!(retried.final_text, first.final_text);
        assert_eq!(h.audit.len(), audited, "retry does not re-run compliance");
    }

    #[tokio::test]
    async fn test_empty_recipient_denied() {
        let h = create_test_pipeline(&GovernanceConfig::default());
        let result = h.pipeline.send("Bom dia!", "", "Comitê 45").await;

        assert_eq!(result.outcome, Outcome::DeniedRateLimit);
        assert_eq!(
            result.admission,
            Some(Admission::Denied(DenyReason::InvalidRecipient))
        );
    }

    #[tokio::test]
    async fn test_govern_writes_final_text() {
        let h = create_test_pipeline(&GovernanceConfig::default());

        let mut message = OutboundMessage::new("alice", "Bom dia!");
        let result = h.pipeline.govern(&mut message, "Comitê 45").await;
        assert_eq!(result.outcome, Outcome::SentAllowed);
        assert_eq!(message.final_text.as_deref(), Some(result.final_text.as_str()));
        assert_eq!(message.raw_text, "Bom dia!");

        let mut blocked = OutboundMessage::new("bob", "vou te matar");
        let result = h.pipeline.govern(&mut blocked, "Comitê 45").await;
        assert_eq!(result.outcome, Outcome::BlockedCompliance);
        assert_eq!(blocked.final_text, None);
    }

    #[tokio::test]
    async fn test_send_with_options() {
        let h = create_test_pipeline(&GovernanceConfig::default());
        let result = h
            .pipeline
            .send_with(
                "Bom dia!",
                "alice",
                "Comitê 45",
                PrepareOptions {
                    add_disclaimer: false,
                    add_identification: false,
                },
            )
            .await;
        assert_eq!(result.final_text, "Bom dia!");
    }

    #[tokio::test]
    async fn test_atomic_admission_records() {
        let mut config = GovernanceConfig::default();
        config.rate_limit.atomic_admission = true;
        let h = create_test_pipeline(&config);

        let first = h.pipeline.send("Bom dia!", "alice", "Comitê 45").await;
        assert_eq!(first.outcome, Outcome::SentAllowed);
        assert!(first.recorded);

        let second = h.pipeline.send("Bom dia!", "alice", "Comitê 45").await;
        assert_eq!(second.outcome, Outcome::DeniedRateLimit);
        assert!(!second.recorded);

        let usage = h.pipeline.limiter().daily_usage().await;
        assert_eq!(usage.total_sends, 1);
    }

    #[tokio::test]
    async fn test_unreachable_redis_fails_open() {
        let mut config = GovernanceConfig::default();
        config.store.url = "redis://127.0.0.1:1/".to_string();
        config.store.operation_timeout_ms = 100;

        let pipeline =
            GovernancePipeline::open(&config, Arc::new(MemoryAuditSink::new())).unwrap();

        let started = std::time::Instant::now();
        let result = pipeline.send("Bom dia!", "alice", "Comitê 45").await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.outcome, Outcome::SentAllowed);
        assert_eq!(result.admission, Some(Admission::AllowedDegraded));

        pipeline.confirm_sent("alice").await;
        let usage = pipeline.limiter().daily_usage().await;
        assert!(!usage.store_reachable);
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&Outcome::DeniedRateLimit).unwrap();
        assert_eq!(json, "\"DENIED_RATE_LIMIT\"");
    }

    #[test]
    fn test_from_config_validates() {
        let mut config = GovernanceConfig::default();
        config.rate_limit.global_per_second_ceiling = 0;
        let result = GovernancePipeline::from_config(
            &config,
            Arc::new(InMemoryCounterStore::new()),
            Arc::new(MemoryAuditSink::new()),
        );
        assert!(result.is_err());
    }
}
