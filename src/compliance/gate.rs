//! Content validation and finalization of outbound text.

use std::collections::HashSet;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{debug, warn};

use super::audit::{AuditLogEntry, AuditOutcome, AuditSink};
use super::rules::{
    CLIENT_LABEL_PLACEHOLDER, MAX_MESSAGE_CHARS, TRUNCATE_TO_CHARS, TRUNCATION_MARKER,
};
use crate::clock::{Clock, SystemClock};
use crate::config::ComplianceConfig;
use crate::error::{GovernanceError, Result};

/// Result of validating a text against the content rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplianceDecision {
    pub is_valid: bool,
    /// Review notes that do not block sending
    pub alerts: Vec<String>,
    pub blocked: bool,
    /// Why the text was blocked
    pub reason: Option<String>,
}

/// Which disclosures `prepare_outbound` appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOptions {
    pub add_disclaimer: bool,
    pub add_identification: bool,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            add_disclaimer: true,
            add_identification: true,
        }
    }
}

/// A text that went through the whole gate.
///
/// When `blocked` is set, `final_text` is the untouched input and must not
/// be sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreparedMessage {
    pub final_text: String,
    pub is_valid: bool,
    pub alerts: Vec<String>,
    pub blocked: bool,
    pub reason: Option<String>,
}

#[derive(Debug)]
struct BlockRule {
    name: String,
    regex: Regex,
}

/// Validates, discloses and truncates outbound text.
///
/// Stateless apart from the audit sink; every input yields a decision.
pub struct ComplianceGate {
    block_rules: Vec<BlockRule>,
    soft_alerts: Vec<String>,
    opt_out_keywords: HashSet<String>,
    disclaimer: String,
    disclaimer_marker: String,
    identification_template: String,
    identification_marker: String,
    preview_chars: usize,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ComplianceGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplianceGate")
            .field("block_rules", &self.block_rules.len())
            .field("soft_alerts", &self.soft_alerts.len())
            .field("opt_out_keywords", &self.opt_out_keywords)
            .finish_non_exhaustive()
    }
}

impl ComplianceGate {
    /// Compile the configured rules.
    ///
    /// # Errors
    /// Fails if a block pattern does not compile or a disclosure text does
    /// not contain its own marker (which would break idempotency).
    pub fn new(config: &ComplianceConfig, audit: Arc<dyn AuditSink>) -> Result<Self> {
        Self::with_clock(config, audit, Arc::new(SystemClock::new()))
    }

    /// Like [`new`](Self::new), stamping audit entries with `clock`.
    pub fn with_clock(
        config: &ComplianceConfig,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.disclaimer_marker.is_empty()
            || !config.disclaimer.contains(&config.disclaimer_marker)
        {
            return Err(GovernanceError::Config(
                "compliance.disclaimer must contain compliance.disclaimer_marker".into(),
            ));
        }
        if config.identification_marker.is_empty()
            || !config
                .identification_template
                .contains(&config.identification_marker)
        {
            return Err(GovernanceError::Config(
                "compliance.identification_template must contain compliance.identification_marker"
                    .into(),
            ));
        }

        let block_rules = config
            .hard_block
            .iter()
            .map(|rule| -> Result<BlockRule> {
                let regex = RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .build()?;
                Ok(BlockRule {
                    name: rule.name.clone(),
                    regex,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            block_rules,
            soft_alerts: config
                .soft_alerts
                .iter()
                .map(|t| t.to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            opt_out_keywords: config
                .opt_out_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .collect(),
            disclaimer: config.disclaimer.clone(),
            disclaimer_marker: config.disclaimer_marker.clone(),
            identification_template: config.identification_template.clone(),
            identification_marker: config.identification_marker.clone(),
            preview_chars: config.preview_chars,
            audit,
            clock,
        })
    }

    /// Check `text` against the hard-block, soft-alert and length rules.
    pub fn validate(&self, text: &str) -> ComplianceDecision {
        let reason = self
            .block_rules
            .iter()
            .find(|rule| rule.regex.is_match(text))
            .map(|rule| format!("hard-block rule matched: {}", rule.name));

        let lowered = text.to_lowercase();
        let mut alerts: Vec<String> = self
            .soft_alerts
            .iter()
            .filter(|term| lowered.contains(term.as_str()))
            .map(|term| format!("sensitive term: '{}'", term))
            .collect();

        let length = text.chars().count();
        if length > MAX_MESSAGE_CHARS {
            alerts.push(format!(
                "text has {} characters, over the provider limit of {}; it will be truncated",
                length, MAX_MESSAGE_CHARS
            ));
        }

        let blocked = reason.is_some();
        ComplianceDecision {
            is_valid: !blocked,
            alerts,
            blocked,
            reason,
        }
    }

    /// Append the AI disclosure unless its marker is already present.
    pub fn add_ai_disclaimer(&self, text: &str) -> String {
        if text.contains(&self.disclaimer_marker) {
            return text.to_string();
        }
        format!("{}{}", text, self.disclaimer)
    }

    /// Append the legal identification footer unless its marker is already present.
    pub fn add_legal_identification(&self, text: &str, client_label: &str) -> String {
        if text.contains(&self.identification_marker) {
            return text.to_string();
        }
        let footer = self
            .identification_template
            .replace(CLIENT_LABEL_PLACEHOLDER, client_label);
        format!("{}{}", text, footer)
    }

    /// Whether `text` is exactly an opt-out keyword, ignoring case and
    /// surrounding whitespace.
    pub fn is_opt_out(&self, text: &str) -> bool {
        self.opt_out_keywords.contains(&text.trim().to_lowercase())
    }

    /// Validate, disclose, truncate and audit `text`.
    pub fn prepare_outbound(
        &self,
        text: &str,
        client_label: &str,
        options: PrepareOptions,
    ) -> PreparedMessage {
        let decision = self.validate(text);

        if decision.blocked {
            warn!(
                reason = decision.reason.as_deref().unwrap_or_default(),
                text_length = text.chars().count(),
                "Outbound text blocked"
            );
            self.audit(text, AuditOutcome::Blocked, decision.reason.clone());
            return PreparedMessage {
                final_text: text.to_string(),
                is_valid: false,
                alerts: decision.alerts,
                blocked: true,
                reason: decision.reason,
            };
        }

        let mut final_text = text.to_string();
        if options.add_disclaimer {
            final_text = self.add_ai_disclaimer(&final_text);
        }
        if options.add_identification {
            final_text = self.add_legal_identification(&final_text, client_label);
        }
        let final_text = truncate(final_text);

        if !decision.alerts.is_empty() {
            debug!(alerts = ?decision.alerts, "Outbound text approved with alerts");
        }
        self.audit(&final_text, AuditOutcome::Approved, None);

        PreparedMessage {
            final_text,
            is_valid: true,
            alerts: decision.alerts,
            blocked: false,
            reason: None,
        }
    }

    fn audit(&self, text: &str, outcome: AuditOutcome, reason: Option<String>) {
        let entry = AuditLogEntry::new(self.clock.now(), text, self.preview_chars, outcome, reason);
        self.audit.append(&entry);
    }
}

/// Cut text over the provider ceiling and mark the cut.
fn truncate(text: String) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        return text;
    }
    let mut cut: String = text.chars().take(TRUNCATE_TO_CHARS).collect();
    cut.push_str(TRUNCATION_MARKER);
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::audit::MemoryAuditSink;
    use crate::compliance::rules::{AI_DISCLAIMER_MARKER, LEGAL_IDENTIFICATION_MARKER};
    use crate::config::BlockRuleConfig;

    fn create_test_gate() -> (Arc<MemoryAuditSink>, ComplianceGate) {
        let sink = Arc::new(MemoryAuditSink::new());
        let gate = ComplianceGate::new(&ComplianceConfig::default(), sink.clone()).unwrap();
        (sink, gate)
    }

    #[test]
    fn test_clean_text_is_valid() {
        let (_sink, gate) = create_test_gate();
        let decision = gate.validate("Olá! Nosso comício será sábado às 10h.");

        assert!(decision.is_valid);
        assert!(!decision.blocked);
        assert!(decision.alerts.is_empty());
        assert_eq!(decision.reason, None);
    }

    #[test]
    fn test_vote_buying_blocked() {
        let (_sink, gate) = create_test_gate();

        for text in [
            "Eu COMPRO seu voto por 50 reais",
            "pago o voto de quem aparecer",
            "Voto em troca de cesta",
            "tem pix pra quem votar no 45",
        ] {
            let decision = gate.validate(text);
            assert!(decision.blocked, "expected block for {:?}", text);
            assert!(!decision.is_valid);
            assert_eq!(
                decision.reason.as_deref(),
                Some("hard-block rule matched: vote_buying")
            );
        }
    }

    #[test]
    fn test_threat_blocked() {
        let (_sink, gate) = create_test_gate();
        let decision = gate.validate("Se continuar, vou te matar");
        assert!(decision.blocked);
        assert_eq!(
            decision.reason.as_deref(),
            Some("hard-block rule matched: violent_threat")
        );
    }

    #[test]
    fn test_soft_alerts_do_not_block() {
        let (_sink, gate) = create_test_gate();
        let decision = gate.validate("Resultado GARANTIDO, é uma promessa!");

        assert!(decision.is_valid);
        assert!(!decision.blocked);
        assert_eq!(
            decision.alerts,
            vec![
                "sensitive term: 'garantido'".to_string(),
                "sensitive term: 'promessa'".to_string(),
            ]
        );
    }

    #[test]
    fn test_length_alert() {
        let (_sink, gate) = create_test_gate();
        let decision = gate.validate(&"a".repeat(4097));
        assert!(decision.is_valid);
        assert_eq!(decision.alerts.len(), 1);
        assert!(decision.alerts[0].contains("4096"));

        assert!(gate.validate(&"a".repeat(4096)).alerts.is_empty());
    }

    #[test]
    fn test_disclaimer_idempotent() {
        let (_sink, gate) = create_test_gate();
        let once = gate.add_ai_disclaimer("Bom dia!");
        let twice = gate.add_ai_disclaimer(&once);

        assert!(once.starts_with("Bom dia!"));
        assert!(once.contains(AI_DISCLAIMER_MARKER));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_identification_idempotent() {
        let (_sink, gate) = create_test_gate();
        let once = gate.add_legal_identification("Bom dia!", "Candidata Maria 12");
        let twice = gate.add_legal_identification(&once, "Candidata Maria 12");

        assert!(once.contains("Enviado por Candidata Maria 12"));
        assert!(once.contains(LEGAL_IDENTIFICATION_MARKER));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_opt_out_exact_match() {
        let (_sink, gate) = create_test_gate();
        assert!(gate.is_opt_out("  Parar  "));
        assert!(gate.is_opt_out("SAIR"));
        assert!(gate.is_opt_out("unsubscribe\n"));
        assert!(!gate.is_opt_out("quero parar agora"));
        assert!(!gate.is_opt_out("pararam"));
        assert!(!gate.is_opt_out(""));
    }

    #[test]
    fn test_prepare_appends_in_order() {
        let (sink, gate) = create_test_gate();
        let prepared = gate.prepare_outbound("Bom dia!", "Comitê 45", PrepareOptions::default());

        assert!(prepared.is_valid);
        assert!(!prepared.blocked);
        let disclaimer_at = prepared.final_text.find(AI_DISCLAIMER_MARKER).unwrap();
        let footer_at = prepared.final_text.find(LEGAL_IDENTIFICATION_MARKER).unwrap();
        assert!(disclaimer_at < footer_at);

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Approved);
        assert_eq!(entries[0].text_length, prepared.final_text.chars().count());
    }

    #[test]
    fn test_prepare_respects_options() {
        let (_sink, gate) = create_test_gate();
        let prepared = gate.prepare_outbound(
            "Bom dia!",
            "Comitê 45",
            PrepareOptions {
                add_disclaimer: false,
                add_identification: false,
            },
        );
        assert_eq!(prepared.final_text, "Bom dia!");
    }

    #[test]
    fn test_prepare_empty_text() {
        let (_sink, gate) = create_test_gate();
        let prepared = gate.prepare_outbound("", "Comitê 45", PrepareOptions::default());

        assert!(prepared.is_valid);
        assert!(prepared.final_text.contains(AI_DISCLAIMER_MARKER));
        assert!(prepared.final_text.contains(LEGAL_IDENTIFICATION_MARKER));
    }

    #[test]
    fn test_blocked_regardless_of_options() {
        let (sink, gate) = create_test_gate();
        let text = "compro seu voto";

        for (add_disclaimer, add_identification) in
            [(true, true), (true, false), (false, true), (false, false)]
        {
            let prepared = gate.prepare_outbound(
                text,
                "Comitê 45",
                PrepareOptions {
                    add_disclaimer,
                    add_identification,
                },
            );
            assert!(prepared.blocked);
            assert!(!prepared.is_valid);
            assert_eq!(prepared.final_text, text);
        }

        let entries = sink.entries();
        assert_eq!(entries.len(), 4);
        assert!(entries.iter().all(|e| e.outcome == AuditOutcome::Blocked));
        assert!(entries[0].reason.is_some());
    }

    #[test]
    fn test_truncation_bound() {
        let (_sink, gate) = create_test_gate();

        for len in [0, 4000, 4096, 4097, 10_000] {
            let text = "ç".repeat(len);
            let prepared = gate.prepare_outbound(&text, "Comitê 45", PrepareOptions::default());
            assert!(
                prepared.final_text.chars().count() <= MAX_MESSAGE_CHARS,
                "input of {} chars produced {}",
                len,
                prepared.final_text.chars().count()
            );
        }
    }

    #[test]
    fn test_truncation_marker() {
        let truncated = truncate("x".repeat(5000));
        assert_eq!(truncated.chars().count(), MAX_MESSAGE_CHARS);
        assert!(truncated.ends_with(TRUNCATION_MARKER));

        assert_eq!(truncate("short".to_string()), "short");
    }

    #[test]
    fn test_audit_preview_is_bounded() {
        let (sink, gate) = create_test_gate();
        gate.prepare_outbound(&"b".repeat(3000), "Comitê 45", PrepareOptions::default());

        let entry = &sink.entries()[0];
        assert_eq!(entry.text_preview.chars().count(), 100);
        assert!(entry.text_length > 3000);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let config = ComplianceConfig {
            hard_block: vec![BlockRuleConfig {
                name: "broken".into(),
                pattern: "(unclosed".into(),
            }],
            ..Default::default()
        };
        let err = ComplianceGate::new(&config, Arc::new(MemoryAuditSink::new())).unwrap_err();
        assert!(matches!(err, GovernanceError::Pattern(_)));
    }

    #[test]
    fn test_disclaimer_without_marker_rejected() {
        let config = ComplianceConfig {
            disclaimer: "\n\nGerado automaticamente.".into(),
            ..Default::default()
        };
        let err = ComplianceGate::new(&config, Arc::new(MemoryAuditSink::new())).unwrap_err();
        assert!(matches!(err, GovernanceError::Config(_)));
    }
}
