//! Compliance gate: content rules, mandatory disclosures and the audit trail.

pub mod audit;
mod gate;
pub mod rules;

pub use audit::{
    AuditLogEntry, AuditOutcome, AuditSink, JsonLinesAuditSink, MemoryAuditSink,
    TracingAuditSink,
};
pub use gate::{ComplianceDecision, ComplianceGate, PrepareOptions, PreparedMessage};
