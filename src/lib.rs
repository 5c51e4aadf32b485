//! Outbound Gate - Governance pipeline for outbound messages
//!
//! Every message a conversational system wants to send to an external
//! contact passes two gates: a compliance gate (blocked content, mandatory
//! disclosures, size limits) and a distributed rate limiter backed by a
//! shared counter store (global per-second ceiling, per-recipient pacing,
//! daily unique-contact cap, suppression windows).

pub mod clock;
pub mod compliance;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod ratelimit;
pub mod store;

pub use compliance::{ComplianceDecision, ComplianceGate, PrepareOptions, PreparedMessage};
pub use config::GovernanceConfig;
pub use error::{GovernanceError, Result};
pub use pipeline::{GovernancePipeline, OutboundMessage, Outcome, PipelineResult};
pub use ratelimit::{Admission, DenyReason, RateLimiter, UsageReport};
