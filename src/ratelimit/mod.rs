//! Rate limiting logic: admission checks over the shared counter store.

mod checks;
mod limiter;
mod usage;

pub use checks::{evaluate, Admission, AdmissionLimits, DenyReason};
pub use limiter::RateLimiter;
pub use usage::UsageReport;
