//! Validation, repair and control of an online table migration.
//!
//! A [`Validator`] compares a base store against a target store in both
//! directions and publishes one [`migrator_core::InconsistentEvent`] per
//! divergence. A [`FixerConsumer`] drains those events and converges the
//! target through an [`OverrideFixer`]. The [`Scheduler`] owns the dual-write
//! pattern and the single-flight validation runs.

mod call;
pub mod fixer;
pub mod scheduler;
pub mod validator;

#[cfg(test)]
mod testing;

pub use fixer::{FixOutcome, FixerConsumer, OverrideFixer};
pub use scheduler::{RunStatus, RunWatch, Scheduler, SchedulerStatus, ValidatorSettings};
pub use validator::{ScanMode, ScanReport, Validator, MAX_BATCH_SIZE};
