//! Admission cadence

pub mod cadence;

pub use cadence::{CadenceScheduler, CadenceStats, SkipReason, TickDecision};
