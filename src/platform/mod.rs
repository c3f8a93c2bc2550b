//! Admission-side building blocks shared by the engine
//!
//! - Capital ledger: reserve/release with conservation invariant
//! - Consensus aggregator: signals → one decision

pub mod consensus;
pub mod ledger;

pub use consensus::{Consensus, ConsensusAggregator, NoDecisionReason};
pub use ledger::{CapitalLedger, CapitalSnapshot, LedgerConfig};
