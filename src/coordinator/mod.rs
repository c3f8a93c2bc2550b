//! Agent/task coordinator
//!
//! Owns the agent registry and groups, issues one analysis task per group
//! per cycle, and keeps each agent's performance score current.

pub mod coordinator;
pub mod registry;
pub mod state;

pub use coordinator::{Coordinator, CycleSignals};
pub use registry::{AgentGroup, AgentRegistry};
pub use state::{AgentSnapshot, AgentState, INITIAL_PERFORMANCE_SCORE};
