//! Agent state owned by the coordinator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::agents::{AgentKind, SignalAgent};

/// Starting performance score for every agent
pub const INITIAL_PERFORMANCE_SCORE: f64 = 0.5;

/// Weight on the previous score in the performance EMA
const SCORE_DECAY: f64 = 0.95;

/// Registry entry: the agent plus its running scores
pub struct AgentState {
    pub agent: Arc<dyn SignalAgent>,
    pub group_id: String,
    /// EMA of observed trade outcomes in [0, 1]
    pub performance_score: f64,
    /// Confidence of the agent's most recent signal
    pub confidence: f64,
    pub active: bool,
    pub signals_produced: u64,
    pub failures: u64,
    pub outcomes_recorded: u64,
    pub last_signal_at: Option<DateTime<Utc>>,
}

impl AgentState {
    pub fn new(agent: Arc<dyn SignalAgent>, group_id: &str) -> Self {
        Self {
            agent,
            group_id: group_id.to_string(),
            performance_score: INITIAL_PERFORMANCE_SCORE,
            confidence: 0.0,
            active: true,
            signals_produced: 0,
            failures: 0,
            outcomes_recorded: 0,
            last_signal_at: None,
        }
    }

    /// `score = score * 0.95 + outcome * 0.05`
    pub fn record_outcome(&mut self, outcome: f64) {
        let outcome = outcome.clamp(0.0, 1.0);
        self.performance_score =
            self.performance_score * SCORE_DECAY + outcome * (1.0 - SCORE_DECAY);
        self.outcomes_recorded += 1;
    }

    /// Multiplier applied to this agent's signal strength
    pub fn weight(&self) -> f64 {
        0.5 + self.performance_score
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: self.agent.id().to_string(),
            kind: self.agent.kind(),
            group_id: self.group_id.clone(),
            performance_score: self.performance_score,
            confidence: self.confidence,
            active: self.active,
            signals_produced: self.signals_produced,
            failures: self.failures,
            outcomes_recorded: self.outcomes_recorded,
            last_signal_at: self.last_signal_at,
        }
    }
}

/// Per-agent view exposed through engine status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub kind: AgentKind,
    pub group_id: String,
    pub performance_score: f64,
    pub confidence: f64,
    pub active: bool,
    pub signals_produced: u64,
    pub failures: u64,
    pub outcomes_recorded: u64,
    pub last_signal_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ema_update() {
        let mut state = AgentState::new(AgentKind::Momentum.build("m"), "trend");
        state.record_outcome(1.0);
        assert_relative_eq!(state.performance_score, 0.525, epsilon = 1e-12);
        state.record_outcome(0.0);
        assert_relative_eq!(state.performance_score, 0.49875, epsilon = 1e-12);
        assert_eq!(state.outcomes_recorded, 2);
    }

    #[test]
    fn test_score_converges_towards_outcomes() {
        let mut state = AgentState::new(AgentKind::Momentum.build("m"), "trend");
        for _ in 0..200 {
            state.record_outcome(1.0);
        }
        assert!(state.performance_score > 0.99);
        assert!(state.weight() > 1.49);
    }
}
