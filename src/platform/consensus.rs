//! Consensus Aggregator
//!
//! Folds independent directional signals into one decision:
//!
//! ```text
//! score(d)   = Σ confidence_i * strength_i   over signals with direction d
//! direction  = argmax(score(long), score(short))
//! confidence = |score(long) - score(short)| / (score(long) + score(short))
//! ```
//!
//! Signals are summed in a canonical order (agent id, then direction) so the
//! same set always produces the same decision, whatever order the agents
//! answered in.

use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::domain::{Decision, Direction, Signal};

/// Why no decision was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoDecisionReason {
    NoSignals,
    ZeroScore,
    /// Long and short scores are exactly equal
    Tie,
}

impl std::fmt::Display for NoDecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoDecisionReason::NoSignals => write!(f, "no signals"),
            NoDecisionReason::ZeroScore => write!(f, "zero total score"),
            NoDecisionReason::Tie => write!(f, "tied scores"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Consensus {
    Decision(Decision),
    NoDecision(NoDecisionReason),
}

impl Consensus {
    pub fn decision(self) -> Option<Decision> {
        match self {
            Consensus::Decision(d) => Some(d),
            Consensus::NoDecision(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsensusAggregator;

impl ConsensusAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Aggregate signals for a single symbol with unit weights
    pub fn aggregate(&self, signals: &[Signal]) -> Consensus {
        self.aggregate_weighted(signals, &HashMap::new())
    }

    /// Aggregate signals for a single symbol, scaling each signal's strength by
    /// its agent's weight (missing agents weigh 1.0).
    ///
    /// Signals for a different symbol than the first are ignored.
    pub fn aggregate_weighted(
        &self,
        signals: &[Signal],
        weights: &HashMap<String, f64>,
    ) -> Consensus {
        let Some(first) = signals.first() else {
            return Consensus::NoDecision(NoDecisionReason::NoSignals);
        };
        let symbol = first.symbol.as_str();

        let mut ordered: Vec<&Signal> = signals.iter().filter(|s| s.symbol == symbol).collect();
        if ordered.len() != signals.len() {
            debug!(
                symbol,
                ignored = signals.len() - ordered.len(),
                "ignoring signals for other symbols"
            );
        }
        ordered.sort_by(|a, b| {
            a.agent_id
                .cmp(&b.agent_id)
                .then_with(|| a.direction.as_str().cmp(b.direction.as_str()))
        });

        let mut long_score = 0.0;
        let mut short_score = 0.0;
        for signal in &ordered {
            let weight = weights
                .get(&signal.agent_id)
                .copied()
                .filter(|w| w.is_finite() && *w >= 0.0)
                .unwrap_or(1.0);
            let score = signal.score() * weight;
            match signal.direction {
                Direction::Long => long_score += score,
                Direction::Short => short_score += score,
            }
        }

        let total = long_score + short_score;
        if total <= 0.0 {
            return Consensus::NoDecision(NoDecisionReason::ZeroScore);
        }
        if long_score == short_score {
            return Consensus::NoDecision(NoDecisionReason::Tie);
        }

        let direction = if long_score > short_score {
            Direction::Long
        } else {
            Direction::Short
        };
        let confidence = ((long_score - short_score).abs() / total).clamp(0.0, 1.0);

        Consensus::Decision(Decision {
            symbol: symbol.to_string(),
            direction,
            confidence,
            signal_count: ordered.len(),
            contributors: ordered
                .iter()
                .map(|s| (s.agent_id.clone(), s.direction))
                .collect(),
        })
    }

    /// Group signals by symbol and aggregate each group
    pub fn aggregate_by_symbol(
        &self,
        signals: &[Signal],
        weights: &HashMap<String, f64>,
    ) -> BTreeMap<String, Consensus> {
        let mut grouped: BTreeMap<String, Vec<Signal>> = BTreeMap::new();
        for signal in signals {
            grouped
                .entry(signal.symbol.clone())
                .or_default()
                .push(signal.clone());
        }
        grouped
            .into_iter()
            .map(|(symbol, group)| {
                let consensus = self.aggregate_weighted(&group, weights);
                (symbol, consensus)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn signal(agent: &str, direction: Direction, confidence: f64, strength: f64) -> Signal {
        Signal::new(agent, "BTCUSDT", direction, confidence, strength, Utc::now())
    }

    #[test]
    fn test_long_wins_with_expected_confidence() {
        let signals = vec![
            signal("a", Direction::Long, 0.8, 1.0),
            signal("b", Direction::Short, 0.6, 1.0),
        ];
        let aggregator = ConsensusAggregator::new();
        for _ in 0..10 {
            let decision = aggregator.aggregate(&signals).decision().unwrap();
            assert_eq!(decision.direction, Direction::Long);
            assert_relative_eq!(decision.confidence, 0.2 / 1.4, epsilon = 1e-12);
            assert_eq!(decision.signal_count, 2);
        }
    }

    #[test]
    fn test_empty_and_zero_scores() {
        let aggregator = ConsensusAggregator::new();
        assert!(matches!(
            aggregator.aggregate(&[]),
            Consensus::NoDecision(NoDecisionReason::NoSignals)
        ));
        let zeros = vec![
            signal("a", Direction::Long, 0.0, 1.0),
            signal("b", Direction::Short, 0.9, 0.0),
        ];
        assert!(matches!(
            aggregator.aggregate(&zeros),
            Consensus::NoDecision(NoDecisionReason::ZeroScore)
        ));
    }

    #[test]
    fn test_exact_tie_is_no_decision() {
        let signals = vec![
            signal("a", Direction::Long, 0.5, 1.0),
            signal("b", Direction::Short, 0.5, 1.0),
        ];
        assert!(matches!(
            ConsensusAggregator::new().aggregate(&signals),
            Consensus::NoDecision(NoDecisionReason::Tie)
        ));
    }

    #[test]
    fn test_order_independent() {
        let mut signals = vec![
            signal("c", Direction::Short, 0.3, 0.7),
            signal("a", Direction::Long, 0.9, 0.4),
            signal("b", Direction::Long, 0.1, 2.0),
        ];
        let aggregator = ConsensusAggregator::new();
        let first = aggregator.aggregate(&signals).decision().unwrap();
        signals.reverse();
        let second = aggregator.aggregate(&signals).decision().unwrap();
        assert_eq!(first.confidence.to_bits(), second.confidence.to_bits());
        assert_eq!(first.contributors, second.contributors);
    }

    #[test]
    fn test_weights_can_flip_direction() {
        let signals = vec![
            signal("a", Direction::Long, 0.8, 1.0),
            signal("b", Direction::Short, 0.6, 1.0),
        ];
        let weights = HashMap::from([("a".to_string(), 0.5), ("b".to_string(), 1.5)]);
        let decision = ConsensusAggregator::new()
            .aggregate_weighted(&signals, &weights)
            .decision()
            .unwrap();
        assert_eq!(decision.direction, Direction::Short);
    }

    #[test]
    fn test_by_symbol_grouping() {
        let signals = vec![
            signal("a", Direction::Long, 0.8, 1.0),
            Signal::new("a", "ETHUSDT", Direction::Short, 0.7, 1.0, Utc::now()),
        ];
        let grouped = ConsensusAggregator::new().aggregate_by_symbol(&signals, &HashMap::new());
        assert_eq!(grouped.len(), 2);
        let eth = grouped.get("ETHUSDT").cloned().unwrap().decision().unwrap();
        assert_eq!(eth.direction, Direction::Short);
        assert_relative_eq!(eth.confidence, 1.0);
    }
}
