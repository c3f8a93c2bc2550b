use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::OrderSide;

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    pub fn entry_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A directional opinion from one agent about one symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub agent_id: String,
    pub symbol: String,
    pub direction: Direction,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Non-negative signal strength
    pub strength: f64,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        agent_id: &str,
        symbol: &str,
        direction: Direction,
        confidence: f64,
        strength: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            symbol: symbol.to_string(),
            direction,
            confidence: sanitize(confidence).clamp(0.0, 1.0),
            strength: sanitize(strength).max(0.0),
            timestamp,
        }
    }

    /// Contribution to its direction's score
    pub fn score(&self) -> f64 {
        self.confidence * self.strength
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Consensus outcome for one symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub direction: Direction,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub signal_count: usize,
    /// Agents that contributed, with the direction each voted for
    pub contributors: Vec<(String, Direction)>,
}
