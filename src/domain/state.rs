use serde::{Deserialize, Serialize};
use std::fmt;

/// Trade lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeState {
    /// Decision received, capital not yet reserved
    Pending,
    /// Capital reserved, order not yet confirmed
    Admitted,
    /// Order confirmed by the gateway
    Open,
    /// Supervision loop running
    Monitoring,
    /// Closed on take-profit / profit threshold
    ClosedProfit,
    /// Closed on stop-loss / trailing stop
    ClosedStop,
    /// Never opened, or aborted
    Failed,
}

impl TradeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeState::Pending => "PENDING",
            TradeState::Admitted => "ADMITTED",
            TradeState::Open => "OPEN",
            TradeState::Monitoring => "MONITORING",
            TradeState::ClosedProfit => "CLOSED_PROFIT",
            TradeState::ClosedStop => "CLOSED_STOP",
            TradeState::Failed => "FAILED",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: TradeState) -> bool {
        use TradeState::*;

        match (self, target) {
            // From Pending: only through a successful reservation
            (Pending, Admitted) => true,

            // From Admitted
            (Admitted, Open) => true,   // Gateway confirmed the order
            (Admitted, Failed) => true, // Invalid parameters / rejection / timeout

            // From Open
            (Open, Monitoring) => true,
            (Open, Failed) => true, // Cancelled before supervision started

            // From Monitoring
            (Monitoring, ClosedProfit) => true,
            (Monitoring, ClosedStop) => true,
            (Monitoring, Failed) => true, // Sustained query failure / cancellation

            // All other transitions are invalid
            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<TradeState> {
        use TradeState::*;

        match self {
            Pending => vec![Admitted],
            Admitted => vec![Open, Failed],
            Open => vec![Monitoring, Failed],
            Monitoring => vec![ClosedProfit, ClosedStop, Failed],
            ClosedProfit | ClosedStop | Failed => vec![],
        }
    }

    /// Holds reserved capital
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TradeState::Admitted | TradeState::Open | TradeState::Monitoring
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeState::ClosedProfit | TradeState::ClosedStop | TradeState::Failed
        )
    }
}

impl fmt::Display for TradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TradeState {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(TradeState::Pending),
            "ADMITTED" => Ok(TradeState::Admitted),
            "OPEN" => Ok(TradeState::Open),
            "MONITORING" => Ok(TradeState::Monitoring),
            "CLOSED_PROFIT" => Ok(TradeState::ClosedProfit),
            "CLOSED_STOP" => Ok(TradeState::ClosedStop),
            "FAILED" => Ok(TradeState::Failed),
            _ => Err(format!("Unknown state: {}", s)),
        }
    }
}

/// State transition event (for logging/debugging)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TradeState,
    pub to: TradeState,
    pub reason: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl StateTransition {
    pub fn new(
        from: TradeState,
        to: TradeState,
        reason: impl Into<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use TradeState::*;

        assert!(Pending.can_transition_to(Admitted));
        assert!(Admitted.can_transition_to(Open));
        assert!(Admitted.can_transition_to(Failed));
        assert!(Open.can_transition_to(Monitoring));
        assert!(Monitoring.can_transition_to(ClosedProfit));
        assert!(Monitoring.can_transition_to(ClosedStop));

        // Invalid transitions
        assert!(!Pending.can_transition_to(Open));
        assert!(!Pending.can_transition_to(Monitoring));
        assert!(!Open.can_transition_to(ClosedProfit));
        assert!(!ClosedProfit.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Admitted));
    }

    #[test]
    fn test_table_matches_predicate() {
        use TradeState::*;
        let all = [Pending, Admitted, Open, Monitoring, ClosedProfit, ClosedStop, Failed];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    from.valid_transitions().contains(&to),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_state_from_str() {
        assert_eq!(TradeState::try_from("OPEN").unwrap(), TradeState::Open);
        assert_eq!(
            TradeState::try_from("closed_stop").unwrap(),
            TradeState::ClosedStop
        );
        assert!(TradeState::try_from("INVALID").is_err());
    }

    #[test]
    fn test_active_and_terminal() {
        assert!(!TradeState::Pending.is_active());
        assert!(TradeState::Admitted.is_active());
        assert!(TradeState::Monitoring.is_active());
        assert!(TradeState::Failed.is_terminal());
        assert!(!TradeState::Open.is_terminal());
    }
}
