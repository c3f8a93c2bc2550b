use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Decision, Direction, StateTransition, TradeState};
use crate::error::{PaceError, Result};

pub type TradeId = Uuid;

/// One admitted trading action and its lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub symbol: String,
    pub direction: Direction,
    /// Margin reserved in the capital ledger
    pub size: Decimal,
    /// Contract quantity (size * leverage / entry)
    pub qty: Decimal,
    pub leverage: u32,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub trailing_stop_distance: Decimal,
    pub state: TradeState,
    pub order_id: Option<String>,
    pub decision_confidence: f64,
    pub contributors: Vec<(String, Direction)>,
    pub created_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub failure_reason: Option<String>,
    pub transitions: Vec<StateTransition>,
}

impl Trade {
    /// New trade in `Pending` for a consensus decision
    pub fn pending(decision: &Decision, size: Decimal, leverage: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: decision.symbol.clone(),
            direction: decision.direction,
            size,
            qty: Decimal::ZERO,
            leverage,
            entry_price: Decimal::ZERO,
            stop_loss: Decimal::ZERO,
            take_profit: Decimal::ZERO,
            trailing_stop_distance: Decimal::ZERO,
            state: TradeState::Pending,
            order_id: None,
            decision_confidence: decision.confidence,
            contributors: decision.contributors.clone(),
            created_at: now,
            opened_at: None,
            closed_at: None,
            exit_price: None,
            realized_pnl: None,
            failure_reason: None,
            transitions: Vec::new(),
        }
    }

    /// Move to `to`, rejecting anything outside the transition table
    pub fn transition(
        &mut self,
        to: TradeState,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(PaceError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.transitions
            .push(StateTransition::new(self.state, to, reason, now));
        self.state = to;
        if to.is_terminal() {
            self.closed_at = Some(now);
        }
        Ok(())
    }

    /// PnL at `mark` for the full quantity
    pub fn pnl_at(&self, mark: Decimal) -> Decimal {
        (mark - self.entry_price) * self.qty * self.direction.sign()
    }

    /// Favourable price move from entry as a fraction of entry
    pub fn favourable_move_pct(&self, mark: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (mark - self.entry_price) * self.direction.sign() / self.entry_price
    }

    /// Whether the trade passed through `state` at any point
    pub fn visited(&self, state: TradeState) -> bool {
        self.state == state || self.transitions.iter().any(|t| t.from == state || t.to == state)
    }
}
