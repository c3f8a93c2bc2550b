//! Exit rules evaluated on every monitor poll

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::RiskConfig;
use crate::domain::{Direction, Trade, TradeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit,
    MinProfit,
    MaxHoldTime,
    /// Position gone from the exchange (server-side bracket or manual close)
    ClosedOnExchange,
    /// Engine stop with flattening enabled
    Flattened,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::MinProfit => "min_profit",
            ExitReason::MaxHoldTime => "max_hold_time",
            ExitReason::ClosedOnExchange => "closed_on_exchange",
            ExitReason::Flattened => "flattened",
        }
    }

    /// Terminal state for an exit at `pnl`
    pub fn terminal_state(&self, pnl: Decimal) -> TradeState {
        match self {
            ExitReason::StopLoss | ExitReason::TrailingStop => TradeState::ClosedStop,
            ExitReason::TakeProfit | ExitReason::MinProfit => TradeState::ClosedProfit,
            ExitReason::MaxHoldTime | ExitReason::ClosedOnExchange | ExitReason::Flattened => {
                if pnl > Decimal::ZERO {
                    TradeState::ClosedProfit
                } else {
                    TradeState::ClosedStop
                }
            }
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ExitRules {
    pub min_profit: Decimal,
    pub trailing_activation_pct: Decimal,
    pub max_hold: Duration,
}

impl ExitRules {
    pub fn from_risk(risk: &RiskConfig) -> Self {
        Self {
            min_profit: risk.min_profit,
            trailing_activation_pct: risk.trailing_activation_pct,
            max_hold: Duration::seconds(risk.max_hold_secs as i64),
        }
    }
}

/// Per-trade trailing state carried between polls
#[derive(Debug, Clone, Serialize)]
pub struct TrailingState {
    /// Best mark seen (highest for long, lowest for short)
    pub best_mark: Decimal,
    /// Armed stop level
    pub stop: Option<Decimal>,
}

impl TrailingState {
    pub fn new(entry: Decimal) -> Self {
        Self {
            best_mark: entry,
            stop: None,
        }
    }

    fn update(&mut self, trade: &Trade, mark: Decimal, activation_pct: Decimal) {
        let improved = match trade.direction {
            Direction::Long => mark > self.best_mark,
            Direction::Short => mark < self.best_mark,
        };
        if improved {
            self.best_mark = mark;
        }
        let armed = self.stop.is_some()
            || trade.favourable_move_pct(self.best_mark) >= activation_pct;
        if armed {
            let level = self.best_mark - trade.direction.sign() * trade.trailing_stop_distance;
            // Ratchets only in the trade's favour
            self.stop = Some(match (self.stop, trade.direction) {
                (Some(prev), Direction::Long) => prev.max(level),
                (Some(prev), Direction::Short) => prev.min(level),
                (None, _) => level,
            });
        }
    }

    fn breached(&self, direction: Direction, mark: Decimal) -> bool {
        match (self.stop, direction) {
            (Some(stop), Direction::Long) => mark <= stop,
            (Some(stop), Direction::Short) => mark >= stop,
            (None, _) => false,
        }
    }
}

/// Decide whether the trade should close at `mark`.
///
/// Stops are checked before profit targets so a gap through both closes
/// as a stop.
pub fn evaluate(
    trade: &Trade,
    trailing: &mut TrailingState,
    mark: Decimal,
    now: DateTime<Utc>,
    rules: &ExitRules,
) -> Option<ExitReason> {
    trailing.update(trade, mark, rules.trailing_activation_pct);

    let stop_hit = match trade.direction {
        Direction::Long => mark <= trade.stop_loss,
        Direction::Short => mark >= trade.stop_loss,
    };
    if stop_hit {
        return Some(ExitReason::StopLoss);
    }
    if trailing.breached(trade.direction, mark) {
        return Some(ExitReason::TrailingStop);
    }

    let target_hit = match trade.direction {
        Direction::Long => mark >= trade.take_profit,
        Direction::Short => mark <= trade.take_profit,
    };
    if target_hit {
        return Some(ExitReason::TakeProfit);
    }
    if trade.pnl_at(mark) >= rules.min_profit {
        return Some(ExitReason::MinProfit);
    }

    let held_since = trade.opened_at.unwrap_or(trade.created_at);
    if now - held_since >= rules.max_hold {
        return Some(ExitReason::MaxHoldTime);
    }
    None
}
