//! Order parameter computation and validation

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::config::RiskConfig;
use crate::domain::Direction;
use crate::error::ExecutionError;

/// Contract quantity precision
const QTY_DP: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderParams {
    pub entry_price: Decimal,
    pub qty: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub trailing_stop_distance: Decimal,
}

impl OrderParams {
    /// Derive order parameters for a position of `size` margin at `entry`.
    ///
    /// `stop_loss = entry * (1 ∓ sl_pct)`, `take_profit = entry * (1 ± tp_pct)`,
    /// `trailing = entry * trailing_pct`, `qty = size * leverage / entry`
    /// rounded down to 6 dp.
    pub fn compute(
        direction: Direction,
        entry: Decimal,
        size: Decimal,
        leverage: u32,
        risk: &RiskConfig,
    ) -> Result<Self, ExecutionError> {
        if entry <= Decimal::ZERO {
            return Err(ExecutionError::InvalidParameters(format!(
                "entry price must be positive, got {entry}"
            )));
        }
        let notional = size * Decimal::from(leverage);
        let qty = (notional / entry).round_dp_with_strategy(QTY_DP, RoundingStrategy::ToZero);
        let sign = direction.sign();

        let params = Self {
            entry_price: entry,
            qty,
            stop_loss: entry * (Decimal::ONE - sign * risk.stop_loss_pct),
            take_profit: entry * (Decimal::ONE + sign * risk.take_profit_pct),
            trailing_stop_distance: entry * risk.trailing_stop_pct,
        };
        params.validate(direction)?;
        Ok(params)
    }

    /// qty > 0, price > 0 and stop/entry/target ordered for the direction
    pub fn validate(&self, direction: Direction) -> Result<(), ExecutionError> {
        if self.qty <= Decimal::ZERO {
            return Err(ExecutionError::InvalidParameters(format!(
                "quantity must be positive, got {}",
                self.qty
            )));
        }
        if self.entry_price <= Decimal::ZERO {
            return Err(ExecutionError::InvalidParameters(format!(
                "entry price must be positive, got {}",
                self.entry_price
            )));
        }
        let ordered = match direction {
            Direction::Long => {
                self.stop_loss < self.entry_price && self.entry_price < self.take_profit
            }
            Direction::Short => {
                self.take_profit < self.entry_price && self.entry_price < self.stop_loss
            }
        };
        if !ordered {
            return Err(ExecutionError::InvalidParameters(format!(
                "{direction} bracket out of order: sl={} entry={} tp={}",
                self.stop_loss, self.entry_price, self.take_profit
            )));
        }
        Ok(())
    }
}
