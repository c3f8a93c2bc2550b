//! Momentum agent: follows the recent price move

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;

use super::context::MarketContext;
use super::traits::{AgentKind, SignalAgent};
use crate::domain::{Direction, Signal};
use crate::error::Result;

pub struct MomentumAgent {
    id: String,
    /// Moves smaller than this (fraction) carry no view
    min_move: f64,
    /// Move at which strength saturates
    full_scale: f64,
}

impl MomentumAgent {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            min_move: 0.0005,
            full_scale: 0.01,
        }
    }

    fn window_move(ctx: &MarketContext) -> Option<f64> {
        let prices = ctx.prices_f64();
        let (first, last) = (*prices.first()?, *prices.last()?);
        if prices.len() < 2 || first <= 0.0 {
            return None;
        }
        Some((last - first) / first)
    }
}

#[async_trait]
impl SignalAgent for MomentumAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Momentum
    }

    async fn produce_signal(&self, symbol: &str, ctx: &MarketContext) -> Result<Option<Signal>> {
        let daily = ctx.ticker.change_pct.to_f64().unwrap_or(0.0);
        let short = Self::window_move(ctx).unwrap_or(daily);
        if short.abs() < self.min_move {
            return Ok(None);
        }

        let direction = if short > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        };
        // Short-term move confirmed by the daily trend
        let confirmed = daily != 0.0 && daily.signum() == short.signum();
        let confidence = if confirmed { 0.8 } else { 0.5 };
        let strength = (short.abs() / self.full_scale).min(1.0);

        Ok(Some(Signal::new(
            &self.id,
            symbol,
            direction,
            confidence,
            strength,
            ctx.as_of,
        )))
    }
}
