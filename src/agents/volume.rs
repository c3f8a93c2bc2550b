//! Volume breakout agent: trades with price moves backed by unusual volume

use async_trait::async_trait;

use super::context::MarketContext;
use super::traits::{AgentKind, SignalAgent};
use crate::domain::{Direction, Signal};
use crate::error::Result;

pub struct VolumeBreakoutAgent {
    id: String,
    /// Earlier volume samples needed for a baseline
    min_baseline: usize,
    /// Latest / baseline volume ratio that counts as a breakout
    breakout_ratio: f64,
}

impl VolumeBreakoutAgent {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            min_baseline: 5,
            breakout_ratio: 1.2,
        }
    }
}

#[async_trait]
impl SignalAgent for VolumeBreakoutAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> AgentKind {
        AgentKind::VolumeBreakout
    }

    async fn produce_signal(&self, symbol: &str, ctx: &MarketContext) -> Result<Option<Signal>> {
        let volumes = ctx.volumes_f64();
        let prices = ctx.prices_f64();
        let Some((&latest, baseline)) = volumes.split_last() else {
            return Ok(None);
        };
        if baseline.len() < self.min_baseline || prices.len() < 2 {
            return Ok(None);
        }

        let mean = baseline.iter().sum::<f64>() / baseline.len() as f64;
        if mean <= 0.0 {
            return Ok(None);
        }
        let ratio = latest / mean;
        if ratio < self.breakout_ratio {
            return Ok(None);
        }

        let prev = prices[prices.len() - 2];
        let last = prices[prices.len() - 1];
        let direction = if last > prev {
            Direction::Long
        } else if last < prev {
            Direction::Short
        } else {
            return Ok(None);
        };

        let confidence = ((ratio - 1.0) / 2.0).min(1.0);
        let strength = (ratio / (2.0 * self.breakout_ratio)).min(1.0);

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
