//! Mean reversion agent: fades stretched prices back toward the recent mean

use async_trait::async_trait;

use super::context::MarketContext;
use super::traits::{AgentKind, SignalAgent};
use crate::domain::{Direction, Signal};
use crate::error::Result;

pub struct MeanReversionAgent {
    id: String,
    /// Prices required before the agent forms a view
    min_history: usize,
    /// Z-score at which the agent starts fading the move
    entry_z: f64,
}

impl MeanReversionAgent {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            min_history: 10,
            entry_z: 1.5,
        }
    }
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

#[async_trait]
impl SignalAgent for MeanReversionAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> AgentKind {
        AgentKind::MeanReversion
    }

    async fn produce_signal(&self, symbol: &str, ctx: &MarketContext) -> Result<Option<Signal>> {
        let prices = ctx.prices_f64();
        if prices.len() < self.min_history {
            return Ok(None);
        }
        let Some(&last) = prices.last() else {
            return Ok(None);
        };
        let (mean, std) = mean_and_std(&prices);
        if std <= f64::EPSILON {
            return Ok(None);
        }

        let z = (last - mean) / std;
        if z.abs() < self.entry_z {
            return Ok(None);
        }

        // Stretched above the mean → expect a move down, and vice versa
        let direction = if z > 0.0 {
            Direction::Short
        } else {
            Direction::Long
        };
        let confidence = (z.abs() / 3.0).min(1.0);
        let strength = ((z.abs() - self.entry_z) / self.entry_z).clamp(0.1, 1.0);

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
