//! MarketContext: what an agent sees for one symbol in one cycle

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

use crate::exchange::Ticker;

#[derive(Debug, Clone, Serialize)]
pub struct MarketContext {
    pub ticker: Ticker,
    /// Oldest first, latest price last
    pub recent_prices: Vec<Decimal>,
    /// Oldest first, latest volume last
    pub recent_volumes: Vec<Decimal>,
    pub as_of: DateTime<Utc>,
}

impl MarketContext {
    pub fn new(ticker: Ticker, as_of: DateTime<Utc>) -> Self {
        Self {
            recent_prices: vec![ticker.price],
            recent_volumes: vec![ticker.volume],
            ticker,
            as_of,
        }
    }

    pub fn prices_f64(&self) -> Vec<f64> {
        self.recent_prices.iter().filter_map(|p| p.to_f64()).collect()
    }

    pub fn volumes_f64(&self) -> Vec<f64> {
        self.recent_volumes.iter().filter_map(|v| v.to_f64()).collect()
    }
}

/// Bounded per-symbol ticker history used to build contexts
#[derive(Debug, Default)]
pub struct MarketHistory {
    capacity: usize,
    series: HashMap<String, VecDeque<(Decimal, Decimal)>>,
}

impl MarketHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            series: HashMap::new(),
        }
    }

    /// Record a ticker and return the context including it
    pub fn record(&mut self, ticker: Ticker, as_of: DateTime<Utc>) -> MarketContext {
        let window = self.series.entry(ticker.symbol.clone()).or_default();
        window.push_back((ticker.price, ticker.volume));
        while window.len() > self.capacity {
            window.pop_front();
        }
        MarketContext {
            recent_prices: window.iter().map(|(p, _)| *p).collect(),
            recent_volumes: window.iter().map(|(_, v)| *v).collect(),
            ticker,
            as_of,
        }
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.series.get(symbol).map_or(0, |w| w.len())
    }
}
