//! Timeout and fallback wrapper around a gateway
//!
//! Every call carries its own deadline. Price reads that fail transiently
//! (timeout, rate limit, unavailable) fall back to the last ticker seen
//! for the symbol as long as it is younger than the cache TTL.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::traits::{GatewayResult, MarketGateway, PositionInfo, Ticker};
use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::domain::{OrderAck, OrderRequest};
use crate::error::GatewayError;

pub struct GuardedGateway {
    inner: Arc<dyn MarketGateway>,
    config: GatewayConfig,
    clock: Arc<dyn Clock>,
    ticker_cache: RwLock<HashMap<String, Ticker>>,
    cache_fallbacks: AtomicU64,
    timeouts: AtomicU64,
}

impl GuardedGateway {
    pub fn new(inner: Arc<dyn MarketGateway>, config: GatewayConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            config,
            clock,
            ticker_cache: RwLock::new(HashMap::new()),
            cache_fallbacks: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Number of price reads served from cache
    pub fn cache_fallbacks(&self) -> u64 {
        self.cache_fallbacks.load(Ordering::Relaxed)
    }

    /// Number of calls that hit their deadline
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Last ticker seen for `symbol`, regardless of age
    pub async fn last_known(&self, symbol: &str) -> Option<Ticker> {
        self.ticker_cache.read().await.get(symbol).cloned()
    }

    async fn with_deadline<T, F>(&self, operation: &str, timeout_ms: u64, fut: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
            Ok(result) => result,
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(GatewayError::Timeout {
                    operation: operation.to_string(),
                    elapsed_ms: timeout_ms,
                })
            }
        }
    }

    async fn cached_ticker(&self, symbol: &str) -> Option<Ticker> {
        let cache = self.ticker_cache.read().await;
        let ticker = cache.get(symbol)?;
        let age = self.clock.now() - ticker.timestamp;
        let ttl = ChronoDuration::milliseconds(self.config.ticker_cache_ttl_ms as i64);
        if age <= ttl {
            Some(ticker.clone())
        } else {
            None
        }
    }
}

#[async_trait]
impl MarketGateway for GuardedGateway {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_ticker(&self, symbol: &str) -> GatewayResult<Ticker> {
        let result = self
            .with_deadline(
                "get_ticker",
                self.config.ticker_timeout_ms,
                self.inner.get_ticker(symbol),
            )
            .await;

        match result {
            Ok(ticker) => {
                self.ticker_cache
                    .write()
                    .await
                    .insert(symbol.to_string(), ticker.clone());
                Ok(ticker)
            }
            Err(e) if e.is_transient() => match self.cached_ticker(symbol).await {
                Some(cached) => {
                    self.cache_fallbacks.fetch_add(1, Ordering::Relaxed);
                    debug!(symbol, error = %e, "serving cached ticker");
                    Ok(cached)
                }
                None => {
                    warn!(symbol, error = %e, "ticker unavailable and no fresh cache");
                    Err(e)
                }
            },
            Err(e) => Err(e),
        }
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()> {
        self.with_deadline(
            "set_leverage",
            self.config.order_timeout_ms,
            self.inner.set_leverage(symbol, leverage),
        )
        .await
    }

    async fn place_order(&self, request: &OrderRequest) -> GatewayResult<OrderAck> {
        self.with_deadline(
            "place_order",
            self.config.order_timeout_ms,
            self.inner.place_order(request),
        )
        .await
    }

    async fn get_positions(&self, symbol: Option<&str>) -> GatewayResult<Vec<PositionInfo>> {
        self.with_deadline(
            "get_positions",
            self.config.position_timeout_ms,
            self.inner.get_positions(symbol),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::exchange::PaperGateway;
    use rust_decimal_macros::dec;

    fn guarded(paper: Arc<PaperGateway>, clock: ManualClock) -> GuardedGateway {
        GuardedGateway::new(paper, GatewayConfig::default(), Arc::new(clock))
    }

    #[tokio::test]
    async fn test_ticker_falls_back_to_cache() {
        let clock = ManualClock::default();
        let paper = Arc::new(PaperGateway::new(&[("BTCUSDT", dec!(100))], Arc::new(clock.clone())));
        let gateway = guarded(paper.clone(), clock.clone());

        let fresh = gateway.get_ticker("BTCUSDT").await.unwrap();
        assert_eq!(fresh.price, dec!(100));

        paper.set_unavailable(true);
        let cached = gateway.get_ticker("BTCUSDT").await.unwrap();
        assert_eq!(cached.price, dec!(100));
        assert_eq!(gateway.cache_fallbacks(), 1);
    }

    #[tokio::test]
    async fn test_stale_cache_is_not_used() {
        let clock = ManualClock::default();
        let paper = Arc::new(PaperGateway::new(&[("BTCUSDT", dec!(100))], Arc::new(clock.clone())));
        let gateway = guarded(paper.clone(), clock.clone());

        gateway.get_ticker("BTCUSDT").await.unwrap();
        paper.set_unavailable(true);
        clock.advance(Duration::from_secs(60));
        assert!(gateway.get_ticker("BTCUSDT").await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_symbol_is_not_masked() {
        let clock = ManualClock::default();
        let paper = Arc::new(PaperGateway::new(&[("BTCUSDT", dec!(100))], Arc::new(clock.clone())));
        let gateway = guarded(paper, clock);
        assert!(matches!(
            gateway.get_ticker("DOGEUSDT").await,
            Err(GatewayError::InvalidSymbol(_))
        ));
    }
}
