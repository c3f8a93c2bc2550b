//! In-memory simulated exchange
//!
//! Market orders fill immediately at the current price. Prices follow a
//! seeded random walk when [`PaperGateway::step`] is called. Failure hooks
//! let tests and dry runs exercise the engine's error paths.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use super::traits::{GatewayResult, MarketGateway, PositionInfo, Ticker};
use crate::clock::Clock;
use crate::domain::{Direction, OrderAck, OrderRequest, OrderSide};
use crate::error::GatewayError;

#[derive(Debug, Clone)]
struct PaperMarket {
    price: Decimal,
    open_price: Decimal,
    volume: Decimal,
}

#[derive(Debug, Default)]
struct PaperBook {
    markets: HashMap<String, PaperMarket>,
    positions: HashMap<String, PositionInfo>,
    leverage: HashMap<String, u32>,
    orders: Vec<OrderRequest>,
}

pub struct PaperGateway {
    book: Mutex<PaperBook>,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    /// Per-step price volatility as a fraction
    volatility: f64,
    order_seq: AtomicU64,
    unavailable: AtomicBool,
    reject_orders: AtomicBool,
    position_failures: AtomicU32,
    latency: Mutex<Option<Duration>>,
}

impl PaperGateway {
    pub fn new(symbols: &[(&str, Decimal)], clock: Arc<dyn Clock>) -> Self {
        Self::with_seed(symbols, clock, 7)
    }

    pub fn with_seed(symbols: &[(&str, Decimal)], clock: Arc<dyn Clock>, seed: u64) -> Self {
        let markets = symbols
            .iter()
            .map(|(s, p)| {
                (
                    s.to_string(),
                    PaperMarket {
                        price: *p,
                        open_price: *p,
                        volume: dec!(1000000),
                    },
                )
            })
            .collect();
        Self {
            book: Mutex::new(PaperBook {
                markets,
                ..PaperBook::default()
            }),
            clock,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            volatility: 0.002,
            order_seq: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            reject_orders: AtomicBool::new(false),
            position_failures: AtomicU32::new(0),
            latency: Mutex::new(None),
        }
    }

    fn book(&self) -> std::sync::MutexGuard<'_, PaperBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        if let Some(market) = self.book().markets.get_mut(symbol) {
            market.price = price;
        }
    }

    pub fn price(&self, symbol: &str) -> Option<Decimal> {
        self.book().markets.get(symbol).map(|m| m.price)
    }

    /// Advance every price by one random-walk step
    pub fn step(&self) {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let mut book = self.book();
        for market in book.markets.values_mut() {
            let shock: f64 = rng.gen_range(-self.volatility..=self.volatility);
            let factor = Decimal::from_f64(1.0 + shock).unwrap_or(Decimal::ONE);
            market.price = (market.price * factor).round_dp(8).max(dec!(0.00000001));
            let vol_shock: f64 = rng.gen_range(0.9..=1.1);
            let volume = market.volume.to_f64().unwrap_or(0.0) * vol_shock;
            market.volume = Decimal::from_f64(volume).unwrap_or(market.volume).round_dp(2);
        }
    }

    /// Every call fails with `Unavailable` while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Entry orders are rejected while set; closes still fill
    pub fn set_reject_orders(&self, reject: bool) {
        self.reject_orders.store(reject, Ordering::SeqCst);
    }

    /// Fail the next `n` position queries
    pub fn fail_position_queries(&self, n: u32) {
        self.position_failures.store(n, Ordering::SeqCst);
    }

    /// Delay applied to every call
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Drop a position as if the exchange closed it (TP/SL hit server-side)
    pub fn remove_position(&self, symbol: &str) -> Option<PositionInfo> {
        self.book().positions.remove(symbol)
    }

    /// Orders accepted so far
    pub fn orders(&self) -> Vec<OrderRequest> {
        self.book().orders.clone()
    }

    pub fn leverage(&self, symbol: &str) -> Option<u32> {
        self.book().leverage.get(symbol).copied()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_available(&self) -> GatewayResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("paper gateway offline".into()));
        }
        Ok(())
    }
}

fn mark_position(position: &mut PositionInfo, mark: Decimal) {
    position.mark_price = mark;
    position.unrealized_pnl = (mark - position.entry_price) * position.size * position.side.sign();
}

#[async_trait]
impl MarketGateway for PaperGateway {
    fn name(&self) -> &str {
        "paper"
    }

    async fn get_ticker(&self, symbol: &str) -> GatewayResult<Ticker> {
        self.simulate_latency().await;
        self.check_available()?;
        let book = self.book();
        let market = book
            .markets
            .get(symbol)
            .ok_or_else(|| GatewayError::InvalidSymbol(symbol.to_string()))?;
        let change_pct = if market.open_price.is_zero() {
            Decimal::ZERO
        } else {
            (market.price - market.open_price) / market.open_price
        };
        Ok(Ticker {
            symbol: symbol.to_string(),
            price: market.price,
            volume: market.volume,
            change_pct,
            timestamp: self.clock.now(),
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()> {
        self.simulate_latency().await;
        self.check_available()?;
        let mut book = self.book();
        if !book.markets.contains_key(symbol) {
            return Err(GatewayError::InvalidSymbol(symbol.to_string()));
        }
        book.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn place_order(&self, request: &OrderRequest) -> GatewayResult<OrderAck> {
        self.simulate_latency().await;
        self.check_available()?;
        if request.qty <= Decimal::ZERO {
            return Err(GatewayError::Rejected(format!(
                "quantity must be positive, got {}",
                request.qty
            )));
        }
        if !request.reduce_only && self.reject_orders.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected("order rejected by paper gateway".into()));
        }

        let mut book = self.book();
        let price = book
            .markets
            .get(&request.symbol)
            .map(|m| m.price)
            .ok_or_else(|| GatewayError::InvalidSymbol(request.symbol.clone()))?;

        let side = match request.side {
            OrderSide::Buy => Direction::Long,
            OrderSide::Sell => Direction::Short,
        };

        if request.reduce_only {
            let remaining = match book.positions.get_mut(&request.symbol) {
                Some(pos) if pos.side != side => {
                    pos.size = (pos.size - request.qty).max(Decimal::ZERO);
                    pos.size
                }
                _ => {
                    return Err(GatewayError::Rejected(format!(
                        "no position to reduce for {}",
                        request.symbol
                    )))
                }
            };
            if remaining.is_zero() {
                book.positions.remove(&request.symbol);
            }
        } else {
            let position = book
                .positions
                .entry(request.symbol.clone())
                .or_insert_with(|| PositionInfo {
                    symbol: request.symbol.clone(),
                    side,
                    size: Decimal::ZERO,
                    entry_price: price,
                    mark_price: price,
                    unrealized_pnl: Decimal::ZERO,
                });
            if position.side != side {
                return Err(GatewayError::Rejected(format!(
                    "opposite position open for {}",
                    request.symbol
                )));
            }
            let notional = position.entry_price * position.size + price * request.qty;
            position.size += request.qty;
            position.entry_price = notional / position.size;
            mark_position(position, price);
        }

        book.orders.push(request.clone());
        let seq = self.order_seq.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(symbol = %request.symbol, side = %request.side, qty = %request.qty, "paper fill");
        Ok(OrderAck {
            order_id: format!("paper-{}", seq),
        })
    }

    async fn get_positions(&self, symbol: Option<&str>) -> GatewayResult<Vec<PositionInfo>> {
        self.simulate_latency().await;
        self.check_available()?;
        let pending_failures = self.position_failures.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.position_failures
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(GatewayError::Unavailable("position query failed".into()));
        }

        let mut book = self.book();
        let prices: HashMap<String, Decimal> = book
            .markets
            .iter()
            .map(|(s, m)| (s.clone(), m.price))
            .collect();
        let mut out = Vec::new();
        for position in book.positions.values_mut() {
            if symbol.map_or(false, |s| s != position.symbol) {
                continue;
            }
            if let Some(mark) = prices.get(&position.symbol) {
                mark_position(position, *mark);
            }
            out.push(position.clone());
        }
        Ok(out)
    }
}
