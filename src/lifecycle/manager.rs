//! Trade Lifecycle Manager
//!
//! Takes a consensus decision through
//! `Pending → Admitted → Open → Monitoring → {ClosedProfit | ClosedStop | Failed}`.
//!
//! Ordering rules:
//! - capital is reserved before any order reaches the gateway
//! - capital is released once, after the trade reaches a terminal state
//!
//! Each open trade gets its own monitor task polling the gateway for the
//! position. Monitors stop when their trade settles or when the shared
//! cancel signal is raised; `drain` raises it and awaits every monitor.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::exit::{self, ExitReason, ExitRules, TrailingState};
use super::params::OrderParams;
use super::trade_log::{TradeLog, TradeLogEntry};
use crate::clock::Clock;
use crate::config::{AppConfig, MonitorConfig, RiskConfig};
use crate::coordination::{EmergencyReason, EmergencyStopManager};
use crate::coordinator::Coordinator;
use crate::domain::{Decision, OrderRequest, Trade, TradeId, TradeState};
use crate::error::{ErrorCategory, ExecutionError, MonitoringError, PaceError, Result};
use crate::exchange::MarketGateway;
use crate::platform::CapitalLedger;
use crate::services::EngineMetrics;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Margin reserved per trade
    pub trade_size: Decimal,
    pub leverage: u32,
    pub risk: RiskConfig,
    pub monitor: MonitorConfig,
    /// Settled trades kept in memory
    pub archive_limit: usize,
}

impl LifecycleConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            trade_size: config.capital.trade_size,
            leverage: config.capital.leverage,
            risk: config.risk.clone(),
            monitor: config.monitor.clone(),
            archive_limit: 1000,
        }
    }
}

/// Shared collaborators
#[derive(Clone)]
pub struct LifecycleDeps {
    pub ledger: Arc<CapitalLedger>,
    pub gateway: Arc<dyn MarketGateway>,
    pub coordinator: Arc<Coordinator>,
    pub metrics: Arc<EngineMetrics>,
    pub emergency: Arc<EmergencyStopManager>,
    pub clock: Arc<dyn Clock>,
    pub trade_log: Option<Arc<TradeLog>>,
}

/// How a trade settles
#[derive(Debug, Clone)]
struct Settlement {
    state: TradeState,
    reason: String,
    exit_price: Option<Decimal>,
    realized_pnl: Option<Decimal>,
}

impl Settlement {
    fn closed(reason: ExitReason, exit_price: Decimal, pnl: Decimal) -> Self {
        Self {
            state: reason.terminal_state(pnl),
            reason: reason.to_string(),
            exit_price: Some(exit_price),
            realized_pnl: Some(pnl),
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: TradeState::Failed,
            reason: reason.into(),
            exit_price: None,
            realized_pnl: None,
        }
    }
}

struct LifecycleInner {
    config: LifecycleConfig,
    deps: LifecycleDeps,
    active: RwLock<HashMap<TradeId, Trade>>,
    archive: Mutex<VecDeque<Trade>>,
    monitors: Mutex<HashMap<TradeId, JoinHandle<()>>>,
    cancel_tx: watch::Sender<bool>,
}

/// Clonable handle; all clones share the same trades and monitors
#[derive(Clone)]
pub struct TradeLifecycleManager {
    inner: Arc<LifecycleInner>,
}

impl TradeLifecycleManager {
    pub fn new(config: LifecycleConfig, deps: LifecycleDeps) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(LifecycleInner {
                config,
                deps,
                active: RwLock::new(HashMap::new()),
                archive: Mutex::new(VecDeque::new()),
                monitors: Mutex::new(HashMap::new()),
                cancel_tx,
            }),
        }
    }

    /// Admit a decision: reserve capital, place the order, start supervision.
    ///
    /// Admission rejections leave no trace beyond metrics. Execution
    /// failures settle the trade as `Failed` with its capital released.
    pub async fn admit(&self, decision: &Decision) -> Result<TradeId> {
        let deps = &self.inner.deps;
        deps.emergency.check_allowed()?;
        if self.is_cancelled() {
            return Err(PaceError::Halted("lifecycle manager is stopped".into()));
        }

        let ticker = deps.gateway.get_ticker(&decision.symbol).await?;
        let now = deps.clock.now();
        let mut trade = Trade::pending(
            decision,
            self.inner.config.trade_size,
            self.inner.config.leverage,
            now,
        );

        if let Err(e) = deps
            .ledger
            .try_reserve(trade.id, &trade.symbol, trade.size, now)
            .await
        {
            deps.metrics.record_rejection(e.reason()).await;
            debug!(symbol = %trade.symbol, reason = %e, "admission rejected");
            return Err(e.into());
        }
        deps.metrics.inc_admissions();
        if let Err(e) = trade.transition(TradeState::Admitted, "capital reserved", now) {
            // A fresh trade is always Pending; undo the reservation regardless
            let _ = deps.ledger.release(trade.id, now).await;
            return Err(e);
        }
        self.inner
            .active
            .write()
            .await
            .insert(trade.id, trade.clone());
        info!(
            trade_id = %trade.id,
            symbol = %trade.symbol,
            direction = %trade.direction,
            confidence = trade.decision_confidence,
            "trade admitted"
        );

        if let Err(e) = self.open_position(&mut trade, ticker.price).await {
            error!(trade_id = %trade.id, symbol = %trade.symbol, error = %e, "order placement failed");
            deps.metrics.record_execution_failure(e.kind()).await;
            self.finalize(trade, Settlement::failed(e.to_string())).await;
            return Err(e.into());
        }

        let now = deps.clock.now();
        let order_id = trade.order_id.clone().unwrap_or_default();
        trade.opened_at = Some(now);
        trade.transition(TradeState::Open, format!("order {order_id} confirmed"), now)?;
        deps.metrics.inc_trades_opened();
        self.log(TradeLogEntry::Opened {
            trade_id: trade.id,
            symbol: trade.symbol.clone(),
            direction: trade.direction,
            size: trade.size,
            qty: trade.qty,
            entry_price: trade.entry_price,
            order_id,
            opened_at: now,
        })
        .await;

        trade.transition(TradeState::Monitoring, "supervision started", now)?;
        self.inner
            .active
            .write()
            .await
            .insert(trade.id, trade.clone());
        info!(
            trade_id = %trade.id,
            symbol = %trade.symbol,
            entry = %trade.entry_price,
            qty = %trade.qty,
            stop_loss = %trade.stop_loss,
            take_profit = %trade.take_profit,
            "trade open"
        );

        let trade_id = trade.id;
        self.spawn_monitor(trade).await;
        Ok(trade_id)
    }

    async fn open_position(&self, trade: &mut Trade, price: Decimal) -> std::result::Result<(), ExecutionError> {
        let params = OrderParams::compute(
            trade.direction,
            price,
            trade.size,
            trade.leverage,
            &self.inner.config.risk,
        )?;
        trade.entry_price = params.entry_price;
        trade.qty = params.qty;
        trade.stop_loss = params.stop_loss;
        trade.take_profit = params.take_profit;
        trade.trailing_stop_distance = params.trailing_stop_distance;

        let gateway = &self.inner.deps.gateway;
        gateway.set_leverage(&trade.symbol, trade.leverage).await?;
        let request = OrderRequest::market_entry(
            &trade.symbol,
            trade.direction,
            params.qty,
            params.take_profit,
            params.stop_loss,
        );
        let ack = gateway.place_order(&request).await?;
        trade.order_id = Some(ack.order_id);
        Ok(())
    }

    async fn close_position(&self, trade: &Trade) -> std::result::Result<(), ExecutionError> {
        let request = OrderRequest::market_close(&trade.symbol, trade.direction, trade.qty);
        self.inner.deps.gateway.place_order(&request).await?;
        Ok(())
    }

    async fn spawn_monitor(&self, trade: Trade) {
        // Held across spawn so the task cannot settle before its handle is stored
        let mut monitors = self.inner.monitors.lock().await;
        let trade_id = trade.id;
        let manager = self.clone();
        let handle = tokio::spawn(async move { manager.supervise(trade).await });
        monitors.insert(trade_id, handle);
    }

    async fn supervise(&self, trade: Trade) {
        let monitor = &self.inner.config.monitor;
        let rules = ExitRules::from_risk(&self.inner.config.risk);
        let gateway = self.inner.deps.gateway.clone();
        let mut cancel_rx = self.inner.cancel_tx.subscribe();
        let mut trailing = TrailingState::new(trade.entry_price);
        let mut last_mark = trade.entry_price;
        let mut failures: u32 = 0;

        loop {
            if *cancel_rx.borrow() {
                self.on_cancel(trade, last_mark).await;
                return;
            }

            let wait = if failures == 0 {
                Duration::from_millis(monitor.poll_interval_ms)
            } else {
                backoff(monitor, failures)
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        self.on_cancel(trade, last_mark).await;
                        return;
                    }
                    continue;
                }
            }

            let positions = match gateway.get_positions(Some(&trade.symbol)).await {
                Ok(positions) => {
                    failures = 0;
                    positions
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        trade_id = %trade.id,
                        symbol = %trade.symbol,
                        attempt = failures,
                        error = %e,
                        "position query failed"
                    );
                    if failures >= monitor.max_query_failures {
                        let err = MonitoringError::PositionQueryFailed {
                            trade_id: trade.id,
                            attempts: failures,
                            reason: e.to_string(),
                        };
                        self.escalate(trade, err).await;
                        return;
                    }
                    continue;
                }
            };

            let position = positions
                .iter()
                .find(|p| p.symbol == trade.symbol && p.side == trade.direction);
            let Some(position) = position else {
                let pnl = trade.pnl_at(last_mark);
                info!(trade_id = %trade.id, symbol = %trade.symbol, "position closed on exchange");
                self.finalize(
                    trade,
                    Settlement::closed(ExitReason::ClosedOnExchange, last_mark, pnl),
                )
                .await;
                return;
            };
            last_mark = position.mark_price;

            let now = self.inner.deps.clock.now();
            let Some(reason) = exit::evaluate(&trade, &mut trailing, last_mark, now, &rules) else {
                continue;
            };
            match self.close_position(&trade).await {
                Ok(()) => {
                    let pnl = trade.pnl_at(last_mark);
                    self.finalize(trade, Settlement::closed(reason, last_mark, pnl))
                        .await;
                    return;
                }
                Err(e) => {
                    // Retried on the next poll
                    warn!(trade_id = %trade.id, reason = %reason, error = %e, "close order failed");
                    self.inner
                        .deps
                        .metrics
                        .record_error(ErrorCategory::Execution, e.to_string(), now)
                        .await;
                }
            }
        }
    }

    async fn on_cancel(&self, trade: Trade, last_mark: Decimal) {
        if !self.inner.config.monitor.flatten_on_stop {
            self.finalize(trade, Settlement::failed("cancelled")).await;
            return;
        }
        match self.close_position(&trade).await {
            Ok(()) => {
                let pnl = trade.pnl_at(last_mark);
                self.finalize(trade, Settlement::closed(ExitReason::Flattened, last_mark, pnl))
                    .await;
            }
            Err(e) => {
                warn!(trade_id = %trade.id, error = %e, "flatten on stop failed");
                self.finalize(trade, Settlement::failed(format!("cancelled; flatten failed: {e}")))
                    .await;
            }
        }
    }

    /// Sustained monitoring failure: settle the trade, halt the engine,
    /// cancel every other monitor.
    async fn escalate(&self, trade: Trade, err: MonitoringError) {
        let deps = &self.inner.deps;
        error!(trade_id = %trade.id, error = %err, "monitoring failure, escalating to emergency stop");
        deps.metrics
            .record_error(ErrorCategory::Monitoring, err.to_string(), deps.clock.now())
            .await;
        let reason = err.to_string();
        self.finalize(trade, Settlement::failed(reason.clone())).await;
        deps.emergency
            .trigger(EmergencyReason::MonitoringFailure, Some(reason))
            .await;
        self.cancel_all();
    }

    /// Move `trade` to its terminal state and release its capital.
    ///
    /// Whoever removes the trade from the active set settles it, so each
    /// trade is settled (and released) once.
    async fn finalize(&self, mut trade: Trade, settlement: Settlement) -> bool {
        if self.inner.active.write().await.remove(&trade.id).is_none() {
            return false;
        }
        let deps = &self.inner.deps;
        let now = deps.clock.now();

        if let Err(e) = trade.transition(settlement.state, settlement.reason.clone(), now) {
            error!(trade_id = %trade.id, error = %e, "illegal terminal transition");
        }
        trade.exit_price = settlement.exit_price;
        trade.realized_pnl = settlement.realized_pnl;
        if settlement.state == TradeState::Failed {
            trade.failure_reason = Some(settlement.reason.clone());
        }

        match deps.ledger.release(trade.id, now).await {
            Ok(amount) => debug!(trade_id = %trade.id, amount = %amount, "capital released"),
            Err(e) => error!(trade_id = %trade.id, error = %e, "capital release failed"),
        }
        self.inner.monitors.lock().await.remove(&trade.id);

        let entry = match (settlement.exit_price, settlement.realized_pnl) {
            (Some(exit_price), Some(realized_pnl)) if settlement.state != TradeState::Failed => {
                TradeLogEntry::Closed {
                    trade_id: trade.id,
                    symbol: trade.symbol.clone(),
                    state: settlement.state,
                    exit_price,
                    realized_pnl,
                    closed_at: now,
                }
            }
            _ => TradeLogEntry::Failed {
                trade_id: trade.id,
                symbol: trade.symbol.clone(),
                reason: settlement.reason.clone(),
                failed_at: now,
            },
        };
        self.log(entry).await;

        deps.metrics
            .record_trade_closed(trade.id, &trade.symbol, settlement.state, trade.realized_pnl, now)
            .await;
        if let Some(pnl) = trade.realized_pnl {
            deps.coordinator
                .record_trade_outcome(trade.direction, &trade.contributors, pnl)
                .await;
        }

        info!(
            trade_id = %trade.id,
            symbol = %trade.symbol,
            state = %settlement.state,
            reason = %settlement.reason,
            pnl = ?trade.realized_pnl,
            "trade settled"
        );

        let limit = self.inner.config.archive_limit.max(1);
        let mut archive = self.inner.archive.lock().await;
        archive.push_back(trade);
        while archive.len() > limit {
            archive.pop_front();
        }
        true
    }

    async fn log(&self, entry: TradeLogEntry) {
        if let Some(log) = &self.inner.deps.trade_log {
            if let Err(e) = log.append(&entry).await {
                warn!(trade_id = %entry.trade_id(), error = %e, "trade log write failed");
            }
        }
    }

    /// Raise the cancel signal for every monitor
    pub fn cancel_all(&self) {
        self.inner.cancel_tx.send_replace(true);
    }

    /// Lower the cancel signal so new trades may be admitted again
    pub fn resume(&self) {
        self.inner.cancel_tx.send_replace(false);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancel_tx.borrow()
    }

    /// Cancel all monitors and wait for each to settle its trade
    pub async fn drain(&self) {
        self.cancel_all();
        loop {
            let handles: Vec<(TradeId, JoinHandle<()>)> =
                self.inner.monitors.lock().await.drain().collect();
            if handles.is_empty() {
                break;
            }
            info!(monitors = handles.len(), "draining trade monitors");
            let ids: Vec<TradeId> = handles.iter().map(|(id, _)| *id).collect();
            let results = join_all(handles.into_iter().map(|(_, h)| h)).await;
            for (id, result) in ids.into_iter().zip(results) {
                if let Err(e) = result {
                    error!(trade_id = %id, error = %e, "monitor task panicked");
                }
            }
        }
    }

    /// Trades holding capital, oldest first
    pub async fn open_trades(&self) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self.inner.active.read().await.values().cloned().collect();
        trades.sort_by_key(|t| t.created_at);
        trades
    }

    pub async fn open_count(&self) -> usize {
        self.inner.active.read().await.len()
    }

    pub async fn monitor_count(&self) -> usize {
        self.inner.monitors.lock().await.len()
    }

    /// Most recently settled trades, newest last
    pub async fn archived(&self, limit: usize) -> Vec<Trade> {
        let archive = self.inner.archive.lock().await;
        let skip = archive.len().saturating_sub(limit);
        archive.iter().skip(skip).cloned().collect()
    }

    pub async fn get(&self, trade_id: TradeId) -> Option<Trade> {
        if let Some(trade) = self.inner.active.read().await.get(&trade_id) {
            return Some(trade.clone());
        }
        self.inner
            .archive
            .lock()
            .await
            .iter()
            .rev()
            .find(|t| t.id == trade_id)
            .cloned()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.deps.clock.now()
    }
}

fn backoff(monitor: &MonitorConfig, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let ms = monitor
        .backoff_base_ms
        .saturating_mul(1u64 << exp)
        .min(monitor.backoff_max_ms);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CoordinatorConfig;
    use crate::coordinator::AgentRegistry;
    use crate::domain::Direction;
    use crate::error::AdmissionError;
    use crate::config::GatewayConfig;
    use crate::exchange::{GuardedGateway, PaperGateway};
    use crate::platform::LedgerConfig;
    use rust_decimal_macros::dec;

    struct Harness {
        manager: TradeLifecycleManager,
        paper: Arc<PaperGateway>,
        ledger: Arc<CapitalLedger>,
        emergency: Arc<EmergencyStopManager>,
        metrics: Arc<EngineMetrics>,
    }

    fn harness(monitor: MonitorConfig) -> Harness {
        harness_with(monitor, None)
    }

    /// `guard` wraps the paper exchange in the timeout/fallback layer
    fn harness_with(monitor: MonitorConfig, guard: Option<GatewayConfig>) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let paper = Arc::new(PaperGateway::new(
            &[("BTCUSDT", dec!(100)), ("ETHUSDT", dec!(50)), ("SOLUSDT", dec!(20))],
            clock.clone(),
        ));
        let ledger = Arc::new(CapitalLedger::new(LedgerConfig {
            total_capital: dec!(12),
            safety_buffer: dec!(2),
            max_concurrent_trades: 2,
            min_admission_spacing: Duration::ZERO,
        }));
        let emergency = Arc::new(EmergencyStopManager::new(clock.clone()));
        let metrics = Arc::new(EngineMetrics::new());
        let gateway: Arc<dyn MarketGateway> = match guard {
            Some(config) => Arc::new(GuardedGateway::new(paper.clone(), config, clock.clone())),
            None => paper.clone() as Arc<dyn MarketGateway>,
        };
        let deps = LifecycleDeps {
            ledger: ledger.clone(),
            gateway,
            coordinator: Arc::new(Coordinator::new(
                CoordinatorConfig::default(),
                AgentRegistry::with_builtin_agents(),
            )),
            metrics: metrics.clone(),
            emergency: emergency.clone(),
            clock,
            trade_log: None,
        };
        let config = LifecycleConfig {
            trade_size: dec!(5),
            leverage: 10,
            risk: RiskConfig {
                min_profit: dec!(1000),
                ..Default::default()
            },
            monitor,
            archive_limit: 100,
        };
        Harness {
            manager: TradeLifecycleManager::new(config, deps),
            paper,
            ledger,
            emergency,
            metrics,
        }
    }

    fn fast_monitor() -> MonitorConfig {
        MonitorConfig {
            poll_interval_ms: 5,
            max_query_failures: 3,
            backoff_base_ms: 2,
            backoff_max_ms: 10,
            flatten_on_stop: false,
        }
    }

    fn decision(symbol: &str, direction: Direction) -> Decision {
        Decision {
            symbol: symbol.to_string(),
            direction,
            confidence: 0.6,
            signal_count: 2,
            contributors: vec![("momentum-1".into(), direction)],
        }
    }

    async fn wait_settled(manager: &TradeLifecycleManager, id: TradeId) -> Trade {
        for _ in 0..400 {
            if let Some(trade) = manager.get(id).await {
                if trade.state.is_terminal() {
                    return trade;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("trade {id} did not settle");
    }

    #[tokio::test]
    async fn test_admit_opens_and_monitors() {
        let h = harness(fast_monitor());
        let id = h
            .manager
            .admit(&decision("BTCUSDT", Direction::Long))
            .await
            .unwrap();

        let trade = h.manager.get(id).await.unwrap();
        assert_eq!(trade.state, TradeState::Monitoring);
        assert!(trade.visited(TradeState::Admitted));
        assert!(trade.visited(TradeState::Open));
        assert_eq!(trade.qty, dec!(0.5));
        assert_eq!(h.paper.leverage("BTCUSDT"), Some(10));
        assert!(h.ledger.holds_reservation(id).await);

        h.manager.drain().await;
    }

    #[tokio::test]
    async fn test_rejected_order_fails_and_releases() {
        let h = harness(fast_monitor());
        h.paper.set_reject_orders(true);
        let err = h
            .manager
            .admit(&decision("BTCUSDT", Direction::Long))
            .await
            .unwrap_err();
        assert!(matches!(err, PaceError::Execution(ExecutionError::OrderRejected(_))));

        let snapshot = h.ledger.snapshot().await;
        assert_eq!(snapshot.allocated, Decimal::ZERO);
        assert!(snapshot.is_balanced());
        let archived = h.manager.archived(10).await;
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].state, TradeState::Failed);
        assert!(!archived[0].visited(TradeState::Open));
        assert_eq!(
            h.metrics.snapshot().await.execution_failures["order_rejected"],
            1
        );
    }

    #[tokio::test]
    async fn test_order_timeout_fails_and_releases() {
        let h = harness_with(
            fast_monitor(),
            Some(GatewayConfig {
                ticker_timeout_ms: 1000,
                order_timeout_ms: 20,
                position_timeout_ms: 1000,
                ticker_cache_ttl_ms: 30_000,
            }),
        );
        h.paper.set_latency(Some(Duration::from_millis(100)));

        let err = h
            .manager
            .admit(&decision("BTCUSDT", Direction::Long))
            .await
            .unwrap_err();
        assert!(matches!(err, PaceError::Execution(ExecutionError::GatewayTimeout(_))));

        let snapshot = h.ledger.snapshot().await;
        assert_eq!(snapshot.allocated, Decimal::ZERO);
        assert!(snapshot.is_balanced());
        let archived = h.manager.archived(10).await;
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].state, TradeState::Failed);
        assert!(archived[0].visited(TradeState::Admitted));
        assert!(!archived[0].visited(TradeState::Open));
        assert!(h.paper.orders().is_empty());
        assert_eq!(
            h.metrics.snapshot().await.execution_failures["gateway_timeout"],
            1
        );
        assert_eq!(h.manager.monitor_count().await, 0);
    }

    #[tokio::test]
    async fn test_second_trade_on_symbol_rejected() {
        let h = harness(fast_monitor());
        h.manager
            .admit(&decision("BTCUSDT", Direction::Long))
            .await
            .unwrap();
        let err = h
            .manager
            .admit(&decision("BTCUSDT", Direction::Short))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaceError::Admission(AdmissionError::SymbolAlreadyActive { .. })
        ));
        assert_eq!(h.manager.open_count().await, 1);
        h.manager.drain().await;
    }

    #[tokio::test]
    async fn test_stop_loss_closes_and_releases() {
        let h = harness(fast_monitor());
        let id = h
            .manager
            .admit(&decision("BTCUSDT", Direction::Long))
            .await
            .unwrap();
        h.paper.set_price("BTCUSDT", dec!(99));

        let trade = wait_settled(&h.manager, id).await;
        assert_eq!(trade.state, TradeState::ClosedStop);
        assert_eq!(trade.exit_price, Some(dec!(99)));
        assert_eq!(trade.realized_pnl, Some(dec!(-0.5)));
        assert!(!h.ledger.holds_reservation(id).await);
        assert_eq!(h.ledger.snapshot().await.available, dec!(10));
        assert!(h.paper.orders().last().unwrap().reduce_only);
    }

    #[tokio::test]
    async fn test_take_profit_closes_in_profit() {
        let h = harness(fast_monitor());
        let id = h
            .manager
            .admit(&decision("ETHUSDT", Direction::Short))
            .await
            .unwrap();
        h.paper.set_price("ETHUSDT", dec!(49));

        let trade = wait_settled(&h.manager, id).await;
        assert_eq!(trade.state, TradeState::ClosedProfit);
        assert!(trade.realized_pnl.unwrap() > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_exchange_side_close_detected() {
        let h = harness(fast_monitor());
        let id = h
            .manager
            .admit(&decision("SOLUSDT", Direction::Long))
            .await
            .unwrap();
        h.paper.remove_position("SOLUSDT");

        let trade = wait_settled(&h.manager, id).await;
        assert_eq!(trade.state, TradeState::ClosedStop);
        assert_eq!(trade.realized_pnl, Some(Decimal::ZERO));
        assert!(h.ledger.snapshot().await.is_balanced());
    }

    #[tokio::test]
    async fn test_drain_cancels_monitors() {
        let h = harness(fast_monitor());
        h.manager
            .admit(&decision("BTCUSDT", Direction::Long))
            .await
            .unwrap();
        h.manager
            .admit(&decision("ETHUSDT", Direction::Long))
            .await
            .unwrap();
        assert_eq!(h.manager.monitor_count().await, 2);

        h.manager.drain().await;
        assert_eq!(h.manager.open_count().await, 0);
        assert_eq!(h.manager.monitor_count().await, 0);
        assert_eq!(h.ledger.snapshot().await.allocated, Decimal::ZERO);
        for trade in h.manager.archived(10).await {
            assert_eq!(trade.state, TradeState::Failed);
            assert_eq!(trade.failure_reason.as_deref(), Some("cancelled"));
        }

        let err = h
            .manager
            .admit(&decision("SOLUSDT", Direction::Long))
            .await
            .unwrap_err();
        assert!(matches!(err, PaceError::Halted(_)));
    }

    #[tokio::test]
    async fn test_flatten_on_stop_closes_at_market() {
        let h = harness(MonitorConfig {
            flatten_on_stop: true,
            ..fast_monitor()
        });
        let id = h
            .manager
            .admit(&decision("BTCUSDT", Direction::Long))
            .await
            .unwrap();
        h.manager.drain().await;

        let trade = h.manager.get(id).await.unwrap();
        assert_eq!(trade.state, TradeState::ClosedStop);
        assert!(h.paper.get_positions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_failures_escalate_to_emergency_stop() {
        let h = harness(fast_monitor());
        let id = h
            .manager
            .admit(&decision("BTCUSDT", Direction::Long))
            .await
            .unwrap();
        h.paper.fail_position_queries(10);

        let trade = wait_settled(&h.manager, id).await;
        assert_eq!(trade.state, TradeState::Failed);
        assert!(h.emergency.is_stopped());
        assert!(h.manager.is_cancelled());
        assert_eq!(h.ledger.snapshot().await.allocated, Decimal::ZERO);
        assert!(h
            .metrics
            .snapshot()
            .await
            .last_errors
            .contains_key(&ErrorCategory::Monitoring));
    }

    #[test]
    fn test_backoff_is_capped() {
        let monitor = MonitorConfig::default();
        assert_eq!(backoff(&monitor, 1), Duration::from_millis(200));
        assert_eq!(backoff(&monitor, 3), Duration::from_millis(800));
        assert_eq!(backoff(&monitor, 10), Duration::from_millis(5000));
    }
}
