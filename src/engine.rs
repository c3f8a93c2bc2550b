//! TradingEngine: the context object wiring scheduler, coordinator,
//! aggregator, ledger and lifecycle manager together.
//!
//! One engine owns one set of components. Nothing here is global, so tests
//! (or a host process) may run several engines side by side.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::{MarketContext, MarketHistory};
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::coordination::{EmergencyReason, EmergencyState, EmergencyStopManager};
use crate::coordinator::{AgentRegistry, AgentSnapshot, Coordinator};
use crate::domain::{Decision, Direction, Trade, TradeId};
use crate::error::{AdmissionRejection, ErrorCategory, GatewayError, PaceError, Result};
use crate::exchange::{GuardedGateway, MarketGateway};
use crate::lifecycle::{
    LifecycleConfig, LifecycleDeps, ReconcileReport, TradeLifecycleManager, TradeLog,
};
use crate::platform::{CapitalLedger, CapitalSnapshot, ConsensusAggregator, LedgerConfig};
use crate::scheduler::{CadenceScheduler, CadenceStats, TickDecision};
use crate::services::{EngineMetrics, MetricsSnapshot};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// What one admission cycle did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Skipped {
        cause: String,
    },
    NoDecision {
        signals: usize,
    },
    Admitted {
        trade_id: TradeId,
        symbol: String,
        direction: Direction,
        confidence: f64,
    },
    Rejected {
        reason: AdmissionRejection,
    },
    Failed {
        category: ErrorCategory,
        message: String,
    },
}

impl CycleOutcome {
    fn skipped(cause: &str) -> Self {
        CycleOutcome::Skipped {
            cause: cause.to_string(),
        }
    }
}

/// Status surface: capital, open trades, cadence, agents, halt state, metrics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub halted: bool,
    pub capital: CapitalSnapshot,
    pub open_trade_count: usize,
    pub open_trades: Vec<Trade>,
    pub cadence: CadenceStats,
    pub mean_analysis_latency_ms: f64,
    pub agents: Vec<AgentSnapshot>,
    pub emergency: EmergencyState,
    pub gateway_cache_fallbacks: u64,
    pub gateway_timeouts: u64,
    pub metrics: MetricsSnapshot,
    pub as_of: DateTime<Utc>,
}

pub struct TradingEngine {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    gateway: Arc<GuardedGateway>,
    ledger: Arc<CapitalLedger>,
    aggregator: ConsensusAggregator,
    coordinator: Arc<Coordinator>,
    scheduler: Mutex<CadenceScheduler>,
    history: Mutex<MarketHistory>,
    metrics: Arc<EngineMetrics>,
    emergency: Arc<EmergencyStopManager>,
    lifecycle: TradeLifecycleManager,
    trade_log: Option<Arc<TradeLog>>,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TradingEngine {
    /// Build an engine with the built-in agents.
    ///
    /// Fails with `PaceError::Configuration` on an invalid configuration.
    pub fn new(
        config: AppConfig,
        gateway: Arc<dyn MarketGateway>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::with_registry(config, gateway, clock, AgentRegistry::with_builtin_agents())
    }

    pub fn with_registry(
        config: AppConfig,
        gateway: Arc<dyn MarketGateway>,
        clock: Arc<dyn Clock>,
        registry: AgentRegistry,
    ) -> Result<Self> {
        config.validate()?;
        if registry.is_empty() {
            return Err(PaceError::Configuration(
                "agent registry must contain at least one agent".into(),
            ));
        }

        let gateway = Arc::new(GuardedGateway::new(
            gateway,
            config.gateway.clone(),
            clock.clone(),
        ));
        let ledger = Arc::new(CapitalLedger::new(LedgerConfig::from_app(&config)));
        let coordinator = Arc::new(Coordinator::new(config.coordinator.clone(), registry));
        let metrics = Arc::new(EngineMetrics::new());
        let emergency = Arc::new(EmergencyStopManager::new(clock.clone()));
        let trade_log = config
            .trade_log_path
            .as_ref()
            .map(|path| Arc::new(TradeLog::new(path.clone())));

        let lifecycle = TradeLifecycleManager::new(
            LifecycleConfig::from_app(&config),
            LifecycleDeps {
                ledger: ledger.clone(),
                gateway: gateway.clone(),
                coordinator: coordinator.clone(),
                metrics: metrics.clone(),
                emergency: emergency.clone(),
                clock: clock.clone(),
                trade_log: trade_log.clone(),
            },
        );
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            total_capital = %config.capital.total_capital,
            trade_size = %config.capital.trade_size,
            max_concurrent = config.capital.max_concurrent_trades,
            target_per_day = config.scheduler.target_trades_per_day,
            symbols = ?config.coordinator.symbols,
            gateway = gateway.name(),
            "trading engine configured"
        );

        Ok(Self {
            scheduler: Mutex::new(CadenceScheduler::new(&config.scheduler)),
            history: Mutex::new(MarketHistory::new(config.coordinator.price_history_len)),
            aggregator: ConsensusAggregator::new(),
            config,
            clock,
            gateway,
            ledger,
            coordinator,
            metrics,
            emergency,
            lifecycle,
            trade_log,
            shutdown_tx,
            running: AtomicBool::new(false),
            driver: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ledger(&self) -> &Arc<CapitalLedger> {
        &self.ledger
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn emergency(&self) -> &Arc<EmergencyStopManager> {
        &self.emergency
    }

    pub fn lifecycle(&self) -> &TradeLifecycleManager {
        &self.lifecycle
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One scheduler tick: decide whether to attempt, then gather signals,
    /// aggregate and admit at most one trade.
    ///
    /// Per-cycle errors are folded into the outcome and metrics; this never
    /// returns an error.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleOutcome {
        self.metrics.inc_cycles();
        let tick = self.scheduler.lock().await.tick(now);
        let forced = match tick {
            TickDecision::Skip { reason } => {
                self.metrics.record_skip(reason.as_str()).await;
                debug!(reason = reason.as_str(), "cycle skipped by scheduler");
                return CycleOutcome::skipped(reason.as_str());
            }
            TickDecision::Forced => true,
            TickDecision::Probabilistic { probability } => {
                debug!(probability, "probabilistic admission attempt");
                false
            }
        };
        self.metrics.inc_attempt(forced);

        if self.emergency.is_stopped() {
            self.metrics.record_skip("halted").await;
            return CycleOutcome::skipped("halted");
        }

        match self.attempt(now).await {
            Ok(outcome) => outcome,
            Err(PaceError::Admission(e)) => {
                debug!(reason = %e, "admission rejected");
                self.metrics
                    .record_error(ErrorCategory::Admission, e.to_string(), now)
                    .await;
                CycleOutcome::Rejected {
                    reason: e.reason(),
                }
            }
            Err(PaceError::Gateway(e)) => {
                warn!(error = %e, "gateway unavailable, cycle skipped");
                self.metrics
                    .record_error(ErrorCategory::Gateway, e.to_string(), now)
                    .await;
                self.metrics.record_skip("gateway_unavailable").await;
                CycleOutcome::skipped("gateway_unavailable")
            }
            Err(PaceError::Halted(_)) => {
                self.metrics.record_skip("halted").await;
                CycleOutcome::skipped("halted")
            }
            Err(e) => {
                let category = e.category();
                error!(category = ?category, error = %e, "admission cycle failed");
                self.metrics.record_error(category, e.to_string(), now).await;
                CycleOutcome::Failed {
                    category,
                    message: e.to_string(),
                }
            }
        }
    }

    async fn attempt(&self, now: DateTime<Utc>) -> Result<CycleOutcome> {
        let contexts = self.market_contexts(now).await?;
        let cycle = self.coordinator.gather_signals(&contexts, now).await;
        self.metrics
            .record_analysis(cycle.latency_ms, cycle.signals.len());
        if !cycle.failures.is_empty() {
            debug!(failures = cycle.failures.len(), "some agents produced no signal");
        }

        let weights = self.coordinator.weights().await;
        let consensus = self
            .aggregator
            .aggregate_by_symbol(&cycle.signals, &weights);

        let min_confidence = self.config.coordinator.min_decision_confidence;
        let mut best: Option<Decision> = None;
        for (symbol, outcome) in consensus {
            let Some(decision) = outcome.decision() else {
                continue;
            };
            if decision.confidence < min_confidence || self.ledger.has_open_trade(&symbol).await {
                continue;
            }
            if best
                .as_ref()
                .map_or(true, |b| decision.confidence > b.confidence)
            {
                best = Some(decision);
            }
        }
        let Some(decision) = best else {
            return Ok(CycleOutcome::NoDecision {
                signals: cycle.signals.len(),
            });
        };

        info!(
            cycle = cycle.cycle,
            symbol = %decision.symbol,
            direction = %decision.direction,
            confidence = decision.confidence,
            signals = decision.signal_count,
            "consensus decision"
        );

        // Admission runs on its own task so a cycle timeout cannot drop it
        // between capital reservation and settlement.
        let manager = self.lifecycle.clone();
        let pending = decision.clone();
        let trade_id = tokio::spawn(async move { manager.admit(&pending).await })
            .await
            .map_err(|e| PaceError::Internal(format!("admission task failed: {e}")))??;

        Ok(CycleOutcome::Admitted {
            trade_id,
            symbol: decision.symbol,
            direction: decision.direction,
            confidence: decision.confidence,
        })
    }

    /// Fetch every symbol's ticker concurrently and extend the price history.
    ///
    /// Symbols whose ticker cannot be read are left out of this cycle; the
    /// cycle fails only when none can be read.
    async fn market_contexts(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, MarketContext>> {
        let symbols = &self.config.coordinator.symbols;
        let results = join_all(symbols.iter().map(|s| self.gateway.get_ticker(s))).await;

        let mut history = self.history.lock().await;
        let mut contexts = BTreeMap::new();
        let mut last_error: Option<GatewayError> = None;
        for (symbol, result) in symbols.iter().zip(results) {
            match result {
                Ok(ticker) => {
                    contexts.insert(symbol.clone(), history.record(ticker, now));
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "ticker unavailable");
                    last_error = Some(e);
                }
            }
        }
        if contexts.is_empty() {
            return Err(last_error
                .unwrap_or_else(|| GatewayError::Unavailable("no symbols configured".into()))
                .into());
        }
        Ok(contexts)
    }

    /// Run one cycle under a deadline of one tick period
    pub async fn run_cycle_with_deadline(&self, now: DateTime<Utc>) -> Option<CycleOutcome> {
        let deadline = self.scheduler.lock().await.trade_interval();
        match tokio::time::timeout(deadline, self.run_cycle(now)).await {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                self.metrics.inc_cycle_timeouts();
                warn!(deadline_ms = deadline.as_millis() as u64, "cycle exceeded its tick period");
                None
            }
        }
    }

    /// Reconcile the trade log against the gateway. `None` without a log.
    pub async fn reconcile(&self) -> Result<Option<ReconcileReport>> {
        let Some(log) = &self.trade_log else {
            return Ok(None);
        };
        let report = log.reconcile(self.gateway.as_ref(), self.clock.now()).await?;
        if !report.orphaned_positions.is_empty() {
            warn!(
                orphans = report.orphaned_positions.len(),
                "positions opened before restart are still live on the exchange"
            );
        }
        Ok(Some(report))
    }

    /// Start the periodic driver on a background task
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PaceError::Internal("engine already running".into()));
        }
        if let Err(e) = self.reconcile().await {
            warn!(error = %e, "trade log reconciliation failed");
        }
        self.shutdown_tx.send_replace(false);
        self.lifecycle.resume();

        let period = self.scheduler.lock().await.trade_interval();
        let engine = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut status = tokio::time::interval(STATUS_LOG_INTERVAL);
            status.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        let now = engine.clock.now();
                        if let Some(outcome) = engine.run_cycle_with_deadline(now).await {
                            debug!(outcome = ?outcome, "cycle complete");
                        }
                    }
                    _ = status.tick() => {
                        engine.metrics.log_status().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("engine driver stopped");
        });
        *self.driver.lock().await = Some(handle);

        info!(period_ms = period.as_millis() as u64, "trading engine started");
        Ok(())
    }

    /// Stop the driver, cancel every monitor and wait for them to settle
    pub async fn stop(&self) {
        info!("stopping trading engine");
        self.shutdown_tx.send_replace(true);
        let driver = self.driver.lock().await.take();
        if let Some(handle) = driver {
            if let Err(e) = handle.await {
                error!(error = %e, "engine driver panicked");
            }
        }
        self.lifecycle.drain().await;
        self.running.store(false, Ordering::SeqCst);
        self.metrics.log_status().await;
    }

    /// Block new admissions, cancel all monitors and wait for them to settle.
    ///
    /// Returns false when an emergency stop was already active.
    pub async fn emergency_stop(&self, reason: EmergencyReason, context: Option<String>) -> bool {
        let triggered = self.emergency.trigger(reason, context).await;
        self.lifecycle.drain().await;
        triggered
    }

    /// Clear the emergency stop and allow admissions again
    pub async fn reset_emergency(&self, operator: &str) {
        self.emergency.reset(operator).await;
        self.lifecycle.resume();
    }

    pub async fn status(&self) -> EngineStatus {
        let open_trades = self.lifecycle.open_trades().await;
        EngineStatus {
            running: self.is_running(),
            halted: self.emergency.is_stopped(),
            capital: self.ledger.snapshot().await,
            open_trade_count: open_trades.len(),
            open_trades,
            cadence: self.scheduler.lock().await.stats(),
            mean_analysis_latency_ms: self.metrics.mean_analysis_latency_ms(),
            agents: self.coordinator.agent_snapshots().await,
            emergency: self.emergency.get_state().await,
            gateway_cache_fallbacks: self.gateway.cache_fallbacks(),
            gateway_timeouts: self.gateway.timeouts(),
            metrics: self.metrics.snapshot().await,
            as_of: self.clock.now(),
        }
    }

    pub async fn trade(&self, trade_id: Uuid) -> Option<Trade> {
        self.lifecycle.get(trade_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::exchange::PaperGateway;
    use rust_decimal_macros::dec;

    fn engine() -> (TradingEngine, Arc<ManualClock>, Arc<PaperGateway>) {
        let clock = Arc::new(ManualClock::default());
        let paper = Arc::new(PaperGateway::new(
            &[("BTCUSDT", dec!(100)), ("ETHUSDT", dec!(50)), ("SOLUSDT", dec!(20))],
            clock.clone(),
        ));
        let mut config = AppConfig::default();
        config.scheduler.rng_seed = Some(1);
        let engine = TradingEngine::new(config, paper.clone(), clock.clone()).unwrap();
        (engine, clock, paper)
    }

    #[test]
    fn test_invalid_config_refused() {
        let clock = Arc::new(ManualClock::default());
        let paper = Arc::new(PaperGateway::new(&[("BTCUSDT", dec!(100))], clock.clone()));
        let mut config = AppConfig::default();
        config.capital.max_concurrent_trades = 0;
        let err = TradingEngine::new(config, paper, clock).err().unwrap();
        assert!(matches!(err, PaceError::Configuration(_)));
    }

    #[test]
    fn test_rate_above_one_per_millisecond_refused() {
        let clock = Arc::new(ManualClock::default());
        let paper = Arc::new(PaperGateway::new(&[("BTCUSDT", dec!(100))], clock.clone()));
        let mut config = AppConfig::default();
        config.scheduler.target_trades_per_day = 100_000_000;
        let err = TradingEngine::new(config, paper, clock).err().unwrap();
        assert!(matches!(err, PaceError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_first_cycle_is_warmup() {
        let (engine, clock, _) = engine();
        let outcome = engine.run_cycle(clock.now()).await;
        assert_eq!(outcome, CycleOutcome::skipped("warmup"));
        assert_eq!(engine.metrics.snapshot().await.skipped_cycles["warmup"], 1);
    }

    #[tokio::test]
    async fn test_gateway_outage_skips_cycle() {
        let (engine, clock, paper) = engine();
        engine.run_cycle(clock.now()).await;
        paper.set_unavailable(true);
        clock.advance(engine.scheduler.lock().await.trade_interval() * 2);

        let outcome = engine.run_cycle(clock.now()).await;
        assert_eq!(outcome, CycleOutcome::skipped("gateway_unavailable"));
        let metrics = engine.metrics.snapshot().await;
        assert_eq!(metrics.forced_attempts, 1);
        assert!(metrics.last_errors.contains_key(&ErrorCategory::Gateway));
    }

    #[tokio::test]
    async fn test_emergency_stop_blocks_attempts() {
        let (engine, clock, _) = engine();
        engine.run_cycle(clock.now()).await;
        assert!(engine.emergency_stop(EmergencyReason::Manual, None).await);
        assert!(!engine.emergency_stop(EmergencyReason::Manual, None).await);

        clock.advance(engine.scheduler.lock().await.trade_interval() * 2);
        let outcome = engine.run_cycle(clock.now()).await;
        assert_eq!(outcome, CycleOutcome::skipped("halted"));

        engine.reset_emergency("tester").await;
        assert!(!engine.status().await.halted);
        assert!(!engine.lifecycle.is_cancelled());
    }

    #[tokio::test]
    async fn test_status_reports_balanced_capital() {
        let (engine, _, _) = engine();
        let status = engine.status().await;
        assert!(status.capital.is_balanced());
        assert_eq!(status.capital.available, dec!(10));
        assert_eq!(status.open_trade_count, 0);
        assert_eq!(status.agents.len(), 3);
        assert!(serde_json::to_string(&status).is_ok());
    }
}
