use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::info;

use crate::domain::{TradeId, TradeState};
use crate::error::{AdmissionRejection, ErrorCategory};

/// Realized PnL points kept for status
const PNL_HISTORY_LIMIT: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct PnlPoint {
    pub trade_id: TradeId,
    pub symbol: String,
    pub realized_pnl: Decimal,
    pub cumulative_pnl: Decimal,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastError {
    pub message: String,
    pub at: DateTime<Utc>,
    pub count: u64,
}

#[derive(Default)]
struct MetricsMaps {
    skipped_cycles: BTreeMap<String, u64>,
    rejections: BTreeMap<AdmissionRejection, u64>,
    execution_failures: BTreeMap<String, u64>,
    last_errors: BTreeMap<ErrorCategory, LastError>,
    pnl_history: VecDeque<PnlPoint>,
    cumulative_pnl: Decimal,
}

/// Metrics collector for the engine
pub struct EngineMetrics {
    pub cycles: AtomicU64,
    pub cycle_timeouts: AtomicU64,
    pub forced_attempts: AtomicU64,
    pub probabilistic_attempts: AtomicU64,
    pub admissions: AtomicU64,
    pub trades_opened: AtomicU64,
    pub closed_profit: AtomicU64,
    pub closed_stop: AtomicU64,
    pub trades_failed: AtomicU64,
    pub signals_collected: AtomicU64,
    analysis_latency_total_ms: AtomicU64,
    analysis_samples: AtomicU64,
    maps: RwLock<MetricsMaps>,
}

/// Serializable metrics view
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub cycles: u64,
    pub cycle_timeouts: u64,
    pub skipped_cycles: BTreeMap<String, u64>,
    pub forced_attempts: u64,
    pub probabilistic_attempts: u64,
    pub admissions: u64,
    pub rejections: BTreeMap<AdmissionRejection, u64>,
    pub trades_opened: u64,
    pub closed_profit: u64,
    pub closed_stop: u64,
    pub trades_failed: u64,
    pub execution_failures: BTreeMap<String, u64>,
    pub signals_collected: u64,
    pub mean_analysis_latency_ms: f64,
    pub realized_pnl: Decimal,
    pub pnl_history: Vec<PnlPoint>,
    pub last_errors: BTreeMap<ErrorCategory, LastError>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            cycles: AtomicU64::new(0),
            cycle_timeouts: AtomicU64::new(0),
            forced_attempts: AtomicU64::new(0),
            probabilistic_attempts: AtomicU64::new(0),
            admissions: AtomicU64::new(0),
            trades_opened: AtomicU64::new(0),
            closed_profit: AtomicU64::new(0),
            closed_stop: AtomicU64::new(0),
            trades_failed: AtomicU64::new(0),
            signals_collected: AtomicU64::new(0),
            analysis_latency_total_ms: AtomicU64::new(0),
            analysis_samples: AtomicU64::new(0),
            maps: RwLock::new(MetricsMaps::default()),
        }
    }

    pub fn inc_cycles(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cycle_timeouts(&self) {
        self.cycle_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_attempt(&self, forced: bool) {
        if forced {
            self.forced_attempts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.probabilistic_attempts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_admissions(&self) {
        self.admissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_trades_opened(&self) {
        self.trades_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_analysis(&self, latency_ms: u64, signals: usize) {
        self.analysis_latency_total_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
        self.analysis_samples.fetch_add(1, Ordering::Relaxed);
        self.signals_collected
            .fetch_add(signals as u64, Ordering::Relaxed);
    }

    pub fn mean_analysis_latency_ms(&self) -> f64 {
        let samples = self.analysis_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        self.analysis_latency_total_ms.load(Ordering::Relaxed) as f64 / samples as f64
    }

    pub async fn record_skip(&self, cause: &str) {
        *self
            .maps
            .write()
            .await
            .skipped_cycles
            .entry(cause.to_string())
            .or_default() += 1;
    }

    pub async fn record_rejection(&self, reason: AdmissionRejection) {
        *self.maps.write().await.rejections.entry(reason).or_default() += 1;
    }

    pub async fn record_execution_failure(&self, kind: &str) {
        *self
            .maps
            .write()
            .await
            .execution_failures
            .entry(kind.to_string())
            .or_default() += 1;
    }

    /// Remember the latest error of a category
    pub async fn record_error(&self, category: ErrorCategory, message: String, at: DateTime<Utc>) {
        let mut maps = self.maps.write().await;
        let count = maps.last_errors.get(&category).map_or(0, |e| e.count) + 1;
        maps.last_errors
            .insert(category, LastError { message, at, count });
    }

    /// Count a terminal trade and, when it has one, its realized PnL
    pub async fn record_trade_closed(
        &self,
        trade_id: TradeId,
        symbol: &str,
        state: TradeState,
        realized_pnl: Option<Decimal>,
        closed_at: DateTime<Utc>,
    ) {
        match state {
            TradeState::ClosedProfit => self.closed_profit.fetch_add(1, Ordering::Relaxed),
            TradeState::ClosedStop => self.closed_stop.fetch_add(1, Ordering::Relaxed),
            _ => self.trades_failed.fetch_add(1, Ordering::Relaxed),
        };
        let Some(pnl) = realized_pnl else {
            return;
        };
        let mut maps = self.maps.write().await;
        maps.cumulative_pnl += pnl;
        let point = PnlPoint {
            trade_id,
            symbol: symbol.to_string(),
            realized_pnl: pnl,
            cumulative_pnl: maps.cumulative_pnl,
            closed_at,
        };
        maps.pnl_history.push_back(point);
        while maps.pnl_history.len() > PNL_HISTORY_LIMIT {
            maps.pnl_history.pop_front();
        }
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let maps = self.maps.read().await;
        MetricsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            cycle_timeouts: self.cycle_timeouts.load(Ordering::Relaxed),
            skipped_cycles: maps.skipped_cycles.clone(),
            forced_attempts: self.forced_attempts.load(Ordering::Relaxed),
            probabilistic_attempts: self.probabilistic_attempts.load(Ordering::Relaxed),
            admissions: self.admissions.load(Ordering::Relaxed),
            rejections: maps.rejections.clone(),
            trades_opened: self.trades_opened.load(Ordering::Relaxed),
            closed_profit: self.closed_profit.load(Ordering::Relaxed),
            closed_stop: self.closed_stop.load(Ordering::Relaxed),
            trades_failed: self.trades_failed.load(Ordering::Relaxed),
            execution_failures: maps.execution_failures.clone(),
            signals_collected: self.signals_collected.load(Ordering::Relaxed),
            mean_analysis_latency_ms: self.mean_analysis_latency_ms(),
            realized_pnl: maps.cumulative_pnl,
            pnl_history: maps.pnl_history.iter().cloned().collect(),
            last_errors: maps.last_errors.clone(),
        }
    }

    /// One-line-per-field status block
    pub async fn summary(&self) -> String {
        let s = self.snapshot().await;
        format!(
            r#"
=== PACELINE STATUS ===
Cycles: {} (timeouts {}) | Attempts: {} forced / {} probabilistic
Admitted: {} | Opened: {} | Profit: {} | Stop: {} | Failed: {}
Realized PnL: {} | Mean analysis latency: {:.1}ms
=======================
"#,
            s.cycles,
            s.cycle_timeouts,
            s.forced_attempts,
            s.probabilistic_attempts,
            s.admissions,
            s.trades_opened,
            s.closed_profit,
            s.closed_stop,
            s.trades_failed,
            s.realized_pnl,
            s.mean_analysis_latency_ms,
        )
    }

    /// Export counters in Prometheus text format
    pub async fn prometheus(&self) -> String {
        let s = self.snapshot().await;
        let mut out = String::new();
        for (name, help, value) in [
            ("paceline_cycles_total", "Admission cycles run", s.cycles),
            ("paceline_cycle_timeouts_total", "Cycles cut off by the cycle timeout", s.cycle_timeouts),
            ("paceline_forced_attempts_total", "Catch-up admission attempts", s.forced_attempts),
            ("paceline_probabilistic_attempts_total", "Probabilistic admission attempts", s.probabilistic_attempts),
            ("paceline_admissions_total", "Successful capital reservations", s.admissions),
            ("paceline_trades_opened_total", "Orders confirmed by the gateway", s.trades_opened),
            ("paceline_trades_closed_profit_total", "Trades closed in profit", s.closed_profit),
            ("paceline_trades_closed_stop_total", "Trades closed by a stop", s.closed_stop),
            ("paceline_trades_failed_total", "Trades that ended in Failed", s.trades_failed),
        ] {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n"
            ));
        }
        out.push_str("# HELP paceline_admission_rejections_total Rejected admissions by reason\n");
        out.push_str("# TYPE paceline_admission_rejections_total counter\n");
        for (reason, count) in &s.rejections {
            out.push_str(&format!(
                "paceline_admission_rejections_total{{reason=\"{}\"}} {}\n",
                reason.as_str(),
                count
            ));
        }
        out.push_str(&format!(
            "\n# HELP paceline_realized_pnl Realized PnL\n# TYPE paceline_realized_pnl gauge\npaceline_realized_pnl {}\n",
            s.realized_pnl
        ));
        out
    }

    pub async fn log_status(&self) {
        info!("{}", self.summary().await);
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
