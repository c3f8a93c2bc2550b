//! Capital Ledger
//!
//! Single source of truth for whether a new trade may start. Every check and
//! every mutation of `allocated`/`available` happens under one lock, so a
//! reservation is either fully applied or not visible at all.
//!
//! Invariant: `allocated + available + safety_buffer == total` at all times.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::domain::TradeId;
use crate::error::{AdmissionError, LedgerError};

/// Released trade ids remembered for duplicate-release detection
pub const RELEASED_HISTORY_LIMIT: usize = 4096;

/// Ledger limits
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub total_capital: Decimal,
    pub safety_buffer: Decimal,
    pub max_concurrent_trades: usize,
    /// Minimum spacing between two successful reservations
    pub min_admission_spacing: Duration,
}

impl LedgerConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            total_capital: config.capital.total_capital,
            safety_buffer: config.capital.safety_buffer,
            max_concurrent_trades: config.capital.max_concurrent_trades,
            min_admission_spacing: config.scheduler.admission_spacing(),
        }
    }
}

/// Point-in-time view of the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalSnapshot {
    pub total: Decimal,
    pub allocated: Decimal,
    pub available: Decimal,
    pub safety_buffer: Decimal,
    pub open_trades: usize,
    pub active_symbols: Vec<String>,
}

impl CapitalSnapshot {
    pub fn is_balanced(&self) -> bool {
        self.allocated + self.available + self.safety_buffer == self.total
    }
}

#[derive(Debug, Clone)]
struct Reservation {
    symbol: String,
    amount: Decimal,
    reserved_at: DateTime<Utc>,
}

#[derive(Debug)]
struct LedgerInner {
    allocated: Decimal,
    available: Decimal,
    reservations: HashMap<TradeId, Reservation>,
    released: HashSet<TradeId>,
    released_order: VecDeque<TradeId>,
    last_admission_at: Option<DateTime<Utc>>,
}

impl LedgerInner {
    fn remember_released(&mut self, trade_id: TradeId) {
        if self.released.insert(trade_id) {
            self.released_order.push_back(trade_id);
        }
        while self.released_order.len() > RELEASED_HISTORY_LIMIT {
            if let Some(oldest) = self.released_order.pop_front() {
                self.released.remove(&oldest);
            }
        }
    }
}

pub struct CapitalLedger {
    config: LedgerConfig,
    inner: Mutex<LedgerInner>,
}

impl CapitalLedger {
    pub fn new(config: LedgerConfig) -> Self {
        let available = config.total_capital - config.safety_buffer;
        info!(
            total = %config.total_capital,
            buffer = %config.safety_buffer,
            available = %available,
            "capital ledger initialised"
        );
        Self {
            config,
            inner: Mutex::new(LedgerInner {
                allocated: Decimal::ZERO,
                available,
                reservations: HashMap::new(),
                released: HashSet::new(),
                released_order: VecDeque::new(),
                last_admission_at: None,
            }),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Reserve `amount` for `trade_id` on `symbol`.
    ///
    /// Checks, in order: capital, concurrency, symbol exclusivity, spacing.
    /// On any failure nothing is mutated.
    pub async fn try_reserve(
        &self,
        trade_id: TradeId,
        symbol: &str,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), AdmissionError> {
        let mut inner = self.inner.lock().await;

        if inner.available < amount || amount <= Decimal::ZERO {
            return Err(AdmissionError::InsufficientCapital {
                requested: amount,
                available: inner.available,
            });
        }

        if inner.reservations.len() >= self.config.max_concurrent_trades {
            return Err(AdmissionError::ConcurrencyLimitExceeded {
                limit: self.config.max_concurrent_trades,
            });
        }

        if inner.reservations.contains_key(&trade_id)
            || inner.reservations.values().any(|r| r.symbol == symbol)
        {
            return Err(AdmissionError::SymbolAlreadyActive {
                symbol: symbol.to_string(),
            });
        }

        if let Some(last) = inner.last_admission_at {
            let elapsed_ms = (now - last).num_milliseconds();
            let min_ms = self.config.min_admission_spacing.as_millis() as i64;
            if elapsed_ms < min_ms {
                return Err(AdmissionError::TooSoonSinceLastTrade { elapsed_ms, min_ms });
            }
        }

        inner.allocated += amount;
        inner.available -= amount;
        inner.last_admission_at = Some(now);
        inner.reservations.insert(
            trade_id,
            Reservation {
                symbol: symbol.to_string(),
                amount,
                reserved_at: now,
            },
        );
        debug!(
            trade_id = %trade_id,
            symbol,
            amount = %amount,
            available = %inner.available,
            "capital reserved"
        );
        Ok(())
    }

    /// Return the capital held for `trade_id`. A second release is rejected
    /// while the id is still within the last `RELEASED_HISTORY_LIMIT` releases.
    pub async fn release(&self, trade_id: TradeId, now: DateTime<Utc>) -> Result<Decimal, LedgerError> {
        let mut inner = self.inner.lock().await;

        let Some(reservation) = inner.reservations.remove(&trade_id) else {
            if inner.released.contains(&trade_id) {
                warn!(trade_id = %trade_id, "duplicate capital release rejected");
                return Err(LedgerError::AlreadyReleased(trade_id));
            }
            return Err(LedgerError::UnknownReservation(trade_id));
        };

        inner.allocated -= reservation.amount;
        inner.available += reservation.amount;
        inner.remember_released(trade_id);
        debug!(
            trade_id = %trade_id,
            symbol = %reservation.symbol,
            amount = %reservation.amount,
            held_secs = (now - reservation.reserved_at).num_seconds(),
            "capital released"
        );
        Ok(reservation.amount)
    }

    pub async fn snapshot(&self) -> CapitalSnapshot {
        let inner = self.inner.lock().await;
        let mut active_symbols: Vec<String> =
            inner.reservations.values().map(|r| r.symbol.clone()).collect();
        active_symbols.sort();
        CapitalSnapshot {
            total: self.config.total_capital,
            allocated: inner.allocated,
            available: inner.available,
            safety_buffer: self.config.safety_buffer,
            open_trades: inner.reservations.len(),
            active_symbols,
        }
    }

    pub async fn has_open_trade(&self, symbol: &str) -> bool {
        self.inner
            .lock()
            .await
            .reservations
            .values()
            .any(|r| r.symbol == symbol)
    }

    pub async fn holds_reservation(&self, trade_id: TradeId) -> bool {
        self.inner.lock().await.reservations.contains_key(&trade_id)
    }

    pub async fn open_trade_count(&self) -> usize {
        self.inner.lock().await.reservations.len()
    }
}
