//! Append-only trade log (JSON lines)
//!
//! One line per lifecycle event. On restart the log is replayed to find
//! trades that were opened but never closed, which are then checked
//! against the exchange.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::{Direction, TradeId, TradeState};
use crate::error::Result;
use crate::exchange::MarketGateway;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TradeLogEntry {
    Opened {
        trade_id: TradeId,
        symbol: String,
        direction: Direction,
        size: Decimal,
        qty: Decimal,
        entry_price: Decimal,
        order_id: String,
        opened_at: DateTime<Utc>,
    },
    Closed {
        trade_id: TradeId,
        symbol: String,
        state: TradeState,
        exit_price: Decimal,
        realized_pnl: Decimal,
        closed_at: DateTime<Utc>,
    },
    Failed {
        trade_id: TradeId,
        symbol: String,
        reason: String,
        failed_at: DateTime<Utc>,
    },
}

impl TradeLogEntry {
    pub fn trade_id(&self) -> TradeId {
        match self {
            TradeLogEntry::Opened { trade_id, .. }
            | TradeLogEntry::Closed { trade_id, .. }
            | TradeLogEntry::Failed { trade_id, .. } => *trade_id,
        }
    }
}

/// Result of replaying the log against live positions
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub entries_read: usize,
    /// Opened without a matching close whose position is still on the exchange
    pub orphaned_positions: Vec<(TradeId, String)>,
    /// Opened without a matching close and no longer on the exchange
    pub closed_while_down: Vec<(TradeId, String)>,
}

pub struct TradeLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TradeLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &TradeLogEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// All readable entries; malformed lines are skipped
    pub async fn read_all(&self) -> Result<Vec<TradeLogEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(line = lineno + 1, error = %e, "skipping malformed trade log line"),
            }
        }
        Ok(entries)
    }

    /// Opened entries with no later Closed/Failed entry, keyed by trade id
    pub async fn unmatched_opens(&self) -> Result<Vec<TradeLogEntry>> {
        let entries = self.read_all().await?;
        let mut open: HashMap<TradeId, TradeLogEntry> = HashMap::new();
        let mut order: Vec<TradeId> = Vec::new();
        for entry in entries {
            match &entry {
                TradeLogEntry::Opened { trade_id, .. } => {
                    order.push(*trade_id);
                    open.insert(*trade_id, entry);
                }
                _ => {
                    open.remove(&entry.trade_id());
                }
            }
        }
        Ok(order.into_iter().filter_map(|id| open.remove(&id)).collect())
    }

    /// Replay the log and compare unmatched opens with exchange positions.
    ///
    /// Trades whose position is gone are recorded as failed so the next
    /// replay does not report them again.
    pub async fn reconcile(
        &self,
        gateway: &dyn MarketGateway,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport {
            entries_read: self.read_all().await?.len(),
            ..Default::default()
        };
        let unmatched = self.unmatched_opens().await?;
        if unmatched.is_empty() {
            return Ok(report);
        }

        let positions = gateway.get_positions(None).await?;
        for entry in unmatched {
            let TradeLogEntry::Opened {
                trade_id,
                symbol,
                direction,
                ..
            } = entry
            else {
                continue;
            };
            let live = positions
                .iter()
                .any(|p| p.symbol == symbol && p.side == direction);
            if live {
                warn!(trade_id = %trade_id, symbol = %symbol, "exchange position has no supervising monitor");
                report.orphaned_positions.push((trade_id, symbol));
            } else {
                info!(trade_id = %trade_id, symbol = %symbol, "trade closed while engine was down");
                self.append(&TradeLogEntry::Failed {
                    trade_id,
                    symbol: symbol.clone(),
                    reason: "reconciled: position absent on restart".to_string(),
                    failed_at: now,
                })
                .await?;
                report.closed_while_down.push((trade_id, symbol));
            }
        }
        Ok(report)
    }
}
