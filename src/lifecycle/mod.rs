//! Trade lifecycle: order parameters, exit rules, supervision, audit log

pub mod exit;
pub mod manager;
pub mod params;
pub mod trade_log;

pub use exit::{ExitReason, ExitRules, TrailingState};
pub use manager::{LifecycleConfig, LifecycleDeps, TradeLifecycleManager};
pub use params::OrderParams;
pub use trade_log::{ReconcileReport, TradeLog, TradeLogEntry};
