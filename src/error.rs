use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum PaceError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    // Per-cycle errors
    #[error("Admission rejected: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Monitoring failed: {0}")]
    Monitoring(#[from] MonitoringError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Trade not found: {0}")]
    TradeNotFound(Uuid),

    #[error("Engine halted: {0}")]
    Halted(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for PaceError
pub type Result<T> = std::result::Result<T, PaceError>;

/// Expected, non-fatal reasons a new trade is not admitted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Insufficient capital: requested {requested}, available {available}")]
    InsufficientCapital {
        requested: Decimal,
        available: Decimal,
    },

    #[error("Concurrency limit exceeded: {limit} trades already open")]
    ConcurrencyLimitExceeded { limit: usize },

    #[error("Symbol already active: {symbol}")]
    SymbolAlreadyActive { symbol: String },

    #[error("Too soon since last trade: {elapsed_ms}ms < {min_ms}ms")]
    TooSoonSinceLastTrade { elapsed_ms: i64, min_ms: i64 },
}

impl AdmissionError {
    /// Stable label used for metrics bucketing
    pub fn reason(&self) -> AdmissionRejection {
        match self {
            AdmissionError::InsufficientCapital { .. } => AdmissionRejection::InsufficientCapital,
            AdmissionError::ConcurrencyLimitExceeded { .. } => {
                AdmissionRejection::ConcurrencyLimitExceeded
            }
            AdmissionError::SymbolAlreadyActive { .. } => AdmissionRejection::SymbolAlreadyActive,
            AdmissionError::TooSoonSinceLastTrade { .. } => {
                AdmissionRejection::TooSoonSinceLastTrade
            }
        }
    }
}

/// Payload-free admission rejection reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionRejection {
    InsufficientCapital,
    ConcurrencyLimitExceeded,
    SymbolAlreadyActive,
    TooSoonSinceLastTrade,
}

impl AdmissionRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionRejection::InsufficientCapital => "insufficient_capital",
            AdmissionRejection::ConcurrencyLimitExceeded => "concurrency_limit_exceeded",
            AdmissionRejection::SymbolAlreadyActive => "symbol_already_active",
            AdmissionRejection::TooSoonSinceLastTrade => "too_soon_since_last_trade",
        }
    }
}

/// Errors that move an admitted trade to `Failed`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

impl ExecutionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::OrderRejected(_) => "order_rejected",
            ExecutionError::GatewayTimeout(_) => "gateway_timeout",
            ExecutionError::InvalidParameters(_) => "invalid_parameters",
        }
    }
}

/// Errors raised while supervising an open position
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitoringError {
    #[error("Position query failed for trade {trade_id} after {attempts} attempts: {reason}")]
    PositionQueryFailed {
        trade_id: Uuid,
        attempts: u32,
        reason: String,
    },
}

/// Failures reported by the market data / order gateway
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    #[error("Gateway call timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    /// Whether a cached value may stand in for the failed call
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited(_) | GatewayError::Unavailable(_) | GatewayError::Timeout { .. }
        )
    }
}

impl From<GatewayError> for ExecutionError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Timeout { .. } => ExecutionError::GatewayTimeout(err.to_string()),
            GatewayError::InvalidSymbol(_) => ExecutionError::InvalidParameters(err.to_string()),
            other => ExecutionError::OrderRejected(other.to_string()),
        }
    }
}

/// Capital ledger bookkeeping errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("No reservation for trade {0}")]
    UnknownReservation(Uuid),

    #[error("Reservation for trade {0} already released")]
    AlreadyReleased(Uuid),
}

/// Error category for status surfaces ("last error per category")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Admission,
    Execution,
    Monitoring,
    Configuration,
    Gateway,
    Internal,
}

impl PaceError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PaceError::Admission(_) => ErrorCategory::Admission,
            PaceError::Execution(_) => ErrorCategory::Execution,
            PaceError::Monitoring(_) => ErrorCategory::Monitoring,
            PaceError::Config(_) | PaceError::Configuration(_) => ErrorCategory::Configuration,
            PaceError::Gateway(_) => ErrorCategory::Gateway,
            _ => ErrorCategory::Internal,
        }
    }
}
