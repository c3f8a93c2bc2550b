use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{Direction, OrderAck, OrderRequest};
use crate::error::GatewayError;

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Latest market snapshot for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: Decimal,
    /// Rolling 24h volume
    pub volume: Decimal,
    /// 24h change as a fraction (0.01 = +1%)
    pub change_pct: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Exchange view of an open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub side: Direction,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Market data and order execution boundary.
///
/// Everything the engine knows about the outside market comes through this trait;
/// concrete exchange clients live outside the crate.
#[async_trait]
pub trait MarketGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn get_ticker(&self, symbol: &str) -> GatewayResult<Ticker>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()>;

    async fn place_order(&self, request: &OrderRequest) -> GatewayResult<OrderAck>;

    async fn get_positions(&self, symbol: Option<&str>) -> GatewayResult<Vec<PositionInfo>>;
}
