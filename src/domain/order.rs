use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Direction;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good Till Cancelled
    GTC,
    /// Fill Or Kill
    FOK,
    /// Immediate Or Cancel
    IOC,
}

/// Order request (what we want the gateway to do)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    /// Only reduces an existing position (used for closes)
    #[serde(default)]
    pub reduce_only: bool,
}

impl OrderRequest {
    /// Market entry with exchange-side protective prices attached
    pub fn market_entry(
        symbol: &str,
        direction: Direction,
        qty: Decimal,
        take_profit: Decimal,
        stop_loss: Decimal,
    ) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: direction.entry_side(),
            order_type: OrderType::Market,
            qty,
            price: None,
            time_in_force: TimeInForce::IOC,
            take_profit: Some(take_profit),
            stop_loss: Some(stop_loss),
            reduce_only: false,
        }
    }

    /// Reduce-only market order flattening a position
    pub fn market_close(symbol: &str, direction: Direction, qty: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: direction.entry_side().opposite(),
            order_type: OrderType::Market,
            qty,
            price: None,
            time_in_force: TimeInForce::IOC,
            take_profit: None,
            stop_loss: None,
            reduce_only: true,
        }
    }
}

/// Gateway acknowledgement of a placed order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_close_uses_opposite_side() {
        let entry = OrderRequest::market_entry("BTCUSDT", Direction::Short, dec!(1), dec!(90), dec!(110));
        assert_eq!(entry.side, OrderSide::Sell);
        assert!(!entry.reduce_only);

        let close = OrderRequest::market_close("BTCUSDT", Direction::Short, dec!(1));
        assert_eq!(close.side, OrderSide::Buy);
        assert!(close.reduce_only);
        assert!(close.take_profit.is_none());
    }
}
