pub mod guarded;
pub mod paper;
pub mod traits;

pub use guarded::GuardedGateway;
pub use paper::PaperGateway;
pub use traits::{GatewayResult, MarketGateway, PositionInfo, Ticker};
