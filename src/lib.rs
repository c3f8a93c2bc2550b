pub mod agents;
pub mod clock;
pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod domain;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod lifecycle;
pub mod logging;
pub mod platform;
pub mod scheduler;
pub mod services;

pub use agents::{AgentKind, MarketContext, SignalAgent};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use coordination::{EmergencyReason, EmergencyState, EmergencyStopManager};
pub use coordinator::{AgentGroup, AgentRegistry, Coordinator};
pub use domain::{Decision, Direction, Signal, Trade, TradeId, TradeState};
pub use engine::{CycleOutcome, EngineStatus, TradingEngine};
pub use error::{
    AdmissionError, ErrorCategory, ExecutionError, GatewayError, LedgerError, MonitoringError,
    PaceError, Result,
};
pub use exchange::{GuardedGateway, MarketGateway, PaperGateway, PositionInfo, Ticker};
pub use lifecycle::{TradeLifecycleManager, TradeLog};
pub use platform::{CapitalLedger, CapitalSnapshot, Consensus, ConsensusAggregator};
pub use scheduler::{CadenceScheduler, TickDecision};
pub use services::EngineMetrics;
