//! Signal agents
//!
//! Each agent implements `SignalAgent` and is driven by the coordinator,
//! which groups agents by capability and fans tasks out to them.

pub mod context;
pub mod mean_reversion;
pub mod momentum;
pub mod traits;
pub mod volume;

pub use context::{MarketContext, MarketHistory};
pub use mean_reversion::MeanReversionAgent;
pub use momentum::MomentumAgent;
pub use traits::{AgentKind, SignalAgent};
pub use volume::VolumeBreakoutAgent;
