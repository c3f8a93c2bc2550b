//! SignalAgent trait: one capability, many analysers
//!
//! The coordinator only depends on this trait. Each concrete agent answers
//! one question: given a symbol and its market context, which way and how
//! sure? Agents are side-effect free so the coordinator may call them
//! concurrently.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::context::MarketContext;
use super::{MeanReversionAgent, MomentumAgent, VolumeBreakoutAgent};
use crate::domain::Signal;
use crate::error::Result;

/// Closed set of analyser capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Momentum,
    MeanReversion,
    VolumeBreakout,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Momentum => "momentum",
            AgentKind::MeanReversion => "mean_reversion",
            AgentKind::VolumeBreakout => "volume_breakout",
        }
    }

    /// Group an agent of this kind joins by default
    pub fn default_group(&self) -> &'static str {
        match self {
            AgentKind::Momentum => "trend",
            AgentKind::MeanReversion => "reversion",
            AgentKind::VolumeBreakout => "flow",
        }
    }

    /// Instantiate the built-in agent for this kind
    pub fn build(&self, id: &str) -> Arc<dyn SignalAgent> {
        match self {
            AgentKind::Momentum => Arc::new(MomentumAgent::new(id)),
            AgentKind::MeanReversion => Arc::new(MeanReversionAgent::new(id)),
            AgentKind::VolumeBreakout => Arc::new(VolumeBreakoutAgent::new(id)),
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[async_trait]
pub trait SignalAgent: Send + Sync {
    /// Unique identifier for this agent instance
    fn id(&self) -> &str;

    /// Capability tag
    fn kind(&self) -> AgentKind;

    /// Produce a directional signal, or `None` when the agent has no view.
    async fn produce_signal(&self, symbol: &str, ctx: &MarketContext) -> Result<Option<Signal>>;
}
