//! Emergency stop
//!
//! A single halt switch for the engine:
//! - Blocks new admissions immediately (atomic flag)
//! - Records why and when it was triggered
//! - Stays active until an operator resets it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::clock::Clock;
use crate::error::{PaceError, Result};

/// Emergency stop reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmergencyReason {
    /// Manual trigger by operator
    Manual,
    /// Position queries kept failing for an open trade
    MonitoringFailure,
    /// Exchange unreachable
    ExchangeConnectivity,
    Other(String),
}

impl std::fmt::Display for EmergencyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmergencyReason::Manual => write!(f, "Manual"),
            EmergencyReason::MonitoringFailure => write!(f, "MonitoringFailure"),
            EmergencyReason::ExchangeConnectivity => write!(f, "ExchangeConnectivity"),
            EmergencyReason::Other(s) => write!(f, "Other: {}", s),
        }
    }
}

/// Emergency stop state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmergencyState {
    pub active: bool,
    pub reason: Option<EmergencyReason>,
    pub triggered_at: Option<DateTime<Utc>>,
    /// Additional context
    pub context: Option<String>,
}

pub struct EmergencyStopManager {
    state: RwLock<EmergencyState>,
    is_stopped: AtomicBool,
    trigger_count: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl EmergencyStopManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(EmergencyState::default()),
            is_stopped: AtomicBool::new(false),
            trigger_count: AtomicU64::new(0),
            clock,
        }
    }

    /// Fast atomic check
    pub fn is_stopped(&self) -> bool {
        self.is_stopped.load(Ordering::Relaxed)
    }

    pub async fn get_state(&self) -> EmergencyState {
        self.state.read().await.clone()
    }

    pub fn trigger_count(&self) -> u64 {
        self.trigger_count.load(Ordering::Relaxed)
    }

    /// Raise the halt flag. Returns false if it was already raised, in which
    /// case the original reason is kept.
    pub async fn trigger(&self, reason: EmergencyReason, context: Option<String>) -> bool {
        if self.is_stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        error!(reason = %reason, context = ?context, "EMERGENCY STOP TRIGGERED");
        self.trigger_count.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.write().await;
        state.active = true;
        state.reason = Some(reason);
        state.triggered_at = Some(self.clock.now());
        state.context = context;
        true
    }

    /// Clear the halt (requires manual intervention)
    pub async fn reset(&self, operator: &str) {
        info!(operator, "resetting emergency stop");
        *self.state.write().await = EmergencyState::default();
        self.is_stopped.store(false, Ordering::SeqCst);
    }

    /// Err while the emergency stop is active
    pub fn check_allowed(&self) -> Result<()> {
        if self.is_stopped() {
            Err(PaceError::Halted(
                "emergency stop is active, new admissions are blocked".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manager() -> EmergencyStopManager {
        EmergencyStopManager::new(Arc::new(ManualClock::default()))
    }

    #[test]
    fn test_emergency_reason_display() {
        assert_eq!(EmergencyReason::Manual.to_string(), "Manual");
        assert_eq!(
            EmergencyReason::Other("test".to_string()).to_string(),
            "Other: test"
        );
    }

    #[tokio::test]
    async fn test_trigger_and_reset() {
        let stop = manager();
        assert!(stop.check_allowed().is_ok());

        assert!(stop.trigger(EmergencyReason::Manual, Some("drill".into())).await);
        assert!(stop.is_stopped());
        assert!(matches!(stop.check_allowed(), Err(PaceError::Halted(_))));

        // Second trigger keeps the first reason
        assert!(!stop.trigger(EmergencyReason::MonitoringFailure, None).await);
        let state = stop.get_state().await;
        assert_eq!(state.reason, Some(EmergencyReason::Manual));
        assert_eq!(stop.trigger_count(), 1);

        stop.reset("ops").await;
        assert!(!stop.is_stopped());
        assert!(!stop.get_state().await.active);
    }
}
