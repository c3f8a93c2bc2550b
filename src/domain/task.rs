use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Signal;
use crate::error::{PaceError, Result};

/// What a group is asked to do this cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskAction {
    /// Produce signals for each listed symbol
    AnalyzeSymbols { symbols: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Completed,
}

/// Outcome of a completed analysis task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub signals: Vec<Signal>,
    /// Agent id and reason for each agent that produced nothing
    pub failures: Vec<(String, String)>,
    pub latency_ms: u64,
}

/// Per-cycle unit of work for one agent group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub group_id: String,
    pub cycle: u64,
    pub action: TaskAction,
    /// Free-form context handed to the group (market summary)
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub assigned_agents: Vec<String>,
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        group_id: &str,
        cycle: u64,
        action: TaskAction,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id: group_id.to_string(),
            cycle,
            action,
            payload,
            status: TaskStatus::Pending,
            assigned_agents: Vec::new(),
            result: None,
            created_at: now,
            completed_at: None,
        }
    }

    pub fn assign(&mut self, agents: Vec<String>) -> Result<()> {
        if self.status != TaskStatus::Pending {
            return Err(PaceError::InvalidStateTransition {
                from: format!("{:?}", self.status),
                to: "Assigned".to_string(),
            });
        }
        self.assigned_agents = agents;
        self.status = TaskStatus::Assigned;
        Ok(())
    }

    pub fn complete(&mut self, result: TaskResult, now: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Assigned {
            return Err(PaceError::InvalidStateTransition {
                from: format!("{:?}", self.status),
                to: "Completed".to_string(),
            });
        }
        self.result = Some(result);
        self.status = TaskStatus::Completed;
        self.completed_at = Some(now);
        Ok(())
    }
}
