//! Coordinator: issues analysis tasks to agent groups and scores agents
//!
//! Each cycle the coordinator creates one `Task` per group that has at
//! least one active agent, fans the task out to every agent in the group
//! for every symbol concurrently, and joins the results before returning.
//! Agents that time out or error are recorded as task failures and never
//! hold up the cycle longer than `agent_timeout_ms`.
//!
//! Closed trades feed back into each contributing agent's performance
//! score, which in turn weights that agent's future signals.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::registry::AgentRegistry;
use super::state::AgentSnapshot;
use crate::agents::{MarketContext, SignalAgent};
use crate::config::CoordinatorConfig;
use crate::domain::{Direction, Signal, Task, TaskAction, TaskResult};

/// Everything gathered in one cycle
#[derive(Debug, Clone, Default)]
pub struct CycleSignals {
    pub cycle: u64,
    pub signals: Vec<Signal>,
    pub tasks_dispatched: usize,
    /// Agent id and reason for agents that timed out or errored
    pub failures: Vec<(String, String)>,
    pub latency_ms: u64,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    registry: RwLock<AgentRegistry>,
    history: Mutex<VecDeque<Task>>,
    cycle: AtomicU64,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, registry: AgentRegistry) -> Self {
        info!(
            agents = registry.len(),
            groups = registry.groups().count(),
            "coordinator initialised"
        );
        Self {
            config,
            registry: RwLock::new(registry),
            history: Mutex::new(VecDeque::new()),
            cycle: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run one analysis cycle over `contexts` (keyed by symbol)
    pub async fn gather_signals(
        &self,
        contexts: &BTreeMap<String, MarketContext>,
        now: DateTime<Utc>,
    ) -> CycleSignals {
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();
        let symbols: Vec<String> = contexts.keys().cloned().collect();
        let payload = serde_json::json!({
            "markets": contexts
                .values()
                .map(|ctx| serde_json::json!({
                    "symbol": ctx.ticker.symbol,
                    "price": ctx.ticker.price,
                    "change_pct": ctx.ticker.change_pct,
                }))
                .collect::<Vec<_>>(),
        });

        let plan: Vec<(Task, Vec<Arc<dyn SignalAgent>>)> = {
            let registry = self.registry.read().await;
            registry
                .groups()
                .filter_map(|group| {
                    let agents = registry.active_agents(&group.id);
                    if agents.is_empty() {
                        debug!(group = %group.id, "no active agents, group skipped");
                        return None;
                    }
                    let mut task = Task::new(
                        &group.id,
                        cycle,
                        TaskAction::AnalyzeSymbols {
                            symbols: symbols.clone(),
                        },
                        payload.clone(),
                        now,
                    );
                    task.assign(agents.iter().map(|a| a.id().to_string()).collect())
                        .ok()?;
                    Some((task, agents))
                })
                .collect()
        };

        let timeout = Duration::from_millis(self.config.agent_timeout_ms);
        let completed = join_all(
            plan.into_iter()
                .map(|(task, agents)| run_task(task, agents, contexts, timeout, now)),
        )
        .await;

        let mut out = CycleSignals {
            cycle,
            tasks_dispatched: completed.len(),
            ..Default::default()
        };
        for task in &completed {
            if let Some(result) = &task.result {
                out.signals.extend(result.signals.iter().cloned());
                out.failures.extend(result.failures.iter().cloned());
            }
        }
        self.update_agent_stats(&out).await;
        self.archive(completed).await;

        out.latency_ms = started.elapsed().as_millis() as u64;
        debug!(
            cycle,
            signals = out.signals.len(),
            failures = out.failures.len(),
            latency_ms = out.latency_ms,
            "analysis cycle complete"
        );
        out
    }

    async fn update_agent_stats(&self, cycle: &CycleSignals) {
        let mut registry = self.registry.write().await;
        for signal in &cycle.signals {
            if let Some(state) = registry.get_mut(&signal.agent_id) {
                state.signals_produced += 1;
                state.confidence = signal.confidence;
                state.last_signal_at = Some(signal.timestamp);
            }
        }
        for (agent_id, _) in &cycle.failures {
            if let Some(state) = registry.get_mut(agent_id) {
                state.failures += 1;
            }
        }
    }

    async fn archive(&self, tasks: Vec<Task>) {
        let limit = self.config.task_history_limit.max(1);
        let mut history = self.history.lock().await;
        for task in tasks {
            history.push_back(task);
            while history.len() > limit {
                history.pop_front();
            }
        }
    }

    /// Feed a closed trade back into each contributor's performance score.
    ///
    /// Outcome is 1.0 when the agent agreed with a profitable trade or
    /// opposed a losing one, else 0.0.
    pub async fn record_trade_outcome(
        &self,
        trade_direction: Direction,
        contributors: &[(String, Direction)],
        realized_pnl: Decimal,
    ) {
        let profitable = realized_pnl > Decimal::ZERO;
        let mut registry = self.registry.write().await;
        for (agent_id, voted) in contributors {
            let agreed = *voted == trade_direction;
            let outcome = if agreed == profitable { 1.0 } else { 0.0 };
            match registry.get_mut(agent_id) {
                Some(state) => {
                    state.record_outcome(outcome);
                    debug!(
                        agent = %agent_id,
                        outcome,
                        score = state.performance_score,
                        "agent performance updated"
                    );
                }
                None => warn!(agent = %agent_id, "outcome for unknown agent ignored"),
            }
        }
    }

    /// Per-agent weights for aggregation; empty when weighting is off
    pub async fn weights(&self) -> HashMap<String, f64> {
        if !self.config.performance_weighting {
            return HashMap::new();
        }
        self.registry
            .read()
            .await
            .snapshots()
            .into_iter()
            .map(|s| (s.agent_id, 0.5 + s.performance_score))
            .collect()
    }

    pub async fn set_agent_active(&self, agent_id: &str, active: bool) -> bool {
        self.registry.write().await.set_active(agent_id, active)
    }

    pub async fn agent_snapshots(&self) -> Vec<AgentSnapshot> {
        self.registry.read().await.snapshots()
    }

    /// Most recent tasks, newest last
    pub async fn recent_tasks(&self, limit: usize) -> Vec<Task> {
        let history = self.history.lock().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub async fn task_history_len(&self) -> usize {
        self.history.lock().await.len()
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycle.load(Ordering::Relaxed)
    }
}

async fn run_task(
    mut task: Task,
    agents: Vec<Arc<dyn SignalAgent>>,
    contexts: &BTreeMap<String, MarketContext>,
    timeout: Duration,
    now: DateTime<Utc>,
) -> Task {
    let started = Instant::now();
    let calls = agents.iter().flat_map(|agent| {
        contexts.iter().map(move |(symbol, ctx)| {
            let agent = agent.clone();
            async move {
                let outcome =
                    tokio::time::timeout(timeout, agent.produce_signal(symbol, ctx)).await;
                let outcome = match outcome {
                    Ok(Ok(signal)) => Ok(signal.filter(|s| s.symbol == *symbol)),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
                };
                (agent.id().to_string(), outcome)
            }
        })
    });

    let mut result = TaskResult::default();
    for (agent_id, outcome) in join_all(calls).await {
        match outcome {
            Ok(Some(signal)) => result.signals.push(signal),
            Ok(None) => {}
            Err(reason) => {
                warn!(group = %task.group_id, agent = %agent_id, %reason, "agent call failed");
                result.failures.push((agent_id, reason));
            }
        }
    }
    result.latency_ms = started.elapsed().as_millis() as u64;

    if let Err(e) = task.complete(result, now) {
        warn!(task = %task.id, error = %e, "task completion rejected");
    }
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentKind;
    use crate::domain::TaskStatus;
    use crate::error::Result;
    use crate::exchange::Ticker;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct FixedAgent {
        id: String,
        direction: Direction,
        delay: Duration,
    }

    #[async_trait]
    impl SignalAgent for FixedAgent {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> AgentKind {
            AgentKind::Momentum
        }

        async fn produce_signal(
            &self,
            symbol: &str,
            ctx: &MarketContext,
        ) -> Result<Option<Signal>> {
            tokio::time::sleep(self.delay).await;
            Ok(Some(Signal::new(
                &self.id,
                symbol,
                self.direction,
                0.8,
                1.0,
                ctx.as_of,
            )))
        }
    }

    fn fixed(id: &str, direction: Direction, delay_ms: u64) -> Arc<dyn SignalAgent> {
        Arc::new(FixedAgent {
            id: id.to_string(),
            direction,
            delay: Duration::from_millis(delay_ms),
        })
    }

    fn contexts(symbols: &[&str]) -> BTreeMap<String, MarketContext> {
        symbols
            .iter()
            .map(|s| {
                let ticker = Ticker {
                    symbol: s.to_string(),
                    price: dec!(100),
                    volume: dec!(10),
                    change_pct: dec!(0.01),
                    timestamp: Utc::now(),
                };
                (s.to_string(), MarketContext::new(ticker, Utc::now()))
            })
            .collect()
    }

    fn config(timeout_ms: u64, history: usize) -> CoordinatorConfig {
        CoordinatorConfig {
            agent_timeout_ms: timeout_ms,
            task_history_limit: history,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_one_task_per_group_and_fan_out() {
        let mut registry = AgentRegistry::new();
        registry.register(fixed("a", Direction::Long, 0), "trend").unwrap();
        registry.register(fixed("b", Direction::Short, 0), "trend").unwrap();
        registry.register(fixed("c", Direction::Long, 0), "flow").unwrap();
        let coordinator = Coordinator::new(config(100, 10), registry);

        let out = coordinator
            .gather_signals(&contexts(&["BTCUSDT", "ETHUSDT"]), Utc::now())
            .await;
        assert_eq!(out.cycle, 1);
        assert_eq!(out.tasks_dispatched, 2);
        assert_eq!(out.signals.len(), 6);
        assert!(out.failures.is_empty());

        let tasks = coordinator.recent_tasks(10).await;
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_slow_agent_times_out_without_blocking() {
        let mut registry = AgentRegistry::new();
        registry.register(fixed("fast", Direction::Long, 0), "trend").unwrap();
        registry.register(fixed("slow", Direction::Long, 500), "trend").unwrap();
        let coordinator = Coordinator::new(config(20, 10), registry);

        let out = coordinator
            .gather_signals(&contexts(&["BTCUSDT"]), Utc::now())
            .await;
        assert_eq!(out.signals.len(), 1);
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].0, "slow");
        assert!(out.latency_ms < 500);

        let slow = coordinator
            .agent_snapshots()
            .await
            .into_iter()
            .find(|s| s.agent_id == "slow")
            .unwrap();
        assert_eq!(slow.failures, 1);
    }

    #[tokio::test]
    async fn test_inactive_group_gets_no_task() {
        let mut registry = AgentRegistry::new();
        registry.register(fixed("a", Direction::Long, 0), "trend").unwrap();
        registry.register(fixed("b", Direction::Long, 0), "flow").unwrap();
        let coordinator = Coordinator::new(config(100, 10), registry);
        coordinator.set_agent_active("b", false).await;

        let out = coordinator
            .gather_signals(&contexts(&["BTCUSDT"]), Utc::now())
            .await;
        assert_eq!(out.tasks_dispatched, 1);
    }

    #[tokio::test]
    async fn test_task_history_is_bounded() {
        let mut registry = AgentRegistry::new();
        registry.register(fixed("a", Direction::Long, 0), "trend").unwrap();
        let coordinator = Coordinator::new(config(100, 3), registry);
        for _ in 0..5 {
            coordinator
                .gather_signals(&contexts(&["BTCUSDT"]), Utc::now())
                .await;
        }
        assert_eq!(coordinator.task_history_len().await, 3);
        let tasks = coordinator.recent_tasks(10).await;
        assert_eq!(tasks.first().unwrap().cycle, 3);
        assert_eq!(tasks.last().unwrap().cycle, 5);
    }

    #[tokio::test]
    async fn test_outcomes_update_scores_and_weights() {
        let mut registry = AgentRegistry::new();
        registry.register(fixed("bull", Direction::Long, 0), "trend").unwrap();
        registry.register(fixed("bear", Direction::Short, 0), "trend").unwrap();
        let coordinator = Coordinator::new(config(100, 10), registry);

        let contributors = vec![
            ("bull".to_string(), Direction::Long),
            ("bear".to_string(), Direction::Short),
        ];
        coordinator
            .record_trade_outcome(Direction::Long, &contributors, dec!(0.4))
            .await;

        let weights = coordinator.weights().await;
        assert!((weights["bull"] - 1.025).abs() < 1e-12);
        assert!((weights["bear"] - 0.975).abs() < 1e-12);

        // A losing long rewards the agent that opposed it
        coordinator
            .record_trade_outcome(Direction::Long, &contributors, dec!(-0.4))
            .await;
        let weights = coordinator.weights().await;
        assert!(weights["bear"] > 0.975);
    }

    #[tokio::test]
    async fn test_weighting_disabled_gives_empty_map() {
        let cfg = CoordinatorConfig {
            performance_weighting: false,
            ..Default::default()
        };
        let coordinator = Coordinator::new(cfg, AgentRegistry::with_builtin_agents());
        assert!(coordinator.weights().await.is_empty());
    }
}
