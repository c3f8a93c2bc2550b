//! Cadence scheduler: decides on each tick whether to attempt an admission
//!
//! Ticks arrive every `trade_interval = 86_400_000ms / target_per_day`.
//! If the attempts made so far fall behind `floor(elapsed / trade_interval)`,
//! an attempt is forced. Otherwise the scheduler compares a smoothed
//! realized daily rate with the target and attempts with probability
//! `min(0.9, deficit / 10)`. Attempts are never closer together than the
//! admission spacing (`min_trade_interval * 0.9`).
//!
//! The scheduler never reads the wall clock; callers pass `now`.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::time::Duration;

use crate::config::SchedulerConfig;

const DAY_MS: f64 = 86_400_000.0;
const MAX_ATTEMPT_PROBABILITY: f64 = 0.9;
const DEFICIT_SCALE: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// First tick establishes the start of the window
    Warmup,
    /// Too close to the previous attempt
    MinInterval,
    /// On schedule and the probabilistic draw declined
    OnSchedule,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Warmup => "warmup",
            SkipReason::MinInterval => "min_interval",
            SkipReason::OnSchedule => "on_schedule",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TickDecision {
    /// Behind the expected count: attempt is mandatory
    Forced,
    /// On schedule but drawn to attempt
    Probabilistic { probability: f64 },
    Skip { reason: SkipReason },
}

impl TickDecision {
    pub fn is_attempt(&self) -> bool {
        !matches!(self, TickDecision::Skip { .. })
    }
}

/// Expected vs actual cadence
#[derive(Debug, Clone, Serialize)]
pub struct CadenceStats {
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_ms: i64,
    pub trade_interval_ms: u64,
    pub target_trades_per_day: u32,
    pub expected_by_now: u64,
    pub actual_attempts: u64,
    pub forced_attempts: u64,
    pub probabilistic_attempts: u64,
    pub ticks: u64,
    pub smoothed_daily_rate: f64,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

pub struct CadenceScheduler {
    target_per_day: u32,
    trade_interval: Duration,
    min_spacing: Duration,
    smoothing: f64,
    rng: StdRng,
    started_at: Option<DateTime<Utc>>,
    last_tick_at: Option<DateTime<Utc>>,
    last_attempt_at: Option<DateTime<Utc>>,
    actual_attempts: u64,
    forced_attempts: u64,
    probabilistic_attempts: u64,
    ticks: u64,
    smoothed_rate: f64,
}

impl CadenceScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            target_per_day: config.target_trades_per_day,
            trade_interval: config.trade_interval(),
            min_spacing: config.admission_spacing(),
            smoothing: config.rate_smoothing.clamp(0.0, 1.0),
            rng,
            started_at: None,
            last_tick_at: None,
            last_attempt_at: None,
            actual_attempts: 0,
            forced_attempts: 0,
            probabilistic_attempts: 0,
            ticks: 0,
            smoothed_rate: config.target_trades_per_day as f64,
        }
    }

    /// Tick period the driver should use
    pub fn trade_interval(&self) -> Duration {
        self.trade_interval
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> TickDecision {
        self.ticks += 1;
        let Some(started) = self.started_at else {
            self.started_at = Some(now);
            self.last_tick_at = Some(now);
            return TickDecision::Skip {
                reason: SkipReason::Warmup,
            };
        };
        self.last_tick_at = Some(now);

        let elapsed_ms = (now - started).num_milliseconds().max(0);
        if elapsed_ms == 0 {
            return TickDecision::Skip {
                reason: SkipReason::Warmup,
            };
        }

        if let Some(last) = self.last_attempt_at {
            let since = (now - last).num_milliseconds();
            if since < self.min_spacing.as_millis() as i64 {
                return TickDecision::Skip {
                    reason: SkipReason::MinInterval,
                };
            }
        }

        if self.actual_attempts < self.expected_at(elapsed_ms) {
            self.record_attempt(now);
            self.forced_attempts += 1;
            return TickDecision::Forced;
        }

        let realized = self.actual_attempts as f64 * DAY_MS / elapsed_ms as f64;
        self.smoothed_rate =
            self.smoothed_rate * (1.0 - self.smoothing) + realized * self.smoothing;
        let deficit = self.target_per_day as f64 - self.smoothed_rate;
        let probability = (deficit / DEFICIT_SCALE).clamp(0.0, MAX_ATTEMPT_PROBABILITY);

        if probability > 0.0 && self.rng.gen::<f64>() < probability {
            self.record_attempt(now);
            self.probabilistic_attempts += 1;
            return TickDecision::Probabilistic { probability };
        }
        TickDecision::Skip {
            reason: SkipReason::OnSchedule,
        }
    }

    fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.actual_attempts += 1;
        self.last_attempt_at = Some(now);
    }

    fn expected_at(&self, elapsed_ms: i64) -> u64 {
        let interval_ms = self.trade_interval.as_millis().max(1) as i64;
        (elapsed_ms / interval_ms) as u64
    }

    pub fn stats(&self) -> CadenceStats {
        let elapsed_ms = match (self.started_at, self.last_tick_at) {
            (Some(start), Some(last)) => (last - start).num_milliseconds().max(0),
            _ => 0,
        };
        CadenceStats {
            started_at: self.started_at,
            elapsed_ms,
            trade_interval_ms: self.trade_interval.as_millis() as u64,
            target_trades_per_day: self.target_per_day,
            expected_by_now: self.expected_at(elapsed_ms),
            actual_attempts: self.actual_attempts,
            forced_attempts: self.forced_attempts,
            probabilistic_attempts: self.probabilistic_attempts,
            ticks: self.ticks,
            smoothed_daily_rate: self.smoothed_rate,
            last_attempt_at: self.last_attempt_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn scheduler(target: u32) -> CadenceScheduler {
        CadenceScheduler::new(&SchedulerConfig {
            target_trades_per_day: target,
            rng_seed: Some(7),
            ..Default::default()
        })
    }

    #[test]
    fn test_first_tick_is_warmup() {
        let mut s = scheduler(750);
        let t0 = Utc::now();
        assert_eq!(
            s.tick(t0),
            TickDecision::Skip {
                reason: SkipReason::Warmup
            }
        );
        assert_eq!(s.stats().actual_attempts, 0);
    }

    #[test]
    fn test_behind_schedule_forces_attempt() {
        let mut s = scheduler(750);
        let t0 = Utc::now();
        s.tick(t0);
        let decision = s.tick(t0 + ChronoDuration::milliseconds(115_200));
        assert_eq!(decision, TickDecision::Forced);
        let stats = s.stats();
        assert_eq!(stats.expected_by_now, 1);
        assert_eq!(stats.actual_attempts, 1);
    }

    #[test]
    fn test_spacing_guard_blocks_close_attempts() {
        let mut s = scheduler(750);
        let t0 = Utc::now();
        s.tick(t0);
        // Far behind: many intervals passed at once
        let t1 = t0 + ChronoDuration::milliseconds(115_200 * 5);
        assert_eq!(s.tick(t1), TickDecision::Forced);
        let t2 = t1 + ChronoDuration::milliseconds(50_000);
        assert_eq!(
            s.tick(t2),
            TickDecision::Skip {
                reason: SkipReason::MinInterval
            }
        );
        let t3 = t1 + ChronoDuration::milliseconds(103_680);
        assert_eq!(s.tick(t3), TickDecision::Forced);
    }

    #[test]
    fn test_never_falls_behind_when_ticks_clear_spacing() {
        let mut s = scheduler(750);
        let t0 = Utc::now();
        s.tick(t0);
        let mut t = t0;
        for _ in 0..10 {
            t += ChronoDuration::milliseconds(115_200);
            s.tick(t);
        }
        assert_eq!(s.stats().forced_attempts, 10);
        for _ in 0..20 {
            t += ChronoDuration::milliseconds(104_000);
            s.tick(t);
            let stats = s.stats();
            assert!(stats.actual_attempts >= stats.expected_by_now);
        }
    }

    #[test]
    fn test_seeded_schedulers_agree() {
        let mut a = scheduler(750);
        let mut b = scheduler(750);
        let t0 = Utc::now();
        let mut t = t0;
        for _ in 0..200 {
            assert_eq!(a.tick(t), b.tick(t));
            t += ChronoDuration::milliseconds(110_000);
        }
    }
}
