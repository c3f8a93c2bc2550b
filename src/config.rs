use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PaceError, Result};

const DAY_MILLIS: u64 = 86_400_000;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub capital: CapitalConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Append-only trade log (JSON lines); disabled when unset
    #[serde(default)]
    pub trade_log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapitalConfig {
    /// Total account capital in USDT
    pub total_capital: Decimal,
    /// Capital never allocated to trades (margin requirements, fees)
    pub safety_buffer: Decimal,
    /// Margin reserved per trade
    pub trade_size: Decimal,
    /// Maximum trades in a non-terminal state
    pub max_concurrent_trades: usize,
    /// Leverage applied to every order
    pub leverage: u32,
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            total_capital: dec!(12),
            safety_buffer: dec!(2),
            trade_size: dec!(5),
            max_concurrent_trades: 2,
            leverage: 10,
        }
    }
}

impl CapitalConfig {
    /// Capital that may ever be allocated to trades
    pub fn usable_capital(&self) -> Decimal {
        self.total_capital - self.safety_buffer
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Stop loss distance as a fraction of entry (e.g., 0.005 = 0.5%)
    pub stop_loss_pct: Decimal,
    /// Take profit distance as a fraction of entry
    pub take_profit_pct: Decimal,
    /// Trailing stop distance as a fraction of entry
    pub trailing_stop_pct: Decimal,
    /// Favourable move required before the trailing stop arms
    #[serde(default = "default_trailing_activation_pct")]
    pub trailing_activation_pct: Decimal,
    /// Unrealized PnL (USDT) at which a position is taken as profit.
    /// A take-profit threshold, not a guaranteed outcome.
    pub min_profit: Decimal,
    /// Positions older than this are closed at market (0 = never)
    #[serde(default)]
    pub max_hold_secs: u64,
}

fn default_trailing_activation_pct() -> Decimal {
    dec!(0.004)
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: dec!(0.005),
            take_profit_pct: dec!(0.01),
            trailing_stop_pct: dec!(0.003),
            trailing_activation_pct: default_trailing_activation_pct(),
            min_profit: dec!(0.1),
            max_hold_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Long-run admission attempt rate
    pub target_trades_per_day: u32,
    /// Minimum spacing between admissions; defaults to the trade interval
    #[serde(default)]
    pub min_trade_interval_ms: Option<u64>,
    /// Seed for the probabilistic attempt draw (reproducible runs)
    #[serde(default)]
    pub rng_seed: Option<u64>,
    /// Smoothing factor for the realized daily rate
    #[serde(default = "default_rate_smoothing")]
    pub rate_smoothing: f64,
}

fn default_rate_smoothing() -> f64 {
    0.1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            target_trades_per_day: 750,
            min_trade_interval_ms: None,
            rng_seed: None,
            rate_smoothing: default_rate_smoothing(),
        }
    }
}

impl SchedulerConfig {
    /// Tick period: one day divided by the target rate
    pub fn trade_interval(&self) -> Duration {
        Duration::from_millis(DAY_MILLIS / u64::from(self.target_trades_per_day.max(1)))
    }

    pub fn min_trade_interval(&self) -> Duration {
        self.min_trade_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.trade_interval())
    }

    /// Closest two admission attempts may be: 90% of the minimum interval
    pub fn admission_spacing(&self) -> Duration {
        self.min_trade_interval() * 9 / 10
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Price read timeout in milliseconds
    pub ticker_timeout_ms: u64,
    /// Order placement / leverage timeout in milliseconds
    pub order_timeout_ms: u64,
    /// Position query timeout in milliseconds
    pub position_timeout_ms: u64,
    /// How long a cached ticker may stand in for a failed read
    #[serde(default = "default_ticker_cache_ttl")]
    pub ticker_cache_ttl_ms: u64,
}

fn default_ticker_cache_ttl() -> u64 {
    30_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ticker_timeout_ms: 5,
            order_timeout_ms: 5000,
            position_timeout_ms: 250,
            ticker_cache_ttl_ms: default_ticker_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Polling interval for position state in milliseconds
    pub poll_interval_ms: u64,
    /// Consecutive failed position queries before escalating to an emergency stop
    pub max_query_failures: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Close positions at market when monitors are cancelled
    #[serde(default)]
    pub flatten_on_stop: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_query_failures: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 5000,
            flatten_on_stop: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Symbols analysed every cycle
    pub symbols: Vec<String>,
    /// Decisions below this confidence are not admitted
    pub min_decision_confidence: f64,
    /// Per-agent signal timeout in milliseconds
    pub agent_timeout_ms: u64,
    /// Completed tasks retained for inspection
    pub task_history_limit: usize,
    /// Scale signal strength by agent performance
    #[serde(default = "default_true")]
    pub performance_weighting: bool,
    /// Recent prices kept per symbol for agent context
    #[serde(default = "default_price_history_len")]
    pub price_history_len: usize,
}

fn default_true() -> bool {
    true
}

fn default_price_history_len() -> usize {
    64
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
            ],
            min_decision_confidence: 0.1,
            agent_timeout_ms: 500,
            task_history_limit: 1000,
            performance_weighting: true,
            price_history_len: default_price_history_len(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("PACELINE_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (PACELINE_CAPITAL__TOTAL_CAPITAL, etc.)
            .add_source(
                Environment::with_prefix("PACELINE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("coordinator.symbols")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Check capital and risk settings; the engine refuses to start on failure
    pub fn validate(&self) -> Result<()> {
        let capital = &self.capital;
        if capital.total_capital <= Decimal::ZERO {
            return Err(invalid("capital.total_capital must be positive"));
        }
        if capital.safety_buffer < Decimal::ZERO || capital.safety_buffer >= capital.total_capital {
            return Err(invalid(
                "capital.safety_buffer must be non-negative and below total_capital",
            ));
        }
        if capital.trade_size <= Decimal::ZERO {
            return Err(invalid("capital.trade_size must be positive"));
        }
        if capital.trade_size > capital.usable_capital() {
            return Err(PaceError::Configuration(format!(
                "capital.trade_size {} exceeds usable capital {}",
                capital.trade_size,
                capital.usable_capital()
            )));
        }
        if capital.max_concurrent_trades == 0 {
            return Err(invalid("capital.max_concurrent_trades must be at least 1"));
        }
        if capital.leverage == 0 {
            return Err(invalid("capital.leverage must be at least 1"));
        }

        let risk = &self.risk;
        for (name, value) in [
            ("risk.stop_loss_pct", risk.stop_loss_pct),
            ("risk.take_profit_pct", risk.take_profit_pct),
            ("risk.trailing_stop_pct", risk.trailing_stop_pct),
            ("risk.trailing_activation_pct", risk.trailing_activation_pct),
        ] {
            if value <= Decimal::ZERO || value >= Decimal::ONE {
                return Err(PaceError::Configuration(format!(
                    "{} must be in (0, 1), got {}",
                    name, value
                )));
            }
        }
        if risk.min_profit <= Decimal::ZERO {
            return Err(invalid("risk.min_profit must be positive"));
        }

        if self.scheduler.target_trades_per_day == 0 {
            return Err(invalid("scheduler.target_trades_per_day must be positive"));
        }
        if u64::from(self.scheduler.target_trades_per_day) > DAY_MILLIS {
            return Err(PaceError::Configuration(format!(
                "scheduler.target_trades_per_day must be at most {} (one attempt per millisecond), got {}",
                DAY_MILLIS, self.scheduler.target_trades_per_day
            )));
        }
        if !(0.0..=1.0).contains(&self.scheduler.rate_smoothing) || self.scheduler.rate_smoothing == 0.0
        {
            return Err(invalid("scheduler.rate_smoothing must be in (0, 1]"));
        }
        if self.coordinator.symbols.is_empty() {
            return Err(invalid("coordinator.symbols must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.coordinator.min_decision_confidence) {
            return Err(invalid("coordinator.min_decision_confidence must be in [0, 1]"));
        }
        if self.monitor.poll_interval_ms == 0 {
            return Err(invalid("monitor.poll_interval_ms must be positive"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> PaceError {
    PaceError::Configuration(msg.to_string())
}
