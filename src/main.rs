use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use paceline::clock::{Clock, SystemClock};
use paceline::config::AppConfig;
use paceline::engine::TradingEngine;
use paceline::exchange::PaperGateway;
use paceline::logging;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

/// Cadence-controlled trade admission engine
#[derive(Parser, Debug)]
#[command(name = "paceline")]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine against the in-memory paper exchange
    Run {
        /// Configuration directory (default.toml, $PACELINE_ENV.toml)
        #[arg(long, default_value = "config")]
        config: PathBuf,
        /// Stop after this many seconds (runs until Ctrl+C when unset)
        #[arg(long)]
        duration_secs: Option<u64>,
        /// Override scheduler.target_trades_per_day
        #[arg(long)]
        trades_per_day: Option<u32>,
        /// Override scheduler.rng_seed
        #[arg(long)]
        seed: Option<u64>,
        /// Paper price step period in milliseconds
        #[arg(long, default_value_t = 1000)]
        price_step_ms: u64,
    },
    /// Load and validate configuration, then exit
    CheckConfig {
        #[arg(long, default_value = "config")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            duration_secs,
            trades_per_day,
            seed,
            price_step_ms,
        } => {
            let mut app = AppConfig::load_from(&config)
                .with_context(|| format!("loading configuration from {}", config.display()))?;
            if let Some(rate) = trades_per_day {
                app.scheduler.target_trades_per_day = rate;
            }
            if seed.is_some() {
                app.scheduler.rng_seed = seed;
            }
            logging::init(&app.logging);
            run_paper(app, duration_secs, price_step_ms).await?;
        }
        Commands::CheckConfig { config } => {
            logging::init_simple();
            let app = AppConfig::load_from(&config)
                .with_context(|| format!("loading configuration from {}", config.display()))?;
            app.validate()?;
            println!("configuration OK");
            println!(
                "  capital: total {} buffer {} trade size {} x{} (max {} concurrent)",
                app.capital.total_capital,
                app.capital.safety_buffer,
                app.capital.trade_size,
                app.capital.leverage,
                app.capital.max_concurrent_trades
            );
            println!(
                "  cadence: {} trades/day, tick every {:?}, min spacing {:?}",
                app.scheduler.target_trades_per_day,
                app.scheduler.trade_interval(),
                app.scheduler.admission_spacing()
            );
            println!("  symbols: {}", app.coordinator.symbols.join(", "));
        }
    }

    Ok(())
}

fn paper_start_price(symbol: &str) -> Decimal {
    match symbol {
        "BTCUSDT" => dec!(65000),
        "ETHUSDT" => dec!(3200),
        "SOLUSDT" => dec!(150),
        _ => dec!(100),
    }
}

async fn run_paper(config: AppConfig, duration_secs: Option<u64>, price_step_ms: u64) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let markets: Vec<(&str, Decimal)> = config
        .coordinator
        .symbols
        .iter()
        .map(|s| (s.as_str(), paper_start_price(s)))
        .collect();
    let paper = Arc::new(PaperGateway::new(&markets, clock.clone()));

    let engine = Arc::new(TradingEngine::new(config, paper.clone(), clock)?);

    let stepper = {
        let paper = paper.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(price_step_ms.max(1)));
            loop {
                interval.tick().await;
                paper.step();
            }
        })
    };

    engine.start().await?;
    info!("paper trading running, press Ctrl+C to stop");

    match duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = shutdown_signal() => info!("shutdown signal received"),
                _ = tokio::time::sleep(Duration::from_secs(secs)) => info!(secs, "run duration elapsed"),
            }
        }
        None => shutdown_signal().await,
    }

    engine.stop().await;
    stepper.abort();

    let status = engine.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
