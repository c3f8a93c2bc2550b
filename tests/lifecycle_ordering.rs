use async_trait::async_trait;
use paceline::clock::{Clock, ManualClock};
use paceline::config::{CoordinatorConfig, MonitorConfig, RiskConfig};
use paceline::coordination::EmergencyStopManager;
use paceline::coordinator::{AgentRegistry, Coordinator};
use paceline::domain::{Decision, Direction, OrderAck, OrderRequest, Trade, TradeState};
use paceline::exchange::{GatewayResult, MarketGateway, PaperGateway, PositionInfo, Ticker};
use paceline::lifecycle::{LifecycleConfig, LifecycleDeps, TradeLifecycleManager};
use paceline::platform::{CapitalLedger, LedgerConfig};
use paceline::services::EngineMetrics;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SYMBOLS: [&str; 4] = ["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT"];

#[derive(Debug, Clone)]
enum Event {
    /// Hand a decision for a symbol to the manager
    Propose { symbol: usize, long: bool },
    /// Toggle order rejection on the exchange
    RejectOrders(bool),
    /// Move the price 2% so stop loss or take profit fires
    Move { symbol: usize, up: bool },
    /// Position disappears on the exchange side
    ExchangeClose { symbol: usize },
    /// Next n position queries fail
    FailQueries(u32),
    /// Give monitors time to poll
    Settle,
    /// Try to open a trade that was never admitted
    Sneak { symbol: usize },
}

fn event() -> impl Strategy<Value = Event> {
    prop_oneof![
        3 => (0..SYMBOLS.len(), any::<bool>()).prop_map(|(symbol, long)| Event::Propose { symbol, long }),
        1 => any::<bool>().prop_map(Event::RejectOrders),
        2 => (0..SYMBOLS.len(), any::<bool>()).prop_map(|(symbol, up)| Event::Move { symbol, up }),
        1 => (0..SYMBOLS.len()).prop_map(|symbol| Event::ExchangeClose { symbol }),
        1 => (1..3u32).prop_map(Event::FailQueries),
        2 => Just(Event::Settle),
        1 => (0..SYMBOLS.len()).prop_map(|symbol| Event::Sneak { symbol }),
    ]
}

/// Paper exchange that counts entry orders arriving without a capital
/// reservation for their symbol.
struct ReservationCheckingGateway {
    paper: Arc<PaperGateway>,
    ledger: Arc<CapitalLedger>,
    unreserved_entries: AtomicUsize,
}

#[async_trait]
impl MarketGateway for ReservationCheckingGateway {
    fn name(&self) -> &str {
        "reservation-checking"
    }

    async fn get_ticker(&self, symbol: &str) -> GatewayResult<Ticker> {
        self.paper.get_ticker(symbol).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()> {
        self.paper.set_leverage(symbol, leverage).await
    }

    async fn place_order(&self, request: &OrderRequest) -> GatewayResult<OrderAck> {
        if !request.reduce_only && !self.ledger.has_open_trade(&request.symbol).await {
            self.unreserved_entries.fetch_add(1, Ordering::SeqCst);
        }
        self.paper.place_order(request).await
    }

    async fn get_positions(&self, symbol: Option<&str>) -> GatewayResult<Vec<PositionInfo>> {
        self.paper.get_positions(symbol).await
    }
}

struct Harness {
    manager: TradeLifecycleManager,
    paper: Arc<PaperGateway>,
    gateway: Arc<ReservationCheckingGateway>,
    ledger: Arc<CapitalLedger>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::default());
    let paper = Arc::new(PaperGateway::new(
        &[
            ("BTCUSDT", dec!(100)),
            ("ETHUSDT", dec!(50)),
            ("SOLUSDT", dec!(20)),
            ("XRPUSDT", dec!(2)),
        ],
        clock.clone(),
    ));
    let ledger = Arc::new(CapitalLedger::new(LedgerConfig {
        total_capital: dec!(12),
        safety_buffer: dec!(2),
        max_concurrent_trades: 2,
        min_admission_spacing: Duration::ZERO,
    }));
    let gateway = Arc::new(ReservationCheckingGateway {
        paper: paper.clone(),
        ledger: ledger.clone(),
        unreserved_entries: AtomicUsize::new(0),
    });
    let deps = LifecycleDeps {
        ledger: ledger.clone(),
        gateway: gateway.clone(),
        coordinator: Arc::new(Coordinator::new(
            CoordinatorConfig::default(),
            AgentRegistry::with_builtin_agents(),
        )),
        metrics: Arc::new(EngineMetrics::new()),
        emergency: Arc::new(EmergencyStopManager::new(clock.clone())),
        clock: clock.clone(),
        trade_log: None,
    };
    let config = LifecycleConfig {
        trade_size: dec!(5),
        leverage: 10,
        risk: RiskConfig::default(),
        monitor: MonitorConfig {
            poll_interval_ms: 2,
            max_query_failures: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 4,
            flatten_on_stop: false,
        },
        archive_limit: 1000,
    };
    Harness {
        manager: TradeLifecycleManager::new(config, deps),
        paper,
        gateway,
        ledger,
        clock,
    }
}

fn decision(symbol: &str, long: bool) -> Decision {
    let direction = if long { Direction::Long } else { Direction::Short };
    Decision {
        symbol: symbol.to_string(),
        direction,
        confidence: 0.7,
        signal_count: 1,
        contributors: vec![("momentum-1".into(), direction)],
    }
}

fn entry_orders(paper: &PaperGateway) -> usize {
    paper.orders().iter().filter(|o| !o.reduce_only).count()
}

fn position_of(trade: &Trade, state: TradeState) -> Option<usize> {
    trade.transitions.iter().position(|t| t.to == state)
}

/// Admitted strictly precedes Open in the recorded history
fn admitted_before_open(trade: &Trade) -> bool {
    match (
        position_of(trade, TradeState::Admitted),
        position_of(trade, TradeState::Open),
    ) {
        (Some(admitted), Some(open)) => admitted < open,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Replays `events` against a live manager and checks ordering and capital
/// invariants after every step. Returns the number of successful admissions.
async fn replay(events: Vec<Event>) -> usize {
    let h = harness();
    let mut admitted = 0usize;

    for event in events {
        match event {
            Event::Propose { symbol, long } => {
                let before = entry_orders(&h.paper);
                let result = h.manager.admit(&decision(SYMBOLS[symbol], long)).await;
                let after = entry_orders(&h.paper);
                match result {
                    Ok(id) => {
                        admitted += 1;
                        assert_eq!(after, before + 1);
                        let trade = h.manager.get(id).await.unwrap();
                        assert!(admitted_before_open(&trade));
                        assert!(trade.visited(TradeState::Open));
                    }
                    Err(e) => {
                        assert_eq!(after, before, "entry order placed for failed admission: {e}");
                    }
                }
            }
            Event::RejectOrders(reject) => h.paper.set_reject_orders(reject),
            Event::Move { symbol, up } => {
                let symbol = SYMBOLS[symbol];
                if let Some(price) = h.paper.price(symbol) {
                    let factor = if up { dec!(1.02) } else { dec!(0.98) };
                    h.paper.set_price(symbol, price * factor);
                }
            }
            Event::ExchangeClose { symbol } => {
                h.paper.remove_position(SYMBOLS[symbol]);
            }
            Event::FailQueries(n) => h.paper.fail_position_queries(n),
            Event::Settle => tokio::time::sleep(Duration::from_millis(15)).await,
            Event::Sneak { symbol } => {
                let now = h.clock.now();
                let mut trade = Trade::pending(&decision(SYMBOLS[symbol], true), dec!(5), 10, now);
                assert!(trade.transition(TradeState::Open, "no reservation", now).is_err());
                assert_eq!(trade.state, TradeState::Pending);
            }
        }

        let snapshot = h.ledger.snapshot().await;
        assert!(snapshot.is_balanced());
        assert!(snapshot.open_trades <= 2);
        assert_eq!(h.gateway.unreserved_entries.load(Ordering::SeqCst), 0);
        for trade in h.manager.open_trades().await {
            assert!(trade.visited(TradeState::Admitted));
            assert!(admitted_before_open(&trade));
        }
        for trade in h.manager.archived(usize::MAX).await {
            assert!(trade.state.is_terminal());
            assert!(admitted_before_open(&trade));
        }
    }

    h.manager.drain().await;

    let snapshot = h.ledger.snapshot().await;
    assert_eq!(snapshot.allocated, Decimal::ZERO);
    assert_eq!(snapshot.open_trades, 0);
    assert!(snapshot.is_balanced());
    assert_eq!(h.manager.open_count().await, 0);
    assert_eq!(h.manager.monitor_count().await, 0);

    let archived = h.manager.archived(usize::MAX).await;
    let opened = archived.iter().filter(|t| t.visited(TradeState::Open)).count();
    assert_eq!(opened, admitted);
    assert_eq!(entry_orders(&h.paper), admitted);
    for trade in &archived {
        assert!(trade.state.is_terminal());
        assert!(trade.visited(TradeState::Admitted));
        assert!(!h.ledger.holds_reservation(trade.id).await);
    }
    admitted
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// No entry order reaches the exchange and no trade reaches Open without
    /// a prior successful reservation, whatever the order of fills,
    /// rejections, exits and query failures.
    #[test]
    fn open_requires_prior_reservation(events in prop::collection::vec(event(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let admitted = runtime.block_on(replay(events.clone()));
        let proposals = events
            .iter()
            .filter(|e| matches!(e, Event::Propose { .. }))
            .count();
        prop_assert!(admitted <= proposals);
    }
}
