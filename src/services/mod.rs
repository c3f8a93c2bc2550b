pub mod metrics;

pub use metrics::{EngineMetrics, LastError, MetricsSnapshot, PnlPoint};
