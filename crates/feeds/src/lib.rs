//! Aggregator WebSocket monitors
//!
//! Features:
//! - One WebSocket monitor per aggregator (CoinGecko, Mobula, Codex, GMGN)
//! - Per-aggregator wire decoders
//! - Automatic reconnection with exponential backoff
//! - Shared Prometheus registry for latency gauges

pub mod decoder;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;
pub mod protocols;
pub mod shutdown;
pub mod stats;
pub mod supervisor;

pub use decoder::{ChainTable, ControlFrame, Decoded, Decoder};
pub use metrics::{AggregatorMetrics, MetricsSink};
pub use monitor::AggregatorMonitor;
pub use orchestrator::{build_monitors, MonitorSet};
pub use protocols::FeedProtocol;
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
pub use stats::{LatencySummary, SessionStats};
pub use supervisor::{Backoff, ConnectionSupervisor, MonitorExit, StreamEnd, StreamHandler};
