//! Per-aggregator monitor
//!
//! Binds a protocol, its connection supervisor and the event pipeline that
//! turns decoded events into latency metrics.

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use idxlag_core::{
    compute_lag_ms, is_plausible, Aggregator, Clock, ConnectionState, FeedError, LatencyGrade,
    LatencySample, MonitorSettings, PoolEvent, SystemClock, TimestampUnit, TradeEvent,
};

use crate::decoder::{ControlFrame, Decoded, Decoder};
use crate::metrics::MetricsSink;
use crate::protocols::{self, WsStream};
use crate::shutdown::Shutdown;
use crate::stats::SessionStats;
use crate::supervisor::{ConnectionSupervisor, MonitorExit, StreamEnd, StreamHandler};

/// Decoded events to metrics, logs and session statistics
struct EventPipeline {
    aggregator: Aggregator,
    unit: TimestampUnit,
    sink: Arc<MetricsSink>,
    clock: Arc<dyn Clock>,
    stats: SessionStats,
    summary_every: u64,
    ping_interval: Duration,
    /// Longest silence tolerated before the stream counts as lost
    idle_timeout: Duration,
}

impl EventPipeline {
    fn tag(&self) -> &'static str {
        self.aggregator.tag()
    }

    /// Returns the reason to drop the connection, if any
    fn handle_text(&mut self, text: &str, decoder: &dyn Decoder) -> Option<StreamEnd> {
        let received_at = self.clock.now();

        let decoded = match decoder.decode(text, received_at) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("[{}] Dropping malformed message: {}", self.tag(), e);
                return None;
            }
        };

        match decoded {
            Decoded::Trades(trades) => {
                for trade in &trades {
                    self.record_trade(trade);
                }
            }
            Decoded::Pools(pools) => {
                for pool in &pools {
                    self.record_pool(pool);
                }
            }
            Decoded::Control(ControlFrame::KeepAlive) => debug!("[{}] keepalive", self.tag()),
            Decoded::Control(ControlFrame::Ack) => info!("[{}] Subscription acknowledged", self.tag()),
            Decoded::Control(ControlFrame::Error(reason)) => {
                error!("[{}] Server error: {}", self.tag(), reason);
                return Some(StreamEnd::Lost(FeedError::Remote(reason)));
            }
            Decoded::Control(ControlFrame::Complete(id)) => {
                let id = id.unwrap_or_else(|| "stream".to_string());
                warn!("[{}] Subscription {} completed by server", self.tag(), id);
                return Some(StreamEnd::Lost(FeedError::Completed(id)));
            }
            Decoded::Unrecognized => debug!("[{}] Ignoring message: {}", self.tag(), preview(text)),
        }

        None
    }

    fn sample(&self, chain: &str, event_timestamp: i64, received_at: DateTime<Utc>) -> LatencySample {
        let lag_ms = compute_lag_ms(event_timestamp, self.unit, received_at);
        debug!(
            "[{}][{}] Raw timestamp: {}{} | Receive time: {} | Lag: {}ms",
            self.tag(),
            chain,
            event_timestamp,
            self.unit.suffix(),
            received_at.format("%H:%M:%S%.3f"),
            lag_ms
        );
        if !is_plausible(lag_ms) {
            warn!(
                "[{}][{}] Implausible lag {}ms (raw timestamp {}{}, check timestamp_unit)",
                self.tag(),
                chain,
                lag_ms,
                event_timestamp,
                self.unit.suffix()
            );
        }
        LatencySample {
            aggregator: self.aggregator,
            chain: chain.to_string(),
            lag_ms,
        }
    }

    fn record_trade(&mut self, trade: &TradeEvent) {
        let sample = self.sample(&trade.chain, trade.event_timestamp, trade.received_at);
        let lag_ms = sample.lag_ms;
        let name = sample.aggregator.name();

        if let Err(e) = self.sink.record_latency(name, &sample.chain, lag_ms) {
            error!("[{}] Failed to record latency: {}", self.tag(), e);
        }
        if let Err(e) = self
            .sink
            .record_trade(name, &trade.chain, trade.trade_type, trade.volume_usd)
        {
            error!("[{}] Failed to record trade: {}", self.tag(), e);
        }

        let volume = trade
            .volume_usd
            .map(|v| format!("${v:.2}"))
            .unwrap_or_else(|| "n/a".to_string());
        info!(
            "[{}][{}] New swap! tx={}... type={} volume={} lag={}ms [{}]",
            self.tag(),
            trade.chain,
            trade.short_hash(),
            trade.trade_type,
            volume,
            lag_ms,
            LatencyGrade::from_lag_ms(lag_ms)
        );

        self.stats.record_swap(&trade.chain, lag_ms);
        self.maybe_summary();
    }

    fn record_pool(&mut self, pool: &PoolEvent) {
        let sample = self.sample(&pool.chain, pool.event_timestamp, pool.received_at);
        let lag_ms = sample.lag_ms;

        if let Err(e) = self
            .sink
            .record_pool_discovery(sample.aggregator.name(), &sample.chain, lag_ms)
        {
            error!("[{}] Failed to record pool discovery: {}", self.tag(), e);
        }

        info!(
            "[{}][{}] New pool! token={} exchange={} pool={}... liquidity={} lag={}ms [{}]",
            self.tag(),
            pool.chain,
            pool.token_symbol,
            pool.exchange,
            pool.short_address(),
            pool.initial_liquidity_usd
                .map(|v| format!("${v:.2}"))
                .unwrap_or_else(|| "n/a".to_string()),
            lag_ms,
            LatencyGrade::from_lag_ms(lag_ms)
        );

        self.stats.record_pool(&pool.chain, lag_ms);
        self.maybe_summary();
    }

    fn maybe_summary(&self) {
        if self.summary_every > 0 && self.stats.total_events() % self.summary_every == 0 {
            self.stats.log_summary(self.tag());
        }
    }
}

#[async_trait::async_trait]
impl StreamHandler for EventPipeline {
    async fn stream(
        &mut self,
        ws: &mut WsStream,
        decoder: &dyn Decoder,
        stop: &mut Shutdown,
    ) -> StreamEnd {
        let period = self.ping_interval.max(Duration::from_millis(100));
        let mut ping = tokio::time::interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            let idle_deadline = last_seen + self.idle_timeout;
            let message = tokio::select! {
                _ = stop.wait() => return StreamEnd::Stopped,
                _ = tokio::time::sleep_until(idle_deadline) => {
                    warn!("[{}] Nothing received for {:?}", self.tag(), self.idle_timeout);
                    return StreamEnd::Lost(FeedError::Timeout);
                }
                _ = ping.tick() => None,
                message = ws.next() => Some(message),
            };

            let Some(message) = message else {
                if let Err(e) = ws.send(Message::Ping(Vec::new())).await {
                    return StreamEnd::Lost(FeedError::ConnectionFailed(e.to_string()));
                }
                continue;
            };
            last_seen = Instant::now();

            match message {
                Some(Ok(Message::Text(text))) => {
                    if let Some(end) = self.handle_text(&text, decoder) {
                        return end;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if let Some(end) = self.handle_text(&text, decoder) {
                            return end;
                        }
                    }
                    Err(e) => warn!(
                        "[{}] Dropping malformed message: {}",
                        self.tag(),
                        FeedError::InvalidMessage(format!("binary frame is not UTF-8: {e}"))
                    ),
                },
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = ws.send(Message::Pong(data)).await {
                        return StreamEnd::Lost(FeedError::ConnectionFailed(e.to_string()));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("[{}] WebSocket closed by server: {:?}", self.tag(), frame);
                    return StreamEnd::Lost(FeedError::Disconnected);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return StreamEnd::Lost(FeedError::ConnectionFailed(e.to_string()));
                }
                None => return StreamEnd::Lost(FeedError::Disconnected),
            }
        }
    }
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(120) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// One aggregator: connection plus event pipeline
pub struct AggregatorMonitor {
    aggregator: Aggregator,
    chains: usize,
    supervisor: ConnectionSupervisor,
    pipeline: EventPipeline,
}

impl AggregatorMonitor {
    pub fn new(settings: MonitorSettings, sink: Arc<MetricsSink>) -> Self {
        let supervisor = ConnectionSupervisor::new(protocols::for_settings(&settings), &settings);
        Self {
            aggregator: settings.aggregator,
            chains: settings.chains.len(),
            supervisor,
            pipeline: EventPipeline {
                aggregator: settings.aggregator,
                unit: settings.timestamp_unit,
                sink,
                clock: Arc::new(SystemClock),
                stats: SessionStats::new(),
                summary_every: settings.summary_every,
                ping_interval: settings.reconnect.ping_interval(),
                idle_timeout: settings.reconnect.idle_timeout(),
            },
        }
    }

    /// Replace the receive-time clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.pipeline.clock = clock;
        self
    }

    pub fn aggregator(&self) -> Aggregator {
        self.aggregator
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.state()
    }

    /// Run until `stop` fires or the monitor is skipped
    pub async fn run(mut self, stop: Shutdown) -> MonitorExit {
        let tag = self.aggregator.tag();
        info!("[{}] Starting monitor for {} chain(s)", tag, self.chains);

        let exit = self.supervisor.run(&mut self.pipeline, stop).await;

        if !matches!(exit, MonitorExit::Skipped(_)) {
            self.pipeline.stats.log_summary(tag);
            info!("[{}] Monitor stopped", tag);
        }
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::CodexDecoder;
    use idxlag_core::{default_chains, FixedClock};

    fn pipeline(sink: Arc<MetricsSink>) -> EventPipeline {
        EventPipeline {
            aggregator: Aggregator::Codex,
            unit: TimestampUnit::Seconds,
            sink,
            clock: Arc::new(FixedClock::from_unix_secs(1_700_000_003).unwrap()),
            stats: SessionStats::new(),
            summary_every: 50,
            ping_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(30),
        }
    }

    fn swap_frame(event_type: &str) -> String {
        serde_json::json!({
            "type": "next",
            "id": "sub_1",
            "payload": {"data": {"onEventsCreated": {"networkId": 1399811149, "events": [{
                "timestamp": 1700000000,
                "transactionHash": "0xabc123",
                "eventType": event_type,
                "token0SwapValueUsd": "20.0"
            }]}}}
        })
        .to_string()
    }

    #[test]
    fn test_swap_records_lag() {
        let sink = Arc::new(MetricsSink::new().unwrap());
        let mut pipeline = pipeline(Arc::clone(&sink));
        let decoder = CodexDecoder::new(&default_chains(Aggregator::Codex));

        assert!(pipeline.handle_text(&swap_frame("Swap"), &decoder).is_none());
        assert_eq!(sink.latency_ms("codex", "solana"), Some(3000.0));
        assert_eq!(pipeline.stats.swaps().count(), 1);
    }

    #[test]
    fn test_non_swap_leaves_metrics_untouched() {
        let sink = Arc::new(MetricsSink::new().unwrap());
        let mut pipeline = pipeline(Arc::clone(&sink));
        let decoder = CodexDecoder::new(&default_chains(Aggregator::Codex));

        assert!(pipeline.handle_text(&swap_frame("Transfer"), &decoder).is_none());
        assert!(pipeline.handle_text("{broken", &decoder).is_none());
        assert!(pipeline.handle_text(r#"{"type":"ka"}"#, &decoder).is_none());
        assert_eq!(sink.latency_ms("codex", "solana"), None);
        assert_eq!(pipeline.stats.total_events(), 0);
    }

    #[test]
    fn test_server_error_ends_stream() {
        let sink = Arc::new(MetricsSink::new().unwrap());
        let mut pipeline = pipeline(sink);
        let decoder = CodexDecoder::new(&default_chains(Aggregator::Codex));

        let end = pipeline.handle_text(r#"{"type":"error","id":"sub_1","payload":[]}"#, &decoder);
        assert!(matches!(end, Some(StreamEnd::Lost(FeedError::Remote(_)))));

        let end = pipeline.handle_text(r#"{"type":"complete","id":"sub_1"}"#, &decoder);
        assert!(matches!(end, Some(StreamEnd::Lost(FeedError::Completed(id))) if id == "sub_1"));
    }

    #[test]
    fn test_implausible_lag_is_still_recorded() {
        let sink = Arc::new(MetricsSink::new().unwrap());
        let mut pipeline = pipeline(Arc::clone(&sink));
        // Milliseconds misread as seconds
        pipeline.unit = TimestampUnit::Milliseconds;
        let decoder = CodexDecoder::new(&default_chains(Aggregator::Codex));

        pipeline.handle_text(&swap_frame("Swap"), &decoder);
        let recorded = sink.latency_ms("codex", "solana").unwrap();
        assert!(recorded > 300_000.0);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(200);
        assert_eq!(preview(&long).chars().count(), 120);
        assert_eq!(preview("short"), "short");
    }
}
