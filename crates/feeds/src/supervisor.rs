//! Connection lifecycle with exponential backoff
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Subscribing -> Streaming
//!                     ^                                             |
//!                     +------------------ Backoff <-----------------+
//! ```
//!
//! Any failure on the way to `Streaming`, and any loss of the stream, goes
//! through `Backoff`. The stop signal is honoured in every state.

use futures_util::SinkExt;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use idxlag_core::{ConnectionState, FeedError, FeedResult, MonitorSettings, ReconnectSettings};

use crate::decoder::Decoder;
use crate::protocols::{FeedProtocol, WsStream};
use crate::shutdown::Shutdown;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Doubling reconnect delay, clamped to `[floor, ceiling]`
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self::new(settings.floor(), settings.ceiling())
    }

    /// Delay to wait now; the following one doubles
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    /// Back to the floor after a successful connection
    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Why a streaming session ended
#[derive(Debug)]
pub enum StreamEnd {
    Stopped,
    Lost(FeedError),
}

/// How a monitor task finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// Never started, e.g. missing credentials
    Skipped(String),
    Stopped,
    Panicked,
}

/// Consumes an established stream until it ends or stop fires
#[async_trait::async_trait]
pub trait StreamHandler: Send {
    async fn stream(
        &mut self,
        ws: &mut WsStream,
        decoder: &dyn Decoder,
        stop: &mut Shutdown,
    ) -> StreamEnd;
}

/// Drives one aggregator connection through its lifecycle
pub struct ConnectionSupervisor {
    protocol: Box<dyn FeedProtocol>,
    has_api_key: bool,
    subscribe_delay: Duration,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionSupervisor {
    pub fn new(protocol: Box<dyn FeedProtocol>, settings: &MonitorSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            protocol,
            has_api_key: settings.api_key.is_some(),
            subscribe_delay: settings.reconnect.subscribe_delay(),
            backoff: Backoff::from_settings(&settings.reconnect),
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn protocol(&self) -> &dyn FeedProtocol {
        self.protocol.as_ref()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(
                "[{}] {} -> {}",
                self.protocol.aggregator().tag(),
                previous,
                state
            );
        }
    }

    /// Connect, authenticate and send `frames`
    pub async fn establish(&self, frames: &[String]) -> FeedResult<WsStream> {
        let tag = self.protocol.aggregator().tag();

        self.set_state(ConnectionState::Connecting);
        let request = self.protocol.request()?;
        info!("[{}] Connecting to {}", tag, redacted(request.uri()));

        let (mut ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| FeedError::Timeout)?
            .map_err(|e| FeedError::ConnectionFailed(e.to_string()))?;
        info!("[{}] Connected", tag);

        self.set_state(ConnectionState::Authenticating);
        self.protocol.handshake(&mut ws).await?;

        self.set_state(ConnectionState::Subscribing);
        for (i, frame) in frames.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.subscribe_delay).await;
            }
            ws.send(Message::Text(frame.clone()))
                .await
                .map_err(|e| FeedError::SubscriptionFailed(e.to_string()))?;
        }
        info!("[{}] Sent {} subscription(s)", tag, frames.len());

        self.set_state(ConnectionState::Streaming);
        Ok(ws)
    }

    /// Run until stopped.
    ///
    /// Returns immediately, without connecting, when a required key is
    /// missing or the subscription frames cannot be built.
    pub async fn run<H: StreamHandler>(&mut self, handler: &mut H, mut stop: Shutdown) -> MonitorExit {
        let aggregator = self.protocol.aggregator();
        let tag = aggregator.tag();

        if aggregator.requires_api_key() && !self.has_api_key {
            let reason = format!("{} not set", aggregator.api_key_env());
            warn!("[{}] {}. Skipping {} monitor.", tag, reason, aggregator);
            return MonitorExit::Skipped(reason);
        }

        let frames = match self.protocol.subscriptions() {
            Ok(frames) => frames,
            Err(e) => {
                error!("[{}] {}. Skipping {} monitor.", tag, e, aggregator);
                return MonitorExit::Skipped(e.to_string());
            }
        };

        while !stop.is_triggered() {
            let established = tokio::select! {
                _ = stop.wait() => break,
                result = self.establish(&frames) => result,
            };

            match established {
                Ok(mut ws) => {
                    self.backoff.reset();
                    let end = handler.stream(&mut ws, self.protocol.decoder(), &mut stop).await;
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None)).await;

                    match end {
                        StreamEnd::Stopped => break,
                        StreamEnd::Lost(e) => warn!("[{}] Stream lost: {}", tag, e),
                    }
                }
                Err(e) => error!("[{}] Connection failed: {}", tag, e),
            }

            if !self.back_off(&mut stop).await {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        MonitorExit::Stopped
    }

    /// Wait out the current delay; `false` when stop fired first
    async fn back_off(&mut self, stop: &mut Shutdown) -> bool {
        let delay = self.backoff.next_delay();
        self.set_state(ConnectionState::Backoff);
        warn!(
            "[{}] Reconnecting in {:?}",
            self.protocol.aggregator().tag(),
            delay
        );

        tokio::select! {
            _ = stop.wait() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Scheme, host and path only; query strings may carry API keys
fn redacted(uri: &Uri) -> String {
    format!(
        "{}://{}{}",
        uri.scheme_str().unwrap_or("ws"),
        uri.authority().map(|a| a.as_str()).unwrap_or_default(),
        uri.path()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::for_settings;
    use crate::shutdown::shutdown_channel;
    use idxlag_core::{Aggregator, ChainConfig};
    use proptest::prelude::*;

    struct NoopHandler;

    #[async_trait::async_trait]
    impl StreamHandler for NoopHandler {
        async fn stream(&mut self, _: &mut WsStream, _: &dyn Decoder, _: &mut Shutdown) -> StreamEnd {
            StreamEnd::Stopped
        }
    }

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn test_fourth_attempt_waits_forty_seconds() {
        let mut backoff = Backoff::from_settings(&ReconnectSettings::default());
        for _ in 0..3 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(40));
    }

    #[test]
    fn test_reset_returns_to_floor() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_redacted_drops_query() {
        let uri: Uri = "wss://stream.coingecko.com/v1?x_cg_pro_api_key=secret".parse().unwrap();
        assert_eq!(redacted(&uri), "wss://stream.coingecko.com/v1");
    }

    proptest! {
        #[test]
        fn prop_backoff_is_bounded_and_monotonic(floor in 1u64..30, extra in 0u64..120, steps in 1usize..20) {
            let floor = Duration::from_secs(floor);
            let ceiling = floor + Duration::from_secs(extra);
            let mut backoff = Backoff::new(floor, ceiling);

            let mut previous = Duration::ZERO;
            for _ in 0..steps {
                let delay = backoff.next_delay();
                prop_assert!(delay >= floor && delay <= ceiling);
                prop_assert!(delay >= previous);
                previous = delay;
            }
        }
    }

    #[tokio::test]
    async fn test_missing_api_key_skips() {
        let settings = MonitorSettings::new(Aggregator::Codex);
        let mut supervisor = ConnectionSupervisor::new(for_settings(&settings), &settings);
        let (_trigger, stop) = shutdown_channel();

        let exit = supervisor.run(&mut NoopHandler, stop).await;
        assert_eq!(exit, MonitorExit::Skipped("CODEX_API_KEY not set".to_string()));
    }

    #[tokio::test]
    async fn test_unbuildable_subscription_skips_without_connecting() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let settings = MonitorSettings::new(Aggregator::Codex)
            .with_api_key("key")
            .with_ws_url(format!("ws://{}", listener.local_addr().unwrap()))
            .with_chains(vec![ChainConfig::new("x", "x", None, "0x1")]);
        let mut supervisor = ConnectionSupervisor::new(for_settings(&settings), &settings);
        let (_trigger, stop) = shutdown_channel();

        let exit = tokio::time::timeout(Duration::from_secs(2), supervisor.run(&mut NoopHandler, stop))
            .await
            .unwrap();

        assert!(matches!(exit, MonitorExit::Skipped(ref reason) if reason.contains("network id")));
        // Nobody dialed the listener
        assert!(tokio::time::timeout(Duration::from_millis(200), listener.accept())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_connection_refused_backs_off_until_stopped() {
        let settings = MonitorSettings::new(Aggregator::Gmgn).with_ws_url("ws://127.0.0.1:1");
        let mut supervisor = ConnectionSupervisor::new(for_settings(&settings), &settings);
        let mut state = supervisor.state();
        let (trigger, stop) = shutdown_channel();

        let task = tokio::spawn(async move { supervisor.run(&mut NoopHandler, stop).await });

        tokio::time::timeout(
            Duration::from_secs(10),
            state.wait_for(|s| *s == ConnectionState::Backoff),
        )
        .await
        .unwrap()
        .unwrap();

        trigger.trigger();
        let exit = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, MonitorExit::Stopped);
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    }
}
