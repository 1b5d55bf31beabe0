//! End-to-end: a Codex monitor against an in-process graphql-transport-ws server

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use idxlag_core::{Aggregator, ChainConfig, FixedClock, MonitorSettings, ReconnectSettings};
use idxlag_feeds::{shutdown_channel, AggregatorMonitor, MetricsSink, MonitorExit};

const SOLANA_NETWORK: i64 = 1399811149;

fn swap_event(event_type: &str, hash: &str) -> String {
    serde_json::json!({
        "type": "next",
        "id": "sub_1",
        "payload": {"data": {"onEventsCreated": {
            "address": "pool",
            "networkId": SOLANA_NETWORK,
            "events": [{
                "networkId": SOLANA_NETWORK,
                "timestamp": 1700000000,
                "transactionHash": hash,
                "eventType": event_type,
                "token0SwapValueUsd": "42.0",
            }]
        }}}
    })
    .to_string()
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    accept_hdr_async(stream, |_: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("graphql-transport-ws"));
        Ok(response)
    })
    .await
    .unwrap()
}

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("client went away: {other:?}"),
        }
    }
}

async fn ack_init(ws: &mut WebSocketStream<TcpStream>) {
    let init = next_text(ws).await;
    assert_eq!(init["type"], "connection_init");
    assert_eq!(init["payload"]["Authorization"], "test-key");
    ws.send(Message::Text(r#"{"type":"connection_ack"}"#.to_string()))
        .await
        .unwrap();
}

/// Ack the handshake and consume the single subscription
async fn handshake(ws: &mut WebSocketStream<TcpStream>) {
    ack_init(ws).await;

    let subscribe = next_text(ws).await;
    assert_eq!(subscribe["type"], "subscribe");
    assert_eq!(subscribe["payload"]["variables"]["networkId"], SOLANA_NETWORK);
}

async fn drain(mut ws: WebSocketStream<TcpStream>) {
    while let Some(Ok(_)) = ws.next().await {}
}

fn monitor(addr: std::net::SocketAddr, sink: Arc<MetricsSink>) -> AggregatorMonitor {
    let mut settings = MonitorSettings::new(Aggregator::Codex)
        .with_api_key("test-key")
        .with_ws_url(format!("ws://{addr}"))
        .with_chains(vec![ChainConfig::new("solana", "solana", Some(SOLANA_NETWORK), "pool")]);
    settings.reconnect = ReconnectSettings {
        floor_secs: 1,
        ceiling_secs: 2,
        subscribe_delay_ms: 10,
        ping_interval_secs: 1,
        idle_timeout_secs: 2,
    };

    AggregatorMonitor::new(settings, sink)
        .with_clock(Arc::new(FixedClock::from_unix_secs(1_700_000_003).unwrap()))
}

async fn wait_for_trades(sink: &MetricsSink, expected: u64) {
    let metrics = sink.get_or_create("codex").unwrap();
    let counter = metrics.trades.with_label_values(&["solana", "unknown"]);
    tokio::time::timeout(Duration::from_secs(10), async {
        while counter.get() < expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("trades were not recorded in time");
}

#[tokio::test]
async fn test_swap_lag_reaches_gauge() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let sink = Arc::new(MetricsSink::new().unwrap());

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws).await;
        ws.send(Message::Text(r#"{"type":"ka"}"#.to_string())).await.unwrap();
        ws.send(Message::Text(swap_event("Transfer", "0xtransfer"))).await.unwrap();
        ws.send(Message::Text(swap_event("Swap", "0xabc123def456"))).await.unwrap();
        drain(ws).await;
    });

    let (trigger, stop) = shutdown_channel();
    let task = tokio::spawn(monitor(addr, Arc::clone(&sink)).run(stop));

    wait_for_trades(&sink, 1).await;
    assert_eq!(sink.latency_ms("codex", "solana"), Some(3000.0));

    let text = sink.encode().unwrap();
    assert!(text.contains(r#"all_aggregator_latency_milliseconds{aggregator="codex",chain="solana"} 3000"#));
    // The Transfer event and the keepalive left no trace
    assert!(text.contains(r#"codex_trades_total{chain="solana",type="unknown"} 1"#));

    trigger.trigger();
    let exit = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit, MonitorExit::Stopped);
    server.abort();
}

#[tokio::test]
async fn test_reconnects_after_server_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let sink = Arc::new(MetricsSink::new().unwrap());

    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        handshake(&mut first).await;
        first.close(None).await.unwrap();
        drop(first);

        let mut second = accept(&listener).await;
        handshake(&mut second).await;
        second
            .send(Message::Text(swap_event("Swap", "0xsecond")))
            .await
            .unwrap();
        drain(second).await;
    });

    let (trigger, stop) = shutdown_channel();
    let task = tokio::spawn(monitor(addr, Arc::clone(&sink)).run(stop));

    wait_for_trades(&sink, 1).await;
    assert_eq!(sink.latency_ms("codex", "solana"), Some(3000.0));

    trigger.trigger();
    let exit = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit, MonitorExit::Stopped);
    server.abort();
}

#[tokio::test]
async fn test_server_error_frame_triggers_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let sink = Arc::new(MetricsSink::new().unwrap());

    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        handshake(&mut first).await;
        first
            .send(Message::Text(
                r#"{"type":"error","id":"sub_1","payload":[{"message":"pool not found"}]}"#.to_string(),
            ))
            .await
            .unwrap();
        drain(first).await;

        let mut second = accept(&listener).await;
        handshake(&mut second).await;
        second
            .send(Message::Text(swap_event("Swap", "0xafter")))
            .await
            .unwrap();
        drain(second).await;
    });

    let (trigger, stop) = shutdown_channel();
    let task = tokio::spawn(monitor(addr, Arc::clone(&sink)).run(stop));

    wait_for_trades(&sink, 1).await;

    trigger.trigger();
    let exit = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit, MonitorExit::Stopped);
    server.abort();
}

#[tokio::test]
async fn test_missing_key_is_skipped_without_connecting() {
    let settings = MonitorSettings::new(Aggregator::Codex).with_ws_url("ws://127.0.0.1:1");
    let sink = Arc::new(MetricsSink::new().unwrap());
    let (_trigger, stop) = shutdown_channel();

    let exit = tokio::time::timeout(
        Duration::from_secs(1),
        AggregatorMonitor::new(settings, Arc::clone(&sink)).run(stop),
    )
    .await
    .unwrap();

    assert!(matches!(exit, MonitorExit::Skipped(_)));
    assert_eq!(sink.latency_ms("codex", "solana"), None);
}

#[tokio::test]
async fn test_silent_server_is_dropped_and_reconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let sink = Arc::new(MetricsSink::new().unwrap());

    let server = tokio::spawn(async move {
        // Never read from the first socket again, so client pings go unanswered
        let mut first = accept(&listener).await;
        handshake(&mut first).await;

        let mut second = accept(&listener).await;
        handshake(&mut second).await;
        second
            .send(Message::Text(swap_event("Swap", "0xrevived")))
            .await
            .unwrap();
        drain(second).await;
        drop(first);
    });

    let (trigger, stop) = shutdown_channel();
    let task = tokio::spawn(monitor(addr, Arc::clone(&sink)).run(stop));

    wait_for_trades(&sink, 1).await;
    assert_eq!(sink.latency_ms("codex", "solana"), Some(3000.0));

    trigger.trigger();
    let exit = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit, MonitorExit::Stopped);
    server.abort();
}

/// Codex monitor on the four default chains, with a 1s..8s backoff
fn four_chain_monitor(addr: std::net::SocketAddr) -> AggregatorMonitor {
    let mut settings = MonitorSettings::new(Aggregator::Codex)
        .with_api_key("test-key")
        .with_ws_url(format!("ws://{addr}"));
    settings.reconnect = ReconnectSettings {
        floor_secs: 1,
        ceiling_secs: 8,
        subscribe_delay_ms: 50,
        ping_interval_secs: 1,
        idle_timeout_secs: 2,
    };
    AggregatorMonitor::new(settings, Arc::new(MetricsSink::new().unwrap()))
}

/// Accept three connections, returning the two gaps between them
async fn reconnect_gaps<F, Fut>(session: F) -> (Duration, Duration)
where
    F: Fn(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut accepted = Vec::new();
        for _ in 0..3 {
            let ws = accept(&listener).await;
            accepted.push(Instant::now());
            session(ws).await;
        }
        accepted
    });

    let (trigger, stop) = shutdown_channel();
    let task = tokio::spawn(four_chain_monitor(addr).run(stop));

    let accepted = tokio::time::timeout(Duration::from_secs(15), server)
        .await
        .expect("monitor did not reconnect in time")
        .unwrap();

    trigger.trigger();
    let exit = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit, MonitorExit::Stopped);

    (accepted[1] - accepted[0], accepted[2] - accepted[1])
}

#[tokio::test]
async fn test_failure_mid_subscription_keeps_doubling_delay() {
    let (first_gap, second_gap) = reconnect_gaps(|mut ws| async move {
        ack_init(&mut ws).await;
        let subscribe = next_text(&mut ws).await;
        assert_eq!(subscribe["id"], "sub_1");
        // Hang up before the remaining three subscriptions arrive
        drop(ws);
    })
    .await;

    assert!(first_gap >= Duration::from_millis(900), "first gap {first_gap:?}");
    assert!(second_gap >= Duration::from_millis(1800), "second gap {second_gap:?}");
}

#[tokio::test]
async fn test_completed_subscription_resets_delay() {
    let (first_gap, second_gap) = reconnect_gaps(|mut ws| async move {
        ack_init(&mut ws).await;
        for i in 1..=4 {
            let subscribe = next_text(&mut ws).await;
            assert_eq!(subscribe["id"], format!("sub_{i}"));
        }
        ws.close(None).await.unwrap();
        drain(ws).await;
    })
    .await;

    assert!(first_gap >= Duration::from_millis(900), "first gap {first_gap:?}");
    assert!(second_gap < Duration::from_millis(1600), "second gap {second_gap:?}");
}
