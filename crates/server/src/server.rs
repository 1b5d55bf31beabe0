//! Prometheus scrape endpoint

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use idxlag_feeds::MetricsSink;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Metrics handler - text exposition of every registered series
///
/// GET {path}
async fn metrics_handler(State(sink): State<Arc<MetricsSink>>) -> Response {
    match sink.encode() {
        Ok(body) => (StatusCode::OK, [("Content-Type", CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Router serving `sink` at `path`
pub fn metrics_router(path: &str, sink: Arc<MetricsSink>) -> Router {
    Router::new()
        .route(path, get(metrics_handler))
        .with_state(sink)
}

/// Serve metrics on an already bound listener until the process exits
pub async fn serve(listener: TcpListener, path: &str, sink: Arc<MetricsSink>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Metrics server listening on http://{}{}", addr, path);
    }
    axum::serve(listener, metrics_router(path, sink)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get_raw(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let sink = Arc::new(MetricsSink::new().unwrap());
        sink.record_latency("mobula", "bnb", 900).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, "/metrics", Arc::clone(&sink)));

        let response = get_raw(addr, "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("text/plain; version=0.0.4"));
        assert!(response.contains(r#"mobula_latency_milliseconds{chain="bnb"} 900"#));
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let sink = Arc::new(MetricsSink::new().unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, "/metrics", sink));

        let response = get_raw(addr, "/other").await;
        assert!(response.starts_with("HTTP/1.1 404"));
    }
}
