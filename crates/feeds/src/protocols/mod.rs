//! Aggregator wire protocols
//!
//! A protocol knows how to open the socket (URL, headers, subprotocol), how
//! to authenticate, which subscription frames to send, and how to decode
//! what comes back.

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use idxlag_core::{Aggregator, FeedError, FeedResult, MonitorSettings};

use crate::decoder::Decoder;

pub mod codex;
pub mod coingecko;
pub mod gmgn;
pub mod mobula;
pub mod mobula_pulse;

pub use codex::{CodexDecoder, CodexProtocol};
pub use coingecko::{CoinGeckoDecoder, CoinGeckoProtocol};
pub use gmgn::{GmgnDecoder, GmgnProtocol};
pub use mobula::{MobulaDecoder, MobulaProtocol};
pub use mobula_pulse::{MobulaPulseDecoder, MobulaPulseProtocol};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection-level behaviour of one aggregator
#[async_trait::async_trait]
pub trait FeedProtocol: Send + Sync {
    fn aggregator(&self) -> Aggregator;

    /// WebSocket upgrade request
    fn request(&self) -> FeedResult<Request>;

    /// Application-level handshake once the socket is open
    async fn handshake(&self, _ws: &mut WsStream) -> FeedResult<()> {
        Ok(())
    }

    /// Subscription frames, sent in order
    fn subscriptions(&self) -> FeedResult<Vec<String>>;

    fn decoder(&self) -> &dyn Decoder;
}

/// Protocol implementation for `settings.aggregator`
pub fn for_settings(settings: &MonitorSettings) -> Box<dyn FeedProtocol> {
    match settings.aggregator {
        Aggregator::CoinGecko => Box::new(CoinGeckoProtocol::new(settings)),
        Aggregator::Mobula => Box::new(MobulaProtocol::new(settings)),
        Aggregator::MobulaPulse => Box::new(MobulaPulseProtocol::new(settings)),
        Aggregator::Codex => Box::new(CodexProtocol::new(settings)),
        Aggregator::Gmgn => Box::new(GmgnProtocol::new(settings)),
    }
}

pub(crate) fn client_request(url: &str) -> FeedResult<Request> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    url.into_client_request()
        .map_err(|e| FeedError::ConnectionFailed(format!("invalid url {url}: {e}")))
}

/// `base` with `pairs` appended to its query, percent-encoded
pub(crate) fn with_query<'a, I>(base: &str, pairs: I) -> FeedResult<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut url = Url::parse(base)
        .map_err(|e| FeedError::ConnectionFailed(format!("invalid url {base}: {e}")))?;
    url.query_pairs_mut().extend_pairs(pairs);
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_values_are_encoded() {
        let url = with_query("wss://stream.example.com/v1", [("key", "a&b#c+d")]).unwrap();
        assert_eq!(url, "wss://stream.example.com/v1?key=a%26b%23c%2Bd");

        let request = client_request(&url).unwrap();
        assert_eq!(request.uri().query(), Some("key=a%26b%23c%2Bd"));
    }

    #[test]
    fn test_existing_query_is_kept() {
        let url = with_query("wss://stream.example.com/v1?region=eu", [("key", "k")]).unwrap();
        assert_eq!(url, "wss://stream.example.com/v1?region=eu&key=k");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            with_query("not a url", [("key", "k")]),
            Err(FeedError::ConnectionFailed(_))
        ));
    }
}
