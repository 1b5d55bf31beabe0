//! GMGN quotation stream
//!
//! Public feed behind Cloudflare: the upgrade request needs generated
//! device/client ids and browser-like headers. Two channels per chain,
//! `new_pair_update` (swaps) and `new_pool_info` (pool creations).

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};
use uuid::Uuid;

use idxlag_core::{
    Aggregator, ChainConfig, FeedError, FeedResult, MonitorSettings, PoolEvent, TradeEvent,
    TradeType,
};

use crate::decoder::{as_f64, as_i64, as_str, field, items, ChainTable, ControlFrame, Decoded, Decoder};
use crate::protocols::{client_request, with_query, FeedProtocol};

pub const SWAP_CHANNEL: &str = "new_pair_update";
pub const POOL_CHANNEL: &str = "new_pool_info";

const APP_VERSION: &str = "20250729-1647-ffac485";

const BROWSER_HEADERS: &[(&str, &str)] = &[
    (
        "user-agent",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36",
    ),
    ("origin", "https://gmgn.ai"),
    ("cache-control", "no-cache"),
    ("pragma", "no-cache"),
];

#[derive(Debug, Clone)]
pub struct GmgnDecoder {
    chains: ChainTable,
}

impl GmgnDecoder {
    pub fn new(chains: &[ChainConfig]) -> Self {
        Self {
            chains: ChainTable::new(chains),
        }
    }

    fn chain_of(&self, item: &Value) -> String {
        as_str(field(item, &["c", "n"]))
            .map(|code| self.chains.by_code(code))
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn trades(&self, data: &Value, received_at: DateTime<Utc>) -> Vec<TradeEvent> {
        items(data)
            .into_iter()
            .filter_map(|trade| {
                let timestamp = as_i64(trade.get("t"))?;
                Some(TradeEvent {
                    chain: self.chain_of(trade),
                    tx_hash: as_str(trade.get("a")).unwrap_or_default().to_string(),
                    trade_type: TradeType::Unknown,
                    volume_usd: None,
                    event_timestamp: timestamp,
                    received_at,
                })
            })
            .collect()
    }

    fn pools(&self, data: &Value, received_at: DateTime<Utc>) -> Vec<PoolEvent> {
        let mut events = Vec::new();

        for pool_event in items(data) {
            let chain = self.chain_of(pool_event);
            let open_time = pool_event.get("ot");

            // Nested `p[]` on some chains, a flat pool record on others
            let pools: Vec<&Value> = match pool_event.get("p") {
                Some(Value::Array(nested)) if !nested.is_empty() => {
                    nested.iter().filter(|p| p.is_object()).collect()
                }
                _ if pool_event.get("pa").is_some() => vec![pool_event],
                _ => Vec::new(),
            };

            for pool in pools {
                let Some(timestamp) = as_i64(pool.get("ot").or(open_time)) else {
                    continue;
                };
                let token = pool.get("bti").cloned().unwrap_or(Value::Null);

                events.push(PoolEvent {
                    chain: chain.clone(),
                    pool_address: as_str(pool.get("pa")).unwrap_or_default().to_string(),
                    token_symbol: as_str(token.get("s")).unwrap_or("UNKNOWN").to_string(),
                    exchange: as_str(pool.get("ex")).unwrap_or("unknown").to_string(),
                    initial_liquidity_usd: as_f64(pool.get("il")),
                    market_cap_usd: as_f64(token.get("mc")),
                    holder_count: as_i64(token.get("hc")).and_then(|h| u64::try_from(h).ok()),
                    event_timestamp: timestamp,
                    received_at,
                });
            }
        }

        events
    }
}

impl Decoder for GmgnDecoder {
    fn decode(&self, raw: &str, received_at: DateTime<Utc>) -> FeedResult<Decoded> {
        let frame: Value = serde_json::from_str(raw)?;
        let data = frame.get("data").unwrap_or(&Value::Null);

        match as_str(frame.get("channel")) {
            Some("ack") => Ok(Decoded::Control(ControlFrame::Ack)),
            Some(SWAP_CHANNEL) => Ok(Decoded::trades(self.trades(data, received_at))),
            Some(POOL_CHANNEL) => Ok(Decoded::pools(self.pools(data, received_at))),
            _ => Ok(Decoded::Unrecognized),
        }
    }
}

pub struct GmgnProtocol {
    ws_url: String,
    access_token: Option<String>,
    chains: Vec<ChainConfig>,
    decoder: GmgnDecoder,
}

impl GmgnProtocol {
    pub fn new(settings: &MonitorSettings) -> Self {
        Self {
            ws_url: settings.ws_url.clone(),
            access_token: settings.api_key.clone(),
            chains: settings.chains.clone(),
            decoder: GmgnDecoder::new(&settings.chains),
        }
    }

    fn subscription(&self, channel: &str, chain_code: &str) -> String {
        let id: String = Uuid::new_v4().simple().to_string().chars().take(16).collect();
        json!({
            "action": "subscribe",
            "channel": channel,
            "f": "w",
            "id": id,
            "data": [{"chain": chain_code}],
            "access_token": self.access_token,
            "retry": null,
        })
        .to_string()
    }
}

impl FeedProtocol for GmgnProtocol {
    fn aggregator(&self) -> Aggregator {
        Aggregator::Gmgn
    }

    fn request(&self) -> FeedResult<Request> {
        let client_suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let params = [
            ("device_id", Uuid::new_v4().to_string()),
            ("client_id", format!("gmgn_rust_{client_suffix}")),
            ("from_app", "gmgn".to_string()),
            ("app_ver", APP_VERSION.to_string()),
            ("tz_name", "UTC".to_string()),
            ("tz_offset", "0".to_string()),
            ("app_lang", "en-US".to_string()),
            ("fp_did", Uuid::new_v4().to_string()),
            ("os", "rust".to_string()),
            ("uuid", Uuid::new_v4().to_string()),
        ];
        let url = with_query(&self.ws_url, params.iter().map(|(k, v)| (*k, v.as_str())))?;

        let mut request = client_request(&url)?;
        for &(name, value) in BROWSER_HEADERS {
            let value = HeaderValue::from_str(value)
                .map_err(|e| FeedError::ConnectionFailed(format!("bad header {name}: {e}")))?;
            request
                .headers_mut()
                .insert(HeaderName::from_static(name), value);
        }
        Ok(request)
    }

    fn subscriptions(&self) -> FeedResult<Vec<String>> {
        Ok(self
            .chains
            .iter()
            .flat_map(|chain| {
                [
                    self.subscription(SWAP_CHANNEL, &chain.chain_code),
                    self.subscription(POOL_CHANNEL, &chain.chain_code),
                ]
            })
            .collect())
    }

    fn decoder(&self) -> &dyn Decoder {
        &self.decoder
    }
}
