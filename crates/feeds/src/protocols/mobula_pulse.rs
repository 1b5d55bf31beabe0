//! Mobula pulse: new pool and token creations across chains

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::handshake::client::Request;

use idxlag_core::{Aggregator, ChainConfig, FeedResult, MonitorSettings, PoolEvent};

use crate::decoder::{as_f64, as_i64, as_str, field, items, ChainTable, ControlFrame, Decoded, Decoder};
use crate::protocols::{client_request, FeedProtocol};

#[derive(Debug, Clone)]
pub struct MobulaPulseDecoder {
    chains: ChainTable,
}

impl MobulaPulseDecoder {
    pub fn new(chains: &[ChainConfig]) -> Self {
        Self {
            chains: ChainTable::new(chains),
        }
    }

    fn pool(&self, record: &Value, received_at: DateTime<Utc>) -> Option<PoolEvent> {
        let created_at = created_at_millis(field(record, &["createdAt", "created_at"])?)?;

        let chain = match field(record, &["blockchain", "chainId"])? {
            Value::Number(n) => n
                .as_i64()
                .map(|id| self.chains.by_network(id))
                .unwrap_or_else(|| n.to_string()),
            other => self.chains.by_code(as_str(Some(other))?),
        };

        let exchange = match record.get("exchange") {
            Some(Value::Object(_)) => record.get("exchange").and_then(|e| as_str(e.get("name"))),
            other => as_str(other),
        };

        Some(PoolEvent {
            chain,
            pool_address: as_str(field(record, &["address", "poolAddress"]))
                .unwrap_or_default()
                .to_string(),
            token_symbol: as_str(field(record, &["symbol", "tokenSymbol"]))
                .unwrap_or("UNKNOWN")
                .to_string(),
            exchange: exchange.unwrap_or("unknown").to_string(),
            initial_liquidity_usd: as_f64(record.get("liquidity")),
            market_cap_usd: as_f64(record.get("marketCap")),
            holder_count: as_i64(record.get("holdersCount")).and_then(|h| u64::try_from(h).ok()),
            event_timestamp: created_at,
            received_at,
        })
    }
}

/// Epoch milliseconds, or an RFC 3339 string
fn created_at_millis(value: &Value) -> Option<i64> {
    as_i64(Some(value)).or_else(|| {
        let text = as_str(Some(value))?;
        DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.timestamp_millis())
    })
}

impl Decoder for MobulaPulseDecoder {
    fn decode(&self, raw: &str, received_at: DateTime<Utc>) -> FeedResult<Decoded> {
        let frame: Value = serde_json::from_str(raw)?;
        let payload = frame.get("payload").unwrap_or(&Value::Null);

        match as_str(frame.get("type")) {
            Some("init") | Some("subscribed") => Ok(Decoded::Control(ControlFrame::Ack)),
            Some("ping") | Some("pong") => Ok(Decoded::Control(ControlFrame::KeepAlive)),
            Some("error") => {
                let reason = as_str(field(&frame, &["message", "error"]))
                    .map(str::to_string)
                    .unwrap_or_else(|| payload.to_string());
                Ok(Decoded::Control(ControlFrame::Error(reason)))
            }
            Some("new-pool") | Some("new-token") => {
                let pools = items(payload)
                    .into_iter()
                    .filter_map(|record| self.pool(record, received_at))
                    .collect();
                Ok(Decoded::pools(pools))
            }
            _ => Ok(Decoded::Unrecognized),
        }
    }
}

pub struct MobulaPulseProtocol {
    ws_url: String,
    api_key: String,
    chains: Vec<ChainConfig>,
    decoder: MobulaPulseDecoder,
}

impl MobulaPulseProtocol {
    pub fn new(settings: &MonitorSettings) -> Self {
        Self {
            ws_url: settings.ws_url.clone(),
            api_key: settings.api_key.clone().unwrap_or_default(),
            chains: settings.chains.clone(),
            decoder: MobulaPulseDecoder::new(&settings.chains),
        }
    }
}

impl FeedProtocol for MobulaPulseProtocol {
    fn aggregator(&self) -> Aggregator {
        Aggregator::MobulaPulse
    }

    fn request(&self) -> FeedResult<Request> {
        client_request(&self.ws_url)
    }

    fn subscriptions(&self) -> FeedResult<Vec<String>> {
        let chain_ids: Vec<&str> = self.chains.iter().map(|c| c.chain_code.as_str()).collect();
        Ok(vec![json!({
            "type": "pulse-v2",
            "authorization": self.api_key,
            "payload": {
                "model": "default",
                "assetMode": false,
                "chainId": chain_ids,
            },
        })
        .to_string()])
    }

    fn decoder(&self) -> &dyn Decoder {
        &self.decoder
    }
}
