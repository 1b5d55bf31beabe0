//! Mobula fast-trade stream

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::handshake::client::Request;

use idxlag_core::{Aggregator, ChainConfig, FeedResult, MonitorSettings, TradeEvent, TradeType};

use crate::decoder::{as_f64, as_i64, as_str, items, ChainTable, ControlFrame, Decoded, Decoder};
use crate::protocols::{client_request, FeedProtocol};

#[derive(Debug, Clone)]
pub struct MobulaDecoder {
    chains: ChainTable,
}

impl MobulaDecoder {
    pub fn new(chains: &[ChainConfig]) -> Self {
        Self {
            chains: ChainTable::new(chains),
        }
    }

    fn trade(&self, record: &Value, received_at: DateTime<Utc>) -> Option<TradeEvent> {
        let hash = as_str(record.get("hash"))?;
        let blockchain = as_str(record.get("blockchain"))?;
        let date = as_i64(record.get("date"))?;

        // Liquidity adds and removals share the stream
        let trade_type = match TradeType::from_code(as_str(record.get("type"))?) {
            TradeType::Unknown => return None,
            side => side,
        };

        Some(TradeEvent {
            chain: self.chains.by_code(blockchain),
            tx_hash: hash.to_string(),
            trade_type,
            volume_usd: as_f64(record.get("tokenAmountUsd")),
            event_timestamp: date,
            received_at,
        })
    }
}

impl Decoder for MobulaDecoder {
    fn decode(&self, raw: &str, received_at: DateTime<Utc>) -> FeedResult<Decoded> {
        let frame: Value = serde_json::from_str(raw)?;

        if let Some(error) = frame.get("error").filter(|e| !e.is_null()) {
            let reason = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Ok(Decoded::Control(ControlFrame::Error(reason)));
        }

        let body = match frame.get("data") {
            Some(data) if data.is_object() || data.is_array() => data,
            _ => &frame,
        };

        let trades = items(body)
            .into_iter()
            .filter_map(|record| self.trade(record, received_at))
            .collect();
        Ok(Decoded::trades(trades))
    }
}

pub struct MobulaProtocol {
    ws_url: String,
    api_key: String,
    chains: Vec<ChainConfig>,
    decoder: MobulaDecoder,
}

impl MobulaProtocol {
    pub fn new(settings: &MonitorSettings) -> Self {
        Self {
            ws_url: settings.ws_url.clone(),
            api_key: settings.api_key.clone().unwrap_or_default(),
            chains: settings.chains.clone(),
            decoder: MobulaDecoder::new(&settings.chains),
        }
    }
}

impl FeedProtocol for MobulaProtocol {
    fn aggregator(&self) -> Aggregator {
        Aggregator::Mobula
    }

    fn request(&self) -> FeedResult<Request> {
        client_request(&self.ws_url)
    }

    fn subscriptions(&self) -> FeedResult<Vec<String>> {
        let items: Vec<Value> = self
            .chains
            .iter()
            .map(|c| json!({"blockchain": c.chain_code, "address": c.pool_address}))
            .collect();

        Ok(vec![json!({
            "type": "fast-trade",
            "authorization": self.api_key,
            "payload": {
                "assetMode": false,
                "items": items,
            },
        })
        .to_string()])
    }

    fn decoder(&self) -> &dyn Decoder {
        &self.decoder
    }
}
