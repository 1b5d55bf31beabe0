//! CoinGecko on-chain trade stream (ActionCable framing)

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::handshake::client::Request;

use idxlag_core::{Aggregator, ChainConfig, FeedResult, MonitorSettings, TradeEvent, TradeType};

use crate::decoder::{as_f64, as_i64, as_str, items, ChainTable, ControlFrame, Decoded, Decoder};
use crate::protocols::{client_request, with_query, FeedProtocol};

const CHANNEL_IDENTIFIER: &str = r#"{"channel":"OnchainTrade"}"#;

#[derive(Debug, Clone)]
pub struct CoinGeckoDecoder {
    chains: ChainTable,
}

impl CoinGeckoDecoder {
    pub fn new(chains: &[ChainConfig]) -> Self {
        Self {
            chains: ChainTable::new(chains),
        }
    }

    fn control(&self, kind: &str, frame: &Value) -> Decoded {
        match kind {
            "ping" => Decoded::Control(ControlFrame::KeepAlive),
            "welcome" | "confirm_subscription" => Decoded::Control(ControlFrame::Ack),
            "reject_subscription" => Decoded::Control(ControlFrame::Error(
                "subscription to OnchainTrade rejected".to_string(),
            )),
            "disconnect" => Decoded::Control(ControlFrame::Complete(
                as_str(frame.get("reason")).map(str::to_string),
            )),
            _ => Decoded::Unrecognized,
        }
    }

    /// Status replies to `set_pools` carry a numeric `code`
    fn status(&self, frame: &Value) -> Option<Decoded> {
        let code = as_i64(frame.get("code"))?;
        if (2000..=2999).contains(&code) {
            Some(Decoded::Control(ControlFrame::Ack))
        } else {
            let message = as_str(frame.get("message")).unwrap_or("no message");
            Some(Decoded::Control(ControlFrame::Error(format!("code {code}: {message}"))))
        }
    }

    fn trade(&self, record: &Value, received_at: DateTime<Utc>) -> Option<TradeEvent> {
        let tx_hash = as_str(record.get("tx"))?;
        let network = as_str(record.get("n"))?;
        let timestamp = as_i64(record.get("t"))?;

        Some(TradeEvent {
            chain: self.chains.by_code(network),
            tx_hash: tx_hash.to_string(),
            trade_type: as_str(record.get("ty"))
                .map(TradeType::from_code)
                .unwrap_or(TradeType::Unknown),
            volume_usd: as_f64(record.get("vo")),
            event_timestamp: timestamp,
            received_at,
        })
    }
}

impl Decoder for CoinGeckoDecoder {
    fn decode(&self, raw: &str, received_at: DateTime<Utc>) -> FeedResult<Decoded> {
        let frame: Value = serde_json::from_str(raw)?;

        if let Some(kind) = as_str(frame.get("type")) {
            return Ok(self.control(kind, &frame));
        }
        if let Some(status) = self.status(&frame) {
            return Ok(status);
        }

        // Trades arrive bare or wrapped in an ActionCable `message`
        let body = match frame.get("message") {
            Some(message) if message.is_object() || message.is_array() => message,
            _ => &frame,
        };

        let trades = items(body)
            .into_iter()
            .filter_map(|record| self.trade(record, received_at))
            .collect();
        Ok(Decoded::trades(trades))
    }
}

pub struct CoinGeckoProtocol {
    ws_url: String,
    api_key: String,
    chains: Vec<ChainConfig>,
    decoder: CoinGeckoDecoder,
}

impl CoinGeckoProtocol {
    pub fn new(settings: &MonitorSettings) -> Self {
        Self {
            ws_url: settings.ws_url.clone(),
            api_key: settings.api_key.clone().unwrap_or_default(),
            chains: settings.chains.clone(),
            decoder: CoinGeckoDecoder::new(&settings.chains),
        }
    }

    fn pool_list(&self) -> Vec<String> {
        self.chains
            .iter()
            .filter(|c| !c.pool_address.is_empty())
            .map(|c| format!("{}:{}", c.chain_code, c.pool_address))
            .collect()
    }
}

impl FeedProtocol for CoinGeckoProtocol {
    fn aggregator(&self) -> Aggregator {
        Aggregator::CoinGecko
    }

    fn request(&self) -> FeedResult<Request> {
        client_request(&with_query(
            &self.ws_url,
            [("x_cg_pro_api_key", self.api_key.as_str())],
        )?)
    }

    fn subscriptions(&self) -> FeedResult<Vec<String>> {
        let data = json!({
            "network_id:pool_addresses": self.pool_list(),
            "action": "set_pools",
        });

        Ok(vec![
            json!({"command": "subscribe", "identifier": CHANNEL_IDENTIFIER}).to_string(),
            json!({
                "command": "message",
                "identifier": CHANNEL_IDENTIFIER,
                "data": data.to_string(),
            })
            .to_string(),
        ])
    }

    fn decoder(&self) -> &dyn Decoder {
        &self.decoder
    }
}
