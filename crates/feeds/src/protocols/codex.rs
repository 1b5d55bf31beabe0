//! Codex: GraphQL subscriptions over the `graphql-transport-ws` subprotocol
//!
//! `connection_init` -> `connection_ack` -> one `subscribe` per pool, then a
//! stream of `next` / `ka` / `error` / `complete` frames.

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use idxlag_core::{
    Aggregator, ChainConfig, FeedError, FeedResult, MonitorSettings, TradeEvent, TradeType,
};

use crate::decoder::{as_f64, ChainTable, ControlFrame, Decoded, Decoder};
use crate::protocols::{client_request, FeedProtocol, WsStream};

pub const SUBPROTOCOL: &str = "graphql-transport-ws";

const ACK_TIMEOUT: Duration = Duration::from_secs(10);

const POOL_EVENTS_QUERY: &str = "subscription OnPoolEvents($address: String!, $networkId: Int!) {
  onEventsCreated(address: $address, networkId: $networkId) {
    address
    networkId
    events {
      networkId
      blockNumber
      timestamp
      transactionHash
      eventType
      token0Address
      token1Address
      token0SwapValueUsd
      token1SwapValueUsd
    }
  }
}";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct NextPayload {
    #[serde(default)]
    data: Option<EventsData>,
    #[serde(default)]
    errors: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsData {
    #[serde(default)]
    on_events_created: Option<EventsCreated>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsCreated {
    #[serde(default)]
    network_id: Option<i64>,
    #[serde(default)]
    events: Vec<CodexEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CodexEvent {
    #[serde(default)]
    network_id: Option<i64>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    transaction_hash: Option<String>,
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default)]
    token0_swap_value_usd: Option<Value>,
    #[serde(default)]
    token1_swap_value_usd: Option<Value>,
}

/// Decoder for Codex frames
#[derive(Debug, Clone)]
pub struct CodexDecoder {
    chains: ChainTable,
}

impl CodexDecoder {
    pub fn new(chains: &[ChainConfig]) -> Self {
        Self {
            chains: ChainTable::new(chains),
        }
    }

    fn decode_next(&self, payload: Value, received_at: DateTime<Utc>) -> FeedResult<Decoded> {
        let next: NextPayload = serde_json::from_value(payload)?;

        let Some(created) = next.data.and_then(|d| d.on_events_created) else {
            return Ok(match next.errors {
                Some(errors) => Decoded::Control(ControlFrame::Error(errors.to_string())),
                None => Decoded::Unrecognized,
            });
        };

        let trades = created
            .events
            .into_iter()
            .filter(|e| e.event_type.as_deref() == Some("Swap"))
            .filter_map(|event| {
                let tx_hash = event.transaction_hash.filter(|h| !h.is_empty())?;
                let timestamp = event.timestamp?;
                let chain = match event.network_id.or(created.network_id) {
                    Some(id) => self.chains.by_network(id),
                    None => "unknown".to_string(),
                };
                let volume = match (
                    as_f64(event.token0_swap_value_usd.as_ref()),
                    as_f64(event.token1_swap_value_usd.as_ref()),
                ) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };

                Some(TradeEvent {
                    chain,
                    tx_hash,
                    trade_type: TradeType::Unknown,
                    volume_usd: volume,
                    event_timestamp: timestamp,
                    received_at,
                })
            })
            .collect();

        Ok(Decoded::trades(trades))
    }
}

impl Decoder for CodexDecoder {
    fn decode(&self, raw: &str, received_at: DateTime<Utc>) -> FeedResult<Decoded> {
        let envelope: Envelope = serde_json::from_str(raw)?;

        match envelope.kind.as_str() {
            "connection_ack" => Ok(Decoded::Control(ControlFrame::Ack)),
            "ka" | "ping" | "pong" => Ok(Decoded::Control(ControlFrame::KeepAlive)),
            "error" => Ok(Decoded::Control(ControlFrame::Error(
                envelope
                    .payload
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "unknown error".to_string()),
            ))),
            "complete" => Ok(Decoded::Control(ControlFrame::Complete(envelope.id))),
            "next" => match envelope.payload {
                Some(payload) => self.decode_next(payload, received_at),
                None => Ok(Decoded::Unrecognized),
            },
            _ => Ok(Decoded::Unrecognized),
        }
    }
}

/// Codex connection settings
pub struct CodexProtocol {
    ws_url: String,
    api_key: String,
    chains: Vec<ChainConfig>,
    decoder: CodexDecoder,
}

impl CodexProtocol {
    pub fn new(settings: &MonitorSettings) -> Self {
        Self {
            ws_url: settings.ws_url.clone(),
            api_key: settings.api_key.clone().unwrap_or_default(),
            chains: settings.chains.clone(),
            decoder: CodexDecoder::new(&settings.chains),
        }
    }
}

#[async_trait::async_trait]
impl FeedProtocol for CodexProtocol {
    fn aggregator(&self) -> Aggregator {
        Aggregator::Codex
    }

    fn request(&self) -> FeedResult<Request> {
        let mut request = client_request(&self.ws_url)?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        Ok(request)
    }

    async fn handshake(&self, ws: &mut WsStream) -> FeedResult<()> {
        let init = json!({
            "type": "connection_init",
            "payload": { "Authorization": self.api_key },
        });
        ws.send(Message::Text(init.to_string()))
            .await
            .map_err(|e| FeedError::HandshakeFailed(format!("failed to send connection_init: {e}")))?;

        loop {
            let frame = tokio::time::timeout(ACK_TIMEOUT, ws.next())
                .await
                .map_err(|_| FeedError::Timeout)?;

            let text = match frame {
                None => return Err(FeedError::Disconnected),
                Some(Err(e)) => {
                    return Err(FeedError::HandshakeFailed(format!("failed to read connection_ack: {e}")))
                }
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) => return Err(FeedError::Disconnected),
                Some(Ok(_)) => continue,
            };

            match self.decoder.decode(&text, Utc::now())? {
                Decoded::Control(ControlFrame::Ack) => {
                    debug!("Connection acknowledged by Codex");
                    return Ok(());
                }
                Decoded::Control(ControlFrame::KeepAlive) => continue,
                Decoded::Control(ControlFrame::Error(reason)) => {
                    return Err(FeedError::HandshakeFailed(reason))
                }
                other => {
                    return Err(FeedError::HandshakeFailed(format!(
                        "expected connection_ack, got: {other:?}"
                    )))
                }
            }
        }
    }

    fn subscriptions(&self) -> FeedResult<Vec<String>> {
        self.chains
            .iter()
            .enumerate()
            .map(|(i, chain)| {
                let network_id = chain.network_id.ok_or_else(|| {
                    FeedError::SubscriptionFailed(format!("{} has no network id", chain.chain_name))
                })?;
                Ok(json!({
                    "type": "subscribe",
                    "id": format!("sub_{}", i + 1),
                    "payload": {
                        "query": POOL_EVENTS_QUERY,
                        "variables": {
                            "address": chain.pool_address,
                            "networkId": network_id,
                        },
                    },
                })
                .to_string())
            })
            .collect()
    }

    fn decoder(&self) -> &dyn Decoder {
        &self.decoder
    }
}
