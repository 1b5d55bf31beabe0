//! Wire message decoding
//!
//! Every aggregator speaks its own dialect. Each protocol module provides a
//! [`Decoder`] that turns one text frame into a [`Decoded`] value.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

use idxlag_core::{normalize_chain, ChainConfig, FeedResult, PoolEvent, TradeEvent};

/// Protocol-level frames that carry no event data
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    KeepAlive,
    Ack,
    Error(String),
    Complete(Option<String>),
}

/// Outcome of decoding one wire message
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Control(ControlFrame),
    Trades(Vec<TradeEvent>),
    Pools(Vec<PoolEvent>),
    /// Valid JSON that is not an event we track (wrong event type, missing fields)
    Unrecognized,
}

impl Decoded {
    pub(crate) fn trades(events: Vec<TradeEvent>) -> Self {
        if events.is_empty() {
            Decoded::Unrecognized
        } else {
            Decoded::Trades(events)
        }
    }

    pub(crate) fn pools(events: Vec<PoolEvent>) -> Self {
        if events.is_empty() {
            Decoded::Unrecognized
        } else {
            Decoded::Pools(events)
        }
    }
}

/// Per-aggregator parser
pub trait Decoder: Send + Sync {
    /// Decode one frame. `Err` means the frame was malformed.
    fn decode(&self, raw: &str, received_at: DateTime<Utc>) -> FeedResult<Decoded>;
}

/// Maps aggregator chain codes and network ids to canonical chain names
#[derive(Debug, Clone, Default)]
pub struct ChainTable {
    by_code: Vec<(String, String)>,
    by_network: HashMap<i64, String>,
}

impl ChainTable {
    pub fn new(chains: &[ChainConfig]) -> Self {
        Self {
            by_code: chains
                .iter()
                .map(|c| (c.chain_code.clone(), c.chain_name.clone()))
                .collect(),
            by_network: chains
                .iter()
                .filter_map(|c| c.network_id.map(|id| (id, c.chain_name.clone())))
                .collect(),
        }
    }

    /// Configured name for `code`, else the global normalisation
    pub fn by_code(&self, code: &str) -> String {
        self.by_code
            .iter()
            .find(|(c, _)| c.eq_ignore_ascii_case(code))
            .map(|(_, name)| name.clone())
            .unwrap_or_else(|| normalize_chain(code))
    }

    pub fn by_network(&self, network_id: i64) -> String {
        self.by_network
            .get(&network_id)
            .cloned()
            .unwrap_or_else(|| format!("network_{network_id}"))
    }
}

/// Number or numeric string as `f64`
pub(crate) fn as_f64(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Number or numeric string as `i64`; fractional values are truncated
pub(crate) fn as_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

pub(crate) fn as_str(value: Option<&Value>) -> Option<&str> {
    value?.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// First present field among `keys`
pub(crate) fn field<'a>(object: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| object.get(*k))
        .find(|v| !v.is_null())
}

/// Items of a payload that may be a single object or an array of them
pub(crate) fn items(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().filter(|v| v.is_object()).collect(),
        Value::Object(_) => vec![value],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_coercion() {
        let v = json!({"a": "12.5", "b": 3, "c": 1700000000.9, "d": "x", "e": null});
        assert_eq!(as_f64(v.get("a")), Some(12.5));
        assert_eq!(as_f64(v.get("b")), Some(3.0));
        assert_eq!(as_i64(v.get("c")), Some(1_700_000_000));
        assert_eq!(as_i64(v.get("a")), Some(12));
        assert_eq!(as_f64(v.get("d")), None);
        assert_eq!(as_f64(v.get("e")), None);
        assert_eq!(as_f64(v.get("missing")), None);
    }

    #[test]
    fn test_field_skips_nulls() {
        let v = json!({"created_at": null, "createdAt": 5});
        assert_eq!(as_i64(field(&v, &["created_at", "createdAt"])), Some(5));
    }

    #[test]
    fn test_chain_table() {
        let table = ChainTable::new(&[
            ChainConfig::new("evm:56", "bnb", Some(56), ""),
            ChainConfig::new("custom", "mychain", Some(7), ""),
        ]);
        assert_eq!(table.by_code("EVM:56"), "bnb");
        assert_eq!(table.by_code("custom"), "mychain");
        assert_eq!(table.by_code("Base"), "base");
        assert_eq!(table.by_code("zksync"), "zksync");
        assert_eq!(table.by_network(7), "mychain");
        assert_eq!(table.by_network(99), "network_99");
    }
}
