//! Core type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ConfigError;

/// Supported data aggregators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregator {
    CoinGecko,
    Mobula,
    MobulaPulse,
    Codex,
    Gmgn,
}

impl Aggregator {
    pub const ALL: [Aggregator; 5] = [
        Aggregator::CoinGecko,
        Aggregator::Mobula,
        Aggregator::MobulaPulse,
        Aggregator::Codex,
        Aggregator::Gmgn,
    ];

    /// Name used as the metric prefix and config section
    pub fn name(&self) -> &'static str {
        match self {
            Aggregator::CoinGecko => "coingecko",
            Aggregator::Mobula => "mobula",
            Aggregator::MobulaPulse => "mobula_pulse",
            Aggregator::Codex => "codex",
            Aggregator::Gmgn => "gmgn",
        }
    }

    /// Tag printed at the start of every log line
    pub fn tag(&self) -> &'static str {
        match self {
            Aggregator::CoinGecko => "COINGECKO",
            Aggregator::Mobula => "MOBULA",
            Aggregator::MobulaPulse => "MOBULA-PULSE",
            Aggregator::Codex => "CODEX",
            Aggregator::Gmgn => "GMGN",
        }
    }

    pub fn default_ws_url(&self) -> &'static str {
        match self {
            Aggregator::CoinGecko => "wss://stream.coingecko.com/v1",
            Aggregator::Mobula | Aggregator::MobulaPulse => "wss://api.mobula.io",
            Aggregator::Codex => "wss://graph.codex.io/graphql",
            Aggregator::Gmgn => "wss://ws.gmgn.ai/quotation",
        }
    }

    /// Unit of the event timestamps this aggregator pushes.
    ///
    /// Overridable per deployment through `timestamp_unit` in the settings.
    pub fn default_timestamp_unit(&self) -> TimestampUnit {
        match self {
            Aggregator::CoinGecko => TimestampUnit::Milliseconds,
            Aggregator::Mobula => TimestampUnit::Milliseconds,
            Aggregator::MobulaPulse => TimestampUnit::Milliseconds,
            Aggregator::Codex => TimestampUnit::Seconds,
            Aggregator::Gmgn => TimestampUnit::Seconds,
        }
    }

    /// GMGN's quotation feed is public; every other aggregator needs a key
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Aggregator::Gmgn)
    }

    /// Legacy environment variable holding the key
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Aggregator::CoinGecko => "COINGECKO_API_KEY",
            Aggregator::Mobula | Aggregator::MobulaPulse => "MOBULA_API_KEY",
            Aggregator::Codex => "CODEX_API_KEY",
            Aggregator::Gmgn => "GMGN_ACCESS_TOKEN",
        }
    }
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Unit of an aggregator-supplied event timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampUnit {
    Seconds,
    Milliseconds,
}

impl TimestampUnit {
    /// Convert a raw timestamp in this unit to unix milliseconds
    pub fn to_millis(&self, raw: i64) -> i64 {
        match self {
            TimestampUnit::Seconds => raw.saturating_mul(1000),
            TimestampUnit::Milliseconds => raw,
        }
    }

    pub fn to_datetime(&self, raw: i64) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.to_millis(raw))
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            TimestampUnit::Seconds => "s",
            TimestampUnit::Milliseconds => "ms",
        }
    }
}

impl FromStr for TimestampUnit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "secs" | "seconds" => Ok(TimestampUnit::Seconds),
            "ms" | "millis" | "milliseconds" => Ok(TimestampUnit::Milliseconds),
            other => Err(ConfigError::UnknownTimestampUnit(other.to_string())),
        }
    }
}

/// One monitored chain/pool for an aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Code the aggregator uses for the chain ("evm:56", "bsc", "sol")
    pub chain_code: String,
    /// Canonical chain name used in metric labels
    pub chain_name: String,
    /// Numeric network id, where the protocol has one
    #[serde(default)]
    pub network_id: Option<i64>,
    #[serde(default)]
    pub pool_address: String,
}

impl ChainConfig {
    pub fn new(chain_code: &str, chain_name: &str, network_id: Option<i64>, pool_address: &str) -> Self {
        Self {
            chain_code: chain_code.to_string(),
            chain_name: chain_name.to_string(),
            network_id,
            pool_address: pool_address.to_string(),
        }
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeType {
    Buy,
    Sell,
    Unknown,
}

impl TradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeType::Buy => "buy",
            TradeType::Sell => "sell",
            TradeType::Unknown => "unknown",
        }
    }

    /// Parse the direction codes aggregators use ("b", "buy", "SELL", ...)
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().as_str() {
            "b" | "buy" => TradeType::Buy,
            "s" | "sell" => TradeType::Sell,
            _ => TradeType::Unknown,
        }
    }
}

impl fmt::Display for TradeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalised swap pushed by an aggregator
#[derive(Debug, Clone, PartialEq)]
pub struct TradeEvent {
    /// Canonical chain name
    pub chain: String,
    pub tx_hash: String,
    pub trade_type: TradeType,
    pub volume_usd: Option<f64>,
    /// Raw event timestamp, in the aggregator's unit
    pub event_timestamp: i64,
    pub received_at: DateTime<Utc>,
}

impl TradeEvent {
    /// First eight characters of the hash, for log lines
    pub fn short_hash(&self) -> &str {
        short(&self.tx_hash)
    }
}

/// Normalised pool creation pushed by an aggregator
#[derive(Debug, Clone, PartialEq)]
pub struct PoolEvent {
    pub chain: String,
    pub pool_address: String,
    pub token_symbol: String,
    pub exchange: String,
    pub initial_liquidity_usd: Option<f64>,
    pub market_cap_usd: Option<f64>,
    pub holder_count: Option<u64>,
    pub event_timestamp: i64,
    pub received_at: DateTime<Utc>,
}

impl PoolEvent {
    pub fn short_address(&self) -> &str {
        short(&self.pool_address)
    }
}

/// Derived lag for one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencySample {
    pub aggregator: Aggregator,
    pub chain: String,
    pub lag_ms: i64,
}

/// Connection lifecycle of one aggregator monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribing,
    Streaming,
    Backoff,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Backoff => "backoff",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn short(s: &str) -> &str {
    match s.char_indices().nth(8) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_unit_conversion() {
        assert_eq!(TimestampUnit::Seconds.to_millis(1_700_000_000), 1_700_000_000_000);
        assert_eq!(TimestampUnit::Milliseconds.to_millis(1_700_000_000_123), 1_700_000_000_123);
        assert_eq!(TimestampUnit::Seconds.to_millis(i64::MAX), i64::MAX);
    }

    #[test]
    fn test_timestamp_unit_parse() {
        assert_eq!("ms".parse::<TimestampUnit>().unwrap(), TimestampUnit::Milliseconds);
        assert_eq!("Seconds".parse::<TimestampUnit>().unwrap(), TimestampUnit::Seconds);
        assert!("minutes".parse::<TimestampUnit>().is_err());
    }

    #[test]
    fn test_trade_type_codes() {
        assert_eq!(TradeType::from_code("b"), TradeType::Buy);
        assert_eq!(TradeType::from_code("SELL"), TradeType::Sell);
        assert_eq!(TradeType::from_code("deposit"), TradeType::Unknown);
    }

    #[test]
    fn test_aggregator_names_are_metric_safe() {
        for aggregator in Aggregator::ALL {
            assert!(aggregator
                .name()
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '_'));
        }
        assert!(!Aggregator::Gmgn.requires_api_key());
        assert!(Aggregator::Codex.requires_api_key());
    }

    #[test]
    fn test_short_hash() {
        let event = TradeEvent {
            chain: "base".to_string(),
            tx_hash: "0xabc123456789".to_string(),
            trade_type: TradeType::Buy,
            volume_usd: None,
            event_timestamp: 0,
            received_at: Utc::now(),
        };
        assert_eq!(event.short_hash(), "0xabc123");
    }
}
