//! Configuration types
//!
//! Layering, lowest precedence first: built-in defaults, optional
//! `idxlag.toml`, `IDXLAG__SECTION__KEY` environment variables, then the flat
//! legacy variables (`CODEX_API_KEY`, `METRICS_PORT`, ...).

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::chains::normalize_chain;
use crate::errors::{ConfigError, ConfigResult};
use crate::types::{Aggregator, ChainConfig, TimestampUnit};

/// Metrics endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub listen_addr: String,
    pub path: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2112".to_string(),
            path: "/metrics".to_string(),
        }
    }
}

/// Reconnection policy shared by every monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub floor_secs: u64,
    pub ceiling_secs: u64,
    pub subscribe_delay_ms: u64,
    /// Client ping period while streaming
    pub ping_interval_secs: u64,
    /// Drop the stream after this long without any inbound frame
    pub idle_timeout_secs: u64,
}

impl ReconnectSettings {
    pub fn floor(&self) -> Duration {
        Duration::from_secs(self.floor_secs)
    }

    pub fn ceiling(&self) -> Duration {
        Duration::from_secs(self.ceiling_secs)
    }

    pub fn subscribe_delay(&self) -> Duration {
        Duration::from_millis(self.subscribe_delay_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            floor_secs: 5,
            ceiling_secs: 60,
            subscribe_delay_ms: 200,
            ping_interval_secs: 20,
            idle_timeout_secs: 30,
        }
    }
}

/// Session statistics configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    /// Log a summary every N events (0 = only on shutdown)
    pub summary_every: u64,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self { summary_every: 50 }
    }
}

/// Per-aggregator section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub ws_url: Option<String>,
    pub timestamp_unit: Option<TimestampUnit>,
    pub chains: Vec<ChainConfig>,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            ws_url: None,
            timestamp_unit: None,
            chains: Vec::new(),
        }
    }
}

/// Complete monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub metrics: MetricsSettings,
    pub reconnect: ReconnectSettings,
    pub stats: StatsSettings,
    pub coingecko: AggregatorSettings,
    pub mobula: AggregatorSettings,
    pub mobula_pulse: AggregatorSettings,
    pub codex: AggregatorSettings,
    pub gmgn: AggregatorSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let mut settings = Self {
            metrics: MetricsSettings::default(),
            reconnect: ReconnectSettings::default(),
            stats: StatsSettings::default(),
            coingecko: AggregatorSettings::default(),
            mobula: AggregatorSettings::default(),
            mobula_pulse: AggregatorSettings::default(),
            codex: AggregatorSettings::default(),
            gmgn: AggregatorSettings::default(),
        };
        settings.resolve();
        settings
    }
}

/// Everything one monitor needs, resolved from [`Settings`]
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub aggregator: Aggregator,
    pub api_key: Option<String>,
    pub ws_url: String,
    pub timestamp_unit: TimestampUnit,
    pub chains: Vec<ChainConfig>,
    pub reconnect: ReconnectSettings,
    pub summary_every: u64,
}

impl MonitorSettings {
    /// Defaults for one aggregator, without an API key
    pub fn new(aggregator: Aggregator) -> Self {
        Self {
            aggregator,
            api_key: None,
            ws_url: aggregator.default_ws_url().to_string(),
            timestamp_unit: aggregator.default_timestamp_unit(),
            chains: default_chains(aggregator),
            reconnect: ReconnectSettings::default(),
            summary_every: StatsSettings::default().summary_every,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    pub fn with_chains(mut self, chains: Vec<ChainConfig>) -> Self {
        self.chains = chains;
        self
    }
}

impl Settings {
    /// Load `.env`-backed configuration from every layer
    pub fn load() -> ConfigResult<Self> {
        let path = env::var("IDXLAG_CONFIG").unwrap_or_else(|_| "idxlag".to_string());

        let raw = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("IDXLAG")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = raw.try_deserialize()?;
        settings.apply_legacy_env(|key| env::var(key).ok())?;
        settings.resolve();
        settings.validate()?;

        Ok(settings)
    }

    pub fn aggregator(&self, aggregator: Aggregator) -> &AggregatorSettings {
        match aggregator {
            Aggregator::CoinGecko => &self.coingecko,
            Aggregator::Mobula => &self.mobula,
            Aggregator::MobulaPulse => &self.mobula_pulse,
            Aggregator::Codex => &self.codex,
            Aggregator::Gmgn => &self.gmgn,
        }
    }

    fn aggregator_mut(&mut self, aggregator: Aggregator) -> &mut AggregatorSettings {
        match aggregator {
            Aggregator::CoinGecko => &mut self.coingecko,
            Aggregator::Mobula => &mut self.mobula,
            Aggregator::MobulaPulse => &mut self.mobula_pulse,
            Aggregator::Codex => &mut self.codex,
            Aggregator::Gmgn => &mut self.gmgn,
        }
    }

    /// Apply the flat legacy variables
    pub fn apply_legacy_env<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for aggregator in Aggregator::ALL {
            if let Some(key) = lookup(aggregator.api_key_env()).filter(|k| !k.trim().is_empty()) {
                self.aggregator_mut(aggregator).api_key = Some(key.trim().to_string());
            }
        }

        if let Some(port) = lookup("METRICS_PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("METRICS_PORT is not a port: {port}")))?;
            let mut addr: SocketAddr = self.metrics.listen_addr.parse().map_err(|_| {
                ConfigError::Invalid(format!("metrics.listen_addr: {}", self.metrics.listen_addr))
            })?;
            addr.set_port(port);
            self.metrics.listen_addr = addr.to_string();
        }

        if let Some(chains) = lookup("CHAINS") {
            self.gmgn.chains = chains
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(|code| ChainConfig::new(code, &normalize_chain(code), None, ""))
                .collect();
        }

        Ok(())
    }

    /// Fill unset sections from the built-in defaults
    pub fn resolve(&mut self) {
        for aggregator in Aggregator::ALL {
            let section = self.aggregator_mut(aggregator);
            if section.chains.is_empty() {
                section.chains = default_chains(aggregator);
            }
            if section.api_key.as_deref().map_or(false, |k| k.trim().is_empty()) {
                section.api_key = None;
            }
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.reconnect.floor_secs == 0 {
            return Err(ConfigError::Invalid("reconnect.floor_secs must be > 0".into()));
        }
        if self.reconnect.floor_secs > self.reconnect.ceiling_secs {
            return Err(ConfigError::Invalid(format!(
                "reconnect.floor_secs ({}) exceeds reconnect.ceiling_secs ({})",
                self.reconnect.floor_secs, self.reconnect.ceiling_secs
            )));
        }
        if self.reconnect.ping_interval_secs == 0
            || self.reconnect.ping_interval_secs >= self.reconnect.idle_timeout_secs
        {
            return Err(ConfigError::Invalid(format!(
                "reconnect.ping_interval_secs ({}) must be > 0 and below reconnect.idle_timeout_secs ({})",
                self.reconnect.ping_interval_secs, self.reconnect.idle_timeout_secs
            )));
        }
        self.metrics_addr()?;
        if !self.metrics.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "metrics.path must start with '/': {}",
                self.metrics.path
            )));
        }
        for aggregator in Aggregator::ALL {
            let section = self.aggregator(aggregator);
            if section.enabled && section.chains.is_empty() {
                return Err(ConfigError::Invalid(format!("{aggregator}: no chains configured")));
            }
            if section.enabled && aggregator == Aggregator::Codex {
                if let Some(chain) = section.chains.iter().find(|c| c.network_id.is_none()) {
                    return Err(ConfigError::Invalid(format!(
                        "{aggregator}: chain {} has no network_id",
                        chain.chain_code
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn metrics_addr(&self) -> ConfigResult<SocketAddr> {
        self.metrics
            .listen_addr
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("metrics.listen_addr: {}", self.metrics.listen_addr)))
    }

    /// Resolved settings for every enabled aggregator
    pub fn monitors(&self) -> Vec<MonitorSettings> {
        Aggregator::ALL
            .into_iter()
            .filter(|a| self.aggregator(*a).enabled)
            .map(|a| self.monitor(a))
            .collect()
    }

    pub fn monitor(&self, aggregator: Aggregator) -> MonitorSettings {
        let section = self.aggregator(aggregator);
        MonitorSettings {
            aggregator,
            api_key: section.api_key.clone(),
            ws_url: section
                .ws_url
                .clone()
                .unwrap_or_else(|| aggregator.default_ws_url().to_string()),
            timestamp_unit: section
                .timestamp_unit
                .unwrap_or_else(|| aggregator.default_timestamp_unit()),
            chains: section.chains.clone(),
            reconnect: self.reconnect,
            summary_every: self.stats.summary_every,
        }
    }
}

const SOLANA_POOL: &str = "7qbRF6YsyGuLUVs6Y1q64bdVrfe4ZcUUz1JRdoVNUJnm";
const BNB_POOL: &str = "0x58f876857a02d6762e0101bb5c46a8c1ed44dc16";
const BASE_POOL: &str = "0x4c36388be6f416a29c8d8eee81c771ce6be14b18";
const MONAD_POOL: &str = "0x659bD0BC4167BA25c62E05656F78043E7eD4a9da";

/// Chains and pools monitored when the configuration names none
pub fn default_chains(aggregator: Aggregator) -> Vec<ChainConfig> {
    match aggregator {
        Aggregator::CoinGecko => vec![
            ChainConfig::new("solana", "solana", None, SOLANA_POOL),
            ChainConfig::new("bsc", "bnb", None, BNB_POOL),
            ChainConfig::new("base", "base", None, BASE_POOL),
        ],
        Aggregator::Mobula => vec![
            ChainConfig::new("solana", "solana", Some(1399811149), SOLANA_POOL),
            ChainConfig::new("evm:56", "bnb", Some(56), BNB_POOL),
            ChainConfig::new("evm:8453", "base", Some(8453), BASE_POOL),
        ],
        Aggregator::MobulaPulse => vec![
            ChainConfig::new("solana:solana", "solana", Some(1399811149), ""),
            ChainConfig::new("evm:56", "bnb", Some(56), ""),
            ChainConfig::new("evm:8453", "base", Some(8453), ""),
        ],
        Aggregator::Codex => vec![
            ChainConfig::new("solana", "solana", Some(1399811149), SOLANA_POOL),
            ChainConfig::new("bnb", "bnb", Some(56), BNB_POOL),
            ChainConfig::new("base", "base", Some(8453), BASE_POOL),
            ChainConfig::new("monad", "monad", Some(143), MONAD_POOL),
        ],
        Aggregator::Gmgn => vec![
            ChainConfig::new("sol", "solana", None, ""),
            ChainConfig::new("bsc", "bnb", None, ""),
            ChainConfig::new("base", "base", None, ""),
        ],
    }
}
