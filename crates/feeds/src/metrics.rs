//! Prometheus metrics sink
//!
//! One process-wide registry shared by every monitor. Per-aggregator series
//! have dynamic names (`{aggregator}_latency_milliseconds`), so they are
//! created lazily and registered exactly once under a single mutex.

use parking_lot::Mutex;
use prometheus::core::Collector;
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use idxlag_core::{MetricsError, MetricsResult, TradeType};

/// Series owned by one aggregator
#[derive(Debug)]
pub struct AggregatorMetrics {
    /// `{aggregator}_latency_milliseconds{chain}`
    pub latency: GaugeVec,
    /// `{aggregator}_trades_total{chain,type}`
    pub trades: IntCounterVec,
    /// `{aggregator}_trade_volume_usd{chain}`
    pub volume: GaugeVec,
    /// Chains with a latency sample so far
    chains: Mutex<HashSet<String>>,
}

/// Shared registry of latency metrics
pub struct MetricsSink {
    registry: Registry,
    /// `all_aggregator_latency_milliseconds{aggregator,chain}`
    all_latency: GaugeVec,
    /// `pool_discovery_latency_milliseconds{aggregator,chain}`
    pool_discovery: GaugeVec,
    families: Mutex<HashMap<String, Arc<AggregatorMetrics>>>,
}

impl MetricsSink {
    pub fn new() -> MetricsResult<Self> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> MetricsResult<Self> {
        let all_latency = gauge_vec(
            "all_aggregator_latency_milliseconds",
            "Latency in milliseconds for all aggregators by blockchain and source",
            &["aggregator", "chain"],
        )?;
        register(&registry, "all_aggregator_latency_milliseconds", Box::new(all_latency.clone()))?;

        let pool_discovery = gauge_vec(
            "pool_discovery_latency_milliseconds",
            "Time from pool creation on-chain to its detection by the aggregator",
            &["aggregator", "chain"],
        )?;
        register(&registry, "pool_discovery_latency_milliseconds", Box::new(pool_discovery.clone()))?;

        Ok(Self {
            registry,
            all_latency,
            pool_discovery,
            families: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Series for `aggregator`, registering them on first use.
    ///
    /// The lock covers lookup, creation and registration and nothing else.
    pub fn get_or_create(&self, aggregator: &str) -> MetricsResult<Arc<AggregatorMetrics>> {
        let mut families = self.families.lock();
        if let Some(metrics) = families.get(aggregator) {
            return Ok(Arc::clone(metrics));
        }

        if !is_metric_prefix(aggregator) {
            return Err(MetricsError::InvalidName(aggregator.to_string()));
        }

        let latency_name = format!("{aggregator}_latency_milliseconds");
        let trades_name = format!("{aggregator}_trades_total");
        let volume_name = format!("{aggregator}_trade_volume_usd");

        let latency = gauge_vec(
            &latency_name,
            &format!("Latency in milliseconds for {aggregator} by blockchain"),
            &["chain"],
        )?;
        let trades = IntCounterVec::new(
            Opts::new(&trades_name, format!("Trades received from {aggregator} by blockchain and side")),
            &["chain", "type"],
        )
        .map_err(|e| registration_error(&trades_name, e))?;
        let volume = gauge_vec(
            &volume_name,
            &format!("USD volume of the last trade received from {aggregator}"),
            &["chain"],
        )?;

        // A family is registered whole or not at all
        register(&self.registry, &latency_name, Box::new(latency.clone()))?;
        register(&self.registry, &trades_name, Box::new(trades.clone())).map_err(|e| {
            rollback(&self.registry, vec![Box::new(latency.clone()) as Box<dyn Collector>], e)
        })?;
        register(&self.registry, &volume_name, Box::new(volume.clone())).map_err(|e| {
            let registered = vec![
                Box::new(latency.clone()) as Box<dyn Collector>,
                Box::new(trades.clone()) as Box<dyn Collector>,
            ];
            rollback(&self.registry, registered, e)
        })?;

        let metrics = Arc::new(AggregatorMetrics {
            latency,
            trades,
            volume,
            chains: Mutex::new(HashSet::new()),
        });
        families.insert(aggregator.to_string(), Arc::clone(&metrics));
        Ok(metrics)
    }

    /// Set the per-aggregator gauge and the combined cross-aggregator gauge
    pub fn record_latency(&self, aggregator: &str, chain: &str, lag_ms: i64) -> MetricsResult<()> {
        let metrics = self.get_or_create(aggregator)?;
        metrics.latency.with_label_values(&[chain]).set(lag_ms as f64);
        {
            let mut chains = metrics.chains.lock();
            if !chains.contains(chain) {
                chains.insert(chain.to_string());
            }
        }
        self.all_latency
            .with_label_values(&[aggregator, chain])
            .set(lag_ms as f64);
        Ok(())
    }

    pub fn record_trade(
        &self,
        aggregator: &str,
        chain: &str,
        trade_type: TradeType,
        volume_usd: Option<f64>,
    ) -> MetricsResult<()> {
        let metrics = self.get_or_create(aggregator)?;
        metrics
            .trades
            .with_label_values(&[chain, trade_type.as_str()])
            .inc();
        if let Some(volume) = volume_usd {
            metrics.volume.with_label_values(&[chain]).set(volume);
        }
        Ok(())
    }

    /// Pool discovery lag; also feeds the combined gauge so pool-only
    /// aggregators show up on the overlay chart
    pub fn record_pool_discovery(&self, aggregator: &str, chain: &str, lag_ms: i64) -> MetricsResult<()> {
        self.get_or_create(aggregator)?;
        self.pool_discovery
            .with_label_values(&[aggregator, chain])
            .set(lag_ms as f64);
        self.all_latency
            .with_label_values(&[aggregator, chain])
            .set(lag_ms as f64);
        Ok(())
    }

    /// Current `{aggregator}_latency_milliseconds{chain}` value, `None` until
    /// a sample was recorded for that chain
    pub fn latency_ms(&self, aggregator: &str, chain: &str) -> Option<f64> {
        let metrics = self.families.lock().get(aggregator).cloned()?;
        if !metrics.chains.lock().contains(chain) {
            return None;
        }
        Some(metrics.latency.with_label_values(&[chain]).get())
    }

    /// Text exposition of every registered series
    pub fn encode(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encode(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encode(e.to_string()))
    }
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> MetricsResult<GaugeVec> {
    GaugeVec::new(Opts::new(name, help), labels).map_err(|e| registration_error(name, e))
}

fn register(registry: &Registry, name: &str, collector: Box<dyn Collector>) -> MetricsResult<()> {
    registry
        .register(collector)
        .map_err(|e| registration_error(name, e))
}

/// Drop the already registered part of a family, passing `error` through
fn rollback(registry: &Registry, registered: Vec<Box<dyn Collector>>, error: MetricsError) -> MetricsError {
    for collector in registered {
        let _ = registry.unregister(collector);
    }
    error
}

fn registration_error(name: &str, e: prometheus::Error) -> MetricsError {
    MetricsError::Registration {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

fn is_metric_prefix(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
