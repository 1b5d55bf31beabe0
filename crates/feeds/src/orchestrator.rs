//! Runs every enabled monitor as an isolated task

use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use idxlag_core::{Aggregator, Settings};

use crate::metrics::MetricsSink;
use crate::monitor::AggregatorMonitor;
use crate::shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
use crate::supervisor::MonitorExit;

/// One monitor per enabled aggregator, all sharing `sink`
pub fn build_monitors(settings: &Settings, sink: Arc<MetricsSink>) -> Vec<AggregatorMonitor> {
    settings
        .monitors()
        .into_iter()
        .map(|monitor| AggregatorMonitor::new(monitor, Arc::clone(&sink)))
        .collect()
}

/// Spawned monitor tasks plus the stop signal they share
pub struct MonitorSet {
    trigger: ShutdownTrigger,
    tasks: Vec<(Aggregator, JoinHandle<MonitorExit>)>,
}

impl MonitorSet {
    pub fn new() -> Self {
        let (trigger, _) = shutdown_channel();
        Self {
            trigger,
            tasks: Vec::new(),
        }
    }

    pub fn spawn(monitors: Vec<AggregatorMonitor>) -> Self {
        let mut set = Self::new();
        for monitor in monitors {
            set.spawn_task(monitor.aggregator(), |stop| monitor.run(stop));
        }
        info!("Started {} monitor(s)", set.len());
        set
    }

    /// Spawn `task` with its own subscription to the stop signal
    pub fn spawn_task<F, Fut>(&mut self, aggregator: Aggregator, task: F)
    where
        F: FnOnce(Shutdown) -> Fut,
        Fut: Future<Output = MonitorExit> + Send + 'static,
    {
        let handle = tokio::spawn(task(self.trigger.subscribe()));
        self.tasks.push((aggregator, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Broadcast the stop signal
    pub fn shutdown(&self) {
        info!("Stopping {} monitor(s)", self.tasks.len());
        self.trigger.trigger();
    }

    /// Wait for every task. A panicked task is reported, never propagated.
    pub async fn join(self) -> Vec<(Aggregator, MonitorExit)> {
        let mut exits = Vec::with_capacity(self.tasks.len());

        for (aggregator, handle) in self.tasks {
            let exit = match handle.await {
                Ok(exit) => exit,
                Err(e) if e.is_panic() => {
                    error!("[{}] Monitor task panicked", aggregator.tag());
                    MonitorExit::Panicked
                }
                Err(e) => {
                    error!("[{}] Monitor task failed: {}", aggregator.tag(), e);
                    MonitorExit::Panicked
                }
            };
            exits.push((aggregator, exit));
        }

        exits
    }
}

impl Default for MonitorSet {
    fn default() -> Self {
        Self::new()
    }
}
