//! Prometheus metrics emitted by the state cache
//!
//! Each `Cluster` owns its own registry so independent caches (and tests)
//! never share series.

use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "nodestate";

/// Metrics for one cluster state cache
#[derive(Clone)]
pub struct StateMetrics {
    registry: Registry,
    node_count: IntGauge,
    synced: IntGauge,
    unsynced_time_seconds: Gauge,
    scheduling_decision_duration: Histogram,
}

fn register<C>(registry: &Registry, collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .expect("failed to register state metric collector");
    collector
}

impl StateMetrics {
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None)
            .expect("failed to initialise state metrics registry");

        let node_count = IntGauge::with_opts(Opts::new(
            "cluster_state_node_count",
            "Current count of nodes in cluster state",
        ))
        .expect("failed to build node count gauge");

        let synced = IntGauge::with_opts(Opts::new(
            "cluster_state_synced",
            "Returns 1 if cluster state is synced and 0 otherwise",
        ))
        .expect("failed to build synced gauge");

        let unsynced_time_seconds = Gauge::with_opts(Opts::new(
            "cluster_state_unsynced_time_seconds",
            "The time for which cluster state is not synced",
        ))
        .expect("failed to build unsynced time gauge");

        let scheduling_decision_duration = Histogram::with_opts(
            HistogramOpts::new(
                "pods_scheduling_decision_duration_seconds",
                "Time from a pod first being seen pending to its first scheduling attempt",
            )
            .buckets(prometheus::exponential_buckets(0.005, 2.0, 16).unwrap_or_default()),
        )
        .expect("failed to build scheduling decision histogram");

        Self {
            node_count: register(&registry, node_count),
            synced: register(&registry, synced),
            unsynced_time_seconds: register(&registry, unsynced_time_seconds),
            scheduling_decision_duration: register(&registry, scheduling_decision_duration),
            registry,
        }
    }

    pub fn set_node_count(&self, count: usize) {
        self.node_count.set(count as i64);
    }

    pub fn node_count(&self) -> i64 {
        self.node_count.get()
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.set(i64::from(synced));
    }

    pub fn synced(&self) -> bool {
        self.synced.get() == 1
    }

    pub fn set_unsynced_time(&self, unsynced: Duration) {
        self.unsynced_time_seconds.set(unsynced.as_secs_f64());
    }

    pub fn unsynced_time_seconds(&self) -> f64 {
        self.unsynced_time_seconds.get()
    }

    pub fn observe_scheduling_decision(&self, elapsed: Duration) {
        self.scheduling_decision_duration
            .observe(elapsed.as_secs_f64());
    }

    /// Number of samples recorded by the decision histogram
    pub fn scheduling_decision_samples(&self) -> u64 {
        self.scheduling_decision_duration.get_sample_count()
    }

    /// Encode every metric in the text exposition format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl Default for StateMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMetrics")
            .field("node_count", &self.node_count.get())
            .field("synced", &self.synced.get())
            .finish()
    }
}
