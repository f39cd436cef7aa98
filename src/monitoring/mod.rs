// Broker metrics: a small set of gauges and counters updated by the
// background loops. Values are plain f64s behind locks; an exporter
// surface, when deployed, reads them through `snapshot()`.

use std::sync::Arc;

use parking_lot::RwLock;

/// Counter metric - monotonically increasing value
#[derive(Debug, Clone)]
pub struct Counter {
    name: String,
    value: Arc<RwLock<f64>>,
}

impl Counter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Arc::new(RwLock::new(0.0)),
        }
    }

    pub fn inc(&self) {
        *self.value.write() += 1.0;
    }

    pub fn inc_by(&self, value: f64) {
        if value >= 0.0 {
            *self.value.write() += value;
        }
    }

    pub fn get(&self) -> f64 {
        *self.value.read()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Gauge metric - value that can go up and down
#[derive(Debug, Clone)]
pub struct Gauge {
    name: String,
    value: Arc<RwLock<f64>>,
}

impl Gauge {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Arc::new(RwLock::new(0.0)),
        }
    }

    pub fn set(&self, value: f64) {
        *self.value.write() = value;
    }

    pub fn get(&self) -> f64 {
        *self.value.read()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The broker's metric set.
#[derive(Debug, Clone)]
pub struct BrokerMetrics {
    pub active_connections: Gauge,
    pub running_workloads: Gauge,
    pub pool_workloads: Gauge,
    pub users_synced: Counter,
    pub sync_errors: Counter,
    pub workloads_spawned: Counter,
    pub workloads_destroyed: Counter,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self {
            active_connections: Gauge::new("broker_active_connections"),
            running_workloads: Gauge::new("broker_running_workloads"),
            pool_workloads: Gauge::new("broker_pool_workloads"),
            users_synced: Counter::new("broker_users_synced_total"),
            sync_errors: Counter::new("broker_sync_errors_total"),
            workloads_spawned: Counter::new("broker_workloads_spawned_total"),
            workloads_destroyed: Counter::new("broker_workloads_destroyed_total"),
        }
    }

    /// Current values, for logging and the (external) exporter surface.
    pub fn snapshot(&self) -> Vec<(&str, f64)> {
        vec![
            (self.active_connections.name(), self.active_connections.get()),
            (self.running_workloads.name(), self.running_workloads.get()),
            (self.pool_workloads.name(), self.pool_workloads.get()),
            (self.users_synced.name(), self.users_synced.get()),
            (self.sync_errors.name(), self.sync_errors.get()),
            (self.workloads_spawned.name(), self.workloads_spawned.get()),
            (
                self.workloads_destroyed.name(),
                self.workloads_destroyed.get(),
            ),
        ]
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_gauges_overwrite() {
        let metrics = BrokerMetrics::new();
        metrics.users_synced.inc();
        metrics.users_synced.inc_by(2.0);
        metrics.users_synced.inc_by(-5.0); // ignored
        assert_eq!(metrics.users_synced.get(), 3.0);

        metrics.active_connections.set(4.0);
        metrics.active_connections.set(2.0);
        assert_eq!(metrics.active_connections.get(), 2.0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.len(), 7);
        assert!(snapshot
            .iter()
            .any(|(name, v)| *name == "broker_active_connections" && *v == 2.0));
    }

    #[test]
    fn clones_share_the_underlying_value() {
        let gauge = Gauge::new("g");
        let clone = gauge.clone();
        clone.set(7.0);
        assert_eq!(gauge.get(), 7.0);
    }
}
