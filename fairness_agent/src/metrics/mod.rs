//! Pluggable fairness-metric catalog: a statically registered map in
//! place of a directory-walk, class-name-import plugin loader.

mod greediness;

pub use greediness::GreedinessMetric;

use crate::vector::ResourceVector;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-VM output of a metric: its normalized fair share of the supply
/// and the scalar heaviness cost the allocator will throttle against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmMetricEntry {
    pub compute_host: Option<String>,
    pub user_id: Option<String>,
    pub normalized_endowment: f64,
    pub heaviness: f64,
}

/// Full output of `Metric::map`: the global norm used to scale every
/// dimension, the reporting host, and one entry per VM keyed by
/// instance name. Also the wire shape of `receive_heavinesses`'s
/// `map` argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    pub global_norm: [f64; 6],
    pub compute_host: String,
    pub entries: HashMap<String, VmMetricEntry>,
}

/// A pluggable multi-resource fairness metric: a pure function from
/// cloud supply, per-VM demand/endowment vectors and the cloud-wide
/// user count to a heaviness cost per VM.
pub trait Metric: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    fn map(
        &self,
        supply: &ResourceVector,
        demands: &HashMap<String, ResourceVector>,
        endowments: &HashMap<String, ResourceVector>,
        user_count: usize,
    ) -> Result<MetricResult>;
}

/// String-keyed catalog of available metrics, populated once at
/// startup (or via a plugin-registration point) rather than scanned
/// off disk. `set_metric` (see `agent.rs`) is a lookup into this map.
#[derive(Clone)]
pub struct MetricRegistry {
    metrics: HashMap<String, Arc<dyn Metric>>,
    active: String,
}

impl MetricRegistry {
    pub fn with_default_metrics(active_metric: &str) -> Self {
        let mut metrics: HashMap<String, Arc<dyn Metric>> = HashMap::new();
        let greediness = Arc::new(GreedinessMetric::default());
        metrics.insert(greediness.name().to_string(), greediness);

        let active = if metrics.contains_key(active_metric) {
            active_metric.to_string()
        } else {
            log::warn!(
                "configured active_metric '{}' not found, falling back to GreedinessMetric",
                active_metric
            );
            "GreedinessMetric".to_string()
        };

        Self { metrics, active }
    }

    pub fn register(&mut self, metric: Arc<dyn Metric>) {
        self.metrics.insert(metric.name().to_string(), metric);
    }

    pub fn list(&self) -> Vec<(String, String)> {
        self.metrics
            .values()
            .map(|m| (m.name().to_string(), m.description().to_string()))
            .collect()
    }

    /// Validates that a metric with this name exists and, if so,
    /// switches the active metric. Returns the RPC-facing status
    /// string either way.
    pub fn set_active(&mut self, metric_name: &str) -> String {
        if self.metrics.contains_key(metric_name) {
            self.active = metric_name.to_string();
            "Metric successfully set.".to_string()
        } else {
            "Metric not found on compute host.".to_string()
        }
    }

    pub fn active(&self) -> &Arc<dyn Metric> {
        self.metrics
            .get(&self.active)
            .expect("active metric always present in registry")
    }

    pub fn active_name(&self) -> &str {
        &self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_greediness() {
        let registry = MetricRegistry::with_default_metrics("GreedinessMetric");
        assert_eq!(registry.active_name(), "GreedinessMetric");
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn set_active_rejects_unknown_metric() {
        let mut registry = MetricRegistry::with_default_metrics("GreedinessMetric");
        let status = registry.set_active("DoesNotExist");
        assert_eq!(status, "Metric not found on compute host.");
        assert_eq!(registry.active_name(), "GreedinessMetric");
    }

    #[test]
    fn set_active_accepts_known_metric() {
        let mut registry = MetricRegistry::with_default_metrics("GreedinessMetric");
        let status = registry.set_active("GreedinessMetric");
        assert_eq!(status, "Metric successfully set.");
    }
}
