//! Prometheus export of fairness state, grounded on `lnvps_health`'s
//! `HealthMetrics`: one `Registry`, a handful of `GaugeVec`s, a plain
//! text-encoded `/metrics` handler.

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct FairnessMetrics {
    registry: Registry,
    /// 1 iff every live peer's supply is known locally.
    pub ready_gauge: GaugeVec,
    /// Per-VM heaviness from the last completed reallocation round.
    pub heaviness_gauge: GaugeVec,
    /// Per-dimension global norm from the last metric evaluation.
    pub global_norm_gauge: GaugeVec,
    /// Cloud-wide distinct user count used for the fairness quota.
    pub user_count_gauge: GaugeVec,
}

const DIMENSIONS: [&str; 6] = [
    "cpu_time",
    "disk_bytes_read",
    "disk_bytes_written",
    "net_bytes_rx",
    "net_bytes_tx",
    "memory_used",
];

impl FairnessMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let ready_gauge = GaugeVec::new(
            Opts::new(
                "fairness_supply_ready",
                "1 if every live peer's supply is known, else 0",
            ),
            &["host"],
        )
        .expect("failed to create ready_gauge");

        let heaviness_gauge = GaugeVec::new(
            Opts::new("fairness_heaviness", "Per-VM heaviness, last round"),
            &["instance"],
        )
        .expect("failed to create heaviness_gauge");

        let global_norm_gauge = GaugeVec::new(
            Opts::new(
                "fairness_global_norm",
                "Per-dimension global norm, last metric evaluation",
            ),
            &["dimension"],
        )
        .expect("failed to create global_norm_gauge");

        let user_count_gauge = GaugeVec::new(
            Opts::new("fairness_user_count", "Cloud-wide distinct user count"),
            &["host"],
        )
        .expect("failed to create user_count_gauge");

        registry
            .register(Box::new(ready_gauge.clone()))
            .expect("failed to register ready_gauge");
        registry
            .register(Box::new(heaviness_gauge.clone()))
            .expect("failed to register heaviness_gauge");
        registry
            .register(Box::new(global_norm_gauge.clone()))
            .expect("failed to register global_norm_gauge");
        registry
            .register(Box::new(user_count_gauge.clone()))
            .expect("failed to register user_count_gauge");

        Self {
            registry,
            ready_gauge,
            heaviness_gauge,
            global_norm_gauge,
            user_count_gauge,
        }
    }

    pub fn record_ready(&self, host: &str, ready: bool) {
        self.ready_gauge
            .with_label_values(&[host])
            .set(if ready { 1.0 } else { 0.0 });
    }

    pub fn record_heaviness(&self, instance: &str, heaviness: f64) {
        self.heaviness_gauge
            .with_label_values(&[instance])
            .set(heaviness);
    }

    pub fn record_global_norm(&self, norm: &[f64; 6]) {
        for (dimension, value) in DIMENSIONS.iter().zip(norm.iter()) {
            self.global_norm_gauge
                .with_label_values(&[dimension])
                .set(*value);
        }
    }

    pub fn record_user_count(&self, host: &str, count: usize) {
        self.user_count_gauge
            .with_label_values(&[host])
            .set(count as f64);
    }

    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for FairnessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<Arc<FairnessMetrics>>,
) -> String {
    metrics.export()
}
