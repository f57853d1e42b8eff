//! Configuration for the fairness agent, loaded from a YAML file via the
//! `config` crate: metric selection, tick intervals, decay factor,
//! overcommit ratios and the stub transport/membership knobs this
//! standalone crate needs in place of the real service-group oracle.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(about = "Cluster-wide multi-resource fairness controller", version, author)]
pub struct Args {
    /// Path to the config file
    #[clap(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FairnessSettings {
    /// This host's identifier, as it will appear in gossiped supply and
    /// heaviness messages.
    pub host: String,
    /// Bind address for the RPC/gossip HTTP server.
    #[serde(default = "default_rpc_bind")]
    pub rpc_bind: String,
    /// Other hosts known to run the fairness service, addressed as
    /// `host -> base URL`. Stands in for the real service-group
    /// membership oracle, which is out of scope for this crate.
    #[serde(default)]
    pub peers: std::collections::BTreeMap<String, String>,

    /// Initial active metric class name.
    #[serde(default = "default_active_metric")]
    pub active_metric: String,

    /// RUI collection tick period in seconds. `-1` disables it.
    #[serde(default = "default_interval")]
    pub rui_collection_interval: i64,
    /// Supply-poll tick period in seconds.
    #[serde(default = "default_interval")]
    pub supply_poll_interval: i64,
    /// EWMA decay factor applied to interval demand, in `[0, 1]`.
    #[serde(default = "default_decay_factor")]
    pub resource_decay_factor: f64,

    /// Enable the CSV RUI/prioritization stats export.
    #[serde(default)]
    pub rui_stats_enabled: bool,
    /// Path to the RUI stats CSV file.
    #[serde(default = "default_stats_path")]
    pub rui_stats_path: String,

    /// Configured per-host NIC capacity, in Mbit/s.
    #[serde(default = "default_max_network_throughput")]
    pub max_network_throughput: u64,

    /// Overcommit ratios applied to supply before the global norm is
    /// computed.
    #[serde(default = "default_allocation_ratio")]
    pub cpu_allocation_ratio: f64,
    #[serde(default = "default_allocation_ratio")]
    pub ram_allocation_ratio: f64,
    #[serde(default = "default_allocation_ratio")]
    pub disk_allocation_ratio: f64,

    /// Network interface the HFSC enforcer should configure classes on.
    #[serde(default = "default_network_interface")]
    pub network_interface: String,

    /// Single multiplier applied to all four setpoint formulas before
    /// clamping (see `allocator.rs`), so operators can retune
    /// aggressiveness without recompiling.
    #[serde(default = "default_setpoint_scale")]
    pub setpoint_scale: f64,

    /// Prometheus metrics endpoint bind address.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Bounded per-peer heaviness queue depth before the oldest entry
    /// is dropped (burst absorption, see `exchange.rs`).
    #[serde(default = "default_heaviness_queue_depth")]
    pub heaviness_queue_depth: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_bind")]
    pub bind: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_metrics_bind(),
        }
    }
}

fn default_metrics_bind() -> String {
    "127.0.0.1:9091".to_string()
}

fn default_rpc_bind() -> String {
    "0.0.0.0:7070".to_string()
}

fn default_active_metric() -> String {
    "GreedinessMetric".to_string()
}

fn default_interval() -> i64 {
    10
}

fn default_decay_factor() -> f64 {
    0.5
}

fn default_stats_path() -> String {
    "/var/log/nova/nova-fairness-rui-stats.csv".to_string()
}

fn default_max_network_throughput() -> u64 {
    1000
}

fn default_allocation_ratio() -> f64 {
    1.0
}

fn default_network_interface() -> String {
    "eth0".to_string()
}

fn default_setpoint_scale() -> f64 {
    1.0
}

fn default_heaviness_queue_depth() -> usize {
    16
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub fairness: FairnessSettings,
}
