use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, File};
use fairness_agent::agent::FairnessAgent;
use fairness_agent::bus::HttpMessageBus;
use fairness_agent::config::{Args, Settings};
use fairness_agent::enforcer::{Enforcer, ShellEnforcer};
use fairness_agent::membership::{MembershipOracle, StaticMembershipOracle};
use fairness_agent::metrics_export::FairnessMetrics;
use fairness_agent::probe::{HypervisorProbe, ProcHypervisorProbe};
use fairness_agent::stats::{CsvRuiStatsSink, RuiStatsSink};
use fairness_agent::supply::HostSupply;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let settings: Settings = Config::builder()
        .add_source(File::from(
            args.config.unwrap_or_else(|| PathBuf::from("config.yaml")),
        ))
        .build()
        .context("failed to build configuration")?
        .try_deserialize()
        .context("failed to parse configuration")?;
    let fairness = settings.fairness;

    info!(
        "fairness agent starting as host '{}', metric '{}', {} configured peers",
        fairness.host,
        fairness.active_metric,
        fairness.peers.len(),
    );

    let local_supply = HostSupply::probe_local(&fairness.host, fairness.max_network_throughput)
        .await
        .context("failed to probe local host supply")?;

    let mut members: Vec<String> = fairness.peers.keys().cloned().collect();
    members.push(fairness.host.clone());
    let membership: Arc<dyn MembershipOracle> = Arc::new(StaticMembershipOracle::new(members));

    let bogo_mips = local_supply.cpu_cores_weighted
        / std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
    let probe: Arc<dyn HypervisorProbe> = Arc::new(ProcHypervisorProbe::new(bogo_mips));

    let enforcer: Arc<dyn Enforcer> = Arc::new(ShellEnforcer::new(
        fairness.network_interface.clone(),
        fairness.max_network_throughput as u32,
    ));

    let bus = Arc::new(HttpMessageBus::new(Duration::from_secs(5)));

    let stats: Option<Arc<dyn RuiStatsSink>> = if fairness.rui_stats_enabled {
        Some(Arc::new(
            CsvRuiStatsSink::new(&fairness.rui_stats_path, local_supply.cpu_cores_weighted)
                .context("failed to open RUI stats file")?,
        ))
    } else {
        None
    };

    let prom = if fairness.metrics.enabled {
        Some(Arc::new(FairnessMetrics::new()))
    } else {
        None
    };

    let agent = Arc::new(FairnessAgent::new(
        fairness,
        local_supply,
        membership,
        probe,
        enforcer,
        bus,
        stats,
        prom,
    ));

    agent.run().await
}
