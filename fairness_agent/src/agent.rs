//! `FairnessAgent`: owns every collaborator and runs the two periodic
//! tasks (supply polling, RUI collection) and the three RPC handlers
//! (`set_metric`, `receive_host_supply`, `receive_heavinesses`). Each
//! periodic task runs on a `tokio::time::interval` guarded by an
//! `AtomicBool` so a slow tick never overlaps the next one, and
//! `tokio::select!` ties both loops and the RPC server to a single
//! shutdown path.

use crate::allocator::ResourceAllocator;
use crate::bus::{self, MessageBus};
use crate::config::FairnessSettings;
use crate::enforcer::Enforcer;
use crate::exchange::HeavinessExchange;
use crate::membership::MembershipOracle;
use crate::metrics::MetricRegistry;
use crate::metrics_export::FairnessMetrics;
use crate::probe::HypervisorProbe;
use crate::rui::RUICollector;
use crate::stats::RuiStatsSink;
use crate::supply::{CloudSupplyRegistry, HostSupply};
use crate::vector::ResourceVector;
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::Mutex;
use tokio::time::interval;

pub struct FairnessAgent {
    settings: FairnessSettings,
    host: String,

    supply: Mutex<CloudSupplyRegistry>,
    metrics_registry: Mutex<MetricRegistry>,
    rui: Mutex<RUICollector>,
    exchange: Mutex<HeavinessExchange>,
    allocator: ResourceAllocator,

    membership: Arc<dyn MembershipOracle>,
    probe: Arc<dyn HypervisorProbe>,
    bus: Arc<dyn MessageBus>,
    stats: Option<Arc<dyn RuiStatsSink>>,
    prom: Option<Arc<FairnessMetrics>>,

    last_rui_tick: Mutex<Option<Instant>>,
    fairness_quota: Mutex<ResourceVector>,
    global_norm: Mutex<[f64; 6]>,

    supply_poll_running: AtomicBool,
    rui_collect_running: AtomicBool,
}

impl FairnessAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: FairnessSettings,
        local_supply: HostSupply,
        membership: Arc<dyn MembershipOracle>,
        probe: Arc<dyn HypervisorProbe>,
        enforcer: Arc<dyn Enforcer>,
        bus: Arc<dyn MessageBus>,
        stats: Option<Arc<dyn RuiStatsSink>>,
        prom: Option<Arc<FairnessMetrics>>,
    ) -> Self {
        let host = settings.host.clone();
        let supply = CloudSupplyRegistry::new(
            local_supply,
            membership.clone(),
            settings.cpu_allocation_ratio,
            settings.ram_allocation_ratio,
            settings.disk_allocation_ratio,
        );
        let metrics_registry = MetricRegistry::with_default_metrics(&settings.active_metric);
        let rui = RUICollector::new(settings.resource_decay_factor);
        let exchange = HeavinessExchange::new(settings.heaviness_queue_depth);
        let allocator = ResourceAllocator::new(enforcer, stats.clone(), settings.setpoint_scale);

        Self {
            settings,
            host,
            supply: Mutex::new(supply),
            metrics_registry: Mutex::new(metrics_registry),
            rui: Mutex::new(rui),
            exchange: Mutex::new(exchange),
            allocator,
            membership,
            probe,
            bus,
            stats,
            prom,
            last_rui_tick: Mutex::new(None),
            fairness_quota: Mutex::new(ResourceVector::zero()),
            global_norm: Mutex::new([0.0; 6]),
            supply_poll_running: AtomicBool::new(false),
            rui_collect_running: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Spawns both periodic tasks and the RPC/admin HTTP surface, and
    /// blocks until either one exits unexpectedly or `ctrl_c` fires.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.allocator.reset_network().await;

        let rpc_bind: SocketAddr = self
            .settings
            .rpc_bind
            .parse()
            .context("invalid fairness.rpc-bind address")?;

        let supply_agent = self.clone();
        let supply_task = tokio::spawn(async move {
            supply_agent.supply_poll_loop().await;
        });

        let rui_agent = self.clone();
        let rui_task = tokio::spawn(async move {
            rui_agent.rui_collect_loop().await;
        });

        let rpc_agent = self.clone();
        let rpc_task = tokio::spawn(async move {
            if let Err(e) = crate::http_admin::serve(rpc_agent, rpc_bind).await {
                log::error!("RPC/admin server error: {e}");
            }
        });

        if let Some(prom) = self.prom.clone() {
            let metrics_bind: SocketAddr = self
                .settings
                .metrics
                .bind
                .parse()
                .context("invalid fairness.metrics.bind address")?;
            tokio::spawn(async move {
                if let Err(e) = serve_metrics(prom, metrics_bind).await {
                    log::error!("metrics server error: {e}");
                }
            });
        }

        tokio::select! {
            _ = supply_task => { log::warn!("supply poll loop exited unexpectedly"); }
            _ = rui_task => { log::warn!("RUI collection loop exited unexpectedly"); }
            _ = rpc_task => { log::warn!("RPC/admin server exited unexpectedly"); }
            _ = signal::ctrl_c() => { log::info!("shutdown signal received"); }
        }

        Ok(())
    }

    async fn supply_poll_loop(&self) {
        if self.settings.supply_poll_interval < 0 {
            return;
        }
        let mut ticker = interval(Duration::from_secs(
            self.settings.supply_poll_interval.max(1) as u64,
        ));
        loop {
            ticker.tick().await;
            self.supply_poll_tick().await;
        }
    }

    async fn rui_collect_loop(&self) {
        if self.settings.rui_collection_interval < 0 {
            return;
        }
        let mut ticker = interval(Duration::from_secs(
            self.settings.rui_collection_interval.max(1) as u64,
        ));
        loop {
            ticker.tick().await;
            self.rui_collect_tick().await;
        }
    }

    async fn supply_poll_tick(&self) {
        if self.supply_poll_running.swap(true, Ordering::SeqCst) {
            log::debug!("supply poll tick already running, skipping this trigger");
            return;
        }
        if let Err(e) = self.supply_poll_tick_inner().await {
            log::error!("supply poll tick failed: {e}");
        }
        self.supply_poll_running.store(false, Ordering::SeqCst);
    }

    /// Casts this host's own supply to every live peer not yet known
    /// locally; the remote agent's `receive_host_supply` handler casts
    /// its own supply straight back, so one missing side is enough to
    /// converge both directions.
    async fn supply_poll_tick_inner(&self) -> Result<()> {
        let missing = {
            let mut supply = self.supply.lock().await;
            supply.missing_hosts()
        };
        if missing.is_empty() {
            return Ok(());
        }
        let local_json = {
            let supply = self.supply.lock().await;
            supply.local_supply().to_json()?
        };
        let casts = missing.into_iter().filter_map(|host| {
            match self.settings.peers.get(&host) {
                Some(base_url) => {
                    let base_url = base_url.clone();
                    let json = local_json.clone();
                    Some(async move {
                        self.bus.cast_receive_host_supply(&host, &base_url, json).await;
                    })
                }
                None => {
                    log::warn!("live member {host} has no configured peer URL, cannot poll");
                    None
                }
            }
        });
        futures::future::join_all(casts).await;
        Ok(())
    }

    async fn rui_collect_tick(&self) {
        if self.rui_collect_running.swap(true, Ordering::SeqCst) {
            log::debug!("RUI collection tick already running, skipping this trigger");
            return;
        }
        if let Err(e) = self.rui_collect_tick_inner().await {
            log::error!("RUI collection tick failed: {e}");
        }
        self.rui_collect_running.store(false, Ordering::SeqCst);
    }

    async fn rui_collect_tick_inner(&self) -> Result<()> {
        let ready = {
            let mut supply = self.supply.lock().await;
            supply.ready()
        };
        if let Some(prom) = &self.prom {
            prom.record_ready(&self.host, ready);
        }
        if !ready {
            log::debug!("supply not yet converged, skipping RUI collection");
            return Ok(());
        }

        let now = Instant::now();
        let raw_delta_t = {
            let mut last_tick = self.last_rui_tick.lock().await;
            let elapsed = last_tick.map(|prev| now.duration_since(prev).as_secs_f64());
            *last_tick = Some(now);
            elapsed
        };

        let (cloud_supply, local_supply, overcommitment) = {
            let mut supply = self.supply.lock().await;
            let effective_interval = match raw_delta_t {
                Some(dt) => dt,
                None => {
                    let boottime = supply.local_supply().host_boottime;
                    match boottime {
                        Some(bt) => (Utc::now() - bt).num_milliseconds() as f64 / 1000.0,
                        None => 0.0,
                    }
                }
            };
            (
                supply.cloud_supply(effective_interval),
                supply.host_supply(effective_interval),
                supply.overcommitment(),
            )
        };

        let (demands, endowments) = {
            let mut rui = self.rui.lock().await;
            rui.tick(
                self.probe.as_ref(),
                &local_supply,
                raw_delta_t,
                self.stats.as_deref(),
            )
            .await?
        };

        if demands.is_empty() || endowments.is_empty() || raw_delta_t.is_none() {
            return Ok(());
        }

        // `userCount()` must reflect unique tenants across the whole
        // cloud (spec.md §4.2), not just the VMs this host happens to
        // run. The gossip topology has no cross-host instance index, so
        // we fold in every peer's last-reported `user_id`s via the
        // `HeavinessExchange` queues already fed by `receive_heavinesses`.
        let known_peer_user_ids = self.exchange.lock().await.known_user_ids();
        let user_ids = Self::aggregate_user_ids(&endowments, known_peer_user_ids);
        let user_count = {
            let supply = self.supply.lock().await;
            supply.user_count_from(&user_ids).max(1)
        };
        if let Some(prom) = &self.prom {
            prom.record_user_count(&self.host, user_count);
        }

        let quota = cloud_supply.clone() / (user_count as f64);
        *self.fairness_quota.lock().await = quota;

        let inflated_supply = cloud_supply * overcommitment;
        let metric_result = {
            let registry = self.metrics_registry.lock().await;
            registry
                .active()
                .map(&inflated_supply, &demands, &endowments, user_count)?
        };
        *self.global_norm.lock().await = metric_result.global_norm;
        if let Some(prom) = &self.prom {
            prom.record_global_norm(&metric_result.global_norm);
            for (instance, entry) in &metric_result.entries {
                prom.record_heaviness(instance, entry.heaviness);
            }
        }

        let casts = self.settings.peers.iter().map(|(host, base_url)| {
            let mut outbound = metric_result.clone();
            outbound.compute_host = self.host.clone();
            async move {
                self.bus.cast_receive_heavinesses(host, base_url, outbound).await;
            }
        });
        futures::future::join_all(casts).await;
        self.receive_heavinesses(metric_result).await?;

        Ok(())
    }

    /// Called both from a remote RPC and directly after a local metric
    /// evaluation: enqueues the reporting host's contribution and, once
    /// every live member has reported for this round, runs a
    /// reallocation.
    pub async fn receive_heavinesses(&self, mut result: crate::metrics::MetricResult) -> Result<()> {
        let compute_host = result.compute_host.clone();
        let entries = std::mem::take(&mut result.entries);

        let round = {
            let live = self.membership.live_members();
            let mut exchange = self.exchange.lock().await;
            exchange.enqueue(compute_host, entries);
            if !exchange.all_collected(&live) {
                return Ok(());
            }
            exchange.pop_round()
        };

        let (local_endowments, local_ips) = {
            let rui = self.rui.lock().await;
            (rui.snapshot_endowments(), rui.local_ips())
        };

        self.allocator
            .reallocate(round, &self.host, &local_endowments, &local_ips)
            .await?;

        Ok(())
    }

    pub async fn set_metric(&self, name: &str) -> String {
        let mut registry = self.metrics_registry.lock().await;
        registry.set_active(name)
    }

    pub async fn list_metrics(&self) -> Vec<(String, String)> {
        self.metrics_registry.lock().await.list()
    }

    /// The per-user fair share last computed, exposed for diagnostics.
    pub async fn fairness_quota(&self) -> ResourceVector {
        self.fairness_quota.lock().await.clone()
    }

    /// Dispatches `set-metric` to `host`: applies locally if `host` is
    /// this agent, otherwise makes a blocking RPC call to the peer
    /// (unlike the fire-and-forget casts, this one needs a reply).
    pub async fn dispatch_set_metric(&self, host: &str, metric_name: &str) -> String {
        if host == self.host {
            return self.set_metric(metric_name).await;
        }
        let Some(base_url) = self.settings.peers.get(host) else {
            return "Metric not found on compute host.".to_string();
        };
        let url = format!(
            "{}/rpc/set_metric",
            base_url.trim_end_matches('/')
        );
        let client = reqwest::Client::new();
        match client
            .post(&url)
            .json(&bus::SetMetricPayload {
                metric_name: metric_name.to_string(),
            })
            .send()
            .await
        {
            Ok(resp) => match resp.json::<bus::SetMetricReply>().await {
                Ok(reply) => reply.status,
                Err(e) => format!("error decoding reply from {host}: {e}"),
            },
            Err(e) => format!("error contacting {host}: {e}"),
        }
    }

    /// Merges a peer's (or our own, echoed) supply into the registry
    /// and unconditionally casts our own supply back to the sender
    /// named in the payload.
    pub async fn receive_host_supply(&self, json_supply: &str) -> Result<()> {
        let incoming = HostSupply::from_json(json_supply)?;
        let sender = incoming.compute_host.clone();
        log::debug!("received host supply from {sender}");

        {
            let mut supply = self.supply.lock().await;
            supply.add(incoming);
        }

        if sender != self.host {
            if let Some(base_url) = self.settings.peers.get(&sender) {
                let local_json = {
                    let supply = self.supply.lock().await;
                    supply.local_supply().to_json()?
                };
                self.bus
                    .cast_receive_host_supply(&sender, base_url, local_json)
                    .await;
            }
        }

        Ok(())
    }

    /// Unions this tick's local endowments' `user_id`s with the
    /// `user_id`s carried by every peer's last-reported heaviness
    /// entries, so `userCount()` reflects the whole cloud rather than
    /// just the VMs this host happens to run (spec.md §4.2).
    fn aggregate_user_ids(
        local_endowments: &HashMap<String, ResourceVector>,
        known_peer_user_ids: HashSet<String>,
    ) -> Vec<String> {
        let mut ids: Vec<String> = local_endowments
            .values()
            .filter_map(|v| v.user_id.clone())
            .collect();
        ids.extend(known_peer_user_ids);
        ids
    }
}

async fn serve_metrics(metrics: Arc<FairnessMetrics>, bind: SocketAddr) -> Result<()> {
    use axum::routing::get;
    use tokio::net::TcpListener;

    let app = axum::Router::new()
        .route("/metrics", get(crate::metrics_export::metrics_handler))
        .with_state(metrics);

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind metrics server to {bind}"))?;
    log::info!("metrics server listening on {bind}");
    axum::serve(listener, app)
        .await
        .context("metrics server error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::StaticMembershipOracle;
    use crate::metrics::VmMetricEntry;
    use crate::probe::NullHypervisorProbe;

    /// No-op transport for tests: every cast is dropped, matching the
    /// real `HttpMessageBus`'s "a dropped cast is tolerated" contract.
    struct NullMessageBus;

    #[async_trait::async_trait]
    impl MessageBus for NullMessageBus {
        async fn cast_receive_host_supply(&self, _host: &str, _base_url: &str, _json_supply: String) {}
        async fn cast_receive_heavinesses(
            &self,
            _host: &str,
            _base_url: &str,
            _result: crate::metrics::MetricResult,
        ) {
        }
    }

    fn test_settings(peers: Vec<&str>) -> FairnessSettings {
        FairnessSettings {
            host: "local".to_string(),
            rpc_bind: "127.0.0.1:0".to_string(),
            peers: peers
                .into_iter()
                .map(|p| (p.to_string(), format!("http://{p}")))
                .collect(),
            active_metric: "GreedinessMetric".to_string(),
            rui_collection_interval: 10,
            supply_poll_interval: 10,
            resource_decay_factor: 0.5,
            rui_stats_enabled: false,
            rui_stats_path: "/dev/null".to_string(),
            max_network_throughput: 1000,
            cpu_allocation_ratio: 1.0,
            ram_allocation_ratio: 1.0,
            disk_allocation_ratio: 1.0,
            network_interface: "eth0".to_string(),
            setpoint_scale: 1.0,
            metrics: crate::config::MetricsConfig::default(),
            heaviness_queue_depth: 16,
        }
    }

    fn test_local_supply() -> HostSupply {
        HostSupply {
            compute_host: "local".to_string(),
            host_boottime: None,
            cpu_cores_weighted: 1.0,
            disk_speeds: 0.0,
            network_throughput: 0.0,
            memory_used: None,
            supply_created_at: 1.0,
        }
    }

    fn test_agent(members: Vec<&str>) -> FairnessAgent {
        let members: Vec<String> = members.into_iter().map(String::from).collect();
        let peer_names: Vec<&str> = members.iter().filter(|m| *m != "local").map(String::as_str).collect();
        let settings = test_settings(peer_names);
        let membership = Arc::new(StaticMembershipOracle::new(members));
        FairnessAgent::new(
            settings,
            test_local_supply(),
            membership,
            Arc::new(NullHypervisorProbe),
            Arc::new(crate::enforcer::NullEnforcer),
            Arc::new(NullMessageBus),
            None,
            None,
        )
    }

    fn vm_entry(user_id: &str) -> VmMetricEntry {
        VmMetricEntry {
            compute_host: Some("peer".to_string()),
            user_id: Some(user_id.to_string()),
            normalized_endowment: 1.0,
            heaviness: 0.0,
        }
    }

    #[test]
    fn aggregate_user_ids_unions_local_and_peer_reported_tenants() {
        let local = HashMap::from([(
            "vm-local".to_string(),
            ResourceVector::zero().with_tags(None, Some("tenant-a".to_string()), None),
        )]);
        let peer_ids: HashSet<String> = ["tenant-b".to_string()].into_iter().collect();

        let ids = FairnessAgent::aggregate_user_ids(&local, peer_ids);

        assert!(ids.contains(&"tenant-a".to_string()));
        assert!(ids.contains(&"tenant-b".to_string()));
    }

    #[tokio::test]
    async fn user_count_reflects_tenants_known_only_through_a_peers_heaviness_report() {
        // Two hosts, disjoint local VM sets, same two tenants: a host
        // that only ever saw its own tenant must still count both once
        // the other host's heaviness report has arrived.
        let agent = test_agent(vec!["local", "peer-1"]);
        agent
            .exchange
            .lock()
            .await
            .enqueue(
                "peer-1".to_string(),
                HashMap::from([("vm-on-peer".to_string(), vm_entry("tenant-b"))]),
            );

        let local_endowments = HashMap::from([(
            "vm-local".to_string(),
            ResourceVector::zero().with_tags(None, Some("tenant-a".to_string()), None),
        )]);
        let known_peer_user_ids = agent.exchange.lock().await.known_user_ids();
        let user_ids = FairnessAgent::aggregate_user_ids(&local_endowments, known_peer_user_ids);
        let user_count = agent.supply.lock().await.user_count_from(&user_ids);

        assert_eq!(user_count, 2);
    }

    #[tokio::test]
    async fn rui_collect_tick_short_circuits_while_supply_is_not_yet_ready() {
        // "peer-1" is a live member but its supply was never received,
        // so the registry is not ready and the tick must return
        // without touching `last_rui_tick` or `fairness_quota`.
        let agent = test_agent(vec!["local", "peer-1"]);

        agent.rui_collect_tick_inner().await.unwrap();

        assert!(agent.last_rui_tick.lock().await.is_none());
        assert_eq!(agent.fairness_quota().await, ResourceVector::zero());
    }
}
