//! Turns one round of collected heavinesses into per-local-VM
//! controller setpoints and pushes them to the `Enforcer`. Mutual
//! exclusion of `reallocate()` is enforced with an `AtomicBool` guard,
//! the same single-shot pattern used for the periodic tasks in
//! `agent.rs`.

use crate::enforcer::{Enforcer, NetworkPriority};
use crate::exchange::HeavinessMap;
use crate::stats::RuiStatsSink;
use crate::vector::ResourceVector;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One VM's derived controller setpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct VmSetpoint {
    pub instance_name: String,
    pub cpu_shares: u32,
    pub memory_soft_limit_bytes: u64,
    pub disk_weight: u32,
    pub net_priority: u32,
}

const MIN_CPU_SHARES: f64 = 16.0;
const MAX_CPU_SHARES: f64 = 4096.0;
const CPU_SHARES_BASELINE: f64 = 1024.0;
const MIN_MEMORY_SOFT_LIMIT_BYTES: u64 = 64 * 1024 * 1024;
const MIN_DISK_WEIGHT: f64 = 10.0;
const MAX_DISK_WEIGHT: f64 = 1000.0;
const DISK_WEIGHT_BASELINE: f64 = 1000.0;
const MIN_NET_PRIORITY: f64 = 1.0;
const MAX_NET_PRIORITY: f64 = 100.0;
const NET_PRIORITY_BASELINE: f64 = 100.0;

/// Computes the four setpoints for one VM from its heaviness and
/// normalized endowment (received from the heaviness broadcast) plus
/// its raw memory endowment (known only locally). Each setpoint is
/// monotone non-increasing in heaviness and clamped to the
/// kernel-accepted range for that control (see DESIGN.md).
pub fn derive_setpoint(
    instance_name: &str,
    heaviness: f64,
    normalized_endowment: f64,
    local_memory_endowment_kb: f64,
    setpoint_scale: f64,
) -> VmSetpoint {
    let heaviness_factor = heaviness.max(0.0) + 1.0;
    let endowment_factor = 1.0 + normalized_endowment;

    let cpu_shares = (CPU_SHARES_BASELINE * endowment_factor / heaviness_factor * setpoint_scale)
        .round()
        .clamp(MIN_CPU_SHARES, MAX_CPU_SHARES) as u32;

    let memory_soft_limit_bytes = ((local_memory_endowment_kb * 1024.0 / heaviness_factor
        * setpoint_scale)
        .floor() as u64)
        .max(MIN_MEMORY_SOFT_LIMIT_BYTES);

    let disk_weight = (DISK_WEIGHT_BASELINE / heaviness_factor * setpoint_scale)
        .round()
        .clamp(MIN_DISK_WEIGHT, MAX_DISK_WEIGHT) as u32;

    let net_priority = (NET_PRIORITY_BASELINE / heaviness_factor * setpoint_scale)
        .round()
        .clamp(MIN_NET_PRIORITY, MAX_NET_PRIORITY) as u32;

    VmSetpoint {
        instance_name: instance_name.to_string(),
        cpu_shares,
        memory_soft_limit_bytes,
        disk_weight,
        net_priority,
    }
}

pub struct ResourceAllocator {
    enforcer: Arc<dyn Enforcer>,
    stats: Option<Arc<dyn RuiStatsSink>>,
    setpoint_scale: f64,
    reallocating: AtomicBool,
}

impl ResourceAllocator {
    pub fn new(enforcer: Arc<dyn Enforcer>, stats: Option<Arc<dyn RuiStatsSink>>, setpoint_scale: f64) -> Self {
        Self {
            enforcer,
            stats,
            setpoint_scale,
            reallocating: AtomicBool::new(false),
        }
    }

    /// Tears down any qdisc left over from a previous run. Called once
    /// at startup so a stale HFSC tree from a prior crash doesn't
    /// linger; `set_network_priorities` rebuilds from scratch anyway.
    pub async fn reset_network(&self) {
        if let Err(e) = self.enforcer.reset_network_priorities().await {
            log::warn!("failed to reset network priorities at startup: {e}");
        }
    }

    /// Consumes one round of per-peer heaviness maps, pulls out the
    /// entries that belong to `local_host`, derives setpoints and
    /// pushes them to the `Enforcer`. `local_memory_endowments` and
    /// `local_rui` come from `RUICollector`, since raw per-VM memory
    /// and transfer counters never cross the wire.
    pub async fn reallocate(
        &self,
        round: HashMap<String, HeavinessMap>,
        local_host: &str,
        local_memory_endowments: &HashMap<String, ResourceVector>,
        local_ips: &HashMap<String, String>,
    ) -> anyhow::Result<Vec<VmSetpoint>> {
        if self
            .reallocating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("reallocation already in progress, skipping this trigger");
            return Ok(Vec::new());
        }

        let result = self
            .reallocate_inner(round, local_host, local_memory_endowments, local_ips)
            .await;

        self.reallocating.store(false, Ordering::SeqCst);
        result
    }

    async fn reallocate_inner(
        &self,
        round: HashMap<String, HeavinessMap>,
        local_host: &str,
        local_memory_endowments: &HashMap<String, ResourceVector>,
        local_ips: &HashMap<String, String>,
    ) -> anyhow::Result<Vec<VmSetpoint>> {
        let mut setpoints = Vec::new();
        let mut network_priorities = HashMap::new();

        for map in round.into_values() {
            for (instance_name, entry) in map {
                if entry.compute_host.as_deref() != Some(local_host) {
                    continue;
                }
                let Some(memory_endowment) = local_memory_endowments.get(&instance_name) else {
                    continue;
                };

                let setpoint = derive_setpoint(
                    &instance_name,
                    entry.heaviness,
                    entry.normalized_endowment,
                    memory_endowment.memory_used,
                    self.setpoint_scale,
                );

                self.enforcer
                    .set_cpu_shares(&instance_name, setpoint.cpu_shares)
                    .await?;
                self.enforcer
                    .set_memory_soft_limit(&instance_name, setpoint.memory_soft_limit_bytes)
                    .await?;
                self.enforcer
                    .set_disk_weight(&instance_name, setpoint.disk_weight)
                    .await?;

                if let Some(ip) = local_ips.get(&instance_name) {
                    network_priorities.insert(
                        instance_name.clone(),
                        NetworkPriority {
                            priority: setpoint.net_priority,
                            source_ip: ip.clone(),
                        },
                    );
                }

                if let Some(stats) = &self.stats {
                    stats.add_prioritization(
                        &instance_name,
                        entry.heaviness,
                        setpoint.cpu_shares,
                        setpoint.memory_soft_limit_bytes,
                        setpoint.disk_weight,
                        setpoint.net_priority,
                    );
                }

                setpoints.push(setpoint);
            }
        }

        if !network_priorities.is_empty() {
            self.enforcer.set_network_priorities(&network_priorities).await?;
        }

        Ok(setpoints)
    }
}
