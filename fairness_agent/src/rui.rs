//! Per-tick resource usage information collection: samples every
//! active local VM, turns cumulative counters into an EWMA-smoothed
//! interval demand, and derives each VM's endowment from local supply.

use crate::probe::HypervisorProbe;
use crate::stats::RuiStatsSink;
use crate::vector::ResourceVector;
use anyhow::Result;
use std::collections::{HashMap, HashSet};

/// Holds the two demand maps plus the endowment map `manager.py`
/// keeps as three separate dicts on `RUICollectionHelper`.
pub struct RUICollector {
    decay_factor: f64,
    full_demand: HashMap<String, ResourceVector>,
    interval_demand: HashMap<String, Option<ResourceVector>>,
    endowment: HashMap<String, ResourceVector>,
    ip: HashMap<String, String>,
}

impl RUICollector {
    pub fn new(decay_factor: f64) -> Self {
        Self {
            decay_factor,
            full_demand: HashMap::new(),
            interval_demand: HashMap::new(),
            endowment: HashMap::new(),
            ip: HashMap::new(),
        }
    }

    fn purge_departed(&mut self, live_active: &HashSet<String>) {
        self.full_demand.retain(|k, _| live_active.contains(k));
        self.interval_demand.retain(|k, _| live_active.contains(k));
        self.endowment.retain(|k, _| live_active.contains(k));
        self.ip.retain(|k, _| live_active.contains(k));
    }

    /// Source IPs of locally known active instances, as last seen by
    /// `tick`. Used by `ResourceAllocator` to classify HFSC filters
    /// (see `enforcer.rs`), since per-VM IPs never cross the wire.
    pub fn local_ips(&self) -> HashMap<String, String> {
        self.ip.clone()
    }

    /// The endowment computed at the last successful `tick`, keyed by
    /// instance name. Read by `FairnessAgent` when a reallocation round
    /// completes, since a round can be triggered by an inbound RPC
    /// between two ticks.
    pub fn snapshot_endowments(&self) -> HashMap<String, ResourceVector> {
        self.endowment.clone()
    }

    /// Runs one collection tick. `delta_t` is `None` on the very first
    /// tick the agent ever runs (host-uptime substitution happens one
    /// level up, in `agent.rs`, since it needs `HostSupply.host_boottime`).
    pub async fn tick(
        &mut self,
        probe: &dyn HypervisorProbe,
        local_supply: &ResourceVector,
        delta_t: Option<f64>,
        stats: Option<&dyn RuiStatsSink>,
    ) -> Result<(HashMap<String, ResourceVector>, HashMap<String, ResourceVector>)> {
        let instances = probe.list_instances().await?;
        let active: Vec<_> = instances.into_iter().filter(|i| i.active).collect();
        let live_active: HashSet<String> = active.iter().map(|i| i.name.clone()).collect();

        let active_count = active.len();
        let total_vcpus: u32 = active.iter().map(|i| i.vcpus).sum();

        for instance in &active {
            let full_now = probe
                .sample(instance)
                .await?
                .with_tags(None, Some(instance.user_id.clone()), Some(instance.name.clone()));

            match self.full_demand.get(&instance.name) {
                Some(last_full) => {
                    let new = full_now.clone() - last_full.clone();
                    let updated = match self.interval_demand.get(&instance.name) {
                        Some(Some(old)) => {
                            old.clone() * (1.0 - self.decay_factor) + new.clone() * self.decay_factor
                        }
                        _ => new.clone(),
                    };
                    if let (Some(sink), Some(dt)) = (stats, delta_t) {
                        sink.add_rui(&instance.name, &new, dt);
                    }
                    self.interval_demand.insert(instance.name.clone(), Some(updated));
                }
                None => {
                    let initial = delta_t.map(|_| full_now.clone());
                    self.interval_demand.insert(instance.name.clone(), initial);
                }
            }
            self.full_demand.insert(instance.name.clone(), full_now);

            if active_count > 0 && total_vcpus > 0 {
                let mut endowment = local_supply.clone() / (active_count as f64);
                endowment.cpu_time =
                    local_supply.cpu_time / (total_vcpus as f64) * (instance.vcpus as f64);
                endowment.memory_used = instance.max_memory_kb;
                let endowment = endowment.with_tags(
                    None,
                    Some(instance.user_id.clone()),
                    Some(instance.name.clone()),
                );
                self.endowment.insert(instance.name.clone(), endowment);
            }

            if let Some(ip) = &instance.ip_address {
                self.ip.insert(instance.name.clone(), ip.clone());
            }
        }

        self.purge_departed(&live_active);

        let demands = if !self.interval_demand.is_empty()
            && self.interval_demand.values().all(Option::is_some)
        {
            self.interval_demand
                .iter()
                .map(|(k, v)| (k.clone(), v.clone().expect("checked all() above")))
                .collect()
        } else {
            self.full_demand.clone()
        };

        Ok((demands, self.endowment.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::InstanceInfo;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeProbe {
        instances: Vec<InstanceInfo>,
        samples: Mutex<HashMap<String, Vec<ResourceVector>>>,
    }

    #[async_trait]
    impl HypervisorProbe for FakeProbe {
        async fn list_instances(&self) -> Result<Vec<InstanceInfo>> {
            Ok(self.instances.clone())
        }

        async fn sample(&self, instance: &InstanceInfo) -> Result<ResourceVector> {
            let mut samples = self.samples.lock().unwrap();
            let queue = samples.entry(instance.name.clone()).or_default();
            Ok(queue.remove(0))
        }
    }

    fn instance(name: &str) -> InstanceInfo {
        InstanceInfo {
            name: name.to_string(),
            user_id: "user-1".to_string(),
            vcpus: 2,
            max_memory_kb: 1024.0,
            active: true,
            ip_address: None,
        }
    }

    #[tokio::test]
    async fn first_tick_with_no_prior_interval_yields_null_interval_demand() {
        let probe = FakeProbe {
            instances: vec![instance("vm1")],
            samples: Mutex::new(HashMap::from([(
                "vm1".to_string(),
                vec![ResourceVector::splat(10.0)],
            )])),
        };
        let mut collector = RUICollector::new(0.5);
        let supply = ResourceVector::splat(100.0);

        let (demands, endowments) = collector.tick(&probe, &supply, None, None).await.unwrap();

        // No interval has ever elapsed, so the demand map falls back to
        // full (absolute) counters rather than an interval delta.
        assert_eq!(demands["vm1"].cpu_time, 10.0);
        assert_eq!(endowments["vm1"].memory_used, 1024.0);
    }

    #[tokio::test]
    async fn second_tick_computes_decayed_interval_delta() {
        let probe = FakeProbe {
            instances: vec![instance("vm1")],
            samples: Mutex::new(HashMap::from([(
                "vm1".to_string(),
                vec![ResourceVector::splat(10.0), ResourceVector::splat(30.0)],
            )])),
        };
        let mut collector = RUICollector::new(0.5);
        let supply = ResourceVector::splat(100.0);

        collector.tick(&probe, &supply, None, None).await.unwrap();
        let (demands, _) = collector
            .tick(&probe, &supply, Some(10.0), None)
            .await
            .unwrap();

        // interval_demand was None after tick 1 (delta_t == None), so
        // tick 2's raw delta (20) replaces it outright rather than decaying.
        assert_eq!(demands["vm1"].cpu_time, 20.0);
    }

    #[tokio::test]
    async fn departed_instance_is_purged() {
        let probe = FakeProbe {
            instances: vec![instance("vm1")],
            samples: Mutex::new(HashMap::from([(
                "vm1".to_string(),
                vec![ResourceVector::splat(10.0)],
            )])),
        };
        let mut collector = RUICollector::new(0.5);
        let supply = ResourceVector::splat(100.0);
        collector.tick(&probe, &supply, None, None).await.unwrap();

        let empty_probe = FakeProbe {
            instances: vec![],
            samples: Mutex::new(HashMap::new()),
        };
        let (demands, endowments) = collector
            .tick(&empty_probe, &supply, Some(10.0), None)
            .await
            .unwrap();
        assert!(demands.is_empty());
        assert!(endowments.is_empty());
    }

    #[tokio::test]
    async fn endowment_cpu_time_weighted_by_vcpus() {
        let mut vm_a = instance("vm-a");
        vm_a.vcpus = 1;
        let mut vm_b = instance("vm-b");
        vm_b.vcpus = 3;

        let probe = FakeProbe {
            instances: vec![vm_a, vm_b],
            samples: Mutex::new(HashMap::from([
                ("vm-a".to_string(), vec![ResourceVector::splat(0.0)]),
                ("vm-b".to_string(), vec![ResourceVector::splat(0.0)]),
            ])),
        };
        let mut collector = RUICollector::new(0.5);
        let supply = ResourceVector {
            cpu_time: 400.0,
            ..ResourceVector::splat(100.0)
        };

        let (_, endowments) = collector.tick(&probe, &supply, None, None).await.unwrap();
        assert_eq!(endowments["vm-a"].cpu_time, 100.0);
        assert_eq!(endowments["vm-b"].cpu_time, 300.0);
    }
}
