//! `HostSupply` (per-host static capacity, gossiped verbatim between
//! peers) and `CloudSupplyRegistry` (the local view of every live
//! host's supply, plus the readiness gate built on top of it).

use crate::membership::MembershipOracle;
use crate::vector::ResourceVector;
use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// `DateTime<Utc>` serialized in the micro-precision, timezone-less
/// textual form the wire format names (`YYYY-MM-DDTHH:MM:SS.000000`),
/// so a Rust agent and any other-language peer agree byte-for-byte on
/// what a boot time looks like on the wire.
mod boottime {
    use super::*;
    use serde::{de::Error as DeError, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => serializer.serialize_str(&dt.format(FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        // Accept our own micro-precision form as well as a plain RFC3339
        // stamp, since a boot time may arrive either way.
        if let Ok(naive) = NaiveDateTime::parse_from_str(&raw, FORMAT) {
            return Ok(Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)));
        }
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(DeError::custom)
    }
}

/// Per-host static capacity record. Constant over the agent's
/// lifetime once probed (or received from a peer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSupply {
    pub compute_host: String,
    #[serde(with = "boottime")]
    pub host_boottime: Option<DateTime<Utc>>,
    pub cpu_cores_weighted: f64,
    pub disk_speeds: f64,
    pub network_throughput: f64,
    pub memory_used: Option<f64>,
    pub supply_created_at: f64,
}

impl HostSupply {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Probes this host's own static capacity, the way
    /// `cloud_supply.py`'s `_calculate_local_host_supply` does: CPU
    /// weight is core count times average `/proc/cpuinfo` BogoMIPS,
    /// disk speed is summed `hdparm -t` over every `lsblk` disk,
    /// network throughput comes from configuration (the unscientific
    /// BogoMIPS-style self-estimate `cloud_supply.py` used for CPU
    /// doesn't have a network analogue), memory is `free -k`'s total,
    /// and boot time is read out of `/proc/stat`.
    pub async fn probe_local(host: &str, max_network_throughput_mbit: u64) -> Result<Self> {
        let bogo_mips = Self::probe_bogo_mips().await;
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;

        Ok(Self {
            compute_host: host.to_string(),
            host_boottime: Self::probe_boottime().await,
            cpu_cores_weighted: cores * bogo_mips,
            disk_speeds: Self::probe_disk_speeds().await,
            network_throughput: max_network_throughput_mbit as f64 * 125_000.0,
            memory_used: Self::probe_installed_memory().await,
            supply_created_at: Utc::now().timestamp() as f64,
        })
    }

    async fn probe_bogo_mips() -> f64 {
        let output = tokio::process::Command::new("cat")
            .arg("/proc/cpuinfo")
            .output()
            .await;
        let Ok(output) = output else { return 1.0 };
        let text = String::from_utf8_lossy(&output.stdout);
        let values: Vec<f64> = text
            .lines()
            .filter_map(|line| line.strip_prefix("bogomips"))
            .filter_map(|rest| rest.split(':').nth(1))
            .filter_map(|v| v.trim().parse().ok())
            .collect();
        if values.is_empty() {
            1.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }

    async fn probe_boottime() -> Option<DateTime<Utc>> {
        let output = tokio::process::Command::new("cat")
            .arg("/proc/stat")
            .output()
            .await
            .ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        let btime = text
            .lines()
            .find_map(|line| line.strip_prefix("btime "))?
            .trim()
            .parse::<i64>()
            .ok()?;
        DateTime::from_timestamp(btime, 0)
    }

    async fn probe_disk_speeds() -> f64 {
        let output = tokio::process::Command::new("lsblk")
            .args(["-io", "KNAME,TYPE"])
            .output()
            .await;
        let Ok(output) = output else { return 0.0 };
        let text = String::from_utf8_lossy(&output.stdout);

        let disks: Vec<&str> = text
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let name = parts.next()?;
                let kind = parts.last()?;
                (kind == "disk").then_some(name)
            })
            .collect();

        let mut total = 0.0;
        for disk in disks {
            let output = tokio::process::Command::new("hdparm")
                .args(["-t", &format!("/dev/{disk}")])
                .output()
                .await;
            let Ok(output) = output else { continue };
            let text = String::from_utf8_lossy(&output.stdout);
            if let Some(line) = text.lines().nth(2) {
                if let Some(mbs) = line.split_whitespace().rev().nth(1) {
                    if let Ok(mbs) = mbs.parse::<f64>() {
                        total += mbs * 1_000_000.0;
                    }
                }
            }
        }
        total
    }

    async fn probe_installed_memory() -> Option<f64> {
        let output = tokio::process::Command::new("free")
            .arg("-k")
            .output()
            .await
            .ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        text.lines()
            .nth(1)?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    }

    /// This host's capacity vector for a given interval: cpu is
    /// weighted cores times interval, disk/network are per-second
    /// rates times interval, memory is the installed total regardless
    /// of interval.
    pub fn to_vector(&self, interval_seconds: f64) -> ResourceVector {
        ResourceVector {
            cpu_time: self.cpu_cores_weighted * interval_seconds,
            disk_bytes_read: self.disk_speeds * interval_seconds,
            disk_bytes_written: self.disk_speeds * interval_seconds,
            net_bytes_rx: self.network_throughput * interval_seconds,
            net_bytes_tx: self.network_throughput * interval_seconds,
            memory_used: self.memory_used.unwrap_or(0.0),
            compute_host: Some(self.compute_host.clone()),
            user_id: None,
            instance_name: None,
        }
    }
}

/// Owns the local capacity record, collects peer capacities, and
/// tracks readiness: every live member must have a known supply before
/// a reallocation round is allowed to proceed.
pub struct CloudSupplyRegistry {
    local: HostSupply,
    remote: HashMap<String, HostSupply>,
    membership: Arc<dyn MembershipOracle>,
    overcommitment: ResourceVector,
}

impl CloudSupplyRegistry {
    pub fn new(
        local: HostSupply,
        membership: Arc<dyn MembershipOracle>,
        cpu_alloc: f64,
        ram_alloc: f64,
        disk_alloc: f64,
    ) -> Self {
        Self {
            local,
            remote: HashMap::new(),
            membership,
            overcommitment: ResourceVector {
                cpu_time: cpu_alloc,
                disk_bytes_read: disk_alloc,
                disk_bytes_written: disk_alloc,
                net_bytes_rx: 1.0,
                net_bytes_tx: 1.0,
                memory_used: ram_alloc,
                ..Default::default()
            },
        }
    }

    pub fn local_supply(&self) -> &HostSupply {
        &self.local
    }

    /// Inserts or replaces a peer's supply entry, keyed on
    /// `supply_created_at` monotonicity: a newer timestamp always
    /// wins, an older one is silently dropped. Non-member entries are
    /// purged as part of every mutation.
    pub fn add(&mut self, supply: HostSupply) {
        if supply.compute_host == self.local.compute_host {
            return;
        }
        match self.remote.get(&supply.compute_host) {
            Some(existing) if existing.supply_created_at >= supply.supply_created_at => {
                log::debug!(
                    "dropping stale supply for host {} (existing={}, incoming={})",
                    supply.compute_host,
                    existing.supply_created_at,
                    supply.supply_created_at
                );
            }
            _ => {
                log::debug!("updated host supply for host {}", supply.compute_host);
                self.remote.insert(supply.compute_host.clone(), supply);
            }
        }
        self.purge_non_members();
    }

    fn purge_non_members(&mut self) {
        let live = self.membership.live_members();
        self.remote.retain(|host, _| live.contains(host));
    }

    /// Live members whose supply is not yet known locally.
    pub fn missing_hosts(&mut self) -> Vec<String> {
        self.purge_non_members();
        self.membership
            .live_members()
            .into_iter()
            .filter(|h| *h != self.local.compute_host && !self.remote.contains_key(h))
            .collect()
    }

    /// `true` iff every live member (other than the local host) has a
    /// known supply entry.
    pub fn ready(&mut self) -> bool {
        self.missing_hosts().is_empty()
    }

    /// Sum, over all live remote supplies, of `capacity * interval` in
    /// each dimension.
    pub fn cloud_supply(&mut self, interval_seconds: f64) -> ResourceVector {
        self.purge_non_members();
        let mut total = ResourceVector::zero();
        for supply in self.remote.values() {
            total = total + supply.to_vector(interval_seconds);
        }
        total.compute_host = Some(self.local.compute_host.clone());
        total
    }

    /// The local host's own capacity vector for the given interval.
    pub fn host_supply(&self, interval_seconds: f64) -> ResourceVector {
        self.local.to_vector(interval_seconds)
    }

    pub fn overcommitment(&self) -> ResourceVector {
        self.overcommitment.clone()
    }

    /// Unique user IDs across all VMs on all live members. Resolved
    /// from the last-known heaviness reports rather than a direct
    /// membership/instance-index query, since each per-VM heaviness
    /// entry already carries `user_id`.
    pub fn user_count_from(&self, known_user_ids: &[String]) -> usize {
        use std::collections::HashSet;
        known_user_ids.iter().collect::<HashSet<_>>().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::StaticMembershipOracle;

    fn make_supply(host: &str, created_at: f64) -> HostSupply {
        HostSupply {
            compute_host: host.to_string(),
            host_boottime: Some(DateTime::<Utc>::from_naive_utc_and_offset(
                NaiveDateTime::parse_from_str("2026-01-01T00:00:00.000000", "%Y-%m-%dT%H:%M:%S%.6f")
                    .unwrap(),
                Utc,
            )),
            cpu_cores_weighted: 6000.0,
            disk_speeds: 1_000_000.0,
            network_throughput: 125_000_000.0,
            memory_used: Some(4_000_000.0),
            supply_created_at: created_at,
        }
    }

    #[test]
    fn host_supply_json_roundtrip() {
        let supply = make_supply("host-a", 100.0);
        let json = supply.to_json().unwrap();
        let back = HostSupply::from_json(&json).unwrap();
        assert_eq!(supply, back);
    }

    #[test]
    fn boottime_coerces_textual_stamp() {
        let json = r#"{
            "compute_host": "host-b",
            "host_boottime": "2026-02-03T04:05:06.000000",
            "cpu_cores_weighted": 1.0,
            "disk_speeds": 0.0,
            "network_throughput": 0.0,
            "memory_used": null,
            "supply_created_at": 1.0
        }"#;
        let supply = HostSupply::from_json(json).unwrap();
        assert!(supply.host_boottime.is_some());
    }

    #[test]
    fn newer_timestamp_overrides_older_entry() {
        let oracle = Arc::new(StaticMembershipOracle::new(vec![
            "local".into(),
            "h".into(),
        ]));
        let local = make_supply("local", 1.0);
        let mut registry = CloudSupplyRegistry::new(local, oracle, 1.0, 1.0, 1.0);

        registry.add(make_supply("h", 100.0));
        registry.add(make_supply("h", 99.0));

        assert_eq!(registry.remote.get("h").unwrap().supply_created_at, 100.0);
    }

    #[test]
    fn readiness_requires_every_live_member_to_report() {
        let oracle = Arc::new(StaticMembershipOracle::new(vec![
            "local".into(),
            "a".into(),
            "b".into(),
            "c".into(),
        ]));
        let local = make_supply("local", 1.0);
        let mut registry = CloudSupplyRegistry::new(local, oracle, 1.0, 1.0, 1.0);

        registry.add(make_supply("a", 1.0));
        registry.add(make_supply("b", 1.0));
        assert!(!registry.ready());
        assert_eq!(registry.missing_hosts(), vec!["c".to_string()]);

        registry.add(make_supply("c", 1.0));
        assert!(registry.ready());
    }

    #[test]
    fn non_member_supply_purged() {
        let oracle = Arc::new(StaticMembershipOracle::new(vec!["local".into(), "a".into()]));
        let local = make_supply("local", 1.0);
        let mut registry = CloudSupplyRegistry::new(local, oracle.clone(), 1.0, 1.0, 1.0);

        registry.add(make_supply("a", 1.0));
        registry.add(make_supply("departed", 1.0));
        assert!(registry.ready());
        assert!(registry.cloud_supply(1.0).cpu_time > 0.0);

        oracle.set_members(vec!["local".into()]);
        assert!(registry.ready());
        assert_eq!(registry.cloud_supply(1.0).cpu_time, 0.0);
    }

    #[test]
    fn zero_cpu_cores_yields_sentinel_without_panic() {
        let oracle = Arc::new(StaticMembershipOracle::new(vec!["local".into()]));
        let mut local = make_supply("local", 1.0);
        local.cpu_cores_weighted = 0.0;
        let registry = CloudSupplyRegistry::new(local, oracle, 1.0, 1.0, 1.0);
        let supply = registry.host_supply(10.0);
        assert_eq!(supply.cpu_time, 0.0);
    }
}
