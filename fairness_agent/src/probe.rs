//! Hypervisor access, abstracted behind `HypervisorProbe` so the core
//! collection loop in `rui.rs` never depends on a concrete driver.
//! `ProcHypervisorProbe` shells out to `virsh`, in the same spirit as
//! `tc_wrapper.py`/`cloud_supply.py`'s reliance on external CLI tools
//! rather than a linked driver library.

use crate::vector::ResourceVector;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::process::Command;

/// A single VM as known to the hypervisor, independent of any
/// fairness-specific bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceInfo {
    pub name: String,
    pub user_id: String,
    pub vcpus: u32,
    pub max_memory_kb: f64,
    pub active: bool,
    pub ip_address: Option<String>,
}

#[async_trait]
pub trait HypervisorProbe: Send + Sync {
    /// Every VM currently known to the hypervisor on this host,
    /// including paused/stopped ones (callers filter on `active`).
    async fn list_instances(&self) -> Result<Vec<InstanceInfo>>;

    /// Absolute (cumulative-since-boot) resource counters for one
    /// instance. Tag fields are left unset; callers attach them.
    async fn sample(&self, instance: &InstanceInfo) -> Result<ResourceVector>;
}

/// A probe with no VMs. Used for hosts that run the fairness agent
/// without hosting any instances, and in tests.
pub struct NullHypervisorProbe;

#[async_trait]
impl HypervisorProbe for NullHypervisorProbe {
    async fn list_instances(&self) -> Result<Vec<InstanceInfo>> {
        Ok(Vec::new())
    }

    async fn sample(&self, _instance: &InstanceInfo) -> Result<ResourceVector> {
        Ok(ResourceVector::zero())
    }
}

/// Shells out to `virsh` for instance enumeration and per-VM counters.
/// `bogo_mips` is the local host's weighted CPU speed, applied to raw
/// vcpu nanosecond counters the same way `manager.py`'s
/// `_collect_rui` scales `total_cpu_time`.
pub struct ProcHypervisorProbe {
    bogo_mips: f64,
}

impl ProcHypervisorProbe {
    pub fn new(bogo_mips: f64) -> Self {
        Self { bogo_mips }
    }

    async fn run(args: &[&str]) -> Result<String> {
        let output = Command::new("virsh")
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run virsh {}", args.join(" ")))?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn parse_domstats(raw: &str) -> HashMap<String, String> {
        raw.lines()
            .filter_map(|line| line.trim().split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn field(fields: &HashMap<String, String>, key: &str) -> f64 {
        fields.get(key).and_then(|v| v.parse().ok()).unwrap_or(0.0)
    }
}

#[async_trait]
impl HypervisorProbe for ProcHypervisorProbe {
    async fn list_instances(&self) -> Result<Vec<InstanceInfo>> {
        let running = Self::run(&["list", "--name", "--state-running"]).await?;
        let paused = Self::run(&["list", "--name", "--state-paused", "--state-shutoff"]).await?;

        let mut instances = Vec::new();
        for name in running.lines().map(str::trim).filter(|l| !l.is_empty()) {
            instances.push(self.dominfo(name, true).await?);
        }
        for name in paused.lines().map(str::trim).filter(|l| !l.is_empty()) {
            instances.push(self.dominfo(name, false).await?);
        }
        Ok(instances)
    }

    async fn sample(&self, instance: &InstanceInfo) -> Result<ResourceVector> {
        let raw = Self::run(&[
            "domstats",
            &instance.name,
            "--cpu-total",
            "--interface",
            "--block",
            "--balloon",
        ])
        .await?;
        let fields = Self::parse_domstats(&raw);

        let cpu_time_ns = Self::field(&fields, "cpu.time");
        let cpu_time = cpu_time_ns / 1e9 * self.bogo_mips;

        let block_count = Self::field(&fields, "block.count") as usize;
        let mut disk_read = 0.0;
        let mut disk_written = 0.0;
        for i in 0..block_count {
            disk_read += Self::field(&fields, &format!("block.{i}.rd.bytes"));
            disk_written += Self::field(&fields, &format!("block.{i}.wr.bytes"));
        }

        let net_count = Self::field(&fields, "net.count") as usize;
        let mut net_rx = 0.0;
        let mut net_tx = 0.0;
        for i in 0..net_count {
            net_rx += Self::field(&fields, &format!("net.{i}.rx.bytes"));
            net_tx += Self::field(&fields, &format!("net.{i}.tx.bytes"));
        }

        let balloon_current = Self::field(&fields, "balloon.current");
        let memory_used = if balloon_current > 0.0 {
            balloon_current
        } else {
            instance.max_memory_kb
        }
        .min(instance.max_memory_kb);

        Ok(ResourceVector {
            cpu_time,
            disk_bytes_read: disk_read,
            disk_bytes_written: disk_written,
            net_bytes_rx: net_rx,
            net_bytes_tx: net_tx,
            memory_used,
            ..Default::default()
        })
    }
}

impl ProcHypervisorProbe {
    async fn dominfo(&self, name: &str, active: bool) -> Result<InstanceInfo> {
        let raw = Self::run(&["dominfo", name]).await.unwrap_or_default();
        let mut vcpus = 1;
        let mut max_memory_kb = 0.0;
        for line in raw.lines() {
            if let Some(value) = line.strip_prefix("CPU(s):") {
                vcpus = value.trim().parse().unwrap_or(1);
            } else if let Some(value) = line.strip_prefix("Max memory:") {
                max_memory_kb = value
                    .trim()
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.0);
            }
        }
        let metadata = Self::run(&["metadata", name, "--uri", "fairness:user-id"])
            .await
            .unwrap_or_default();
        let user_id = metadata.trim().to_string();

        let addr_output = Self::run(&["domifaddr", name]).await.unwrap_or_default();
        let ip_address = addr_output.lines().find_map(|line| {
            line.split_whitespace()
                .find(|field| field.contains('.'))
                .and_then(|field| field.split('/').next())
                .map(str::to_string)
        });

        Ok(InstanceInfo {
            name: name.to_string(),
            user_id,
            vcpus,
            max_memory_kb,
            active,
            ip_address,
        })
    }
}
