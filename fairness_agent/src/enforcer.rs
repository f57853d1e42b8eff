//! Pushes computed setpoints to the hypervisor's per-VM cgroup knobs
//! and the host's network qdisc. `ShellEnforcer` shells out to
//! `virsh` for per-VM controls and to `tc` for the HFSC network
//! setup, the latter a direct port of `tc_wrapper.py`'s
//! `hfsc_proportional_share`/`reset_qdisc` into shelled `tc` calls.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::process::Command;

/// Per-VM network priority plus the source IP the HFSC classifier
/// matches traffic against.
#[derive(Debug, Clone)]
pub struct NetworkPriority {
    pub priority: u32,
    pub source_ip: String,
}

#[async_trait]
pub trait Enforcer: Send + Sync {
    async fn set_cpu_shares(&self, instance: &str, shares: u32) -> Result<()>;
    async fn set_memory_soft_limit(&self, instance: &str, bytes: u64) -> Result<()>;
    async fn set_disk_weight(&self, instance: &str, weight: u32) -> Result<()>;
    async fn set_network_priorities(&self, priorities: &HashMap<String, NetworkPriority>) -> Result<()>;
    async fn reset_network_priorities(&self) -> Result<()>;
}

/// No-op enforcer for tests and hosts running with enforcement
/// disabled.
pub struct NullEnforcer;

#[async_trait]
impl Enforcer for NullEnforcer {
    async fn set_cpu_shares(&self, _instance: &str, _shares: u32) -> Result<()> {
        Ok(())
    }
    async fn set_memory_soft_limit(&self, _instance: &str, _bytes: u64) -> Result<()> {
        Ok(())
    }
    async fn set_disk_weight(&self, _instance: &str, _weight: u32) -> Result<()> {
        Ok(())
    }
    async fn set_network_priorities(&self, _priorities: &HashMap<String, NetworkPriority>) -> Result<()> {
        Ok(())
    }
    async fn reset_network_priorities(&self) -> Result<()> {
        Ok(())
    }
}

pub struct ShellEnforcer {
    interface: String,
    upper_limit_mbit: u32,
}

impl ShellEnforcer {
    pub fn new(interface: String, upper_limit_mbit: u32) -> Self {
        Self {
            interface,
            upper_limit_mbit,
        }
    }

    async fn execute(args: &[&str]) -> Result<()> {
        let status = Command::new(args[0])
            .args(&args[1..])
            .status()
            .await
            .with_context(|| format!("failed to spawn {}", args.join(" ")))?;
        if !status.success() {
            log::warn!("command `{}` exited with {}", args.join(" "), status);
        }
        Ok(())
    }
}

#[async_trait]
impl Enforcer for ShellEnforcer {
    async fn set_cpu_shares(&self, instance: &str, shares: u32) -> Result<()> {
        Self::execute(&[
            "virsh",
            "schedinfo",
            instance,
            "--set",
            &format!("cpu_shares={shares}"),
        ])
        .await
    }

    async fn set_memory_soft_limit(&self, instance: &str, bytes: u64) -> Result<()> {
        let kib = (bytes / 1024).max(1);
        Self::execute(&[
            "virsh",
            "memtune",
            instance,
            "--soft-limit",
            &kib.to_string(),
        ])
        .await
    }

    async fn set_disk_weight(&self, instance: &str, weight: u32) -> Result<()> {
        Self::execute(&[
            "virsh",
            "blkiotune",
            instance,
            "--weight",
            &weight.to_string(),
        ])
        .await
    }

    /// Rebuilds the whole HFSC tree every round: one child class per
    /// VM, rate proportional to its priority, classified by source IP.
    /// Ported directly from `hfsc_proportional_share`.
    async fn set_network_priorities(&self, priorities: &HashMap<String, NetworkPriority>) -> Result<()> {
        self.reset_network_priorities().await?;
        if priorities.is_empty() {
            return Ok(());
        }

        let default_class = priorities
            .values()
            .map(|p| p.priority)
            .max()
            .expect("checked non-empty above");
        let prio_sum: u32 = priorities.values().map(|p| p.priority).sum();

        Self::execute(&[
            "tc",
            "qdisc",
            "add",
            "dev",
            &self.interface,
            "root",
            "handle",
            "1:",
            "hfsc",
            "default",
            &default_class.to_string(),
        ])
        .await?;

        Self::execute(&[
            "tc",
            "class",
            "add",
            "dev",
            &self.interface,
            "parent",
            "1:",
            "classid",
            "1:99",
            "hfsc",
            "sc",
            "rate",
            &format!("{}mbit", self.upper_limit_mbit),
            "ul",
            "rate",
            &format!("{}mbit", self.upper_limit_mbit),
        ])
        .await?;

        // Group VMs by priority value so each distinct priority gets
        // exactly one child class, matching `hfsc_proportional_share`'s
        // `prios: {priority: [ip, ...]}` grouping.
        let mut by_priority: HashMap<u32, Vec<&str>> = HashMap::new();
        for p in priorities.values() {
            by_priority.entry(p.priority).or_default().push(&p.source_ip);
        }

        let mut sorted_priorities: Vec<&u32> = by_priority.keys().collect();
        sorted_priorities.sort();

        for priority in sorted_priorities {
            let classid = format!("1:{priority}");
            let rate = (self.upper_limit_mbit * priority) / prio_sum.max(1);
            Self::execute(&[
                "tc",
                "class",
                "add",
                "dev",
                &self.interface,
                "parent",
                "1:99",
                "classid",
                &classid,
                "hfsc",
                "ls",
                "rate",
                &format!("{rate}mbit"),
                "ul",
                "rate",
                &format!("{}mbit", self.upper_limit_mbit),
            ])
            .await?;

            for ip in &by_priority[priority] {
                Self::execute(&[
                    "tc",
                    "filter",
                    "add",
                    "dev",
                    &self.interface,
                    "parent",
                    "1:",
                    "protocol",
                    "ip",
                    "prio",
                    "1",
                    "u32",
                    "match",
                    "ip",
                    "src",
                    ip,
                    "flowid",
                    &classid,
                ])
                .await?;
            }
        }

        Ok(())
    }

    async fn reset_network_priorities(&self) -> Result<()> {
        Self::execute(&["tc", "qdisc", "del", "dev", &self.interface, "root"]).await
    }
}
