//! Optional CSV export of per-VM resource usage and prioritization,
//! grounded on `rui_stats.py`'s two-phase row assembly: a row is
//! written only once both the RUI half and the prioritization half of
//! a tick are present for a given instance, never half-populated.

use crate::vector::ResourceVector;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::sync::Mutex;

const HEADER: &[&str] = &[
    "TIMESTAMP",
    "INSTANCE",
    "HEAVINESS",
    "CPU_SHARES",
    "CPU_USAGE",
    "MEMORY_SOFT_LIMIT",
    "MEMORY_USED",
    "DISK_WEIGHT",
    "DISK_BYTES_TRANSFERRED",
    "NET_PRIORITY",
    "NET_BYTES_TRANSFERRED",
];

pub trait RuiStatsSink: Send + Sync {
    fn add_rui(&self, instance_name: &str, rui: &ResourceVector, interval: f64);

    #[allow(clippy::too_many_arguments)]
    fn add_prioritization(
        &self,
        instance_name: &str,
        heaviness: f64,
        cpu_shares: u32,
        memory_soft_limit: u64,
        disk_weight: u32,
        net_priority: u32,
    );
}

#[derive(Default)]
struct PendingRow {
    rui: Option<(ResourceVector, f64)>,
    prioritization: Option<Prioritization>,
}

#[derive(Clone, Copy)]
struct Prioritization {
    heaviness: f64,
    cpu_shares: u32,
    memory_soft_limit: u64,
    disk_weight: u32,
    net_priority: u32,
}

/// Appends completed rows to `path`. The reference CPU capacity is
/// used to turn absolute cpu-time counters into a CPU_USAGE
/// percentage, the way the original's hardcoded per-deployment
/// reference speed did for `CPU_USAGE`.
pub struct CsvRuiStatsSink {
    path: String,
    reference_cpu_capacity: f64,
    pending: Mutex<HashMap<String, PendingRow>>,
}

impl CsvRuiStatsSink {
    pub fn new(path: &str, reference_cpu_capacity: f64) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to create RUI stats file {path}"))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record(HEADER)?;
        writer.flush()?;

        Ok(Self {
            path: path.to_string(),
            reference_cpu_capacity: reference_cpu_capacity.max(1.0),
            pending: Mutex::new(HashMap::new()),
        })
    }

    fn write_complete_row(&self, instance_name: &str, rui: &ResourceVector, interval: f64, p: Prioritization) -> Result<()> {
        let cpu_usage = (100.0 * (rui.cpu_time / self.reference_cpu_capacity) / interval.max(f64::EPSILON)) as i64;

        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open RUI stats file {}", self.path))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record(&[
            chrono::Utc::now().timestamp().to_string(),
            instance_name.to_string(),
            p.heaviness.to_string(),
            p.cpu_shares.to_string(),
            cpu_usage.to_string(),
            p.memory_soft_limit.to_string(),
            rui.memory_used.to_string(),
            p.disk_weight.to_string(),
            (rui.disk_bytes_read + rui.disk_bytes_written).to_string(),
            p.net_priority.to_string(),
            (rui.net_bytes_rx + rui.net_bytes_tx).to_string(),
        ])?;
        writer.flush()?;
        Ok(())
    }
}

impl RuiStatsSink for CsvRuiStatsSink {
    fn add_rui(&self, instance_name: &str, rui: &ResourceVector, interval: f64) {
        let mut pending = self.pending.lock().expect("stats lock poisoned");
        let row = pending.entry(instance_name.to_string()).or_default();
        row.rui = Some((rui.clone(), interval));

        if let (Some((rui, interval)), Some(p)) = (row.rui.clone(), row.prioritization) {
            if let Err(e) = self.write_complete_row(instance_name, &rui, interval, p) {
                log::warn!("failed to write RUI stats row for {instance_name}: {e}");
            }
            pending.remove(instance_name);
        }
    }

    fn add_prioritization(
        &self,
        instance_name: &str,
        heaviness: f64,
        cpu_shares: u32,
        memory_soft_limit: u64,
        disk_weight: u32,
        net_priority: u32,
    ) {
        let mut pending = self.pending.lock().expect("stats lock poisoned");
        let row = pending.entry(instance_name.to_string()).or_default();
        row.prioritization = Some(Prioritization {
            heaviness,
            cpu_shares,
            memory_soft_limit,
            disk_weight,
            net_priority,
        });

        if let (Some((rui, interval)), Some(p)) = (row.rui.clone(), row.prioritization) {
            if let Err(e) = self.write_complete_row(instance_name, &rui, interval, p) {
                log::warn!("failed to write RUI stats row for {instance_name}: {e}");
            }
            pending.remove(instance_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn row_is_not_written_until_both_halves_present() {
        let dir = std::env::temp_dir().join(format!("fairness-rui-stats-{}", std::process::id()));
        let sink = CsvRuiStatsSink::new(dir.to_str().unwrap(), 6000.0).unwrap();

        sink.add_rui("vm1", &ResourceVector::splat(10.0), 5.0);
        let mut contents = String::new();
        std::fs::File::open(&dir)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents.lines().count(), 1); // header only

        sink.add_prioritization("vm1", 0.5, 512, 65536, 100, 10);
        contents.clear();
        std::fs::File::open(&dir)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents.lines().count(), 2);

        std::fs::remove_file(&dir).ok();
    }
}
