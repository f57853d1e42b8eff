//! The Greediness metric, the built-in default fairness metric.
//! Directly grounded on `greediness.py`: a VM exceeding its endowment
//! in a dimension is charged linearly in the cloud-wide norm; a VM
//! under its endowment is credited proportionally to the cloud-wide
//! ratio of over- to under-demand, clamped so credits never exceed
//! full equalization.

use super::{Metric, MetricResult, VmMetricEntry};
use crate::vector::ResourceVector;
use anyhow::{bail, Result};
use std::collections::HashMap;

const FLOATING_ERROR: f64 = 1e-11;
const NORMALIZER: f64 = 1.0;
const DISCOUNT: f64 = 1.0;

fn not_zero(value: f64) -> f64 {
    if value != 0.0 {
        value
    } else {
        -1.0
    }
}

fn clamp_at_least_minus_one(value: f64) -> f64 {
    value.max(-1.0)
}

pub struct GreedinessMetric {
    description: String,
}

impl Default for GreedinessMetric {
    fn default() -> Self {
        Self {
            description: "The Greediness metric as developed at CSG UZH.".to_string(),
        }
    }
}

impl Metric for GreedinessMetric {
    fn name(&self) -> &str {
        "GreedinessMetric"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn map(
        &self,
        supply: &ResourceVector,
        demands: &HashMap<String, ResourceVector>,
        endowments: &HashMap<String, ResourceVector>,
        user_count: usize,
    ) -> Result<MetricResult> {
        if demands.len() != endowments.len() {
            bail!("demands and endowments must have the same shape");
        }

        let supply_arr = supply.as_array();
        let mut names: Vec<&String> = demands.keys().collect();
        names.sort();

        let mut demand_rows: Vec<[f64; 6]> = Vec::with_capacity(names.len());
        let mut endowment_rows: Vec<[f64; 6]> = Vec::with_capacity(names.len());

        for name in &names {
            let demand = demands.get(*name).expect("key from demands.keys()");
            let endowment = endowments
                .get(*name)
                .ok_or_else(|| anyhow::anyhow!("missing endowment for instance {name}"))?;

            let d = demand.as_array();
            let e = endowment.as_array();
            if d.iter().any(|v| *v < 0.0) {
                bail!("demands cannot be negative (instance {name})");
            }
            if e.iter().any(|v| *v < 0.0) {
                bail!("endowments cannot be negative (instance {name})");
            }
            demand_rows.push(d);
            endowment_rows.push(e);
        }

        let mut endowment_column_sum = [0.0_f64; 6];
        for row in &endowment_rows {
            for k in 0..6 {
                endowment_column_sum[k] += row[k];
            }
        }
        for k in 0..6 {
            if endowment_column_sum[k] > supply_arr[k] + FLOATING_ERROR {
                bail!(
                    "endowments exceed supply in dimension {k}: {} > {}",
                    endowment_column_sum[k],
                    supply_arr[k]
                );
            }
        }

        let norm: [f64; 6] = std::array::from_fn(|k| {
            if supply_arr[k] == 0.0 {
                -1.0
            } else {
                (user_count as f64) * NORMALIZER / (6.0 * supply_arr[k])
            }
        });

        let mut pos_rows: Vec<[f64; 6]> = Vec::with_capacity(names.len());
        let mut neg_rows: Vec<[f64; 6]> = Vec::with_capacity(names.len());
        let mut sum_pos = [0.0_f64; 6];
        let mut sum_neg = [0.0_f64; 6];

        for (d, e) in demand_rows.iter().zip(endowment_rows.iter()) {
            let mut pos = [0.0_f64; 6];
            let mut neg = [0.0_f64; 6];
            for k in 0..6 {
                let delta = d[k] - e[k];
                pos[k] = delta.max(0.0);
                neg[k] = delta.min(0.0);
                sum_pos[k] += pos[k];
                sum_neg[k] += neg[k];
            }
            pos_rows.push(pos);
            neg_rows.push(neg);
        }

        let ratio: [f64; 6] = std::array::from_fn(|k| sum_pos[k] / not_zero(sum_neg[k]));
        let clamped: [f64; 6] = std::array::from_fn(|k| clamp_at_least_minus_one(ratio[k]));

        let mut entries = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let pos = pos_rows[i];
            let neg = neg_rows[i];
            let mut heaviness = 0.0;
            let mut normalized_endowment = 0.0;
            for k in 0..6 {
                heaviness += (pos[k] - DISCOUNT * neg[k] * clamped[k]) * norm[k];
                normalized_endowment += endowment_rows[i][k] * norm[k];
            }

            let demand = demands.get(*name).unwrap();
            entries.insert(
                (*name).clone(),
                VmMetricEntry {
                    compute_host: demand.compute_host.clone(),
                    user_id: demand.user_id.clone(),
                    normalized_endowment,
                    heaviness,
                },
            );
        }

        Ok(MetricResult {
            global_norm: norm,
            compute_host: supply
                .compute_host
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec6(values: [f64; 6]) -> ResourceVector {
        ResourceVector::from_array(values)
    }

    #[test]
    fn single_vm_matching_its_endowment_has_zero_heaviness() {
        let supply = vec6([6000.0, 1e9, 1e9, 1e8, 1e8, 4e6]);
        let demands = HashMap::from([(
            "vm1".to_string(),
            vec6([6000.0, 0.0, 0.0, 0.0, 0.0, 2e6]),
        )]);
        let endowments = HashMap::from([(
            "vm1".to_string(),
            vec6([6000.0, 1e9, 1e9, 1e8, 1e8, 4e6]),
        )]);

        let metric = GreedinessMetric::default();
        let result = metric.map(&supply, &demands, &endowments, 1).unwrap();
        assert_eq!(result.entries["vm1"].heaviness, 0.0);
    }

    #[test]
    fn vm_demanding_above_endowment_outweighs_its_undemanding_peer() {
        let supply = vec6([100.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let endowments = HashMap::from([
            ("vm1".to_string(), vec6([50.0, 0.0, 0.0, 0.0, 0.0, 0.0])),
            ("vm2".to_string(), vec6([50.0, 0.0, 0.0, 0.0, 0.0, 0.0])),
        ]);
        let demands = HashMap::from([
            ("vm1".to_string(), vec6([90.0, 0.0, 0.0, 0.0, 0.0, 0.0])),
            ("vm2".to_string(), vec6([10.0, 0.0, 0.0, 0.0, 0.0, 0.0])),
        ]);

        let metric = GreedinessMetric::default();
        let result = metric.map(&supply, &demands, &endowments, 1).unwrap();

        assert_eq!(result.global_norm[0], 1.0 / 600.0);
        assert!((result.entries["vm1"].heaviness - 40.0 / 600.0).abs() < 1e-9);
        assert!((result.entries["vm2"].heaviness - (-40.0 / 600.0)).abs() < 1e-9);
    }

    #[test]
    fn zero_supply_dimension_yields_sentinel_norm_without_error() {
        let supply = vec6([0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let demands = HashMap::from([("vm1".to_string(), vec6([0.0; 6]))]);
        let endowments = HashMap::from([("vm1".to_string(), vec6([0.0; 6]))]);

        let metric = GreedinessMetric::default();
        let result = metric.map(&supply, &demands, &endowments, 1).unwrap();
        assert_eq!(result.global_norm[0], -1.0);
    }

    #[test]
    fn precondition_negative_demand_fails_fast() {
        let supply = vec6([100.0; 6]);
        let demands = HashMap::from([("vm1".to_string(), vec6([-1.0, 0.0, 0.0, 0.0, 0.0, 0.0]))]);
        let endowments = HashMap::from([("vm1".to_string(), vec6([0.0; 6]))]);

        let metric = GreedinessMetric::default();
        assert!(metric.map(&supply, &demands, &endowments, 1).is_err());
    }

    #[test]
    fn precondition_endowment_exceeding_supply_fails_fast() {
        let supply = vec6([10.0; 6]);
        let demands = HashMap::from([("vm1".to_string(), vec6([0.0; 6]))]);
        let endowments = HashMap::from([("vm1".to_string(), vec6([20.0; 6]))]);

        let metric = GreedinessMetric::default();
        assert!(metric.map(&supply, &demands, &endowments, 1).is_err());
    }

    #[test]
    fn relabeling_instances_reproduces_identical_heaviness_values() {
        let supply = vec6([100.0, 50.0, 50.0, 10.0, 10.0, 1000.0]);
        let endowments = HashMap::from([
            ("vm1".to_string(), vec6([10.0, 5.0, 5.0, 1.0, 1.0, 100.0])),
            ("vm2".to_string(), vec6([20.0, 5.0, 5.0, 1.0, 1.0, 100.0])),
            ("vm3".to_string(), vec6([5.0, 5.0, 5.0, 1.0, 1.0, 100.0])),
        ]);
        let demands = HashMap::from([
            ("vm1".to_string(), vec6([15.0, 2.0, 2.0, 0.5, 0.5, 90.0])),
            ("vm2".to_string(), vec6([25.0, 8.0, 8.0, 2.0, 2.0, 150.0])),
            ("vm3".to_string(), vec6([1.0, 1.0, 1.0, 0.1, 0.1, 50.0])),
        ]);

        let metric = GreedinessMetric::default();
        let result = metric.map(&supply, &demands, &endowments, 3).unwrap();

        // Relabeling instances (here: identical input under different
        // keys) must reproduce identical per-instance heaviness values,
        // since the underlying row order never leaks into the result.
        let relabeled_endowments = HashMap::from([
            ("a".to_string(), endowments["vm2"].clone()),
            ("b".to_string(), endowments["vm3"].clone()),
            ("c".to_string(), endowments["vm1"].clone()),
        ]);
        let relabeled_demands = HashMap::from([
            ("a".to_string(), demands["vm2"].clone()),
            ("b".to_string(), demands["vm3"].clone()),
            ("c".to_string(), demands["vm1"].clone()),
        ]);
        let relabeled = metric
            .map(&supply, &relabeled_demands, &relabeled_endowments, 3)
            .unwrap();

        assert!((result.entries["vm1"].heaviness - relabeled.entries["c"].heaviness).abs() < 1e-9);
        assert!((result.entries["vm2"].heaviness - relabeled.entries["a"].heaviness).abs() < 1e-9);
        assert!((result.entries["vm3"].heaviness - relabeled.entries["b"].heaviness).abs() < 1e-9);
    }

    #[test]
    fn scaling_supply_inversely_scales_the_global_norm() {
        let supply = vec6([100.0, 50.0, 50.0, 10.0, 10.0, 1000.0]);
        let endowments = HashMap::from([(
            "vm1".to_string(),
            vec6([10.0, 5.0, 5.0, 1.0, 1.0, 100.0]),
        )]);
        let demands = HashMap::from([(
            "vm1".to_string(),
            vec6([15.0, 2.0, 2.0, 0.5, 0.5, 90.0]),
        )]);

        let metric = GreedinessMetric::default();
        let base = metric.map(&supply, &demands, &endowments, 1).unwrap();

        let c = 4.0;
        let scaled_supply = supply.clone() * c;
        let scaled = metric
            .map(&scaled_supply, &demands, &endowments, 1)
            .unwrap();

        for k in 0..6 {
            assert!((scaled.global_norm[k] - base.global_norm[k] / c).abs() < 1e-9);
        }
    }
}
