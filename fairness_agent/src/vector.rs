//! Six-dimensional resource value type shared by every other module:
//! supply, demand, endowment, heaviness inputs and the global norm are
//! all `ResourceVector`s.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Div, Mul, Sub};

/// Sentinel used in place of a division result whenever the divisor is
/// zero. Mirrors `not_zero`/`notZero` in the source metric: arithmetic
/// degeneracy is encoded as a value, never a panic.
pub const ZERO_DIVISOR_SENTINEL: f64 = -1.0;

fn safe_div(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        ZERO_DIVISOR_SENTINEL
    } else {
        a / b
    }
}

/// Immutable-by-convention six-field resource measurement: CPU, disk
/// read/write, network rx/tx and memory, plus optional identifying
/// tags. Tag fields are never arithmetized; every operator propagates
/// them from the left-hand operand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceVector {
    pub cpu_time: f64,
    pub disk_bytes_read: f64,
    pub disk_bytes_written: f64,
    pub net_bytes_rx: f64,
    pub net_bytes_tx: f64,
    pub memory_used: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
}

impl ResourceVector {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn splat(value: f64) -> Self {
        Self {
            cpu_time: value,
            disk_bytes_read: value,
            disk_bytes_written: value,
            net_bytes_rx: value,
            net_bytes_tx: value,
            memory_used: value,
            ..Default::default()
        }
    }

    pub fn with_tags(
        mut self,
        compute_host: Option<String>,
        user_id: Option<String>,
        instance_name: Option<String>,
    ) -> Self {
        self.compute_host = compute_host;
        self.user_id = user_id;
        self.instance_name = instance_name;
        self
    }

    /// The six fields in the fixed order used throughout the metric
    /// machinery: cpu, disk-read, disk-write, net-rx, net-tx, memory.
    pub fn as_array(&self) -> [f64; 6] {
        [
            self.cpu_time,
            self.disk_bytes_read,
            self.disk_bytes_written,
            self.net_bytes_rx,
            self.net_bytes_tx,
            self.memory_used,
        ]
    }

    pub fn from_array(values: [f64; 6]) -> Self {
        Self {
            cpu_time: values[0],
            disk_bytes_read: values[1],
            disk_bytes_written: values[2],
            net_bytes_rx: values[3],
            net_bytes_tx: values[4],
            memory_used: values[5],
            ..Default::default()
        }
    }

    fn tags(&self) -> (Option<String>, Option<String>, Option<String>) {
        (
            self.compute_host.clone(),
            self.user_id.clone(),
            self.instance_name.clone(),
        )
    }
}

macro_rules! impl_scalar_op {
    ($trait:ident, $method:ident, $op:tt) => {
        impl $trait<f64> for ResourceVector {
            type Output = ResourceVector;

            fn $method(self, rhs: f64) -> ResourceVector {
                let (compute_host, user_id, instance_name) = self.tags();
                ResourceVector {
                    cpu_time: self.cpu_time $op rhs,
                    disk_bytes_read: self.disk_bytes_read $op rhs,
                    disk_bytes_written: self.disk_bytes_written $op rhs,
                    net_bytes_rx: self.net_bytes_rx $op rhs,
                    net_bytes_tx: self.net_bytes_tx $op rhs,
                    memory_used: self.memory_used $op rhs,
                    compute_host,
                    user_id,
                    instance_name,
                }
            }
        }
    };
}

macro_rules! impl_vector_op {
    ($trait:ident, $method:ident, $op:tt) => {
        impl $trait<ResourceVector> for ResourceVector {
            type Output = ResourceVector;

            fn $method(self, rhs: ResourceVector) -> ResourceVector {
                let (compute_host, user_id, instance_name) = self.tags();
                ResourceVector {
                    cpu_time: self.cpu_time $op rhs.cpu_time,
                    disk_bytes_read: self.disk_bytes_read $op rhs.disk_bytes_read,
                    disk_bytes_written: self.disk_bytes_written $op rhs.disk_bytes_written,
                    net_bytes_rx: self.net_bytes_rx $op rhs.net_bytes_rx,
                    net_bytes_tx: self.net_bytes_tx $op rhs.net_bytes_tx,
                    memory_used: self.memory_used $op rhs.memory_used,
                    compute_host,
                    user_id,
                    instance_name,
                }
            }
        }
    };
}

impl_scalar_op!(Add, add, +);
impl_scalar_op!(Sub, sub, -);
impl_scalar_op!(Mul, mul, *);
impl_vector_op!(Add, add, +);
impl_vector_op!(Sub, sub, -);
impl_vector_op!(Mul, mul, *);

impl Div<f64> for ResourceVector {
    type Output = ResourceVector;

    fn div(self, rhs: f64) -> ResourceVector {
        let (compute_host, user_id, instance_name) = self.tags();
        ResourceVector {
            cpu_time: safe_div(self.cpu_time, rhs),
            disk_bytes_read: safe_div(self.disk_bytes_read, rhs),
            disk_bytes_written: safe_div(self.disk_bytes_written, rhs),
            net_bytes_rx: safe_div(self.net_bytes_rx, rhs),
            net_bytes_tx: safe_div(self.net_bytes_tx, rhs),
            memory_used: safe_div(self.memory_used, rhs),
            compute_host,
            user_id,
            instance_name,
        }
    }
}

impl Div<ResourceVector> for ResourceVector {
    type Output = ResourceVector;

    fn div(self, rhs: ResourceVector) -> ResourceVector {
        let (compute_host, user_id, instance_name) = self.tags();
        ResourceVector {
            cpu_time: safe_div(self.cpu_time, rhs.cpu_time),
            disk_bytes_read: safe_div(self.disk_bytes_read, rhs.disk_bytes_read),
            disk_bytes_written: safe_div(self.disk_bytes_written, rhs.disk_bytes_written),
            net_bytes_rx: safe_div(self.net_bytes_rx, rhs.net_bytes_rx),
            net_bytes_tx: safe_div(self.net_bytes_tx, rhs.net_bytes_tx),
            memory_used: safe_div(self.memory_used, rhs.memory_used),
            compute_host,
            user_id,
            instance_name,
        }
    }
}
