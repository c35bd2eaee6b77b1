//! Estimating the time spent in communication calls from aggregate counters.

use crate::comm::CommCategory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A closed-form latency/bandwidth model of communication cost.
///
/// All estimates are in nanoseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatencyModel {
    /// The fixed cost of starting one transfer, in nanoseconds.
    pub latency_ns: f64,
    /// Sustained transfer rate, in bytes per nanosecond.
    pub bandwidth: f64,
    /// The number of participating processes.
    pub processes: u32,
}

impl Default for LatencyModel {
    fn default() -> Self {
        LatencyModel {
            latency_ns: 1000.0,
            bandwidth: 1.0,
            processes: 1,
        }
    }
}

impl LatencyModel {
    /// Estimate the time spent in a call of the given category.
    ///
    /// `block_frequency` is how often the call's enclosing block executed and
    /// `total_bytes` the sum of its payload sizes across those executions.
    /// Categories the model does not price cost nothing.
    pub fn estimate(&self, category: CommCategory, block_frequency: u64, total_bytes: u64) -> f64 {
        let freq = block_frequency as f64;
        let bytes = total_bytes as f64;
        match category {
            CommCategory::PointToPoint => freq * self.latency_ns + bytes / self.bandwidth,
            CommCategory::Reduce | CommCategory::AllReduce => {
                freq * self.latency_ns
                    + category.reduce_constant() * bytes * self.log_processes() / self.bandwidth
            }
            CommCategory::Collective => {
                2.0 * f64::from(self.processes) * (freq * self.latency_ns + bytes / self.bandwidth)
            }
            CommCategory::Wait | CommCategory::Setup => 0.0,
        }
    }

    fn log_processes(&self) -> f64 {
        f64::from(self.processes.max(1)).log2()
    }
}

/// Regression coefficients for one operation, in seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Coefficients {
    /// Seconds per call.
    pub intercept: f64,
    /// Seconds per byte moved.
    pub per_byte: f64,
    /// Seconds per call per `log2` of the process count.
    pub per_log_process: f64,
}

/// A fitted model of communication cost, keyed by normalized operation name
/// (e.g. `allreduce`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FittingModel {
    coefficients: BTreeMap<String, Coefficients>,
}

impl FittingModel {
    /// Add or replace the coefficients of `op`.
    pub fn insert(&mut self, op: impl Into<String>, coefficients: Coefficients) -> &mut Self {
        self.coefficients.insert(op.into(), coefficients);
        self
    }

    /// Estimate the time spent in `calls` calls of `op` moving `total_bytes`
    /// across `processes` processes, in nanoseconds.
    ///
    /// Operations without fitted coefficients cost nothing.
    pub fn estimate(&self, op: &str, calls: u64, total_bytes: u64, processes: u32) -> f64 {
        let Some(c) = self.coefficients.get(op) else {
            return 0.0;
        };
        let calls = calls as f64;
        let log_r = f64::from(processes.max(1)).log2();
        let seconds = calls * c.intercept
            + c.per_byte * total_bytes as f64
            + calls * c.per_log_process * log_r;
        seconds * 1e9
    }
}
