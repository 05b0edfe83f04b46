//! Quantile aggregation over per-object latency samples.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Quantile summary over all samples of one latency stage within a job.
///
/// One summary document is emitted per stage per job when the owning
/// measurement stops. Latency values are nanoseconds.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LatencyQuantiles {
    /// Stage the samples belong to, e.g. `Ready` or `PodScheduled`.
    pub quantile_name: String,
    /// Run identity.
    pub uuid: String,
    /// Job the samples were recorded under.
    pub job_name: String,
    /// Document discriminator for the indexer.
    pub metric_name: String,
    /// 50th percentile.
    pub p50: i64,
    /// 95th percentile.
    pub p95: i64,
    /// 99th percentile.
    pub p99: i64,
    /// Largest sample.
    pub max: i64,
    /// Smallest sample.
    pub min: i64,
    /// Arithmetic mean.
    pub avg: i64,
    /// Number of samples aggregated.
    pub count: usize,
    /// When the summary was computed.
    pub timestamp: DateTime<Utc>,
    /// Caller-supplied metadata, copied onto every document.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl LatencyQuantiles {
    /// Summarize `latencies` (nanoseconds) for the named stage.
    ///
    /// Identity fields (`uuid`, `job_name`, `metric_name`, `metadata`) are
    /// left empty for the caller to fill in.
    pub fn new(quantile_name: &str, mut latencies: Vec<i64>) -> Self {
        latencies.sort_unstable();
        let count = latencies.len();
        let sum: i64 = latencies.iter().sum();
        Self {
            quantile_name: quantile_name.to_owned(),
            uuid: String::new(),
            job_name: String::new(),
            metric_name: String::new(),
            p50: quantile(&latencies, 0.50),
            p95: quantile(&latencies, 0.95),
            p99: quantile(&latencies, 0.99),
            max: latencies.last().copied().unwrap_or(0),
            min: latencies.first().copied().unwrap_or(0),
            avg: if count > 0 { sum / count as i64 } else { 0 },
            count,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Linear interpolation on the sorted sample array.
fn quantile(sorted: &[i64], q: f64) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        (sorted[lo] as f64 + (sorted[hi] - sorted[lo]) as f64 * frac).round() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantiles_are_ordered() {
        let samples: Vec<i64> = (1..=1000).rev().collect();
        let summary = LatencyQuantiles::new("Ready", samples);
        assert!(summary.p50 <= summary.p95);
        assert!(summary.p95 <= summary.p99);
        assert!(summary.p99 <= summary.max);
        assert!(summary.avg >= summary.min && summary.avg <= summary.max);
        assert_eq!(summary.count, 1000);
    }

    #[test]
    fn interpolates_between_ranks() {
        // Ranks for p50 over four samples fall between the 2nd and 3rd value.
        let summary = LatencyQuantiles::new("Ready", vec![10, 20, 30, 40]);
        assert_eq!(summary.p50, 25);
        assert_eq!(summary.min, 10);
        assert_eq!(summary.max, 40);
        assert_eq!(summary.avg, 25);
    }

    #[test]
    fn single_sample_is_every_quantile() {
        let summary = LatencyQuantiles::new("Ready", vec![42]);
        assert_eq!(summary.p50, 42);
        assert_eq!(summary.p95, 42);
        assert_eq!(summary.p99, 42);
        assert_eq!(summary.max, 42);
        assert_eq!(summary.min, 42);
    }

    #[test]
    fn empty_input_yields_zeroed_summary() {
        let summary = LatencyQuantiles::new("Ready", Vec::new());
        assert_eq!(summary.count, 0);
        assert_eq!(summary.p99, 0);
        assert_eq!(summary.max, 0);
    }
}
