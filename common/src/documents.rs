//! Documents handed to the metrics indexer.
//!
//! Field names are the compatibility surface consumed by dashboards and
//! downstream tooling; change them only deliberately.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Job;

/// Free-form metadata copied onto every document of a run.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Metric name of [`PodLatencyMeasurement`] documents.
pub const POD_LATENCY_METRIC: &str = "podLatencyMeasurement";
/// Metric name of pod latency quantile summaries.
pub const POD_LATENCY_QUANTILES_METRIC: &str = "podLatencyQuantilesMeasurement";
/// Metric name of [`NodeLatencyMeasurement`] documents.
pub const NODE_LATENCY_METRIC: &str = "nodeLatencyMeasurement";
/// Metric name of node latency quantile summaries.
pub const NODE_LATENCY_QUANTILES_METRIC: &str = "nodeLatencyQuantilesMeasurement";
/// Metric name of [`SvcLatencyMeasurement`] documents.
pub const SVC_LATENCY_METRIC: &str = "svcLatencyMeasurement";
/// Metric name of service latency quantile summaries.
pub const SVC_LATENCY_QUANTILES_METRIC: &str = "svcLatencyQuantilesMeasurement";
/// Metric name of [`JobSummary`] documents.
pub const JOB_SUMMARY_METRIC: &str = "jobSummary";

/// Per-pod latency record derived from watch events.
///
/// Stage timestamps are the first observed transition of the matching pod
/// condition to `True`; latencies are the stage timestamp minus the creation
/// timestamp, in milliseconds.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PodLatencyMeasurement {
    /// Server-assigned unique identifier.
    pub uid: String,
    /// Namespace of the pod.
    pub namespace: String,
    /// Name of the pod.
    pub name: String,
    /// Creation timestamp reported by the control plane.
    pub creation_ts: DateTime<Utc>,
    /// First `PodScheduled=True` transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_ts: Option<DateTime<Utc>>,
    /// First `Initialized=True` transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initialized_ts: Option<DateTime<Utc>>,
    /// First `ContainersReady=True` transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub containers_ready_ts: Option<DateTime<Utc>>,
    /// First `Ready=True` transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_ts: Option<DateTime<Utc>>,
    /// First time the custom wait predicate held, when one was configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_ready_ts: Option<DateTime<Utc>>,
    /// Node the pod was scheduled onto.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Scheduling latency in milliseconds.
    pub scheduling_latency: i64,
    /// Initialization latency in milliseconds.
    pub initialized_latency: i64,
    /// Containers-ready latency in milliseconds.
    pub containers_ready_latency: i64,
    /// Ready latency in milliseconds.
    pub pod_ready_latency: i64,
    /// Custom-predicate latency in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_ready_latency: Option<i64>,
    /// Job the pod belongs to.
    pub job_name: String,
    /// Run identity.
    pub uuid: String,
    /// Document discriminator for the indexer.
    pub metric_name: String,
    /// Caller-supplied metadata.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// Per-node readiness record.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NodeLatencyMeasurement {
    /// Name of the node.
    pub name: String,
    /// Creation timestamp reported by the control plane.
    pub creation_ts: DateTime<Utc>,
    /// First `Ready=True` transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_ts: Option<DateTime<Utc>>,
    /// Ready latency in milliseconds.
    pub node_ready_latency: i64,
    /// Job active while the node appeared.
    pub job_name: String,
    /// Run identity.
    pub uuid: String,
    /// Document discriminator for the indexer.
    pub metric_name: String,
    /// Caller-supplied metadata.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// Per-service reachability record.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SvcLatencyMeasurement {
    /// Server-assigned unique identifier.
    pub uid: String,
    /// Namespace of the service.
    pub namespace: String,
    /// Name of the service.
    pub name: String,
    /// Creation timestamp reported by the control plane.
    pub creation_ts: DateTime<Utc>,
    /// Load-balancer IP assignment latency in milliseconds. Absent for
    /// service types without an external IP.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_assigned_latency: Option<i64>,
    /// Time from endpoints readiness to the first successful TCP connect,
    /// in milliseconds.
    pub ready_latency: i64,
    /// Service type, e.g. `ClusterIP` or `LoadBalancer`.
    pub service_type: String,
    /// Job the service belongs to.
    pub job_name: String,
    /// Run identity.
    pub uuid: String,
    /// Document discriminator for the indexer.
    pub metric_name: String,
    /// Caller-supplied metadata.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// Outcome of one job, indexed once per job at the end of the run.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    /// When the job started.
    pub timestamp: DateTime<Utc>,
    /// When the job finished.
    pub end_timestamp: DateTime<Utc>,
    /// Elapsed wall-clock seconds.
    pub elapsed_time: f64,
    /// When churn started, for churn-enabled jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub churn_start_timestamp: Option<DateTime<Utc>>,
    /// When churn finished, for churn-enabled jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub churn_end_timestamp: Option<DateTime<Utc>>,
    /// Run identity.
    pub uuid: String,
    /// Document discriminator for the indexer.
    pub metric_name: String,
    /// The configuration the job ran with.
    pub job_config: Job,
    /// Engine version that produced the summary.
    pub version: String,
    /// Whether the job met all of its criteria.
    pub passed: bool,
    /// Aggregated worker-level errors.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub execution_errors: String,
    /// Requests sent divided by elapsed seconds.
    pub observed_qps: f64,
    /// Total API requests submitted by the job.
    pub requests_sent: u64,
    /// Caller-supplied metadata.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}
