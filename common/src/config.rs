//! Declarative description of a kiln job.
//!
//! A job replicates a list of object specs a number of iterations against the
//! cluster at a bounded request rate. These types are shared with the indexed
//! documents, which embed the job configuration they were produced under.
use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

/// How a job manipulates its objects.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Create objects rendered from templates.
    #[default]
    Create,
    /// Patch previously created objects with a rendered merge document.
    Patch,
    /// Delete objects selected by label.
    Delete,
    /// List objects selected by label.
    Read,
    /// Create semantics with virtual-machine readiness defaults.
    Kubevirt,
}

/// How churn removes the objects of a victim iteration.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ChurnDeletionStrategy {
    /// Delete the iteration namespace and recreate it.
    #[default]
    Default,
    /// Delete each object kind in place, keeping the namespace.
    Gvr,
}

/// Custom readiness predicate for an object spec.
///
/// The status path is a dotted path where each segment is a field name with an
/// optional single `[key=value]` filter applied to an array field, e.g.
/// `status.conditions[type=Ready].status`. The resolved value is compared for
/// string equality against the expected value.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WaitOptions {
    /// Restrict the predicate to objects of this kind. Applies to all kinds
    /// of the spec when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Dotted field path into the object.
    pub status_path: String,
    /// Literal the resolved value must equal.
    pub expected_value: String,
}

/// One entry in a job's object list.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectSpec {
    /// Path to the template document, relative to the config file.
    pub object_template: String,
    /// Replicas rendered per iteration.
    pub replicas: u32,
    /// Extra variables merged into the rendering context.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub input_vars: BTreeMap<String, serde_json::Value>,
    /// Create this object only in the first iteration.
    pub run_once: bool,
    /// Custom readiness predicate overriding the per-kind default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_options: Option<WaitOptions>,
    /// Create the object in this namespace instead of the iteration one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Default for ObjectSpec {
    fn default() -> Self {
        Self {
            object_template: String::new(),
            replicas: 1,
            input_vars: BTreeMap::new(),
            run_once: false,
            wait_options: None,
            namespace: None,
        }
    }
}

/// A declarative unit of workload.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct Job {
    /// Job name, stamped on every object and document the job produces.
    pub name: String,
    /// Operation the job performs.
    pub job_type: JobType,
    /// How many times the object list is replicated.
    pub job_iterations: u32,
    /// Sustained API request rate in requests per second.
    pub qps: f64,
    /// Token bucket burst capacity.
    pub burst: u32,
    /// Base namespace name.
    pub namespace: String,
    /// Give each iteration its own `<namespace>-<iteration>` namespace.
    pub namespaced_iterations: bool,
    /// Extra labels applied to created namespaces.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub namespace_labels: BTreeMap<String, String>,
    /// Wait for readiness of each pod right after creating it.
    pub pod_wait: bool,
    /// Wait for readiness of all objects once submission finishes.
    pub wait_when_finished: bool,
    /// Compare observed object counts against the expected ones.
    pub verify_objects: bool,
    /// Fail the job when verification finds a mismatch.
    pub error_on_verify: bool,
    /// Sleep between iterations.
    #[serde(with = "humantime_serde")]
    pub job_iteration_delay: Duration,
    /// Upper bound for any readiness wait. Exceeding it is fatal.
    #[serde(with = "humantime_serde")]
    pub max_wait_timeout: Duration,
    /// Pre-pull the job's container images onto every node before starting.
    pub pre_load_images: bool,
    /// How long the pre-load workload stays up.
    #[serde(with = "humantime_serde")]
    pub pre_load_period: Duration,
    /// Enable churn after the initial creation wave.
    pub churn: bool,
    /// Number of churn cycles.
    pub churn_cycles: u32,
    /// Percentage of iterations deleted and recreated per cycle.
    pub churn_percent: u32,
    /// Wall-clock budget of one churn cycle.
    #[serde(with = "humantime_serde")]
    pub churn_duration: Duration,
    /// Pause between deletion and recreation within a cycle.
    #[serde(with = "humantime_serde")]
    pub churn_delay: Duration,
    /// How churn deletes a victim iteration.
    pub churn_deletion_strategy: ChurnDeletionStrategy,
    /// Delete the job's namespaces when it finishes.
    pub cleanup: bool,
    /// Skip handing this job's documents to the indexer.
    pub skip_indexing: bool,
    /// Ordered object list.
    pub objects: Vec<ObjectSpec>,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            name: String::new(),
            job_type: JobType::default(),
            job_iterations: 1,
            qps: 5.0,
            burst: 10,
            namespace: "kiln".to_owned(),
            namespaced_iterations: true,
            namespace_labels: BTreeMap::new(),
            pod_wait: false,
            wait_when_finished: true,
            verify_objects: true,
            error_on_verify: false,
            job_iteration_delay: Duration::ZERO,
            max_wait_timeout: Duration::from_secs(4 * 3600),
            pre_load_images: false,
            pre_load_period: Duration::from_secs(60),
            churn: false,
            churn_cycles: 1,
            churn_percent: 10,
            churn_duration: Duration::from_secs(60),
            churn_delay: Duration::from_secs(5),
            churn_deletion_strategy: ChurnDeletionStrategy::default(),
            cleanup: true,
            skip_indexing: false,
            objects: Vec::new(),
        }
    }
}

impl Job {
    /// Total requests one full submission pass produces.
    ///
    /// Specs marked run-once contribute their replicas exactly once, the rest
    /// once per iteration.
    pub fn expected_requests(&self) -> u64 {
        self.objects
            .iter()
            .map(|spec| {
                let per_pass = u64::from(spec.replicas);
                if spec.run_once {
                    per_pass
                } else {
                    per_pass * u64::from(self.job_iterations)
                }
            })
            .sum()
    }
}
