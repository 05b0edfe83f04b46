//! Configuration file loading.
//!
//! The config document itself is a template: it is rendered against the
//! process environment plus CLI-provided variables (missing keys render
//! empty) before being parsed as YAML. Structural problems are rejected here,
//! before any job starts.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use kiln_common::{config::Job, documents::Metadata};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::template::{env_map, MissingKeyPolicy, RenderError, Renderer};

/// Measurement names the engine can run.
pub const KNOWN_MEASUREMENTS: &[&str] = &["podLatency", "nodeLatency", "serviceLatency"];

/// A configuration problem, rejected before the run starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    /// Variable expansion of the config document failed.
    #[error("config template error: {0}")]
    Render(#[from] RenderError),
    /// The rendered document is not valid YAML for the schema.
    #[error("config parsing error: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// The document parsed but describes an unrunnable workload.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which documents a latency measurement hands to the indexer.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LatencyMetricsMode {
    /// Per-object documents and quantile summaries.
    #[default]
    All,
    /// Quantile summaries only.
    Quantiles,
}

/// One requested measurement with its options.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct MeasurementConfig {
    /// Measurement name, one of [`KNOWN_MEASUREMENTS`].
    pub name: String,
    /// Per-port probe budget for the service latency measurement.
    #[serde(with = "humantime_serde")]
    pub svc_timeout: Duration,
    /// Document selection for the service latency measurement.
    pub svc_latency_metrics: LatencyMetricsMode,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            svc_timeout: Duration::from_secs(5),
            svc_latency_metrics: LatencyMetricsMode::default(),
        }
    }
}

/// Process-wide settings.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    /// Run identity. Generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Garbage-collect leftover namespaces of this run at the end.
    pub gc: bool,
    /// Timeout applied to individual API requests.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Measurements active for every job of the run.
    pub measurements: Vec<MeasurementConfig>,
    /// Metadata copied onto every indexed document.
    #[serde(skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            uuid: None,
            gc: true,
            request_timeout: Duration::from_secs(15),
            measurements: Vec::new(),
            metadata: Metadata::new(),
        }
    }
}

/// Where documents are shipped.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IndexerConfig {
    /// JSON files on the local filesystem.
    Local {
        /// Target directory, created when missing.
        #[serde(rename = "metricsDirectory", default = "default_metrics_directory")]
        metrics_directory: String,
    },
}

fn default_metrics_directory() -> String {
    "collected-metrics".to_owned()
}

/// One configured indexer endpoint.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MetricsEndpoint {
    /// Indexer backend settings.
    pub indexer: IndexerConfig,
}

/// The loaded configuration document.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Process-wide settings.
    pub global: GlobalConfig,
    /// Indexer endpoints. Empty disables indexing.
    pub metrics_endpoints: Vec<MetricsEndpoint>,
    /// Jobs, executed sequentially in declared order.
    pub jobs: Vec<Job>,
    /// Directory of the config file; template paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Config {
    /// Load, render, parse and validate the config at `path`.
    ///
    /// `user_data` entries shadow process environment variables in the
    /// document rendering context.
    pub fn load(path: &Path, user_data: &[(String, String)]) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut context = env_map();
        for (key, value) in user_data {
            context.insert(key.clone(), Value::String(value.clone()));
        }
        let rendered =
            Renderer::new(MissingKeyPolicy::Zero).render(&raw, &Value::Object(context))?;
        let mut config: Config = serde_yaml::from_str(&rendered)?;
        config.base_dir = path.parent().unwrap_or(Path::new(".")).to_owned();
        config.validate()?;
        Ok(config)
    }

    /// Resolve an object template path against the config directory.
    pub fn template_path(&self, template: &str) -> PathBuf {
        self.base_dir.join(template)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.jobs.is_empty() {
            return Err(ConfigError::Invalid("no jobs defined".to_owned()));
        }
        let mut names = std::collections::BTreeSet::new();
        for job in &self.jobs {
            if job.name.is_empty() {
                return Err(ConfigError::Invalid("job with empty name".to_owned()));
            }
            if !names.insert(&job.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate job name: {}",
                    job.name
                )));
            }
            if job.qps <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "job {}: qps must be positive",
                    job.name
                )));
            }
            if job.job_iterations == 0 {
                return Err(ConfigError::Invalid(format!(
                    "job {}: jobIterations must be at least 1",
                    job.name
                )));
            }
            if job.objects.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "job {}: no objects defined",
                    job.name
                )));
            }
            if job.churn && !(1..=100).contains(&job.churn_percent) {
                return Err(ConfigError::Invalid(format!(
                    "job {}: churnPercent must be within 1..=100",
                    job.name
                )));
            }
            if job.churn && !job.namespaced_iterations {
                return Err(ConfigError::Invalid(format!(
                    "job {}: churn requires namespacedIterations",
                    job.name
                )));
            }
        }
        for measurement in &self.global.measurements {
            if !KNOWN_MEASUREMENTS.contains(&measurement.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "unknown measurement: {}",
                    measurement.name
                )));
            }
        }
        Ok(())
    }
}
