//! Latency measurements driven by control-plane watch streams.
//!
//! Measurements are registered once at process init into an immutable
//! dispatch table. Per job, the registry instantiates the configured
//! measurements, starts their watchers, and at job stop drains them,
//! summarizes their samples and hands the documents to the indexer.
use anyhow::Result;
use async_trait::async_trait;
use kiln_common::{config::WaitOptions, documents::Metadata};
use kube::Client;
use tracing::{error, info};

use crate::{
    config::MeasurementConfig,
    indexer::{Indexer, IndexingOpts},
};

pub mod node_latency;
pub mod pod_latency;
pub mod service_latency;

/// Everything a measurement needs to observe one job. Passed explicitly;
/// measurements hold no process-global state.
#[derive(Clone)]
pub struct MeasurementContext {
    /// Client used for watchers and the probe pod.
    pub client: Client,
    /// Run identity stamped on every document.
    pub uuid: String,
    /// Job under measurement.
    pub job_name: String,
    /// Label selector matching the run's objects.
    pub selector: String,
    /// Metadata copied onto every document.
    pub metadata: Metadata,
    /// Custom pod readiness predicate of the job, when one is configured.
    pub pod_wait_options: Option<WaitOptions>,
}

/// Documents produced by a stopped measurement, grouped by metric name.
pub type DocumentSet = Vec<(String, Vec<serde_json::Value>)>;

/// A latency measurement observing one job.
#[async_trait]
pub trait Measurement: Send {
    /// Registry name of the measurement.
    fn name(&self) -> &'static str;
    /// Subscribe to the relevant watch streams.
    async fn start(&mut self, ctx: MeasurementContext) -> Result<()>;
    /// Optional post-hoc scan between submission end and stop.
    async fn collect(&mut self) -> Result<()> {
        Ok(())
    }
    /// Drain watchers, freeze samples and summarize them.
    async fn stop(&mut self) -> Result<DocumentSet>;
}

fn instantiate(config: &MeasurementConfig) -> Option<Box<dyn Measurement>> {
    match config.name.as_str() {
        "podLatency" => Some(Box::new(pod_latency::PodLatency::new())),
        "nodeLatency" => Some(Box::new(node_latency::NodeLatency::new())),
        "serviceLatency" => Some(Box::new(service_latency::ServiceLatency::new(config.clone()))),
        _ => None,
    }
}

/// Immutable dispatch table of configured measurements.
pub struct MeasurementRegistry {
    configs: Vec<MeasurementConfig>,
}

impl MeasurementRegistry {
    /// Build the table from validated configuration.
    pub fn new(configs: &[MeasurementConfig]) -> Self {
        Self {
            configs: configs.to_vec(),
        }
    }

    /// Instantiate and start every configured measurement for one job.
    pub async fn start(&self, ctx: &MeasurementContext) -> Result<ActiveMeasurements> {
        let mut active = Vec::new();
        for config in &self.configs {
            let Some(mut measurement) = instantiate(config) else {
                continue;
            };
            info!(measurement = measurement.name(), job = %ctx.job_name, "starting measurement");
            measurement.start(ctx.clone()).await?;
            active.push(measurement);
        }
        Ok(ActiveMeasurements { active })
    }
}

/// The measurements running for the current job.
pub struct ActiveMeasurements {
    active: Vec<Box<dyn Measurement>>,
}

impl ActiveMeasurements {
    /// Run the post-hoc collection pass of every measurement.
    pub async fn collect(&mut self) {
        for measurement in &mut self.active {
            if let Err(err) = measurement.collect().await {
                error!(measurement = measurement.name(), %err, "collect failed");
            }
        }
    }

    /// Stop every measurement and hand its documents to the indexer.
    ///
    /// Indexing failures are logged, never fatal.
    pub async fn stop_and_index(
        mut self,
        job_name: &str,
        indexer: Option<&dyn Indexer>,
        skip_indexing: bool,
    ) {
        for measurement in &mut self.active {
            let name = measurement.name();
            let documents = match measurement.stop().await {
                Ok(documents) => documents,
                Err(err) => {
                    error!(measurement = name, %err, "stop failed");
                    continue;
                }
            };
            let Some(indexer) = indexer else { continue };
            if skip_indexing {
                info!(measurement = name, job = job_name, "skipping indexing");
                continue;
            }
            for (metric_name, docs) in documents {
                let opts = IndexingOpts {
                    metric_name: format!("{metric_name}-{job_name}"),
                };
                match indexer.index(&docs, &opts) {
                    Ok(resp) => info!(measurement = name, %resp, "indexed"),
                    Err(err) => error!(measurement = name, %err, "indexing failed"),
                }
            }
        }
    }
}
