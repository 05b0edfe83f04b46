//! Node readiness latency measurement.
//!
//! Watches nodes cluster-wide and records how long newly created nodes take
//! to report `Ready`. Only nodes created after the measurement started are
//! considered, so autoscaled capacity brought up by the workload is measured
//! and pre-existing nodes are not.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::Node,
    chrono::{DateTime, Utc},
};
use kiln_common::{
    documents::{NodeLatencyMeasurement, NODE_LATENCY_METRIC, NODE_LATENCY_QUANTILES_METRIC},
    quantiles::LatencyQuantiles,
};
use kube::{
    api::{Api, ListParams},
    runtime::watcher,
    ResourceExt,
};
use tracing::info;

use crate::watcher::{EventHandler, Watcher};

use super::{DocumentSet, Measurement, MeasurementContext};

#[derive(Debug, Clone)]
struct NodeSample {
    name: String,
    creation_ts: DateTime<Utc>,
    ready_ts: Option<DateTime<Utc>>,
}

type SampleMap = Arc<RwLock<HashMap<String, NodeSample>>>;

struct NodeHandler {
    samples: SampleMap,
    started: DateTime<Utc>,
}

impl EventHandler<Node> for NodeHandler {
    fn on_add(&self, obj: &Node) {
        self.observe(obj, Utc::now());
    }
    fn on_update(&self, obj: &Node) {
        self.observe(obj, Utc::now());
    }
}

impl NodeHandler {
    fn observe(&self, node: &Node, now: DateTime<Utc>) {
        let Some(uid) = node.uid() else { return };
        let Some(creation) = node.creation_timestamp() else {
            return;
        };
        if creation.0 < self.started {
            return;
        }
        let mut samples = self
            .samples
            .write()
            .expect("should be able to acquire sample lock");
        let sample = samples.entry(uid).or_insert_with(|| NodeSample {
            name: node.name_any(),
            creation_ts: creation.0,
            ready_ts: None,
        });
        if sample.ready_ts.is_none() && node_is_ready(node) {
            sample.ready_ts = Some(now);
        }
    }
}

fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .into_iter()
        .flatten()
        .any(|condition| condition.type_ == "Ready" && condition.status == "True")
}

/// The `nodeLatency` measurement.
pub struct NodeLatency {
    samples: SampleMap,
    watcher: Option<Watcher<Node>>,
    ctx: Option<MeasurementContext>,
    started: Option<DateTime<Utc>>,
}

impl NodeLatency {
    /// Create the measurement.
    pub fn new() -> Self {
        Self {
            samples: SampleMap::default(),
            watcher: None,
            ctx: None,
            started: None,
        }
    }
}

impl Default for NodeLatency {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Measurement for NodeLatency {
    fn name(&self) -> &'static str {
        "nodeLatency"
    }

    async fn start(&mut self, ctx: MeasurementContext) -> Result<()> {
        info!(job = %ctx.job_name, "creating node latency watcher");
        let started = Utc::now();
        let api: Api<Node> = Api::all(ctx.client.clone());
        let handler = Arc::new(NodeHandler {
            samples: self.samples.clone(),
            started,
        });
        self.watcher = Some(Watcher::start(
            api,
            watcher::Config::default(),
            Some(handler),
        ));
        self.started = Some(started);
        self.ctx = Some(ctx);
        Ok(())
    }

    /// Post-hoc scan: fold in nodes whose transitions happened while no
    /// watch event was delivered, using the condition transition times the
    /// control plane recorded.
    async fn collect(&mut self) -> Result<()> {
        let ctx = self.ctx.as_ref().expect("measurement was started");
        let started = self.started.expect("measurement was started");
        let api: Api<Node> = Api::all(ctx.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        let mut samples = self
            .samples
            .write()
            .expect("should be able to acquire sample lock");
        for node in nodes {
            let Some(uid) = node.uid() else { continue };
            let Some(creation) = node.creation_timestamp() else {
                continue;
            };
            if creation.0 < started {
                continue;
            }
            let ready_ts = node
                .status
                .as_ref()
                .and_then(|status| status.conditions.as_ref())
                .into_iter()
                .flatten()
                .find(|condition| condition.type_ == "Ready" && condition.status == "True")
                .and_then(|condition| condition.last_transition_time.as_ref())
                .map(|time| time.0);
            let sample = samples.entry(uid).or_insert_with(|| NodeSample {
                name: node.name_any(),
                creation_ts: creation.0,
                ready_ts: None,
            });
            if sample.ready_ts.is_none() {
                sample.ready_ts = ready_ts;
            }
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<DocumentSet> {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }
        let ctx = self.ctx.take().expect("measurement was started");
        let samples: Vec<NodeSample> = {
            let samples = self
                .samples
                .read()
                .expect("should be able to acquire sample lock");
            samples.values().cloned().collect()
        };
        let mut documents = Vec::with_capacity(samples.len());
        let mut latencies = Vec::new();
        for sample in &samples {
            let latency_ms = sample
                .ready_ts
                .map(|ts| (ts - sample.creation_ts).num_milliseconds().max(0))
                .unwrap_or(0);
            if let Some(ready) = sample.ready_ts {
                latencies.push(
                    (ready - sample.creation_ts)
                        .num_nanoseconds()
                        .unwrap_or(i64::MAX)
                        .max(0),
                );
            }
            documents.push(NodeLatencyMeasurement {
                name: sample.name.clone(),
                creation_ts: sample.creation_ts,
                ready_ts: sample.ready_ts,
                node_ready_latency: latency_ms,
                job_name: ctx.job_name.clone(),
                uuid: ctx.uuid.clone(),
                metric_name: NODE_LATENCY_METRIC.to_owned(),
                metadata: ctx.metadata.clone(),
            });
        }
        let mut summaries = Vec::new();
        if !latencies.is_empty() {
            let mut summary = LatencyQuantiles::new("Ready", latencies);
            summary.uuid = ctx.uuid.clone();
            summary.job_name = ctx.job_name.clone();
            summary.metric_name = NODE_LATENCY_QUANTILES_METRIC.to_owned();
            summary.metadata = ctx.metadata.clone();
            info!(
                "{}: node Ready 50th: {}ms 99th: {}ms max: {}ms avg: {}ms",
                ctx.job_name,
                summary.p50 / 1_000_000,
                summary.p99 / 1_000_000,
                summary.max / 1_000_000,
                summary.avg / 1_000_000,
            );
            summaries.push(summary);
        }
        Ok(vec![
            (
                NODE_LATENCY_METRIC.to_owned(),
                documents
                    .iter()
                    .map(|doc| serde_json::to_value(doc).expect("document serializes"))
                    .collect(),
            ),
            (
                NODE_LATENCY_QUANTILES_METRIC.to_owned(),
                summaries
                    .iter()
                    .map(|doc| serde_json::to_value(doc).expect("document serializes"))
                    .collect(),
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::core::v1::{NodeCondition, NodeStatus},
        apimachinery::pkg::apis::meta::v1::Time,
    };
    use kube::core::ObjectMeta;

    use super::*;

    fn node(uid: &str, created: DateTime<Utc>, ready: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(format!("node-{uid}")),
                uid: Some(uid.to_owned()),
                creation_timestamp: Some(Time(created)),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_owned(),
                    status: if ready { "True" } else { "False" }.to_owned(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pre_existing_nodes_are_ignored() {
        let samples = SampleMap::default();
        let started = Utc::now();
        let handler = NodeHandler {
            samples: samples.clone(),
            started,
        };
        let old = started - k8s_openapi::chrono::Duration::hours(1);
        handler.observe(&node("old", old, true), Utc::now());
        assert!(samples.read().unwrap().is_empty());
    }

    #[test]
    fn new_nodes_record_first_ready_transition() {
        let samples = SampleMap::default();
        let started = Utc::now();
        let handler = NodeHandler {
            samples: samples.clone(),
            started,
        };
        let created = started + k8s_openapi::chrono::Duration::seconds(1);
        handler.observe(&node("n1", created, false), Utc::now());
        assert!(samples.read().unwrap()["n1"].ready_ts.is_none());

        let first_ready = Utc::now();
        handler.observe(&node("n1", created, true), first_ready);
        handler.observe(
            &node("n1", created, true),
            first_ready + k8s_openapi::chrono::Duration::seconds(30),
        );
        let samples = samples.read().unwrap();
        assert_eq!(samples["n1"].ready_ts, Some(first_ready));
    }
}
