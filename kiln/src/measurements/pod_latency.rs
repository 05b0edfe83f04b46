//! Pod readiness latency measurement.
//!
//! Watches the run's pods and records the first transition of each lifecycle
//! condition to `True`. Latencies are relative to the server-assigned
//! creation timestamp.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::Pod,
    chrono::{DateTime, Utc},
};
use kiln_common::{
    config::WaitOptions,
    documents::{PodLatencyMeasurement, POD_LATENCY_METRIC, POD_LATENCY_QUANTILES_METRIC},
    quantiles::LatencyQuantiles,
};
use kube::{api::Api, runtime::watcher, ResourceExt};
use tracing::info;

use crate::{
    wait,
    watcher::{EventHandler, Watcher},
};

use super::{DocumentSet, Measurement, MeasurementContext};

#[derive(Debug, Clone)]
struct PodSample {
    uid: String,
    namespace: String,
    name: String,
    creation_ts: DateTime<Utc>,
    scheduled_ts: Option<DateTime<Utc>>,
    initialized_ts: Option<DateTime<Utc>>,
    containers_ready_ts: Option<DateTime<Utc>>,
    ready_ts: Option<DateTime<Utc>>,
    custom_ready_ts: Option<DateTime<Utc>>,
    node_name: Option<String>,
}

type SampleMap = Arc<RwLock<HashMap<String, PodSample>>>;

struct PodHandler {
    samples: SampleMap,
    custom: Option<WaitOptions>,
}

impl EventHandler<Pod> for PodHandler {
    fn on_add(&self, obj: &Pod) {
        self.observe(obj);
    }
    fn on_update(&self, obj: &Pod) {
        self.observe(obj);
    }
}

impl PodHandler {
    /// Record condition transitions. Only the first observation of each
    /// stage sticks, so resync replays and duplicate events are harmless.
    fn observe(&self, pod: &Pod) {
        let Some(uid) = pod.uid() else { return };
        let Some(creation) = pod.creation_timestamp() else {
            return;
        };
        let now = Utc::now();
        let mut samples = self
            .samples
            .write()
            .expect("should be able to acquire sample lock");
        let sample = samples.entry(uid.clone()).or_insert_with(|| PodSample {
            uid,
            namespace: pod.namespace().unwrap_or_default(),
            name: pod.name_any(),
            creation_ts: creation.0,
            scheduled_ts: None,
            initialized_ts: None,
            containers_ready_ts: None,
            ready_ts: None,
            custom_ready_ts: None,
            node_name: None,
        });
        if sample.node_name.is_none() {
            sample.node_name = pod.spec.as_ref().and_then(|spec| spec.node_name.clone());
        }
        let conditions = pod.status.as_ref().and_then(|s| s.conditions.as_ref());
        for condition in conditions.into_iter().flatten() {
            if condition.status != "True" {
                continue;
            }
            let slot = match condition.type_.as_str() {
                "PodScheduled" => &mut sample.scheduled_ts,
                "Initialized" => &mut sample.initialized_ts,
                "ContainersReady" => &mut sample.containers_ready_ts,
                "Ready" => &mut sample.ready_ts,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(now);
            }
        }
        if let Some(opts) = &self.custom {
            if sample.custom_ready_ts.is_none() {
                let matched = serde_json::to_value(pod)
                    .map(|value| wait::path_equals(&value, &opts.status_path, &opts.expected_value))
                    .unwrap_or(false);
                if matched {
                    sample.custom_ready_ts = Some(now);
                }
            }
        }
    }
}

/// The `podLatency` measurement.
pub struct PodLatency {
    samples: SampleMap,
    watcher: Option<Watcher<Pod>>,
    ctx: Option<MeasurementContext>,
}

impl PodLatency {
    /// Create the measurement.
    pub fn new() -> Self {
        Self {
            samples: SampleMap::default(),
            watcher: None,
            ctx: None,
        }
    }
}

impl Default for PodLatency {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Measurement for PodLatency {
    fn name(&self) -> &'static str {
        "podLatency"
    }

    async fn start(&mut self, ctx: MeasurementContext) -> Result<()> {
        info!(job = %ctx.job_name, "creating pod latency watcher");
        let api: Api<Pod> = Api::all(ctx.client.clone());
        let handler = Arc::new(PodHandler {
            samples: self.samples.clone(),
            custom: ctx.pod_wait_options.clone(),
        });
        self.watcher = Some(Watcher::start(
            api,
            watcher::Config::default().labels(&ctx.selector),
            Some(handler),
        ));
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn stop(&mut self) -> Result<DocumentSet> {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }
        let ctx = self.ctx.take().expect("measurement was started");
        let samples: Vec<PodSample> = {
            let samples = self
                .samples
                .read()
                .expect("should be able to acquire sample lock");
            samples.values().cloned().collect()
        };
        let (documents, summaries) = normalize(&samples, &ctx);
        for summary in &summaries {
            // Divide nanoseconds by 1e6 to report milliseconds.
            info!(
                "{}: {} 50th: {}ms 99th: {}ms max: {}ms avg: {}ms",
                ctx.job_name,
                summary.quantile_name,
                summary.p50 / 1_000_000,
                summary.p99 / 1_000_000,
                summary.max / 1_000_000,
                summary.avg / 1_000_000,
            );
        }
        Ok(vec![
            (
                POD_LATENCY_METRIC.to_owned(),
                documents
                    .iter()
                    .map(|doc| serde_json::to_value(doc).expect("document serializes"))
                    .collect(),
            ),
            (
                POD_LATENCY_QUANTILES_METRIC.to_owned(),
                summaries
                    .iter()
                    .map(|doc| serde_json::to_value(doc).expect("document serializes"))
                    .collect(),
            ),
        ])
    }
}

fn latency_ms(creation: DateTime<Utc>, stage: Option<DateTime<Utc>>) -> i64 {
    stage
        .map(|ts| (ts - creation).num_milliseconds().max(0))
        .unwrap_or(0)
}

fn latency_ns(creation: DateTime<Utc>, stage: DateTime<Utc>) -> i64 {
    (stage - creation)
        .num_nanoseconds()
        .unwrap_or(i64::MAX)
        .max(0)
}

fn normalize(
    samples: &[PodSample],
    ctx: &MeasurementContext,
) -> (Vec<PodLatencyMeasurement>, Vec<LatencyQuantiles>) {
    let mut documents = Vec::with_capacity(samples.len());
    let stages: [(&str, fn(&PodSample) -> Option<DateTime<Utc>>); 4] = [
        ("PodScheduled", |s| s.scheduled_ts),
        ("Initialized", |s| s.initialized_ts),
        ("ContainersReady", |s| s.containers_ready_ts),
        ("Ready", |s| s.ready_ts),
    ];
    for sample in samples {
        documents.push(PodLatencyMeasurement {
            uid: sample.uid.clone(),
            namespace: sample.namespace.clone(),
            name: sample.name.clone(),
            creation_ts: sample.creation_ts,
            scheduled_ts: sample.scheduled_ts,
            initialized_ts: sample.initialized_ts,
            containers_ready_ts: sample.containers_ready_ts,
            ready_ts: sample.ready_ts,
            custom_ready_ts: sample.custom_ready_ts,
            node_name: sample.node_name.clone(),
            scheduling_latency: latency_ms(sample.creation_ts, sample.scheduled_ts),
            initialized_latency: latency_ms(sample.creation_ts, sample.initialized_ts),
            containers_ready_latency: latency_ms(sample.creation_ts, sample.containers_ready_ts),
            pod_ready_latency: latency_ms(sample.creation_ts, sample.ready_ts),
            custom_ready_latency: sample
                .custom_ready_ts
                .map(|ts| latency_ms(sample.creation_ts, Some(ts))),
            job_name: ctx.job_name.clone(),
            uuid: ctx.uuid.clone(),
            metric_name: POD_LATENCY_METRIC.to_owned(),
            metadata: ctx.metadata.clone(),
        });
    }
    let mut summaries = Vec::new();
    for (stage, ts_of) in stages {
        let latencies: Vec<i64> = samples
            .iter()
            .filter_map(|sample| ts_of(sample).map(|ts| latency_ns(sample.creation_ts, ts)))
            .collect();
        if latencies.is_empty() {
            continue;
        }
        let mut summary = LatencyQuantiles::new(stage, latencies);
        summary.uuid = ctx.uuid.clone();
        summary.job_name = ctx.job_name.clone();
        summary.metric_name = POD_LATENCY_QUANTILES_METRIC.to_owned();
        summary.metadata = ctx.metadata.clone();
        summaries.push(summary);
    }
    (documents, summaries)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::core::v1::{PodCondition, PodSpec, PodStatus},
        apimachinery::pkg::apis::meta::v1::Time,
    };
    use kube::core::ObjectMeta;

    use super::*;

    fn context() -> MeasurementContext {
        MeasurementContext {
            client: kube::Client::new(
                tower_test::mock::pair::<http::Request<hyper::Body>, http::Response<hyper::Body>>()
                    .0,
                "default",
            ),
            uuid: "test-uuid".to_owned(),
            job_name: "test-job".to_owned(),
            selector: "kiln-runid=test-uuid".to_owned(),
            metadata: Default::default(),
            pod_wait_options: None,
        }
    }

    fn pod(uid: &str, conditions: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("pod-{uid}")),
                namespace: Some("kiln-1".to_owned()),
                uid: Some(uid.to_owned()),
                creation_timestamp: Some(Time(Utc::now())),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("worker-1".to_owned()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                conditions: Some(
                    conditions
                        .iter()
                        .map(|(type_, status)| PodCondition {
                            type_: (*type_).to_owned(),
                            status: (*status).to_owned(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn handler() -> (PodHandler, SampleMap) {
        let samples = SampleMap::default();
        (
            PodHandler {
                samples: samples.clone(),
                custom: None,
            },
            samples,
        )
    }

    #[test]
    fn first_transition_wins() {
        let (handler, samples) = handler();
        handler.observe(&pod("u1", &[("PodScheduled", "True")]));
        let first = samples.read().unwrap()["u1"].scheduled_ts.unwrap();
        handler.observe(&pod("u1", &[("PodScheduled", "True"), ("Ready", "True")]));
        let samples = samples.read().unwrap();
        let sample = &samples["u1"];
        assert_eq!(sample.scheduled_ts.unwrap(), first);
        assert!(sample.ready_ts.is_some());
    }

    #[test]
    fn false_conditions_are_ignored() {
        let (handler, samples) = handler();
        handler.observe(&pod("u1", &[("Ready", "False")]));
        assert!(samples.read().unwrap()["u1"].ready_ts.is_none());
    }

    #[test]
    fn duplicate_events_replace_never_append() {
        let (handler, samples) = handler();
        handler.observe(&pod("u1", &[("Ready", "True")]));
        handler.observe(&pod("u1", &[("Ready", "True")]));
        assert_eq!(samples.read().unwrap().len(), 1);
    }

    #[test]
    fn custom_predicate_records_a_timestamp() {
        let samples = SampleMap::default();
        let handler = PodHandler {
            samples: samples.clone(),
            custom: Some(WaitOptions {
                kind: None,
                status_path: "status.conditions[type=Ready].status".to_owned(),
                expected_value: "True".to_owned(),
            }),
        };
        handler.observe(&pod("u1", &[("Ready", "False")]));
        assert!(samples.read().unwrap()["u1"].custom_ready_ts.is_none());
        handler.observe(&pod("u1", &[("Ready", "True")]));
        assert!(samples.read().unwrap()["u1"].custom_ready_ts.is_some());
    }

    #[tokio::test]
    async fn normalize_orders_stage_latencies() {
        let creation = Utc::now();
        let sample = PodSample {
            uid: "u1".to_owned(),
            namespace: "kiln-1".to_owned(),
            name: "pod-u1".to_owned(),
            creation_ts: creation,
            scheduled_ts: Some(creation + chrono_ms(100)),
            initialized_ts: Some(creation + chrono_ms(200)),
            containers_ready_ts: Some(creation + chrono_ms(300)),
            ready_ts: Some(creation + chrono_ms(300)),
            custom_ready_ts: None,
            node_name: Some("worker-1".to_owned()),
        };
        let (documents, summaries) = normalize(&[sample], &context());
        let doc = &documents[0];
        assert!(doc.scheduling_latency <= doc.initialized_latency);
        assert!(doc.initialized_latency <= doc.containers_ready_latency);
        assert!(doc.containers_ready_latency <= doc.pod_ready_latency);
        assert_eq!(doc.pod_ready_latency, 300);
        assert_eq!(summaries.len(), 4);
        let ready = summaries.iter().find(|s| s.quantile_name == "Ready").unwrap();
        assert_eq!(ready.count, 1);
        assert_eq!(ready.metric_name, POD_LATENCY_QUANTILES_METRIC);
    }

    #[tokio::test]
    async fn unfinished_stages_are_skipped_in_summaries() {
        let creation = Utc::now();
        let sample = PodSample {
            uid: "u1".to_owned(),
            namespace: "kiln-1".to_owned(),
            name: "pod-u1".to_owned(),
            creation_ts: creation,
            scheduled_ts: Some(creation + chrono_ms(50)),
            initialized_ts: None,
            containers_ready_ts: None,
            ready_ts: None,
            custom_ready_ts: None,
            node_name: None,
        };
        let (documents, summaries) = normalize(&[sample], &context());
        assert_eq!(documents[0].pod_ready_latency, 0);
        assert!(documents[0].ready_ts.is_none());
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].quantile_name, "PodScheduled");
    }

    fn chrono_ms(ms: i64) -> k8s_openapi::chrono::Duration {
        k8s_openapi::chrono::Duration::milliseconds(ms)
    }
}
