//! Service reachability latency measurement.
//!
//! Watches the run's services plus all endpoints. For every new service the
//! protocol is: wait for the load-balancer IP when applicable, wait for
//! ready endpoint addresses, then TCP-connect to each TCP port from a probe
//! pod inside the cluster until the connect succeeds. The time from
//! endpoints-ready to the successful connect is the service's ready latency.
//! Failures skip the sample, never the job. Headless services are skipped.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{Container, Endpoints, Namespace, Pod, PodSpec, Service, ServicePort},
    chrono::{DateTime, Utc},
};
use kiln_common::{
    documents::{SvcLatencyMeasurement, SVC_LATENCY_METRIC, SVC_LATENCY_QUANTILES_METRIC},
    quantiles::LatencyQuantiles,
};
use kube::{
    api::{Api, AttachParams, DeleteParams, ObjectMeta, PostParams},
    runtime::{
        reflector::{ObjectRef, Store},
        watcher,
    },
    Client, ResourceExt,
};
use tokio::time::{Duration, Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    config::{LatencyMetricsMode, MeasurementConfig},
    watcher::{EventHandler, Watcher},
};

use super::{DocumentSet, Measurement, MeasurementContext};

/// Namespace holding the probe pod.
const PROBE_NAMESPACE: &str = "kiln-svc-latency";
/// Name of the probe pod.
const PROBE_POD: &str = "kiln-svc-checker";
/// Image with a shell capable of `/dev/tcp` connects.
const PROBE_IMAGE: &str = "registry.fedoraproject.org/fedora-minimal:39";
/// Retry period between probe connects.
const PROBE_PERIOD: Duration = Duration::from_millis(50);
/// Poll period while waiting for a load-balancer ingress.
const INGRESS_POLL: Duration = Duration::from_millis(100);
/// Poll period while waiting for ready endpoints.
const ENDPOINTS_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct SvcSample {
    uid: String,
    namespace: String,
    name: String,
    service_type: String,
    creation_ts: DateTime<Utc>,
    ip_assigned: Option<Duration>,
    ready: Duration,
}

type SampleMap = Arc<RwLock<HashMap<String, SvcSample>>>;

/// In-cluster helper performing TCP connects via pod exec.
struct ProbePod {
    pods: Api<Pod>,
    host_ip: String,
}

impl ProbePod {
    async fn deploy(client: &Client, cancel: &CancellationToken) -> Result<Self> {
        let namespaces: Api<Namespace> = Api::all(client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(PROBE_NAMESPACE.to_owned()),
                ..Default::default()
            },
            ..Default::default()
        };
        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => {}
            Err(kube::Error::Api(err)) if err.reason == "AlreadyExists" => {
                warn!(namespace = PROBE_NAMESPACE, "already exists");
            }
            Err(err) => return Err(err).context("creating probe namespace"),
        }

        let pods: Api<Pod> = Api::namespaced(client.clone(), PROBE_NAMESPACE);
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(PROBE_POD.to_owned()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "checker".to_owned(),
                    image: Some(PROBE_IMAGE.to_owned()),
                    command: Some(vec!["sleep".to_owned(), "inf".to_owned()]),
                    ..Default::default()
                }],
                restart_policy: Some("Never".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        };
        match pods.create(&PostParams::default(), &pod).await {
            Ok(_) => {}
            Err(kube::Error::Api(err)) if err.reason == "AlreadyExists" => {
                warn!(pod = PROBE_POD, "already exists");
            }
            Err(err) => return Err(err).context("creating probe pod"),
        }

        // The probe is useless until it is running and has a host IP.
        let deadline = Instant::now() + Duration::from_secs(120);
        loop {
            let pod = pods.get(PROBE_POD).await?;
            let ready = pod
                .status
                .as_ref()
                .and_then(|status| status.conditions.as_ref())
                .into_iter()
                .flatten()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True");
            let host_ip = pod
                .status
                .as_ref()
                .and_then(|status| status.host_ip.clone());
            if ready {
                if let Some(host_ip) = host_ip {
                    return Ok(Self { pods, host_ip });
                }
            }
            if Instant::now() >= deadline {
                bail!("probe pod {PROBE_NAMESPACE}/{PROBE_POD} did not become ready");
            }
            tokio::select! {
                _ = cancel.cancelled() => bail!("cancelled waiting for probe pod"),
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    async fn teardown(client: &Client) {
        let namespaces: Api<Namespace> = Api::all(client.clone());
        match namespaces
            .delete(PROBE_NAMESPACE, &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(err)) if err.reason == "NotFound" => {}
            Err(err) => warn!(%err, "failed to delete probe namespace"),
        }
    }

    /// TCP-connect to `ip:port` from inside the cluster, retrying every
    /// 50 ms until success or the budget runs out.
    async fn connect(
        &self,
        ip: &str,
        port: i32,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = Instant::now() + budget;
        loop {
            if self.connect_once(ip, port).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("connect to {ip}:{port} did not succeed within {budget:?}");
            }
            tokio::select! {
                _ = cancel.cancelled() => bail!("cancelled probing {ip}:{port}"),
                _ = tokio::time::sleep(PROBE_PERIOD) => {}
            }
        }
    }

    async fn connect_once(&self, ip: &str, port: i32) -> Result<bool> {
        let command = vec![
            "bash".to_owned(),
            "-c".to_owned(),
            format!("timeout 0.2 bash -c '</dev/tcp/{ip}/{port}'"),
        ];
        let mut attached = self
            .pods
            .exec(
                PROBE_POD,
                command,
                &AttachParams::default().stdout(false).stderr(false),
            )
            .await
            .context("probe exec failed")?;
        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        attached.join().await.ok();
        Ok(matches!(status, Some(s) if s.status.as_deref() == Some("Success")))
    }
}

/// `ClusterIP: None` marks a headless service; there is nothing to probe.
fn is_headless(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.as_deref())
        .map(|ip| ip == "None")
        .unwrap_or(false)
}

fn has_ready_addresses(endpoints: &Endpoints) -> bool {
    endpoints
        .subsets
        .iter()
        .flatten()
        .any(|subset| subset.addresses.as_ref().map_or(false, |a| !a.is_empty()))
}

/// Resolve the addresses and port to probe for one service port.
///
/// Load-balancer ingresses prefer the assigned IP and fall back to the
/// hostname.
fn resolve_targets(
    svc: &Service,
    port: &ServicePort,
    probe_host_ip: &str,
) -> Option<(Vec<String>, i32)> {
    let spec = svc.spec.as_ref()?;
    let service_type = spec.type_.as_deref().unwrap_or("ClusterIP");
    match service_type {
        "ClusterIP" => {
            let ips = spec
                .cluster_ips
                .clone()
                .or_else(|| spec.cluster_ip.clone().map(|ip| vec![ip]))?;
            Some((ips, port.port))
        }
        "NodePort" => Some((vec![probe_host_ip.to_owned()], port.node_port?)),
        "LoadBalancer" => {
            let ingresses = svc
                .status
                .as_ref()
                .and_then(|status| status.load_balancer.as_ref())
                .and_then(|lb| lb.ingress.as_ref())?;
            let ips: Vec<String> = ingresses
                .iter()
                .filter_map(|ingress| ingress.ip.clone().or_else(|| ingress.hostname.clone()))
                .collect();
            Some((ips, port.port))
        }
        other => {
            warn!(service_type = other, "service type not supported, skipping");
            None
        }
    }
}

struct SvcHandler {
    samples: SampleMap,
    svc_store: Store<Service>,
    ep_store: Store<Endpoints>,
    probe: Arc<ProbePod>,
    timeout: Duration,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl EventHandler<Service> for SvcHandler {
    fn on_add(&self, obj: &Service) {
        if is_headless(obj) {
            return;
        }
        debug!(
            namespace = %obj.namespace().unwrap_or_default(),
            service = %obj.name_any(),
            "new service created"
        );
        let svc = obj.clone();
        let samples = self.samples.clone();
        let svc_store = self.svc_store.clone();
        let ep_store = self.ep_store.clone();
        let probe = self.probe.clone();
        let timeout = self.timeout;
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            if let Err(err) =
                measure_service(svc, svc_store, ep_store, probe, timeout, samples, cancel).await
            {
                error!(%err, "service latency sample skipped");
            }
        });
    }

    fn on_update(&self, _obj: &Service) {
        // The per-service task polls the store; updates need no dispatch.
    }
}

async fn measure_service(
    svc: Service,
    svc_store: Store<Service>,
    ep_store: Store<Endpoints>,
    probe: Arc<ProbePod>,
    timeout: Duration,
    samples: SampleMap,
    cancel: CancellationToken,
) -> Result<()> {
    let uid = svc.uid().context("service without uid")?;
    let name = svc.name_any();
    let namespace = svc.namespace().unwrap_or_default();
    let creation_ts = svc
        .creation_timestamp()
        .context("service without creation timestamp")?
        .0;
    let service_type = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.clone())
        .unwrap_or_else(|| "ClusterIP".to_owned());
    let svc_ref = ObjectRef::new(&name).within(&namespace);

    let started = Instant::now();
    let mut ip_assigned = None;
    if service_type == "LoadBalancer" {
        loop {
            let ingress_present = svc_store
                .get(&svc_ref)
                .and_then(|svc| svc.status.clone())
                .and_then(|status| status.load_balancer)
                .and_then(|lb| lb.ingress)
                .map_or(false, |ingress| !ingress.is_empty());
            if ingress_present {
                ip_assigned = Some(started.elapsed());
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => bail!("cancelled waiting for {namespace}/{name} ingress"),
                _ = tokio::time::sleep(INGRESS_POLL) => {}
            }
        }
    }

    let ep_ref = ObjectRef::new(&name).within(&namespace);
    loop {
        let ready = ep_store
            .get(&ep_ref)
            .map_or(false, |endpoints| has_ready_addresses(&endpoints));
        if ready {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => bail!("cancelled waiting for {namespace}/{name} endpoints"),
            _ = tokio::time::sleep(ENDPOINTS_POLL) => {}
        }
    }
    let endpoints_ready_at = Instant::now();
    debug!(%namespace, %name, "endpoints ready");

    // Re-read the service so a load balancer's ingress status is current.
    let latest = svc_store.get(&svc_ref).map(|arc| (*arc).clone()).unwrap_or(svc);
    for port in latest
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .into_iter()
        .flatten()
    {
        if port.protocol.as_deref().unwrap_or("TCP") != "TCP" {
            continue;
        }
        let Some((ips, target_port)) = resolve_targets(&latest, port, &probe.host_ip) else {
            return Ok(());
        };
        for ip in ips {
            probe.connect(&ip, target_port, timeout, &cancel).await?;
        }
    }
    let ready = endpoints_ready_at.elapsed();
    debug!(%namespace, %name, latency_ms = ready.as_millis() as u64, "service ready");

    samples
        .write()
        .expect("should be able to acquire sample lock")
        .insert(
            uid.clone(),
            SvcSample {
                uid,
                namespace,
                name,
                service_type,
                creation_ts,
                ip_assigned,
                ready,
            },
        );
    Ok(())
}

/// The `serviceLatency` measurement.
pub struct ServiceLatency {
    config: MeasurementConfig,
    samples: SampleMap,
    svc_watcher: Option<Watcher<Service>>,
    ep_watcher: Option<Watcher<Endpoints>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    ctx: Option<MeasurementContext>,
}

impl ServiceLatency {
    /// Create the measurement from its configuration entry.
    pub fn new(config: MeasurementConfig) -> Self {
        Self {
            config,
            samples: SampleMap::default(),
            svc_watcher: None,
            ep_watcher: None,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            ctx: None,
        }
    }
}

#[async_trait]
impl Measurement for ServiceLatency {
    fn name(&self) -> &'static str {
        "serviceLatency"
    }

    async fn start(&mut self, ctx: MeasurementContext) -> Result<()> {
        info!(job = %ctx.job_name, "creating service latency watcher");
        let probe = Arc::new(ProbePod::deploy(&ctx.client, &self.cancel).await?);

        let ep_api: Api<Endpoints> = Api::all(ctx.client.clone());
        let ep_watcher = Watcher::start(ep_api, watcher::Config::default(), None);

        let svc_api: Api<Service> = Api::all(ctx.client.clone());
        let samples = self.samples.clone();
        let ep_store = ep_watcher.store();
        let timeout = self.config.svc_timeout;
        let tracker = self.tracker.clone();
        let cancel = self.cancel.clone();
        let svc_watcher = Watcher::start_with(
            svc_api,
            watcher::Config::default().labels(&ctx.selector),
            move |store| {
                Some(Arc::new(SvcHandler {
                    samples,
                    svc_store: store.clone(),
                    ep_store,
                    probe,
                    timeout,
                    tracker,
                    cancel,
                }) as Arc<dyn EventHandler<Service>>)
            },
        );

        self.svc_watcher = Some(svc_watcher);
        self.ep_watcher = Some(ep_watcher);
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn stop(&mut self) -> Result<DocumentSet> {
        // Stop the service watch first so no new probe tasks spawn, then
        // interrupt and drain the in-flight ones.
        if let Some(watcher) = self.svc_watcher.take() {
            watcher.stop().await;
        }
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        if let Some(watcher) = self.ep_watcher.take() {
            watcher.stop().await;
        }
        let ctx = self.ctx.take().expect("measurement was started");
        ProbePod::teardown(&ctx.client).await;

        let samples: Vec<SvcSample> = {
            let samples = self
                .samples
                .read()
                .expect("should be able to acquire sample lock");
            samples.values().cloned().collect()
        };
        let (documents, summaries) = normalize(&samples, &ctx);
        for summary in &summaries {
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
        let mut documents_by_metric = vec![(
            SVC_LATENCY_QUANTILES_METRIC.to_owned(),
            summaries
                .iter()
                .map(|doc| serde_json::to_value(doc).expect("document serializes"))
                .collect(),
        )];
        if self.config.svc_latency_metrics != LatencyMetricsMode::Quantiles {
            documents_by_metric.insert(
                0,
                (
                    SVC_LATENCY_METRIC.to_owned(),
                    documents
                        .iter()
                        .map(|doc| serde_json::to_value(doc).expect("document serializes"))
                        .collect(),
                ),
            );
        }
        Ok(documents_by_metric)
    }
}

fn normalize(
    samples: &[SvcSample],
    ctx: &MeasurementContext,
) -> (Vec<SvcLatencyMeasurement>, Vec<LatencyQuantiles>) {
    let mut documents = Vec::with_capacity(samples.len());
    let mut ready_latencies = Vec::new();
    let mut ip_assigned_latencies = Vec::new();
    for sample in samples {
        ready_latencies.push(sample.ready.as_nanos() as i64);
        if let Some(ip_assigned) = sample.ip_assigned {
            ip_assigned_latencies.push(ip_assigned.as_nanos() as i64);
        }
        documents.push(SvcLatencyMeasurement {
            uid: sample.uid.clone(),
            namespace: sample.namespace.clone(),
            name: sample.name.clone(),
            creation_ts: sample.creation_ts,
            ip_assigned_latency: sample.ip_assigned.map(|d| d.as_millis() as i64),
            ready_latency: sample.ready.as_millis() as i64,
            service_type: sample.service_type.clone(),
            job_name: ctx.job_name.clone(),
            uuid: ctx.uuid.clone(),
            metric_name: SVC_LATENCY_METRIC.to_owned(),
            metadata: ctx.metadata.clone(),
        });
    }
    let mut summaries = Vec::new();
    let mut push_summary = |name: &str, latencies: Vec<i64>| {
        if latencies.is_empty() {
            return;
        }
        let mut summary = LatencyQuantiles::new(name, latencies);
        summary.uuid = ctx.uuid.clone();
        summary.job_name = ctx.job_name.clone();
        summary.metric_name = SVC_LATENCY_QUANTILES_METRIC.to_owned();
        summary.metadata = ctx.metadata.clone();
        summaries.push(summary);
    };
    push_summary("Ready", ready_latencies);
    push_summary("IPAssigned", ip_assigned_latencies);
    (documents, summaries)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        EndpointAddress, EndpointSubset, LoadBalancerIngress, LoadBalancerStatus, ServiceSpec,
        ServiceStatus,
    };
    use kube::core::ObjectMeta;

    use super::*;

    fn service(type_: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("frontend".to_owned()),
                namespace: Some("kiln-1".to_owned()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(type_.to_owned()),
                cluster_ip: Some("10.96.0.10".to_owned()),
                cluster_ips: Some(vec!["10.96.0.10".to_owned(), "fd00::10".to_owned()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn tcp_port(port: i32, node_port: Option<i32>) -> ServicePort {
        ServicePort {
            port,
            node_port,
            protocol: Some("TCP".to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn headless_services_are_skipped() {
        let mut svc = service("ClusterIP");
        svc.spec.as_mut().unwrap().cluster_ip = Some("None".to_owned());
        assert!(is_headless(&svc));
        assert!(!is_headless(&service("ClusterIP")));
    }

    #[test]
    fn cluster_ip_targets_use_all_cluster_ips() {
        let svc = service("ClusterIP");
        let (ips, port) = resolve_targets(&svc, &tcp_port(8080, None), "10.0.0.5").unwrap();
        assert_eq!(ips, vec!["10.96.0.10", "fd00::10"]);
        assert_eq!(port, 8080);
    }

    #[test]
    fn node_port_targets_probe_host() {
        let svc = service("NodePort");
        let (ips, port) = resolve_targets(&svc, &tcp_port(8080, Some(30080)), "10.0.0.5").unwrap();
        assert_eq!(ips, vec!["10.0.0.5"]);
        assert_eq!(port, 30080);
    }

    #[test]
    fn load_balancer_prefers_ip_over_hostname() {
        let mut svc = service("LoadBalancer");
        svc.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![
                    LoadBalancerIngress {
                        ip: Some("203.0.113.7".to_owned()),
                        hostname: Some("lb-1.example.com".to_owned()),
                        ..Default::default()
                    },
                    LoadBalancerIngress {
                        ip: None,
                        hostname: Some("lb-2.example.com".to_owned()),
                        ..Default::default()
                    },
                ]),
            }),
            ..Default::default()
        });
        let (ips, port) = resolve_targets(&svc, &tcp_port(443, None), "10.0.0.5").unwrap();
        assert_eq!(ips, vec!["203.0.113.7", "lb-2.example.com"]);
        assert_eq!(port, 443);
    }

    #[test]
    fn unsupported_types_resolve_to_none() {
        let svc = service("ExternalName");
        assert!(resolve_targets(&svc, &tcp_port(80, None), "10.0.0.5").is_none());
    }

    #[test]
    fn endpoints_require_a_ready_address() {
        let empty = Endpoints::default();
        assert!(!has_ready_addresses(&empty));
        let ready = Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.244.1.3".to_owned(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(has_ready_addresses(&ready));
    }

    #[tokio::test]
    async fn normalize_summarizes_ip_assignment_only_when_present() {
        let ctx = MeasurementContext {
            client: kube::Client::new(
                tower_test::mock::pair::<http::Request<hyper::Body>, http::Response<hyper::Body>>()
                    .0,
                "default",
            ),
            uuid: "u".to_owned(),
            job_name: "j".to_owned(),
            selector: "kiln-runid=u".to_owned(),
            metadata: Default::default(),
            pod_wait_options: None,
        };
        let samples = vec![
            SvcSample {
                uid: "s1".to_owned(),
                namespace: "kiln-1".to_owned(),
                name: "clusterip".to_owned(),
                service_type: "ClusterIP".to_owned(),
                creation_ts: Utc::now(),
                ip_assigned: None,
                ready: Duration::from_millis(40),
            },
            SvcSample {
                uid: "s2".to_owned(),
                namespace: "kiln-1".to_owned(),
                name: "lb".to_owned(),
                service_type: "LoadBalancer".to_owned(),
                creation_ts: Utc::now(),
                ip_assigned: Some(Duration::from_secs(2)),
                ready: Duration::from_millis(60),
            },
        ];
        let (documents, summaries) = normalize(&samples, &ctx);
        assert_eq!(documents.len(), 2);
        let clusterip = documents.iter().find(|d| d.name == "clusterip").unwrap();
        assert_eq!(clusterip.ip_assigned_latency, None);
        assert!(clusterip.ready_latency > 0);
        let lb = documents.iter().find(|d| d.name == "lb").unwrap();
        assert_eq!(lb.ip_assigned_latency, Some(2000));

        assert_eq!(summaries.len(), 2);
        let ip_assigned = summaries
            .iter()
            .find(|s| s.quantile_name == "IPAssigned")
            .unwrap();
        assert_eq!(ip_assigned.count, 1);
        let ready = summaries.iter().find(|s| s.quantile_name == "Ready").unwrap();
        assert_eq!(ready.count, 2);
    }
}
